//! One document session: the conditioner, dropout counter, dwell engine,
//! locators and placement engine for a single document, plus the popup
//! they produce.
//!
//! The session never talks to the summarizer itself. Triggers come out as
//! [`SummaryRequest`]s; the caller obtains a summary however it likes and
//! hands it back through [`GazeSession::present`].

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::{Features, Note, PinnedPopup, Profile};
use crate::dwell::{DwellConfig, DwellEngine};
use crate::geometry::{Rect, Viewport, ViewportPoint};
use crate::locator::{LocatorSet, UnitId};
use crate::placement::{PlaceOptions, PlacementEngine, PopupPlacement, PopupSize};
use crate::signal::{CalibrationOffset, ConditionerConfig, Dropout, RawSample, SignalConditioner};
use crate::summarize::SummaryMode;
use crate::text::char_len;

/// Offset from the pointer used when a selection has no measurable rect.
const POINTER_NUDGE_PX: f64 = 12.0;
const MIN_AUTOHIDE_S: u64 = 3;

/// A text selection reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub rect: Option<Rect>,
    #[serde(default)]
    pub pointer: Option<ViewportPoint>,
    #[serde(default)]
    pub in_code_block: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Gaze,
    Selection,
    ExplainMore,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Gaze => "gaze",
            TriggerSource::Selection => "selection",
            TriggerSource::ExplainMore => "explain_more",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRequest {
    pub id: u64,
    pub text: String,
    pub mode: SummaryMode,
    pub source: TriggerSource,
    pub anchor: Rect,
    pub avoid: Option<Rect>,
    pub unit: Option<UnitId>,
    pub requested_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Popup {
    pub request_id: u64,
    pub summary: String,
    /// The text that was summarized.
    pub text: String,
    pub mode: SummaryMode,
    pub source: TriggerSource,
    pub placement: PopupPlacement,
    pub hide_at: Option<u64>,
    pub visible: bool,
}

#[derive(Debug, Clone)]
struct SessionSettings {
    features: Features,
    min_selection_chars: usize,
    popup_size: PopupSize,
}

impl From<&Profile> for SessionSettings {
    fn from(p: &Profile) -> Self {
        Self {
            features: p.features.clone(),
            min_selection_chars: p.thresholds.min_selection_chars,
            popup_size: PopupSize::from(&p.popup),
        }
    }
}

pub struct GazeSession {
    settings: SessionSettings,
    conditioner: SignalConditioner,
    dropout: Dropout,
    dwell: DwellEngine,
    locators: LocatorSet,
    placement: PlacementEngine,
    viewport: Viewport,
    popup: Option<Popup>,
    last_point: Option<ViewportPoint>,
    next_request: u64,
    latest_request: Option<u64>,
    /// A pin made by `pin_default` that has not been persisted yet.
    new_pin: Option<PinnedPopup>,
}

impl GazeSession {
    pub fn new(profile: &Profile, locators: LocatorSet, viewport: Viewport) -> Self {
        let th = &profile.thresholds;
        let mut locators = locators;
        locators.update_viewport(&viewport);
        Self {
            settings: SessionSettings::from(profile),
            conditioner: SignalConditioner::new(ConditionerConfig::from(th)),
            dropout: Dropout::new(th.dropout_frames),
            dwell: DwellEngine::new(DwellConfig::from(th)),
            locators,
            placement: PlacementEngine::new(),
            viewport,
            popup: None,
            last_point: None,
            next_request: 1,
            latest_request: None,
            new_pin: None,
        }
    }

    /// Take new thresholds and toggles without losing filter, dwell or
    /// popup state.
    pub fn apply_profile(&mut self, profile: &Profile) {
        let th = &profile.thresholds;
        self.settings = SessionSettings::from(profile);
        self.conditioner.set_config(ConditionerConfig::from(th));
        self.dropout.set_limit(th.dropout_frames);
        self.dwell.set_config(DwellConfig::from(th));
        if !self.settings.features.eye_tracking {
            self.dwell.gaze_lost();
        }
    }

    /// Swap in a new document; dwell restarts from idle.
    pub fn set_document(&mut self, locators: LocatorSet, viewport: Viewport) {
        self.locators = locators;
        self.dwell.gaze_lost();
        self.set_viewport(viewport);
        info!("document loaded: locators {:?}", self.locators.kinds());
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        self.locators.update_viewport(&viewport);
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn locators(&self) -> &LocatorSet {
        &self.locators
    }

    pub fn features(&self) -> &Features {
        &self.settings.features
    }

    pub fn offset(&self) -> CalibrationOffset {
        self.conditioner.offset()
    }

    pub fn set_offset(&mut self, offset: CalibrationOffset) {
        self.conditioner.set_offset(offset);
    }

    /// For calibration, which updates the filter state in place.
    pub fn conditioner_mut(&mut self) -> &mut SignalConditioner {
        &mut self.conditioner
    }

    pub fn dwell(&self) -> &DwellEngine {
        &self.dwell
    }

    /// Last accepted, filtered gaze point.
    pub fn last_point(&self) -> Option<ViewportPoint> {
        self.last_point
    }

    pub fn restore_pin(&mut self, saved: Option<PinnedPopup>) {
        self.placement.restore(saved);
    }

    /// Stamp a request with the next id and make it the only one whose
    /// answer will be shown.
    fn issue(&mut self, mut req: SummaryRequest) -> SummaryRequest {
        req.id = self.next_request;
        self.next_request += 1;
        self.latest_request = Some(req.id);
        debug!("summary request #{} ({}, {})", req.id, req.source.as_str(), req.mode);
        req
    }

    /// One gaze sample, or `None` for a frame the producer could not
    /// estimate. Returns a request when dwell fires.
    pub fn on_gaze(&mut self, sample: Option<RawSample>, now_ms: u64) -> Option<SummaryRequest> {
        if !self.settings.features.eye_tracking {
            return None;
        }
        let Some(raw) = sample.filter(|s| s.coords().is_some()) else {
            if self.dropout.miss() {
                self.dwell.gaze_lost();
                self.last_point = None;
            }
            return None;
        };
        self.dropout.hit();
        let point = self.conditioner.condition(&raw, &self.viewport, now_ms)?;
        self.last_point = Some(point);

        let trigger = self.dwell.observe(point, now_ms, &mut self.locators)?;
        info!(
            "dwell trigger on {} ({} chars)",
            trigger.unit.id,
            char_len(&trigger.text)
        );
        Some(self.issue(SummaryRequest {
            id: 0,
            text: trigger.text,
            mode: SummaryMode::Tldr,
            source: TriggerSource::Gaze,
            anchor: trigger.unit.rect,
            avoid: None,
            unit: Some(trigger.unit.id),
            requested_at: now_ms,
        }))
    }

    /// A finished selection. Blank host text falls back to whatever the
    /// locators report as selected.
    pub fn on_selection(&mut self, sel: Selection, now_ms: u64) -> Option<SummaryRequest> {
        if !self.settings.features.selection {
            return None;
        }
        let text = if sel.text.trim().is_empty() {
            self.locators.selected_text()
        } else {
            sel.text
        };
        let text = text.trim().to_string();
        if char_len(&text) < self.settings.min_selection_chars {
            debug!("selection too short ({} chars)", char_len(&text));
            return None;
        }
        let mode = SummaryMode::for_selection(&text, sel.in_code_block);
        let sel_rect = sel.rect.filter(Rect::has_area);
        let anchor = match (sel_rect, sel.pointer) {
            (Some(r), _) => r,
            (None, Some(p)) => Rect::from_point(p.x + POINTER_NUDGE_PX, p.y + POINTER_NUDGE_PX),
            (None, None) => Rect::from_point(0.0, 0.0),
        };
        Some(self.issue(SummaryRequest {
            id: 0,
            text,
            mode,
            source: TriggerSource::Selection,
            anchor,
            avoid: sel_rect,
            unit: None,
            requested_at: now_ms,
        }))
    }

    /// Ask for a longer explanation of the popup's text.
    pub fn explain_more(&mut self, now_ms: u64) -> Option<SummaryRequest> {
        let popup = self.popup.as_ref().filter(|p| p.visible)?;
        let text = popup.text.clone();
        let anchor = Rect::new(
            popup.placement.left,
            popup.placement.top,
            popup.placement.left + self.settings.popup_size.width,
            popup.placement.top + self.settings.popup_size.height,
        );
        Some(self.issue(SummaryRequest {
            id: 0,
            text,
            mode: SummaryMode::ExplainMore,
            source: TriggerSource::ExplainMore,
            anchor,
            avoid: None,
            unit: None,
            requested_at: now_ms,
        }))
    }

    /// Show a summary. Answers to anything but the newest request are
    /// dropped. An explanation replaces the visible popup's body in place.
    pub fn present(&mut self, req: &SummaryRequest, summary: String, now_ms: u64) -> Option<&Popup> {
        if self.latest_request != Some(req.id) {
            debug!("dropping stale summary #{}", req.id);
            return None;
        }
        let features = &self.settings.features;

        if req.source == TriggerSource::ExplainMore {
            if let Some(popup) = self.popup.as_mut().filter(|p| p.visible) {
                popup.request_id = req.id;
                popup.summary = summary;
                popup.mode = req.mode;
                return self.popup.as_ref();
            }
        }

        let was_pinned = self.placement.is_pinned();
        let pin = features.pin_default || was_pinned;
        let mut placement = self.placement.place(
            self.settings.popup_size,
            &req.anchor,
            &self.viewport,
            PlaceOptions {
                avoid: req.avoid,
                pin,
            },
        );
        if placement.pinned && !was_pinned {
            let (left, top) = (placement.left.round(), placement.top.round());
            placement.left = left;
            placement.top = top;
            self.placement.pin_at(left, top);
            self.new_pin = Some(PinnedPopup {
                pinned: true,
                left,
                top,
            });
        }
        let hide_at = (features.autohide && !placement.pinned)
            .then(|| now_ms + features.autohide_timeout_s.max(MIN_AUTOHIDE_S) * 1000);
        self.popup = Some(Popup {
            request_id: req.id,
            summary,
            text: req.text.clone(),
            mode: req.mode,
            source: req.source,
            placement,
            hide_at,
            visible: true,
        });
        self.popup.as_ref()
    }

    /// A pin created by `pin_default` since the last call, for the caller
    /// to persist.
    pub fn take_new_pin(&mut self) -> Option<PinnedPopup> {
        self.new_pin.take()
    }

    pub fn popup(&self) -> Option<&Popup> {
        self.popup.as_ref()
    }

    /// Apply the auto-hide deadline. True when the popup was hidden now.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        match self.popup.as_mut() {
            Some(p) if p.visible && !p.placement.pinned && p.hide_at.is_some_and(|t| now_ms >= t) => {
                p.visible = false;
                debug!("popup #{} auto-hidden", p.request_id);
                true
            }
            _ => false,
        }
    }

    /// Hide the popup unless it is pinned.
    pub fn dismiss(&mut self) -> bool {
        match self.popup.as_mut() {
            Some(p) if p.visible && !p.placement.pinned => {
                p.visible = false;
                true
            }
            _ => false,
        }
    }

    /// Pin the visible popup where it stands. Returns the record to persist.
    pub fn pin(&mut self) -> Option<PinnedPopup> {
        let p = self.popup.as_mut().filter(|p| p.visible)?;
        let (left, top) = (p.placement.left.round(), p.placement.top.round());
        p.placement = PopupPlacement {
            left,
            top,
            pinned: true,
        };
        p.hide_at = None;
        self.placement.pin_at(left, top);
        Some(PinnedPopup {
            pinned: true,
            left,
            top,
        })
    }

    pub fn unpin(&mut self) {
        self.placement.unpin();
        self.new_pin = None;
        if let Some(p) = self.popup.as_mut() {
            p.placement.pinned = false;
        }
    }

    /// The visible popup as a note.
    pub fn note(&self, id: u64) -> Option<Note> {
        let p = self.popup.as_ref().filter(|p| p.visible)?;
        Some(Note {
            id,
            text: p.text.clone(),
            summary: p.summary.clone(),
            source: p.source.as_str().to_string(),
            mode: p.mode.as_str().to_string(),
        })
    }
}
