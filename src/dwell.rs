use log::debug;

use crate::config::Thresholds;
use crate::geometry::ViewportPoint;
use crate::locator::{LocatorSet, TextUnit, UnitId};
use crate::text::char_len;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DwellConfig {
    pub threshold_ms: u64,
    pub suppress_ms: u64,
    pub min_chars: usize,
}

impl Default for DwellConfig {
    fn default() -> Self {
        Self::from(&Thresholds::default())
    }
}

impl From<&Thresholds> for DwellConfig {
    fn from(th: &Thresholds) -> Self {
        Self {
            threshold_ms: th.dwell_ms,
            suppress_ms: th.suppress_ms,
            min_chars: th.min_paragraph_chars,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DwellState {
    #[default]
    Idle,
    Tracking { unit: UnitId, started_at: u64 },
    Suppressed { unit: UnitId, until: u64 },
}

/// A unit the user has attended to long enough, with its extracted text.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub unit: TextUnit,
    pub text: String,
    pub fired_at: u64,
}

#[derive(Debug, Default)]
pub struct DwellEngine {
    cfg: DwellConfig,
    state: DwellState,
}

impl DwellEngine {
    pub fn new(cfg: DwellConfig) -> Self {
        Self {
            cfg,
            state: DwellState::Idle,
        }
    }

    pub fn config(&self) -> &DwellConfig {
        &self.cfg
    }

    pub fn set_config(&mut self, cfg: DwellConfig) {
        self.cfg = cfg;
    }

    pub fn state(&self) -> DwellState {
        self.state
    }

    pub fn current_unit(&self) -> Option<UnitId> {
        match self.state {
            DwellState::Idle => None,
            DwellState::Tracking { unit, .. } | DwellState::Suppressed { unit, .. } => Some(unit),
        }
    }

    pub fn gaze_lost(&mut self) {
        if self.state != DwellState::Idle {
            debug!("dwell: gaze lost");
        }
        self.state = DwellState::Idle;
    }

    /// Advance with the unit resolved for this sample. Returns the unit when
    /// its dwell threshold was just crossed; the state is then already
    /// suppressed whatever the caller decides to do with it.
    pub fn step(&mut self, found: Option<TextUnit>, now_ms: u64) -> Option<TextUnit> {
        let Some(unit) = found else {
            self.state = DwellState::Idle;
            return None;
        };
        let id = unit.id;
        match self.state {
            DwellState::Tracking {
                unit: cur,
                started_at,
            } if cur == id => {
                if now_ms.saturating_sub(started_at) >= self.cfg.threshold_ms {
                    self.state = DwellState::Suppressed {
                        unit: id,
                        until: now_ms + self.cfg.suppress_ms,
                    };
                    debug!("dwell: {id} crossed threshold at {now_ms}");
                    return Some(unit);
                }
            }
            DwellState::Suppressed { unit: cur, until } if cur == id => {
                if now_ms >= until {
                    self.state = DwellState::Tracking {
                        unit: id,
                        started_at: now_ms,
                    };
                }
            }
            _ => {
                self.state = DwellState::Tracking {
                    unit: id,
                    started_at: now_ms,
                };
            }
        }
        None
    }

    /// Minimum-length gate applied to a due unit's extracted text.
    pub fn accepts(&self, text: &str) -> bool {
        char_len(text) >= self.cfg.min_chars
    }

    /// One accepted sample: resolve, advance, and if due extract and gate.
    pub fn observe(
        &mut self,
        point: ViewportPoint,
        now_ms: u64,
        locators: &mut LocatorSet,
    ) -> Option<Trigger> {
        let found = locators.find_unit_at(point);
        let unit = self.step(found, now_ms)?;
        let text = locators.unit_text(&unit);
        if !self.accepts(&text) {
            debug!("dwell: {} has too little text ({} chars)", unit.id, char_len(&text));
            return None;
        }
        Some(Trigger {
            unit,
            text,
            fired_at: now_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::locator::SourceKind;
    use crate::locator::testing::FixedLocator;

    const LONG: &str = "A paragraph with plenty of words to summarize.";

    fn locators(texts: &[&str]) -> LocatorSet {
        let units = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let top = i as f64 * 100.0;
                (Rect::new(0.0, top, 500.0, top + 80.0), *t)
            })
            .collect();
        LocatorSet::new().with(Box::new(FixedLocator::new(SourceKind::Dom, units)))
    }

    fn on(i: usize) -> ViewportPoint {
        ViewportPoint::new(100.0, i as f64 * 100.0 + 40.0)
    }

    #[test]
    fn fires_once_after_threshold_then_rearms() {
        let mut set = locators(&[LONG]);
        let mut dwell = DwellEngine::default();

        assert!(dwell.observe(on(0), 0, &mut set).is_none());
        assert!(dwell.observe(on(0), 1400, &mut set).is_none());
        let t = dwell.observe(on(0), 1600, &mut set).unwrap();
        assert_eq!(t.text, LONG);
        assert_eq!(t.fired_at, 1600);
        assert!(dwell.observe(on(0), 1650, &mut set).is_none());
        assert_eq!(
            dwell.state(),
            DwellState::Suppressed {
                unit: t.unit.id,
                until: 2400
            }
        );

        assert!(dwell.observe(on(0), 2400, &mut set).is_none());
        assert_eq!(
            dwell.state(),
            DwellState::Tracking {
                unit: t.unit.id,
                started_at: 2400
            }
        );
        assert!(dwell.observe(on(0), 3800, &mut set).is_none());
        assert!(dwell.observe(on(0), 3900, &mut set).is_some());
    }

    #[test]
    fn switching_units_restarts_the_clock() {
        let mut set = locators(&[LONG, LONG]);
        let mut dwell = DwellEngine::default();
        dwell.observe(on(0), 0, &mut set);
        dwell.observe(on(1), 1000, &mut set);
        assert!(dwell.observe(on(0), 1600, &mut set).is_none());
        assert!(dwell.observe(on(0), 3000, &mut set).is_none());
        assert!(dwell.observe(on(0), 3100, &mut set).is_some());
    }

    #[test]
    fn short_text_never_fires_but_still_suppresses() {
        let mut set = locators(&["ten chars!"]);
        let mut dwell = DwellEngine::default();
        for t in (0..=6000).step_by(100) {
            assert!(dwell.observe(on(0), t, &mut set).is_none());
        }
        let mut fresh = DwellEngine::default();
        fresh.observe(on(0), 0, &mut set);
        fresh.observe(on(0), 1500, &mut set);
        assert!(matches!(fresh.state(), DwellState::Suppressed { until: 2300, .. }));
    }

    #[test]
    fn empty_space_and_gaze_loss_reset_to_idle() {
        let mut set = locators(&[LONG]);
        let mut dwell = DwellEngine::default();
        dwell.observe(on(0), 0, &mut set);
        dwell.observe(ViewportPoint::new(900.0, 900.0), 800, &mut set);
        assert_eq!(dwell.state(), DwellState::Idle);
        assert!(dwell.observe(on(0), 1600, &mut set).is_none());

        dwell.gaze_lost();
        assert_eq!(dwell.current_unit(), None);
        assert!(dwell.observe(on(0), 3200, &mut set).is_none());
        assert!(dwell.observe(on(0), 4700, &mut set).is_some());
    }

    #[test]
    fn suppression_is_independent_of_threshold() {
        let mut set = locators(&[LONG]);
        let mut dwell = DwellEngine::new(DwellConfig {
            threshold_ms: 500,
            suppress_ms: 2000,
            min_chars: 25,
        });
        dwell.observe(on(0), 0, &mut set);
        assert!(dwell.observe(on(0), 500, &mut set).is_some());
        assert!(dwell.observe(on(0), 2000, &mut set).is_none());
        assert!(dwell.observe(on(0), 2500, &mut set).is_none());
        assert!(dwell.observe(on(0), 3000, &mut set).is_some());
    }
}
