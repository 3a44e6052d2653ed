//! Raw gaze sample conditioning: unit-space repair, EMA smoothing,
//! calibration offset, velocity gating and dropout counting.

use log::debug;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::Thresholds;
use crate::geometry::{Viewport, ViewportPoint};

/// Samples further than this past the viewport edge are taken as page coordinates.
const PAGE_SPACE_MARGIN_PX: f64 = 100.0;
/// Elapsed-time floor for the velocity check.
const MIN_DT_MS: u64 = 1;

/// One estimate from the upstream producer. Only `x`/`y` are trusted, and
/// only when they are finite numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    #[serde(default, deserialize_with = "lenient_coord")]
    pub x: Option<f64>,
    #[serde(default, deserialize_with = "lenient_coord")]
    pub y: Option<f64>,
}

// Strings, bools, nulls and NaN all collapse to "missing" instead of failing the parse.
fn lenient_coord<'de, D>(de: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(de)?;
    Ok(val.as_f64().filter(|v| v.is_finite()))
}

impl RawSample {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
        }
    }

    pub fn coords(&self) -> Option<(f64, f64)> {
        match (self.x, self.y) {
            (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Some((x, y)),
            _ => None,
        }
    }
}

/// Additive per-axis correction in viewport pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOffset {
    pub dx: f64,
    pub dy: f64,
}

impl CalibrationOffset {
    pub const ZERO: CalibrationOffset = CalibrationOffset { dx: 0.0, dy: 0.0 };

    pub fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }.sanitized()
    }

    /// Any non-finite component voids the whole offset.
    pub fn sanitized(self) -> Self {
        if self.dx.is_finite() && self.dy.is_finite() {
            self
        } else {
            Self::ZERO
        }
    }

    pub fn is_zero(&self) -> bool {
        self.dx == 0.0 && self.dy == 0.0
    }
}

/// Map a raw sample into the viewport, or `None` if it is malformed.
pub fn normalize(raw: &RawSample, vp: &Viewport) -> Option<ViewportPoint> {
    let (mut x, mut y) = raw.coords()?;

    // page-space producers report scrolled coordinates
    if x > vp.width + PAGE_SPACE_MARGIN_PX || y > vp.height + PAGE_SPACE_MARGIN_PX {
        x -= vp.scroll_x;
        y -= vp.scroll_y;
    }

    // fractional DPR means the producer handed us device pixels
    let dpr = vp.device_pixel_ratio;
    if dpr.is_finite() && dpr > 0.0 && (dpr.round() - dpr).abs() > 0.001 {
        x /= dpr;
        y /= dpr;
    }

    Some(vp.clamp(x.round(), y.round()))
}

#[derive(Debug, Clone)]
pub struct ConditionerConfig {
    pub smoothing_alpha: f64,
    pub velocity_px_s: f64,
    pub dropout_frames: u32,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.18,
            velocity_px_s: 1200.0,
            dropout_frames: 3,
        }
    }
}

impl From<&Thresholds> for ConditionerConfig {
    fn from(th: &Thresholds) -> Self {
        Self {
            smoothing_alpha: th.smoothing_alpha,
            velocity_px_s: th.velocity_px_s,
            dropout_frames: th.dropout_frames,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MotionRef {
    point: ViewportPoint,
    t_ms: u64,
}

/// Per-session filter memory. Never shared between sessions.
#[derive(Debug, Clone, Default)]
pub struct FilterState {
    ema: Option<(f64, f64)>,
    last: Option<MotionRef>,
    pub offset: CalibrationOffset,
}

#[derive(Debug)]
pub struct SignalConditioner {
    cfg: ConditionerConfig,
    state: FilterState,
}

impl Default for SignalConditioner {
    fn default() -> Self {
        Self::new(ConditionerConfig::default())
    }
}

impl SignalConditioner {
    pub fn new(cfg: ConditionerConfig) -> Self {
        Self {
            cfg,
            state: FilterState::default(),
        }
    }

    pub fn config(&self) -> &ConditionerConfig {
        &self.cfg
    }

    /// Swap thresholds without dropping filter memory or the offset.
    pub fn set_config(&mut self, cfg: ConditionerConfig) {
        self.cfg = cfg;
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn offset(&self) -> CalibrationOffset {
        self.state.offset
    }

    /// Takes effect on the very next sample.
    pub fn set_offset(&mut self, offset: CalibrationOffset) {
        self.state.offset = offset.sanitized();
    }

    /// Forget the EMA and the velocity reference; the offset survives.
    pub fn reset(&mut self) {
        self.state.ema = None;
        self.state.last = None;
    }

    /// EMA over normalized points, seeded with the first point. The offset
    /// is added after filtering so it is never damped.
    pub fn smooth(&mut self, point: ViewportPoint, vp: &Viewport) -> ViewportPoint {
        let a = self.cfg.smoothing_alpha;
        let (ex, ey) = match self.state.ema {
            None => (point.x, point.y),
            Some((ex, ey)) => ((1.0 - a) * ex + a * point.x, (1.0 - a) * ey + a * point.y),
        };
        self.state.ema = Some((ex, ey));
        let off = self.state.offset;
        vp.clamp(ex + off.dx, ey + off.dy)
    }

    /// Reject glitches faster than the velocity threshold. Only accepted
    /// points move the reference used by the next check.
    pub fn accept_velocity(&mut self, point: ViewportPoint, now_ms: u64) -> bool {
        let Some(last) = self.state.last else {
            self.state.last = Some(MotionRef {
                point,
                t_ms: now_ms,
            });
            return true;
        };

        let dt_ms = now_ms.saturating_sub(last.t_ms).max(MIN_DT_MS);
        let speed = point.distance_to(&last.point) / (dt_ms as f64 / 1000.0);
        if speed > self.cfg.velocity_px_s {
            debug!("rejecting gaze spike: {speed:.0} px/s over {dt_ms} ms");
            return false;
        }

        self.state.last = Some(MotionRef {
            point,
            t_ms: now_ms,
        });
        true
    }

    /// normalize → smooth → offset → clamp → velocity gate.
    pub fn condition(
        &mut self,
        raw: &RawSample,
        vp: &Viewport,
        now_ms: u64,
    ) -> Option<ViewportPoint> {
        let point = normalize(raw, vp)?;
        let smoothed = self.smooth(point, vp);
        self.accept_velocity(smoothed, now_ms).then_some(smoothed)
    }
}

/// Consecutive-miss counter implementing the dropout policy.
#[derive(Debug, Clone)]
pub struct Dropout {
    limit: u32,
    misses: u32,
}

impl Dropout {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            misses: 0,
        }
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit.max(1);
    }

    /// Record a missing sample; true once the gaze counts as lost.
    pub fn miss(&mut self) -> bool {
        self.misses = self.misses.saturating_add(1);
        self.misses >= self.limit
    }

    pub fn hit(&mut self) {
        self.misses = 0;
    }

    pub fn is_lost(&self) -> bool {
        self.misses >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp() -> Viewport {
        Viewport::new(1000.0, 800.0)
    }

    #[test]
    fn malformed_samples_normalize_to_none() {
        let v = vp();
        assert_eq!(normalize(&RawSample::default(), &v), None);
        assert_eq!(
            normalize(
                &RawSample {
                    x: Some(10.0),
                    y: None
                },
                &v
            ),
            None
        );
        assert_eq!(normalize(&RawSample::new(f64::NAN, 5.0), &v), None);

        let from_json: RawSample = serde_json::from_str(r#"{"x":"12","y":true}"#).unwrap();
        assert_eq!(normalize(&from_json, &v), None);
        let missing: RawSample = serde_json::from_str(r#"{"y":40}"#).unwrap();
        assert_eq!(normalize(&missing, &v), None);
    }

    #[test]
    fn page_space_samples_lose_the_scroll_offset() {
        let v = Viewport {
            scroll_y: 2000.0,
            ..vp()
        };
        let p = normalize(&RawSample::new(300.0, 2400.0), &v).unwrap();
        assert_eq!(p, ViewportPoint::new(300.0, 400.0));

        // within the margin: left alone
        let p = normalize(&RawSample::new(300.0, 850.0), &v).unwrap();
        assert_eq!(p, ViewportPoint::new(300.0, 799.0));
    }

    #[test]
    fn fractional_dpr_is_divided_out() {
        let v = Viewport {
            device_pixel_ratio: 1.5,
            ..vp()
        };
        let p = normalize(&RawSample::new(300.0, 450.0), &v).unwrap();
        assert_eq!(p, ViewportPoint::new(200.0, 300.0));

        let v2 = Viewport {
            device_pixel_ratio: 2.0,
            ..vp()
        };
        let p = normalize(&RawSample::new(300.0, 450.0), &v2).unwrap();
        assert_eq!(p, ViewportPoint::new(300.0, 450.0));
    }

    #[test]
    fn first_smoothed_point_has_no_lag() {
        let mut c = SignalConditioner::default();
        let out = c.smooth(ViewportPoint::new(400.0, 300.0), &vp());
        assert_eq!(out, ViewportPoint::new(400.0, 300.0));

        let out = c.smooth(ViewportPoint::new(500.0, 300.0), &vp());
        assert!((out.x - 418.0).abs() < 1e-9);
        assert_eq!(out.y, 300.0);
    }

    #[test]
    fn offset_is_applied_after_smoothing() {
        let mut c = SignalConditioner::default();
        c.set_offset(CalibrationOffset::new(10.0, -5.0));
        let v = vp();
        assert_eq!(
            c.smooth(ViewportPoint::new(100.0, 100.0), &v),
            ViewportPoint::new(110.0, 95.0)
        );
        // a new offset lands in full on the next sample, no EMA ramp
        c.set_offset(CalibrationOffset::new(30.0, 0.0));
        assert_eq!(
            c.smooth(ViewportPoint::new(100.0, 100.0), &v),
            ViewportPoint::new(130.0, 100.0)
        );
    }

    #[test]
    fn spikes_are_rejected_without_moving_the_reference() {
        let mut c = SignalConditioner::default();
        assert!(c.accept_velocity(ViewportPoint::new(100.0, 100.0), 0));
        // 500 px in 100 ms = 5000 px/s
        assert!(!c.accept_velocity(ViewportPoint::new(600.0, 100.0), 100));
        // measured against (100,100)@0 still: 100 px in 200 ms = 500 px/s
        assert!(c.accept_velocity(ViewportPoint::new(200.0, 100.0), 200));
        // same timestamp twice uses the 1 ms floor
        assert!(!c.accept_velocity(ViewportPoint::new(210.0, 100.0), 200));
    }

    #[test]
    fn non_finite_offsets_fall_back_to_zero() {
        assert_eq!(CalibrationOffset::new(f64::NAN, 3.0), CalibrationOffset::ZERO);
        assert_eq!(
            CalibrationOffset::new(1.0, f64::INFINITY),
            CalibrationOffset::ZERO
        );
    }

    #[test]
    fn dropout_tolerates_short_gaps() {
        let mut d = Dropout::new(3);
        assert!(!d.miss());
        assert!(!d.miss());
        d.hit();
        assert!(!d.miss());
        assert!(!d.miss());
        assert!(d.miss());
        assert!(d.is_lost());
    }
}
