//! Guided N-point calibration.
//!
//! The sampling loop only talks to capabilities: a [`GazeSource`] for raw
//! predictions, a display callback that shows each target, a [`Ticker`] that
//! suspends between samples and a [`CancelFlag`]. The offset math is the
//! pure [`estimate_offset`].

use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::config::{CalibrationSettings, StoreError};
use crate::geometry::{Viewport, ViewportPoint};
use crate::signal::{CalibrationOffset, RawSample, SignalConditioner, normalize};

/// Corners and centre, in fractions of the viewport.
pub const DEFAULT_TARGETS: [(f64, f64); 5] =
    [(0.1, 0.1), (0.9, 0.1), (0.5, 0.5), (0.1, 0.9), (0.9, 0.9)];

/// Anything that can be polled for "where is the user looking right now".
pub trait GazeSource {
    fn is_available(&self) -> bool {
        true
    }
    fn current_prediction(&mut self) -> Option<RawSample>;
}

pub trait Ticker {
    fn sleep(&mut self, d: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTicker;

impl Ticker for ThreadTicker {
    fn sleep(&mut self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Shared cancellation switch. Clones observe the same flag.
#[derive(Debug, Default, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
    /// Raw flag, for `signal_hook::flag::register`.
    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Where a finished offset is persisted.
pub trait OffsetStore {
    fn load_offset(&self) -> CalibrationOffset;
    fn save_offset(&mut self, offset: CalibrationOffset) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct CalibrationPlan {
    pub targets: Vec<(f64, f64)>,
    pub interval_ms: u64,
    pub window_ms: u64,
    pub quota: usize,
    pub settle_ms: u64,
}

impl Default for CalibrationPlan {
    fn default() -> Self {
        Self::from(&CalibrationSettings::default())
    }
}

impl From<&CalibrationSettings> for CalibrationPlan {
    fn from(s: &CalibrationSettings) -> Self {
        Self {
            targets: DEFAULT_TARGETS.to_vec(),
            interval_ms: s.interval_ms.max(1),
            window_ms: s.window_ms,
            quota: s.quota.max(1),
            settle_ms: s.settle_ms,
        }
    }
}

impl CalibrationPlan {
    fn max_ticks(&self) -> u64 {
        self.window_ms.div_ceil(self.interval_ms.max(1))
    }

    pub fn target_px(&self, idx: usize, vp: &Viewport) -> Option<ViewportPoint> {
        self.targets
            .get(idx)
            .map(|&(fx, fy)| ViewportPoint::new(fx * vp.width, fy * vp.height))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationOutcome {
    Completed {
        offset: CalibrationOffset,
        points_used: usize,
    },
    NoProducer,
    Cancelled,
}

impl CalibrationOutcome {
    /// The offset a caller should report: neutral unless completed.
    pub fn offset(&self) -> CalibrationOffset {
        match self {
            CalibrationOutcome::Completed { offset, .. } => *offset,
            _ => CalibrationOffset::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("a calibration run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Capabilities a run needs from its host.
pub struct CalibrationIo<'a> {
    pub source: Option<&'a mut dyn GazeSource>,
    pub display: &'a mut dyn FnMut(usize, ViewportPoint),
    pub ticker: &'a mut dyn Ticker,
    pub cancel: &'a CancelFlag,
}

struct Interrupted;

/// Average of the normalized samples gathered for one target, if any.
fn collect_point(
    source: &mut dyn GazeSource,
    vp: &Viewport,
    plan: &CalibrationPlan,
    ticker: &mut dyn Ticker,
    cancel: &CancelFlag,
) -> Result<Option<(f64, f64)>, Interrupted> {
    let mut sum = (0.0, 0.0);
    let mut n = 0usize;
    for _ in 0..plan.max_ticks() {
        ticker.sleep(Duration::from_millis(plan.interval_ms));
        if cancel.is_cancelled() {
            return Err(Interrupted);
        }
        if let Some(p) = source
            .current_prediction()
            .and_then(|raw| normalize(&raw, vp))
        {
            sum.0 += p.x;
            sum.1 += p.y;
            n += 1;
        }
        if n >= plan.quota {
            break;
        }
    }
    Ok((n > 0).then(|| (sum.0 / n as f64, sum.1 / n as f64)))
}

/// Mean of `target − average` over the targets that collected anything.
pub fn estimate_offset(
    targets: &[ViewportPoint],
    averages: &[Option<(f64, f64)>],
) -> (CalibrationOffset, usize) {
    let mut dx = 0.0;
    let mut dy = 0.0;
    let mut count = 0usize;
    for (t, avg) in targets.iter().zip(averages) {
        if let Some((ax, ay)) = avg {
            dx += t.x - ax;
            dy += t.y - ay;
            count += 1;
        }
    }
    if count == 0 {
        return (CalibrationOffset::ZERO, 0);
    }
    (
        CalibrationOffset::new(dx / count as f64, dy / count as f64),
        count,
    )
}

#[derive(Debug, Default)]
pub struct CalibrationController {
    running: AtomicBool,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CalibrationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the sequence. Completed runs (including the neutral results of a
    /// missing producer or an all-empty run) are persisted and applied to
    /// `conditioner`; a cancelled run touches neither.
    pub fn run(
        &self,
        plan: &CalibrationPlan,
        vp: &Viewport,
        io: CalibrationIo<'_>,
        conditioner: &mut SignalConditioner,
        store: &mut dyn OffsetStore,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CalibrationError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let CalibrationIo {
            source,
            display,
            ticker,
            cancel,
        } = io;

        let source = match source {
            Some(s) if s.is_available() => s,
            _ => {
                warn!("calibration: no gaze producer; applying neutral offset");
                conditioner.set_offset(CalibrationOffset::ZERO);
                store.save_offset(CalibrationOffset::ZERO)?;
                return Ok(CalibrationOutcome::NoProducer);
            }
        };

        let mut targets = Vec::with_capacity(plan.targets.len());
        let mut averages = Vec::with_capacity(plan.targets.len());
        for idx in 0..plan.targets.len() {
            let Some(target) = plan.target_px(idx, vp) else {
                break;
            };
            if cancel.is_cancelled() {
                info!("calibration cancelled before point {}", idx + 1);
                return Ok(CalibrationOutcome::Cancelled);
            }
            display(idx, target);
            ticker.sleep(Duration::from_millis(plan.settle_ms));

            match collect_point(source, vp, plan, ticker, cancel) {
                Ok(avg) => {
                    debug!("calibration point {} at {:?}: {:?}", idx + 1, target, avg);
                    targets.push(target);
                    averages.push(avg);
                }
                Err(Interrupted) => {
                    info!("calibration cancelled during point {}", idx + 1);
                    return Ok(CalibrationOutcome::Cancelled);
                }
            }
        }

        let (offset, points_used) = estimate_offset(&targets, &averages);
        if points_used == 0 {
            warn!("calibration: no usable samples; applying neutral offset");
        } else {
            info!(
                "calibration finished: dx={:.1} dy={:.1} from {points_used} point(s)",
                offset.dx, offset.dy
            );
        }
        // applied even when it cannot be persisted
        conditioner.set_offset(offset);
        store.save_offset(offset)?;
        Ok(CalibrationOutcome::Completed {
            offset,
            points_used,
        })
    }
}
