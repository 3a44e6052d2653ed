use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::dispatch::{self, Job, Summarized};
use super::server::{reply_err, reply_ok};
use crate::calibration::{
    CalibrationController, CalibrationIo, CalibrationOutcome, CalibrationPlan, CancelFlag,
    GazeSource, ThreadTicker,
};
use crate::config::{Profile, StateStore};
use crate::document::DocumentSnapshot;
use crate::geometry::{Viewport, ViewportPoint};
use crate::input::{GazeMessage, UdpGazeSource};
use crate::locator::LocatorSet;
use crate::session::{GazeSession, Selection};

const IDLE_SLEEP: Duration = Duration::from_millis(4);

pub enum PipelineCmd {
    Profile(Profile),
    Open(PathBuf),
    Select(Selection),
    Viewport(Viewport),
    Calibrate,
    Pin,
    Unpin,
    Dismiss,
    Explain,
    Note,
    Status,
    Shutdown,
}

pub struct PipelineRequest {
    cmd: PipelineCmd,
    reply: Option<Sender<Value>>,
}

/// Send a command and wait for its answer.
pub fn call(
    tx: &Sender<PipelineRequest>,
    cmd: PipelineCmd,
    timeout: Option<Duration>,
) -> Result<Value> {
    let (reply_tx, reply_rx) = mpsc::channel();
    tx.send(PipelineRequest {
        cmd,
        reply: Some(reply_tx),
    })
    .map_err(|_| anyhow!("gaze pipeline is not running"))?;
    match timeout {
        Some(t) => reply_rx.recv_timeout(t).map_err(|e| match e {
            RecvTimeoutError::Timeout => anyhow!("gaze pipeline did not answer in {t:?}"),
            RecvTimeoutError::Disconnected => anyhow!("gaze pipeline stopped"),
        }),
        None => reply_rx.recv().map_err(|_| anyhow!("gaze pipeline stopped")),
    }
}

/// Fire-and-forget variant for commands nobody waits on.
pub fn post(tx: &Sender<PipelineRequest>, cmd: PipelineCmd) {
    if tx.send(PipelineRequest { cmd, reply: None }).is_err() {
        warn!("gaze pipeline is not running; command dropped");
    }
}

pub struct PipelineHandle {
    tx: Sender<PipelineRequest>,
    cancel: CancelFlag,
    thread: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn start(profile: Profile, store: StateStore, gaze_addr: SocketAddr) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let thread = thread::Builder::new()
            .name("gazectl-pipeline".into())
            .spawn(move || match Pipeline::new(profile, store, gaze_addr, worker_cancel) {
                Ok(mut p) => p.run(rx),
                Err(e) => error!("gaze pipeline failed to start: {e:#}"),
            })
            .context("spawn gaze pipeline")?;
        Ok(Self {
            tx,
            cancel,
            thread: Some(thread),
        })
    }

    pub fn sender(&self) -> Sender<PipelineRequest> {
        self.tx.clone()
    }

    /// Interrupts a running calibration.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn stop(mut self) {
        self.cancel.cancel();
        post(&self.tx, PipelineCmd::Shutdown);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                error!("gaze pipeline panicked");
            }
        }
    }
}

struct Pipeline {
    session: GazeSession,
    profile: Profile,
    store: StateStore,
    gaze: Option<UdpGazeSource>,
    jobs: Sender<Job>,
    done: Receiver<Summarized>,
    calibrator: CalibrationController,
    cancel: CancelFlag,
    clock: Instant,
}

enum Flow {
    Continue,
    Stop,
}

impl Pipeline {
    fn new(
        profile: Profile,
        store: StateStore,
        gaze_addr: SocketAddr,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let gaze = match UdpGazeSource::bind(gaze_addr) {
            Ok(g) => Some(g),
            Err(e) => {
                warn!("no gaze input: {e:#}");
                None
            }
        };
        let (jobs, done) = dispatch::spawn_worker(&profile.endpoint, false)?;

        let mut session = GazeSession::new(&profile, LocatorSet::new(), Viewport::default());
        session.set_offset(store.calibration());
        session.restore_pin(store.pinned_popup());
        info!(
            "pipeline ready (offset dx={:.1} dy={:.1})",
            session.offset().dx,
            session.offset().dy
        );

        Ok(Self {
            session,
            profile,
            store,
            gaze,
            jobs,
            done,
            calibrator: CalibrationController::new(),
            cancel,
            clock: Instant::now(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    fn run(&mut self, rx: Receiver<PipelineRequest>) {
        loop {
            let mut busy = false;

            match rx.try_recv() {
                Ok(req) => {
                    busy = true;
                    let (resp, flow) = self.handle(req.cmd);
                    if let Some(reply) = req.reply {
                        let _ = reply.send(resp);
                    }
                    if let Flow::Stop = flow {
                        info!("pipeline stopping");
                        return;
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return,
            }

            let msgs = self.gaze.as_mut().map(|g| g.poll()).unwrap_or_default();
            for msg in msgs {
                busy = true;
                let now = self.now_ms();
                let sample = match msg {
                    GazeMessage::Sample(s) => Some(s),
                    GazeMessage::Missing => None,
                    GazeMessage::Ready => continue,
                };
                if let Some(req) = self.session.on_gaze(sample, now) {
                    dispatch::submit(&self.jobs, req);
                }
                if let (true, Some(p)) = (self.profile.features.debug, self.session.last_point()) {
                    debug!(
                        "gaze at ({:.0}, {:.0}) dwell {:?}",
                        p.x,
                        p.y,
                        self.session.dwell().state()
                    );
                }
            }

            while let Ok(done) = self.done.try_recv() {
                busy = true;
                let now = self.now_ms();
                dispatch::present(&mut self.session, done, now);
                if let Some(pin) = self.session.take_new_pin() {
                    if let Err(e) = self.store.set_pinned_popup(Some(pin)) {
                        warn!("pin not saved: {e}");
                    }
                }
            }

            if self.session.tick(self.now_ms()) {
                info!("popup hidden");
            }

            if !busy {
                thread::sleep(IDLE_SLEEP);
            }
        }
    }

    fn handle(&mut self, cmd: PipelineCmd) -> (Value, Flow) {
        let now = self.now_ms();
        let resp = match cmd {
            PipelineCmd::Profile(p) => {
                self.session.apply_profile(&p);
                if self.jobs.send(Job::Endpoint(p.endpoint.clone())).is_err() {
                    warn!("summarizer worker is gone");
                }
                self.profile = p;
                reply_ok(json!("profile applied"))
            }
            PipelineCmd::Open(path) => self.open(path),
            PipelineCmd::Select(sel) => match self.session.on_selection(sel, now) {
                Some(req) => {
                    let id = req.id;
                    dispatch::submit(&self.jobs, req);
                    reply_ok(json!({"request": id}))
                }
                None => reply_err("selection ignored"),
            },
            PipelineCmd::Viewport(vp) => {
                self.session.set_viewport(vp);
                reply_ok(json!(vp))
            }
            PipelineCmd::Calibrate => self.calibrate(),
            PipelineCmd::Pin => match self.session.pin() {
                Some(pin) => match self.store.set_pinned_popup(Some(pin)) {
                    Ok(()) => reply_ok(json!(pin)),
                    Err(e) => reply_err(e),
                },
                None => reply_err("no visible popup"),
            },
            PipelineCmd::Unpin => {
                self.session.unpin();
                match self.store.set_pinned_popup(None) {
                    Ok(()) => reply_ok(json!("unpinned")),
                    Err(e) => reply_err(e),
                }
            }
            PipelineCmd::Dismiss => {
                if self.session.dismiss() {
                    reply_ok(json!("dismissed"))
                } else {
                    reply_err("no dismissable popup")
                }
            }
            PipelineCmd::Explain => match self.session.explain_more(now) {
                Some(req) => {
                    let id = req.id;
                    dispatch::submit(&self.jobs, req);
                    reply_ok(json!({"request": id}))
                }
                None => reply_err("no visible popup"),
            },
            PipelineCmd::Note => {
                let id = self.store.notes().iter().map(|n| n.id).max().unwrap_or(0) + 1;
                match self.session.note(id) {
                    Some(note) => match self.store.add_note(note.clone()) {
                        Ok(()) => reply_ok(json!(note)),
                        Err(e) => reply_err(e),
                    },
                    None => reply_err("no visible popup"),
                }
            }
            PipelineCmd::Status => reply_ok(self.status()),
            PipelineCmd::Shutdown => return (reply_ok(json!("stopping")), Flow::Stop),
        };
        (resp, Flow::Continue)
    }

    fn open(&mut self, path: PathBuf) -> Value {
        let doc = match DocumentSnapshot::load(&path) {
            Ok(d) => d,
            Err(e) => return reply_err(e),
        };
        let base = path.parent().map(PathBuf::from).unwrap_or_default();
        let timeout = Duration::from_millis(self.profile.endpoint.timeout_ms);
        let locators = doc.build_locators(&base, timeout);
        let kinds = locators.kinds();
        self.session.set_document(locators, doc.viewport);
        reply_ok(json!({"url": doc.url, "locators": kinds}))
    }

    fn calibrate(&mut self) -> Value {
        let plan = CalibrationPlan::from(&self.profile.calibration);
        let vp = *self.session.viewport();
        self.cancel.reset();
        let mut display = |idx: usize, p: ViewportPoint| {
            info!("calibration: look at target {} ({:.0}, {:.0})", idx + 1, p.x, p.y);
        };
        let mut ticker = ThreadTicker;
        let io = CalibrationIo {
            source: self.gaze.as_mut().map(|g| g as &mut dyn GazeSource),
            display: &mut display,
            ticker: &mut ticker,
            cancel: &self.cancel,
        };
        let outcome = self.calibrator.run(
            &plan,
            &vp,
            io,
            self.session.conditioner_mut(),
            &mut self.store,
        );
        match outcome {
            Ok(CalibrationOutcome::Completed {
                offset,
                points_used,
            }) => reply_ok(json!({
                "result": "completed",
                "offset": offset,
                "points_used": points_used,
            })),
            Ok(CalibrationOutcome::NoProducer) => {
                reply_ok(json!({"result": "no_producer", "offset": self.session.offset()}))
            }
            Ok(CalibrationOutcome::Cancelled) => {
                reply_ok(json!({"result": "cancelled", "offset": self.session.offset()}))
            }
            Err(e) => reply_err(e),
        }
    }

    fn status(&self) -> Value {
        json!({
            "locators": self.session.locators().kinds(),
            "viewport": self.session.viewport(),
            "offset": self.session.offset(),
            "dwell": format!("{:?}", self.session.dwell().state()),
            "gaze": {
                "listening": self.gaze.as_ref().and_then(|g| g.local_addr().ok()),
                "producer_seen": self.gaze.as_ref().is_some_and(UdpGazeSource::seen_producer),
                "last_point": self.session.last_point(),
            },
            "popup": self.session.popup(),
            "features": self.session.features(),
        })
    }
}
