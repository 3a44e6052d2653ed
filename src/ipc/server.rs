use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde_json::{Value, json};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::fmt::Display;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::pipeline::{PipelineCmd, PipelineHandle, PipelineRequest, call, post};
use super::runtime::socket_path;
use crate::calibration::CancelFlag;
use crate::config::{ConfigState, StateStore};
use crate::geometry::Viewport;
use crate::input::{DEFAULT_GAZE_ADDR, gaze_addr_from_env};
use crate::session::Selection;

const PIPELINE_TIMEOUT: Duration = Duration::from_secs(30);

pub fn reply_ok(data: Value) -> Value {
    json!({"ok": true, "data": data})
}

pub fn reply_err(e: impl Display) -> Value {
    json!({"ok": false, "error": e.to_string()})
}

pub fn run_daemon() -> Result<()> {
    // socket
    let sock = socket_path()?;
    if sock.exists() {
        let _ = std::fs::remove_file(&sock);
    }
    let listener =
        UnixListener::bind(&sock).with_context(|| format!("bind {}", sock.display()))?;
    info!("daemon: listening on {}", sock.display());

    // state
    let cfg = ConfigState::load_or_install_default()?;
    info!("daemon: active profile '{}'", cfg.active_name);
    let gaze_addr = match gaze_addr_from_env() {
        Some(a) => a,
        None => DEFAULT_GAZE_ADDR.parse()?,
    };
    let store = StateStore::open(cfg.state_path());
    let pipeline = PipelineHandle::start(cfg.profile.clone(), store, gaze_addr)?;
    let profiles_dir = cfg.profiles_dir.clone();
    let config_dir = cfg.config_dir.clone();
    let active_ptr = cfg.active_ptr.clone();
    let cfg = Arc::new(Mutex::new(cfg));

    // signals
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("install signal handlers")?;
    {
        let shutdown = Arc::clone(&shutdown);
        let cancel = pipeline.cancel_flag();
        thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("daemon: signal {sig}, shutting down");
                cancel.cancel();
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    // hot reload
    let (tx_fs, rx_fs) = mpsc::channel::<()>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(ev) = res else { return };
        if is_profile_change(&ev, &active_ptr) {
            let _ = tx_fs.send(());
        }
    })?;
    watcher.watch(&profiles_dir, RecursiveMode::NonRecursive)?;
    watcher.watch(&config_dir, RecursiveMode::NonRecursive)?;

    // accept loop
    listener.set_nonblocking(true)?;
    let ctx = ClientCtx {
        cfg: Arc::clone(&cfg),
        pipeline: pipeline.sender(),
        cancel: pipeline.cancel_flag(),
        shutdown: Arc::clone(&shutdown),
        socket: sock.clone(),
    };
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &ctx) {
                        error!("ipc client error: {e:#}");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept failed: {e}"),
        }

        if rx_fs.try_iter().count() > 0 {
            reload_from_disk(&cfg, &ctx.pipeline);
        }

        thread::sleep(Duration::from_millis(5));
    }

    drop(watcher);
    pipeline.stop();
    let _ = std::fs::remove_file(&sock);
    info!("daemon: stopped");
    Ok(())
}

/// Profile files or the active pointer changed. State saves in the same
/// directory do not count.
fn is_profile_change(ev: &Event, active_ptr: &Path) -> bool {
    matches!(
        ev.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && ev
        .paths
        .iter()
        .any(|p| p == active_ptr || p.extension().is_some_and(|e| e == "toml"))
}

fn reload_from_disk(cfg: &Mutex<ConfigState>, pipeline: &Sender<PipelineRequest>) {
    let Ok(mut cfg) = cfg.lock() else {
        error!("config lock poisoned; reload skipped");
        return;
    };
    match cfg.reload() {
        Ok(()) => {
            post(pipeline, PipelineCmd::Profile(cfg.profile.clone()));
            info!("profile '{}' reloaded after change on disk", cfg.active_name);
        }
        Err(e) => warn!("reload failed, keeping last good profile: {e:#}"),
    }
}

#[derive(Clone)]
struct ClientCtx {
    cfg: Arc<Mutex<ConfigState>>,
    pipeline: Sender<PipelineRequest>,
    cancel: CancelFlag,
    shutdown: Arc<AtomicBool>,
    socket: PathBuf,
}

impl ClientCtx {
    fn ask(&self, cmd: PipelineCmd) -> Value {
        let timeout = match cmd {
            PipelineCmd::Calibrate => None,
            _ => Some(PIPELINE_TIMEOUT),
        };
        call(&self.pipeline, cmd, timeout).unwrap_or_else(|e| reply_err(format!("{e:#}")))
    }

    fn with_cfg<F>(&self, f: F) -> Value
    where
        F: FnOnce(&mut ConfigState) -> Value,
    {
        match self.cfg.lock() {
            Ok(mut cfg) => f(&mut cfg),
            Err(_) => reply_err("config lock poisoned"),
        }
    }
}

fn handle_client(mut stream: UnixStream, ctx: &ClientCtx) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let req: Value = match serde_json::from_str(&line) {
        Ok(v) => v,
        Err(e) => {
            writeln!(stream, "{}", reply_err(format!("bad request: {e}")))?;
            return Err(e).context("parse request");
        }
    };
    let resp = respond(&req, ctx);
    writeln!(stream, "{resp}")?;
    Ok(())
}

fn param<T: serde::de::DeserializeOwned>(req: &Value, key: &str) -> Result<T> {
    let v = req
        .get(key)
        .ok_or_else(|| anyhow!("missing \"{key}\""))?;
    serde_json::from_value(v.clone()).with_context(|| format!("bad \"{key}\""))
}

fn respond(req: &Value, ctx: &ClientCtx) -> Value {
    let op = req.get("op").and_then(|v| v.as_str()).unwrap_or("");
    match op {
        "status" => {
            let session = ctx.ask(PipelineCmd::Status);
            ctx.with_cfg(|cfg| {
                reply_ok(json!({
                    "active_profile": cfg.active_name,
                    "socket": ctx.socket,
                    "session": session.get("data").cloned().unwrap_or(session),
                }))
            })
        }
        "reload" => ctx.with_cfg(|cfg| match cfg.reload() {
            Ok(()) => {
                post(&ctx.pipeline, PipelineCmd::Profile(cfg.profile.clone()));
                reply_ok(json!({"active_profile": cfg.active_name}))
            }
            Err(e) => reply_err(format!("{e:#}")),
        }),
        "use" => {
            let name: String = match param(req, "profile") {
                Ok(n) => n,
                Err(e) => return reply_err(e),
            };
            ctx.with_cfg(|cfg| match cfg.set_active(&name) {
                Ok(()) => {
                    post(&ctx.pipeline, PipelineCmd::Profile(cfg.profile.clone()));
                    info!("switched active profile to {}", cfg.active_name);
                    reply_ok(json!({"active_profile": cfg.active_name}))
                }
                Err(e) => reply_err(e),
            })
        }
        "list" => ctx.with_cfg(|cfg| {
            reply_ok(json!({"profiles": cfg.list_profiles(), "active": cfg.active_name}))
        }),
        "doctor" => ctx.with_cfg(|cfg| {
            let store = StateStore::open(cfg.state_path());
            reply_ok(cfg.doctor_report(&store))
        }),
        "calibrate" => ctx.ask(PipelineCmd::Calibrate),
        "cancel" => {
            ctx.cancel.cancel();
            reply_ok(json!("cancel requested"))
        }
        "pin" => ctx.ask(PipelineCmd::Pin),
        "unpin" => ctx.ask(PipelineCmd::Unpin),
        "dismiss" => ctx.ask(PipelineCmd::Dismiss),
        "explain" => ctx.ask(PipelineCmd::Explain),
        "note" => ctx.ask(PipelineCmd::Note),
        "open" => match param::<PathBuf>(req, "path") {
            Ok(p) => ctx.ask(PipelineCmd::Open(p)),
            Err(e) => reply_err(e),
        },
        "select" => match param::<Selection>(req, "selection") {
            Ok(sel) => ctx.ask(PipelineCmd::Select(sel)),
            Err(e) => reply_err(e),
        },
        "viewport" => match param::<Viewport>(req, "viewport") {
            Ok(vp) => ctx.ask(PipelineCmd::Viewport(vp)),
            Err(e) => reply_err(e),
        },
        "shutdown" => {
            ctx.shutdown.store(true, Ordering::SeqCst);
            reply_ok(json!("shutting down"))
        }
        _ => reply_err(format!("unknown op: {op}")),
    }
}

/// Send one request to the daemon at `sock` and read its one-line answer.
pub fn client_request_at(sock: &Path, req: &Value) -> Result<Value> {
    if !sock.exists() {
        return Err(anyhow!(
            "gazectl daemon is not running (socket missing at {})",
            sock.display()
        ));
    }
    let mut stream = UnixStream::connect(sock)?;
    let line = serde_json::to_string(req)? + "\n";
    stream.write_all(line.as_bytes())?;
    let mut reader = BufReader::new(stream);
    let mut resp = String::new();
    reader.read_line(&mut resp)?;
    let v: Value = serde_json::from_str(&resp)?;
    Ok(v)
}

// client helper
pub fn client_request(req: Value) -> Result<Value> {
    client_request_at(&socket_path()?, &req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: ClientCtx,
        pipeline: PipelineHandle,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ConfigState::load_from(dir.path().to_path_buf()).unwrap();
        let mut profile: Profile = cfg.profile.clone();
        profile.endpoint.offline = true;
        let store = StateStore::open(cfg.state_path());
        let pipeline =
            PipelineHandle::start(profile, store, "127.0.0.1:0".parse().unwrap()).unwrap();
        let ctx = ClientCtx {
            cfg: Arc::new(Mutex::new(cfg)),
            pipeline: pipeline.sender(),
            cancel: pipeline.cancel_flag(),
            shutdown: Arc::new(AtomicBool::new(false)),
            socket: dir.path().join("gazectl.sock"),
        };
        Fixture {
            _dir: dir,
            ctx,
            pipeline,
        }
    }

    #[test]
    fn config_ops_answer_from_the_shared_state() {
        let f = fixture();
        let r = respond(&json!({"op": "list"}), &f.ctx);
        assert_eq!(r["data"]["profiles"], json!(["default"]));
        assert_eq!(r["data"]["active"], json!("default"));

        let r = respond(&json!({"op": "use", "profile": "nope"}), &f.ctx);
        assert_eq!(r["ok"], json!(false));
        let r = respond(&json!({"op": "use"}), &f.ctx);
        assert!(r["error"].as_str().unwrap().contains("profile"));

        let r = respond(&json!({"op": "frobnicate"}), &f.ctx);
        assert_eq!(r["error"], json!("unknown op: frobnicate"));
        f.pipeline.stop();
    }

    #[test]
    fn session_ops_reach_the_pipeline() {
        let f = fixture();
        let r = respond(
            &json!({"op": "viewport", "viewport": {"width": 640, "height": 480}}),
            &f.ctx,
        );
        assert_eq!(r["data"]["width"], json!(640.0));

        let r = respond(&json!({"op": "select", "selection": {"text": "short"}}), &f.ctx);
        assert_eq!(r["ok"], json!(false));

        let r = respond(&json!({"op": "status"}), &f.ctx);
        assert_eq!(r["data"]["active_profile"], json!("default"));
        assert_eq!(r["data"]["session"]["viewport"]["height"], json!(480.0));

        let r = respond(&json!({"op": "cancel"}), &f.ctx);
        assert_eq!(r["ok"], json!(true));
        assert!(f.ctx.cancel.is_cancelled());

        respond(&json!({"op": "shutdown"}), &f.ctx);
        assert!(f.ctx.shutdown.load(Ordering::SeqCst));
        f.pipeline.stop();
    }

    #[test]
    fn client_round_trips_over_the_socket() {
        let f = fixture();
        let sock = f.ctx.socket.clone();
        let listener = UnixListener::bind(&sock).unwrap();
        let ctx = f.ctx.clone();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_client(stream, &ctx).unwrap();
        });
        let r = client_request_at(&sock, &json!({"op": "list"})).unwrap();
        assert_eq!(r["ok"], json!(true));
        server.join().unwrap();

        let missing = f.ctx.socket.with_file_name("absent.sock");
        assert!(client_request_at(&missing, &json!({"op": "status"})).is_err());
        f.pipeline.stop();
    }

    #[test]
    fn malformed_lines_still_get_an_answer() {
        let f = fixture();
        let sock = f.ctx.socket.clone();
        let listener = UnixListener::bind(&sock).unwrap();
        let ctx = f.ctx.clone();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_client(stream, &ctx)
        });
        let mut stream = UnixStream::connect(&sock).unwrap();
        stream.write_all(b"{not json\n").unwrap();
        let mut resp = String::new();
        BufReader::new(stream).read_line(&mut resp).unwrap();
        let r: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(r["ok"], json!(false));
        assert!(r["error"].as_str().unwrap().starts_with("bad request"));
        assert!(server.join().unwrap().is_err());
        f.pipeline.stop();
    }

    #[test]
    fn only_profile_files_trigger_a_reload() {
        use notify::event::{CreateKind, ModifyKind};
        let dir = Path::new("/cfg/gazectl");
        let active = dir.join("active");
        let modify = |p: PathBuf| Event::new(EventKind::Modify(ModifyKind::Any)).add_path(p);

        assert!(is_profile_change(&modify(dir.join("profiles/default.toml")), &active));
        assert!(is_profile_change(&modify(active.clone()), &active));
        assert!(!is_profile_change(&modify(dir.join("state.json")), &active));
        assert!(!is_profile_change(
            &Event::new(EventKind::Access(notify::event::AccessKind::Any))
                .add_path(dir.join("profiles/default.toml")),
            &active
        ));
        assert!(is_profile_change(
            &Event::new(EventKind::Create(CreateKind::File)).add_path(dir.join("profiles/fast.toml")),
            &active
        ));
    }
}
