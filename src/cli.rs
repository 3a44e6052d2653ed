use anyhow::{Context, Result, anyhow};
use log::warn;
use pico_args::Arguments;
use serde_json::{Value, json};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, process::Command};

use crate::config::{ConfigState, Profile, StateStore};
use crate::document::DocumentSnapshot;
use crate::input::{GazeMessage, TraceEvent, read_trace};
use crate::ipc;
use crate::ipc::dispatch::popup_text;
use crate::session::{GazeSession, Selection};
use crate::signal::CalibrationOffset;
use crate::summarize::{SummaryMode, Summarizer, from_endpoint};

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // Hidden daemon mode (spawned by `start`)
    if pargs.contains("--daemon") {
        return ipc::run_daemon();
    }

    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("start") => {
            let exe = std::env::current_exe()?;
            let child = Command::new(exe).arg("--daemon").spawn()?;
            println!("gazectl: started daemon (pid={})", child.id());
            Ok(())
        }

        Some("stop") => request(json!({"op": "shutdown"})),
        Some("status") => request(json!({"op": "status"})),
        Some("reload") => request(json!({"op": "reload"})),
        Some("list") => request(json!({"op": "list"})),
        Some("doctor") => request(json!({"op": "doctor"})),
        Some("calibrate") => request(json!({"op": "calibrate"})),
        Some("cancel") => request(json!({"op": "cancel"})),
        Some("pin") => request(json!({"op": "pin"})),
        Some("unpin") => request(json!({"op": "unpin"})),
        Some("dismiss") => request(json!({"op": "dismiss"})),
        Some("explain") => request(json!({"op": "explain"})),
        Some("note") => request(json!({"op": "note"})),

        Some("use") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: gazectl use <profile_name>"))?;
            request(json!({"op": "use", "profile": name}))
        }

        Some("open") => {
            let path: PathBuf = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: gazectl open <snapshot.json>"))?;
            let path = path
                .canonicalize()
                .with_context(|| format!("snapshot {}", path.display()))?;
            request(json!({"op": "open", "path": path}))
        }

        Some("select") => {
            let in_code_block = pargs.contains("--code");
            let text = rest_or_stdin(pargs)?;
            let selection = Selection {
                text,
                in_code_block,
                ..Selection::default()
            };
            request(json!({"op": "select", "selection": selection}))
        }

        Some("viewport") => {
            let scroll_y: f64 = pargs.opt_value_from_str("--scroll-y")?.unwrap_or(0.0);
            let width: f64 = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: gazectl viewport <width> <height> [--scroll-y px]"))?;
            let height: f64 = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: gazectl viewport <width> <height> [--scroll-y px]"))?;
            request(json!({
                "op": "viewport",
                "viewport": {"width": width, "height": height, "scroll_y": scroll_y},
            }))
        }

        Some("notes") => {
            let store = open_store()?;
            print_response(&json!({"ok": true, "data": store.notes()}));
            Ok(())
        }

        Some("offset") => {
            let mut store = open_store()?;
            let action: Option<String> = pargs.free_from_str().ok();
            match action.as_deref() {
                None => {}
                Some("reset") => {
                    store.set_calibration(CalibrationOffset::ZERO)?;
                    println!("ok: offset reset (a running daemon keeps its offset until restart)");
                }
                Some(other) => return Err(anyhow!("unknown offset action: {other}")),
            }
            print_response(&json!({"ok": true, "data": store.calibration()}));
            Ok(())
        }

        Some("summarize") => {
            let offline = pargs.contains("--offline");
            let mode: Option<SummaryMode> = pargs.opt_value_from_str("--mode")?;
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("read text from stdin")?;
            let mode = mode.unwrap_or_else(|| SummaryMode::for_selection(&text, false));
            let profile = load_profile();
            let summarizer = from_endpoint(&profile.endpoint, offline);
            println!("{}", summarizer.summarize(&text, mode)?);
            Ok(())
        }

        Some("replay") => {
            let offline = pargs.contains("--offline");
            let doc: PathBuf = pargs
                .value_from_str("--doc")
                .map_err(|_| anyhow!("usage: gazectl replay <trace.jsonl> --doc <snapshot.json>"))?;
            let trace: PathBuf = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: gazectl replay <trace.jsonl> --doc <snapshot.json>"))?;
            let profile = load_profile();
            let summarizer = from_endpoint(&profile.endpoint, offline);
            let stdout = std::io::stdout();
            replay(&trace, &doc, &profile, summarizer.as_ref(), &mut stdout.lock())
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn request(req: Value) -> Result<()> {
    let r = ipc::client_request(req)?;
    print_response(&r);
    Ok(())
}

fn rest_or_stdin(pargs: Arguments) -> Result<String> {
    let words: Vec<String> = pargs
        .finish()
        .into_iter()
        .map(|w| w.to_string_lossy().into_owned())
        .collect();
    if words.is_empty() || words == ["-"] {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    Ok(words.join(" "))
}

fn open_store() -> Result<StateStore> {
    let cfg = ConfigState::load_or_install_default()?;
    Ok(StateStore::open(cfg.state_path()))
}

/// The active profile, or defaults when the config directory is unusable.
fn load_profile() -> Profile {
    match ConfigState::load_or_install_default() {
        Ok(cfg) => cfg.profile,
        Err(e) => {
            warn!("no usable configuration ({e:#}); using defaults");
            Profile::default()
        }
    }
}

/// Run a recorded trace against a document snapshot, writing one JSON
/// event per line: requests, popups and auto-hides.
pub fn replay(
    trace: &Path,
    doc: &Path,
    profile: &Profile,
    summarizer: &dyn Summarizer,
    out: &mut dyn Write,
) -> Result<()> {
    let snapshot = DocumentSnapshot::load(doc)?;
    let base = doc.parent().map(Path::to_path_buf).unwrap_or_default();
    let timeout = Duration::from_millis(profile.endpoint.timeout_ms);
    let locators = snapshot.build_locators(&base, timeout);
    let mut session = GazeSession::new(profile, locators, snapshot.viewport);
    let events = read_trace(trace)?;

    for ev in events {
        let t = ev.time();
        if session.tick(t) {
            writeln!(out, "{}", json!({"t": t, "event": "hidden"}))?;
        }
        let req = match ev {
            TraceEvent::Gaze { msg, .. } => match msg {
                GazeMessage::Sample(s) => session.on_gaze(Some(s), t),
                GazeMessage::Missing => session.on_gaze(None, t),
                GazeMessage::Ready => None,
            },
            TraceEvent::Selection { selection, .. } => session.on_selection(selection, t),
            TraceEvent::Viewport { viewport, .. } => {
                session.set_viewport(viewport);
                None
            }
        };
        let Some(req) = req else { continue };
        writeln!(out, "{}", json!({"t": t, "event": "request", "request": req}))?;
        let text = popup_text(summarizer.summarize(&req.text, req.mode));
        if let Some(popup) = session.present(&req, text, t) {
            writeln!(out, "{}", json!({"t": t, "event": "popup", "popup": popup}))?;
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"gazectl — gaze-driven reading assistant

USAGE:
  gazectl help [command]                  Show general or command-specific help
  gazectl start                           Start the daemon
  gazectl stop                            Stop the daemon
  gazectl status                          Show daemon and session state
  gazectl reload                          Reload active profile
  gazectl use <name>                      Switch active profile
  gazectl list                            List profiles
  gazectl doctor                          Show configuration diagnostics
  gazectl open <snapshot.json>            Load a document snapshot into the session
  gazectl viewport <w> <h> [--scroll-y n] Update the viewport
  gazectl select [--code] <text...>       Summarize a selection (stdin with '-')
  gazectl calibrate                       Run gaze calibration
  gazectl cancel                          Cancel a running calibration
  gazectl pin | unpin | dismiss           Popup controls
  gazectl explain                         Ask for a longer explanation
  gazectl note                            Save the visible popup to notes
  gazectl notes                           Print saved notes
  gazectl offset [reset]                  Show or reset the stored calibration
  gazectl summarize [--mode m] [--offline]
                                          Summarize stdin
  gazectl replay <trace> --doc <snapshot> [--offline]
                                          Replay a recorded session

TIPS:
  - Gaze producers send UDP datagrams to 127.0.0.1:47000 (GAZECTL_GAZE_ADDR)
  - Profiles: ~/.config/gazectl/profiles
  - Active profile pointer: ~/.config/gazectl/active
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "start" => println!("usage: gazectl start\nStarts the background daemon."),
        "stop" => println!("usage: gazectl stop\nStops the running daemon."),
        "status" => println!(
            "usage: gazectl status\nShows active profile, socket, locators, dwell state and popup."
        ),
        "reload" => println!(
            "usage: gazectl reload\nReloads the current profile; keeps last good on error."
        ),
        "use" => {
            println!("usage: gazectl use <name>\nSwitches active profile to <name> and reloads.")
        }
        "list" => println!("usage: gazectl list\nLists available profiles."),
        "doctor" => println!(
            "usage: gazectl doctor\nShows paths, endpoint, stored calibration and hints."
        ),
        "open" => println!(
            "usage: gazectl open <snapshot.json>\nLoads a document snapshot; locators are picked from its content."
        ),
        "viewport" => println!(
            "usage: gazectl viewport <width> <height> [--scroll-y px]\nUpdates the session viewport."
        ),
        "select" => println!(
            "usage: gazectl select [--code] <text...>\nSummarizes a selection; '--code' marks it as inside a code block."
        ),
        "calibrate" => println!(
            "usage: gazectl calibrate\nRuns the five-point calibration; blocks until it finishes."
        ),
        "cancel" => println!("usage: gazectl cancel\nCancels a running calibration."),
        "pin" | "unpin" | "dismiss" => println!(
            "usage: gazectl pin | unpin | dismiss\nPins the popup in place, releases it, or hides it."
        ),
        "explain" => println!(
            "usage: gazectl explain\nRe-requests the visible popup's text in explain_more mode."
        ),
        "note" | "notes" => println!(
            "usage:\n  gazectl note     save the visible popup\n  gazectl notes    print saved notes"
        ),
        "offset" => println!(
            "usage: gazectl offset [reset]\nShows or resets the stored calibration offset."
        ),
        "summarize" => println!(
            "usage: gazectl summarize [--mode tldr|explain_more|explain_code] [--offline] < text"
        ),
        "replay" => println!(
            "usage: gazectl replay <trace.jsonl> --doc <snapshot.json> [--offline]\nPrints one JSON event per line."
        ),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_response(v: &Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarize::OfflineSummarizer;
    use std::fs;

    const SNAPSHOT: &str = r#"{
        "url": "https://example.org/essay",
        "viewport": {"width": 1000, "height": 800},
        "dom": {"nodes": [
            {"id": 1, "tag": "body", "display": "block", "rect": {"left":0,"top":0,"right":1000,"bottom":800}},
            {"id": 2, "parent": 1, "tag": "p", "display": "block",
             "rect": {"left":100,"top":100,"right":500,"bottom":200},
             "text": "Readers linger on the paragraphs that matter most."}
        ]}
    }"#;

    fn run_replay(trace: &str) -> Vec<Value> {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("doc.json");
        let tr = dir.path().join("trace.jsonl");
        fs::write(&doc, SNAPSHOT).unwrap();
        fs::write(&tr, trace).unwrap();
        let mut out = Vec::new();
        replay(&tr, &doc, &Profile::default(), &OfflineSummarizer, &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn replayed_dwell_produces_a_popup() {
        let trace: String = (0..=32)
            .map(|i| format!("{{\"t\":{},\"x\":300,\"y\":150}}\n", i * 50))
            .collect();
        let events = run_replay(&trace);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], json!("request"));
        assert_eq!(events[0]["t"], json!(1500));
        assert_eq!(events[0]["request"]["mode"], json!("tldr"));
        assert_eq!(events[1]["event"], json!("popup"));
        assert_eq!(
            events[1]["popup"]["summary"],
            json!("TL;DR (local-only): Readers linger on the paragraphs that matter most.")
        );
    }

    #[test]
    fn replayed_selection_in_code_block_is_explained() {
        let trace = r#"{"t":10,"selection":{"text":"let total = items.len();","in_code_block":true,"rect":{"left":100,"top":300,"right":300,"bottom":320}}}"#;
        let events = run_replay(trace);
        assert_eq!(events[0]["request"]["mode"], json!("explain_code"));
        let summary = events[1]["popup"]["summary"].as_str().unwrap();
        assert!(summary.starts_with("Explanation (local-only): "));
    }
}
