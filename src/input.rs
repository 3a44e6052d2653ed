//! Gaze sample producers: a UDP listener for live trackers and a JSON-lines
//! trace reader for replay.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;

use crate::calibration::GazeSource;
use crate::geometry::Viewport;
use crate::session::Selection;
use crate::signal::RawSample;

pub const DEFAULT_GAZE_ADDR: &str = "127.0.0.1:47000";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GazeMessage {
    Sample(RawSample),
    /// The producer had no estimate for this frame.
    Missing,
    /// One-shot notice that the producer is up.
    Ready,
}

fn from_json(v: &Value) -> GazeMessage {
    if v.get("type").and_then(Value::as_str) == Some("ready") {
        return GazeMessage::Ready;
    }
    let sample: RawSample = serde_json::from_value(v.clone()).unwrap_or_default();
    if sample.coords().is_some() {
        GazeMessage::Sample(sample)
    } else {
        GazeMessage::Missing
    }
}

/// Accepts `{"x":..,"y":..}`, `{"type":"ready"}`, `null`, or `x=.. y=..`
/// tokens. Anything unrecognised but non-empty counts as a missed frame.
pub fn parse_gaze_message(msg: &str) -> Option<GazeMessage> {
    let msg = msg.trim();
    if msg.is_empty() {
        return None;
    }
    if msg == "ready" {
        return Some(GazeMessage::Ready);
    }
    if msg.starts_with('{') || msg == "null" {
        return Some(match serde_json::from_str::<Value>(msg) {
            Ok(v) => from_json(&v),
            Err(_) => GazeMessage::Missing,
        });
    }

    let mut x = None;
    let mut y = None;
    for tok in msg.split_whitespace() {
        match tok.split_once('=') {
            Some(("x", v)) => x = v.parse::<f64>().ok(),
            Some(("y", v)) => y = v.parse::<f64>().ok(),
            _ => {}
        }
    }
    Some(match (x, y) {
        (Some(x), Some(y)) if x.is_finite() && y.is_finite() => {
            GazeMessage::Sample(RawSample::new(x, y))
        }
        _ => GazeMessage::Missing,
    })
}

pub fn gaze_addr_from_env() -> Option<SocketAddr> {
    let raw = std::env::var("GAZECTL_GAZE_ADDR").ok()?;
    raw.parse::<SocketAddr>().ok()
}

/// Non-blocking UDP listener; one message per datagram.
pub struct UdpGazeSource {
    sock: UdpSocket,
    latest: Option<RawSample>,
    seen: bool,
    buf: Vec<u8>,
}

impl UdpGazeSource {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let sock = UdpSocket::bind(addr).with_context(|| format!("bind gaze socket {addr}"))?;
        sock.set_nonblocking(true)
            .context("set gaze socket non-blocking")?;
        info!("gaze listener bound on {}", sock.local_addr()?);
        Ok(Self {
            sock,
            latest: None,
            seen: false,
            buf: vec![0u8; 2048],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Has anything ever arrived (samples, misses or a ready notice).
    pub fn seen_producer(&self) -> bool {
        self.seen
    }

    /// Drain every pending datagram, in arrival order.
    pub fn poll(&mut self) -> Vec<GazeMessage> {
        let mut out = Vec::new();
        loop {
            match self.sock.recv_from(&mut self.buf) {
                Ok((len, _src)) => {
                    let Ok(s) = std::str::from_utf8(&self.buf[..len]) else {
                        debug!("non-UTF-8 gaze datagram dropped");
                        out.push(GazeMessage::Missing);
                        continue;
                    };
                    if let Some(msg) = parse_gaze_message(s) {
                        self.seen = true;
                        match msg {
                            GazeMessage::Sample(raw) => self.latest = Some(raw),
                            GazeMessage::Missing => self.latest = None,
                            GazeMessage::Ready => info!("gaze producer ready"),
                        }
                        out.push(msg);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("gaze recv error: {e}");
                    break;
                }
            }
        }
        out
    }
}

impl GazeSource for UdpGazeSource {
    fn is_available(&self) -> bool {
        self.seen
    }

    fn current_prediction(&mut self) -> Option<RawSample> {
        self.poll();
        self.latest
    }
}

/// One line of a recorded session.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Gaze { t: u64, msg: GazeMessage },
    Selection { t: u64, selection: Selection },
    Viewport { t: u64, viewport: Viewport },
}

impl TraceEvent {
    pub fn time(&self) -> u64 {
        match self {
            TraceEvent::Gaze { t, .. }
            | TraceEvent::Selection { t, .. }
            | TraceEvent::Viewport { t, .. } => *t,
        }
    }
}

fn parse_trace_line(v: &Value) -> Result<TraceEvent> {
    let t = v
        .get("t")
        .and_then(Value::as_u64)
        .context("missing or non-integer \"t\"")?;
    if let Some(sel) = v.get("selection") {
        let selection = serde_json::from_value(sel.clone()).context("bad selection")?;
        return Ok(TraceEvent::Selection { t, selection });
    }
    if let Some(vp) = v.get("viewport") {
        let viewport = serde_json::from_value(vp.clone()).context("bad viewport")?;
        return Ok(TraceEvent::Viewport { t, viewport });
    }
    let msg = match v.get("gaze") {
        Some(Value::Null) => GazeMessage::Missing,
        Some(g) => from_json(g),
        None => from_json(v),
    };
    Ok(TraceEvent::Gaze { t, msg })
}

/// Parse a JSON-lines trace. Blank lines and `#` comments are skipped; a
/// line that is not a usable event is logged and skipped. Events come back
/// in time order.
pub fn parse_trace(reader: impl BufRead) -> Result<Vec<TraceEvent>> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read trace line {}", idx + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = serde_json::from_str::<Value>(line)
            .map_err(anyhow::Error::from)
            .and_then(|v| parse_trace_line(&v));
        match parsed {
            Ok(ev) => events.push(ev),
            Err(e) => warn!("trace line {} skipped: {e:#}", idx + 1),
        }
    }
    events.sort_by_key(TraceEvent::time);
    Ok(events)
}

pub fn read_trace(path: &Path) -> Result<Vec<TraceEvent>> {
    let f = File::open(path).with_context(|| format!("open trace {}", path.display()))?;
    parse_trace(BufReader::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn parse_json_and_tokens() {
        assert_eq!(
            parse_gaze_message(r#"{"x":120.5,"y":40}"#),
            Some(GazeMessage::Sample(RawSample::new(120.5, 40.0)))
        );
        assert_eq!(
            parse_gaze_message("x=10 y=20 conf=0.9"),
            Some(GazeMessage::Sample(RawSample::new(10.0, 20.0)))
        );
        assert_eq!(parse_gaze_message(r#"{"type":"ready"}"#), Some(GazeMessage::Ready));
        assert_eq!(parse_gaze_message("   "), None);
    }

    #[test]
    fn malformed_samples_are_misses() {
        for msg in ["null", r#"{"x":"12","y":3}"#, r#"{"x":1}"#, "{oops", "x=abc y=1", "hello"] {
            assert_eq!(parse_gaze_message(msg), Some(GazeMessage::Missing), "{msg}");
        }
    }

    #[test]
    fn trace_lines_become_events() {
        let trace = r#"
# recorded by hand
{"t":40,"x":100,"y":200}
{"t":0,"type":"ready"}
{"t":80,"gaze":null}
{"t":90,"gaze":{"x":1,"y":2}}
{"t":120,"selection":{"text":"picked words","in_code_block":true}}
{"t":130,"viewport":{"width":800,"height":600,"scroll_y":50}}
{"x":1,"y":2}
not json
"#;
        let events = parse_trace(trace.as_bytes()).unwrap();
        assert_eq!(events.len(), 6);
        assert_eq!(events[0], TraceEvent::Gaze { t: 0, msg: GazeMessage::Ready });
        assert_eq!(
            events[1],
            TraceEvent::Gaze {
                t: 40,
                msg: GazeMessage::Sample(RawSample::new(100.0, 200.0))
            }
        );
        assert_eq!(events[2], TraceEvent::Gaze { t: 80, msg: GazeMessage::Missing });
        assert!(matches!(
            &events[4],
            TraceEvent::Selection { t: 120, selection } if selection.in_code_block && selection.text == "picked words"
        ));
        assert!(matches!(
            &events[5],
            TraceEvent::Viewport { viewport, .. } if viewport.scroll_y == 50.0
        ));
    }

    #[test]
    fn udp_source_tracks_latest_sample() {
        let mut src = UdpGazeSource::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(!src.is_available());
        let addr = src.local_addr().unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(br#"{"type":"ready"}"#, addr).unwrap();
        tx.send_to(b"x=5 y=6", addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = Vec::new();
        while got.len() < 2 && Instant::now() < deadline {
            got.extend(src.poll());
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            got,
            vec![GazeMessage::Ready, GazeMessage::Sample(RawSample::new(5.0, 6.0))]
        );
        assert!(src.is_available());
        assert_eq!(src.current_prediction(), Some(RawSample::new(5.0, 6.0)));

        tx.send_to(b"null", addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while src.latest.is_some() && Instant::now() < deadline {
            src.poll();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(src.current_prediction(), None);
    }
}
