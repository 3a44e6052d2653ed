use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use crate::config::Endpoint;
use crate::session::{GazeSession, Popup, SummaryRequest};
use crate::summarize::{SummarizeError, from_endpoint};

pub const NO_SUMMARY_TEXT: &str = "No summary returned.";
pub const UNREACHABLE_TEXT: &str = "Could not reach AI backend.";

pub enum Job {
    Summarize(SummaryRequest),
    /// Rebuild the summarizer after a profile change.
    Endpoint(Endpoint),
}

pub struct Summarized {
    pub request: SummaryRequest,
    pub result: Result<String, SummarizeError>,
}

/// Summaries are produced on their own thread so gaze processing never
/// waits on the network.
pub fn spawn_worker(
    endpoint: &Endpoint,
    offline: bool,
) -> Result<(Sender<Job>, Receiver<Summarized>)> {
    let (job_tx, job_rx) = mpsc::channel::<Job>();
    let (done_tx, done_rx) = mpsc::channel::<Summarized>();
    let endpoint = endpoint.clone();
    thread::Builder::new()
        .name("gazectl-summarize".into())
        .spawn(move || {
            let mut summarizer = from_endpoint(&endpoint, offline);
            for job in job_rx {
                match job {
                    Job::Endpoint(ep) => {
                        summarizer = from_endpoint(&ep, offline);
                        debug!("summarizer now '{}'", summarizer.name());
                    }
                    Job::Summarize(request) => {
                        let result = summarizer.summarize(&request.text, request.mode);
                        if done_tx.send(Summarized { request, result }).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("summarizer worker exiting");
        })
        .context("spawn summarizer worker")?;
    Ok((job_tx, done_rx))
}

pub fn submit(jobs: &Sender<Job>, req: SummaryRequest) {
    let id = req.id;
    if jobs.send(Job::Summarize(req)).is_err() {
        warn!("summarizer worker is gone; request #{id} dropped");
    }
}

/// What the popup shows for a finished request.
pub fn popup_text(result: Result<String, SummarizeError>) -> String {
    match result {
        Ok(s) => s,
        Err(SummarizeError::NoSummary) => NO_SUMMARY_TEXT.to_string(),
        Err(e) => {
            warn!("summary failed: {e}");
            UNREACHABLE_TEXT.to_string()
        }
    }
}

/// Hand a finished summary to the session; logs the popup it shows.
pub fn present(session: &mut GazeSession, done: Summarized, now_ms: u64) -> Option<&Popup> {
    let text = popup_text(done.result);
    let popup = session.present(&done.request, text, now_ms)?;
    match serde_json::to_string(popup) {
        Ok(json) => info!("popup {json}"),
        Err(e) => warn!("popup not serializable: {e}"),
    }
    Some(popup)
}
