//! Text in, prose out: the summarization endpoint client and its local
//! stand-in.

use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::config::Endpoint;
use crate::text::truncate_chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryMode {
    #[default]
    Tldr,
    ExplainMore,
    ExplainCode,
}

impl SummaryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryMode::Tldr => "tldr",
            SummaryMode::ExplainMore => "explain_more",
            SummaryMode::ExplainCode => "explain_code",
        }
    }

    /// Mode for a piece of selected text.
    pub fn for_selection(text: &str, in_code_block: bool) -> Self {
        if is_likely_code(text, in_code_block) {
            SummaryMode::ExplainCode
        } else {
            SummaryMode::Tldr
        }
    }
}

impl fmt::Display for SummaryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "tldr" | "tl;dr" => Ok(SummaryMode::Tldr),
            "explain_more" | "more" => Ok(SummaryMode::ExplainMore),
            "explain_code" | "code" => Ok(SummaryMode::ExplainCode),
            other => Err(anyhow::anyhow!("unknown summary mode: {other}")),
        }
    }
}

static CODE_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:function|var|let|const|if|else|for|while|return|class|def|import|public|private|static|void|int|float|String|using|try|catch|finally|async|await)\b|=>|#include")
        .expect("valid regex")
});

/// Source-code heuristic: inside a code block, more than two of `{ } ;`,
/// more than one keyword, or over a fifth of the lines indented.
pub fn is_likely_code(text: &str, in_code_block: bool) -> bool {
    if in_code_block {
        return true;
    }
    let punct = text.chars().filter(|c| matches!(c, '{' | '}' | ';')).count();
    if punct > 2 {
        return true;
    }
    if CODE_KEYWORDS.find_iter(text).count() > 1 {
        return true;
    }
    let lines: Vec<&str> = text.split('\n').collect();
    let indented = lines
        .iter()
        .filter(|l| l.starts_with(char::is_whitespace) && !l.trim().is_empty())
        .count();
    indented as f64 / lines.len().max(1) as f64 > 0.2
}

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("no text provided")]
    EmptyText,
    #[error("summarization request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },
    #[error("endpoint response carried no summary")]
    NoSummary,
}

pub trait Summarizer: Send {
    fn name(&self) -> &'static str;
    fn summarize(&self, text: &str, mode: SummaryMode) -> Result<String, SummarizeError>;
}

fn check_text(text: &str) -> Result<(), SummarizeError> {
    if text.trim().chars().count() < 3 {
        return Err(SummarizeError::EmptyText);
    }
    Ok(())
}

#[derive(Serialize)]
struct SummaryRequest<'a> {
    text: &'a str,
    mode: SummaryMode,
}

#[derive(Debug, Default, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpSummarizer {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpSummarizer {
    pub fn new(endpoint: &Endpoint) -> Result<Self, SummarizeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(endpoint.timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            client,
            url: endpoint.url.clone(),
        })
    }
}

impl Summarizer for HttpSummarizer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn summarize(&self, text: &str, mode: SummaryMode) -> Result<String, SummarizeError> {
        check_text(text)?;
        debug!("POST {} mode={mode} ({} chars)", self.url, text.chars().count());
        let resp = self
            .client
            .post(&self.url)
            .json(&SummaryRequest { text, mode })
            .send()?;
        let status = resp.status();
        let body = match resp.json::<SummaryResponse>() {
            Ok(b) => b,
            Err(e) if !status.is_success() => {
                return Err(SummarizeError::Endpoint {
                    status: status.as_u16(),
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(message) = body.error {
            return Err(SummarizeError::Endpoint {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            return Err(SummarizeError::Endpoint {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("error").to_string(),
            });
        }
        body.summary
            .or(body.result)
            .filter(|s| !s.trim().is_empty())
            .ok_or(SummarizeError::NoSummary)
    }
}

const TLDR_LIMIT: usize = 240;
const TLDR_KEEP: usize = 237;
const EXPLAIN_KEEP: usize = 800;

/// Canned local-only answers; useful without a reachable endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineSummarizer;

impl Summarizer for OfflineSummarizer {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn summarize(&self, text: &str, mode: SummaryMode) -> Result<String, SummarizeError> {
        check_text(text)?;
        let len = text.chars().count();
        Ok(match mode {
            SummaryMode::Tldr => {
                if len > TLDR_LIMIT {
                    format!("TL;DR (local-only): {}...", truncate_chars(text, TLDR_KEEP))
                } else {
                    format!("TL;DR (local-only): {text}")
                }
            }
            SummaryMode::ExplainMore | SummaryMode::ExplainCode => {
                let ellipsis = if len > EXPLAIN_KEEP { "..." } else { "" };
                format!(
                    "Explanation (local-only): {}{ellipsis}",
                    truncate_chars(text, EXPLAIN_KEEP)
                )
            }
        })
    }
}

/// Tries the endpoint, answers locally when it fails.
pub struct FallbackSummarizer {
    primary: Box<dyn Summarizer>,
    local: OfflineSummarizer,
}

impl FallbackSummarizer {
    pub fn new(primary: Box<dyn Summarizer>) -> Self {
        Self {
            primary,
            local: OfflineSummarizer,
        }
    }
}

impl Summarizer for FallbackSummarizer {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn summarize(&self, text: &str, mode: SummaryMode) -> Result<String, SummarizeError> {
        check_text(text)?;
        match self.primary.summarize(text, mode) {
            Ok(s) => Ok(s),
            Err(e) => {
                warn!("{} summarizer failed ({e}); answering locally", self.primary.name());
                self.local.summarize(text, mode)
            }
        }
    }
}

/// Summarizer for an endpoint section: offline when asked to be, otherwise
/// HTTP with a local fallback.
pub fn from_endpoint(endpoint: &Endpoint, force_offline: bool) -> Box<dyn Summarizer> {
    if force_offline || endpoint.offline {
        return Box::new(OfflineSummarizer);
    }
    match HttpSummarizer::new(endpoint) {
        Ok(http) => Box::new(FallbackSummarizer::new(Box::new(http))),
        Err(e) => {
            warn!("HTTP client unavailable ({e}); summaries are local-only");
            Box::new(OfflineSummarizer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Serve one canned HTTP response and hand back the request body.
    fn one_shot(status: &'static str, body: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/summarize", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(v) = lower.strip_prefix("content-length:") {
                    content_length = v.trim().parse().unwrap();
                }
            }
            let mut req = vec![0u8; content_length];
            reader.read_exact(&mut req).unwrap();
            tx.send(String::from_utf8(req).unwrap()).unwrap();
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
        });
        (url, rx)
    }

    fn endpoint(url: String) -> Endpoint {
        Endpoint {
            url,
            timeout_ms: 5_000,
            offline: false,
        }
    }

    #[test]
    fn code_heuristic() {
        assert!(is_likely_code("fn main() { let x = 1; }", false));
        assert!(is_likely_code("const f = async () => await g()", false));
        assert!(is_likely_code("line one\n    indented\n    more", false));
        assert!(is_likely_code("plain words", true));
        assert!(!is_likely_code("The quick brown fox jumps over the lazy dog.", false));
        assert!(!is_likely_code("If it rains we stay inside.", false));
        assert_eq!(
            SummaryMode::for_selection("for (i = 0; i < n; i++) {}", false),
            SummaryMode::ExplainCode
        );
    }

    #[test]
    fn modes_parse_and_serialize() {
        assert_eq!("explain-more".parse::<SummaryMode>().unwrap(), SummaryMode::ExplainMore);
        assert!("poem".parse::<SummaryMode>().is_err());
        assert_eq!(
            serde_json::to_string(&SummaryMode::ExplainCode).unwrap(),
            "\"explain_code\""
        );
    }

    #[test]
    fn offline_truncates_like_the_local_endpoint() {
        let s = OfflineSummarizer;
        assert_eq!(
            s.summarize("short text", SummaryMode::Tldr).unwrap(),
            "TL;DR (local-only): short text"
        );
        let long = "a".repeat(300);
        let out = s.summarize(&long, SummaryMode::Tldr).unwrap();
        assert_eq!(out, format!("TL;DR (local-only): {}...", "a".repeat(237)));

        let exact = "b".repeat(240);
        assert!(!s.summarize(&exact, SummaryMode::Tldr).unwrap().ends_with("..."));

        let huge = "c".repeat(900);
        let out = s.summarize(&huge, SummaryMode::ExplainMore).unwrap();
        assert_eq!(out.len(), "Explanation (local-only): ".len() + 800 + 3);
        assert!(matches!(
            s.summarize("  ", SummaryMode::Tldr),
            Err(SummarizeError::EmptyText)
        ));
    }

    #[test]
    fn http_posts_text_and_mode() {
        let (url, rx) = one_shot("200 OK", r#"{"summary":"It is about gaze."}"#);
        let s = HttpSummarizer::new(&endpoint(url)).unwrap();
        let out = s.summarize("A long paragraph about gaze.", SummaryMode::Tldr).unwrap();
        assert_eq!(out, "It is about gaze.");
        let sent: serde_json::Value = serde_json::from_str(&rx.recv().unwrap()).unwrap();
        assert_eq!(sent["text"], "A long paragraph about gaze.");
        assert_eq!(sent["mode"], "tldr");
    }

    #[test]
    fn http_accepts_result_field() {
        let (url, _rx) = one_shot("200 OK", r#"{"result":"via result"}"#);
        let s = HttpSummarizer::new(&endpoint(url)).unwrap();
        assert_eq!(s.summarize("some text here", SummaryMode::ExplainMore).unwrap(), "via result");
    }

    #[test]
    fn http_error_payload_is_an_error() {
        let (url, _rx) = one_shot("500 Internal Server Error", r#"{"error":"AI request failed"}"#);
        let s = HttpSummarizer::new(&endpoint(url)).unwrap();
        match s.summarize("some text here", SummaryMode::Tldr) {
            Err(SummarizeError::Endpoint { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "AI request failed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fallback_answers_locally_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/summarize", listener.local_addr().unwrap());
        drop(listener);
        let s = from_endpoint(&endpoint(url), false);
        let out = s.summarize("nobody is listening", SummaryMode::Tldr).unwrap();
        assert_eq!(out, "TL;DR (local-only): nobody is listening");
    }
}
