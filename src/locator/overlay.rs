//! Slide decks and other documents without native page rendering. Text runs
//! are pulled out of the deck's XML parts and laid out as invisible boxes
//! over the document canvas so they can be hit-tested.

use log::{debug, warn};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use zip::ZipArchive;

use super::{ContentLocator, DocumentError, SourceKind, TextUnit, UnitId};
use crate::geometry::{Rect, Viewport, ViewportPoint};
use crate::text::{truncate_chars, unescape_xml};

pub const MAX_BLOCK_CHARS: usize = 400;

const SLIDE_PREFIX: &str = "ppt/slides/slide";
const BOX_LEFT_FRAC: f64 = 0.08;
const BOX_WIDTH_FRAC: f64 = 0.84;
const BOX_TOP_PX: f64 = 8.0;
const BOX_PITCH_PX: f64 = 100.0;
const BOX_PAD_PX: f64 = 8.0;
const LINE_PX: f64 = 20.0;
const GLYPH_PX: f64 = 8.0;
const MAX_BOX_PX: f64 = 92.0;

static TEXT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<a:t(?:\s[^>]*)?>(.*?)</a:t>").expect("valid regex"));

/// An archive of named structured parts.
pub trait SlideArchive {
    fn part_names(&self) -> Vec<String>;
    fn read_part(&mut self, name: &str) -> Result<String, DocumentError>;
}

pub struct ZipSlideArchive {
    zip: ZipArchive<Cursor<Vec<u8>>>,
}

impl ZipSlideArchive {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, DocumentError> {
        Ok(Self {
            zip: ZipArchive::new(Cursor::new(bytes))?,
        })
    }

    pub fn open(path: &Path) -> Result<Self, DocumentError> {
        let bytes = std::fs::read(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(bytes)
    }

    pub fn fetch(url: &str, timeout: Duration) -> Result<Self, DocumentError> {
        let fetch_err = |source| DocumentError::Fetch {
            url: url.to_string(),
            source,
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(fetch_err)?;
        let bytes = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .map_err(fetch_err)?;
        Self::from_bytes(bytes.to_vec())
    }
}

impl SlideArchive for ZipSlideArchive {
    fn part_names(&self) -> Vec<String> {
        self.zip.file_names().map(String::from).collect()
    }

    fn read_part(&mut self, name: &str) -> Result<String, DocumentError> {
        let mut file = self.zip.by_name(name)?;
        let mut xml = String::new();
        file.read_to_string(&mut xml)
            .map_err(|source| DocumentError::Part {
                part: name.to_string(),
                source,
            })?;
        Ok(xml)
    }
}

/// Parts already held in memory, keyed by part name.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive(pub BTreeMap<String, String>);

impl SlideArchive for MemoryArchive {
    fn part_names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    fn read_part(&mut self, name: &str) -> Result<String, DocumentError> {
        self.0.get(name).cloned().ok_or_else(|| DocumentError::Part {
            part: name.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}

/// Slide parts in slide-number order.
pub fn slide_parts(names: &[String]) -> Vec<String> {
    let mut slides: Vec<(u32, &String)> = names
        .iter()
        .filter_map(|n| {
            let num = n.strip_prefix(SLIDE_PREFIX)?.strip_suffix(".xml")?;
            num.parse().ok().map(|k| (k, n))
        })
        .collect();
    slides.sort_by_key(|(k, _)| *k);
    slides.into_iter().map(|(_, n)| n.clone()).collect()
}

/// Text runs of one slide, entity-decoded.
pub fn extract_runs(xml: &str) -> Vec<String> {
    TEXT_RUN
        .captures_iter(xml)
        .map(|c| unescape_xml(&c[1]))
        .collect()
}

fn is_deck_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".pptx")
}

/// A deck link for the page: the URL itself, else the first matching link.
pub fn find_slide_source<'a>(url: &'a str, links: &'a [String]) -> Option<&'a str> {
    if is_deck_url(url) {
        return Some(url);
    }
    links.iter().map(String::as_str).find(|l| is_deck_url(l))
}

fn box_height(text: &str, width: f64) -> f64 {
    let inner = (width - 2.0 * BOX_PAD_PX).max(GLYPH_PX);
    let per_line = (inner / GLYPH_PX).floor().max(1.0);
    let lines = (text.chars().count() as f64 / per_line).ceil().max(1.0);
    (2.0 * BOX_PAD_PX + lines * LINE_PX).min(MAX_BOX_PX)
}

pub struct OverlayLocator {
    archive: Option<Box<dyn SlideArchive + Send>>,
    /// One slot per slide; empty for slides without readable text.
    blocks: Vec<String>,
    parsed: bool,
    canvas: Rect,
}

impl OverlayLocator {
    pub fn new(archive: Option<Box<dyn SlideArchive + Send>>) -> Self {
        Self {
            archive,
            blocks: Vec::new(),
            parsed: false,
            canvas: Viewport::default().rect(),
        }
    }

    /// A locator with no source; every lookup misses.
    pub fn unavailable() -> Self {
        Self::new(None)
    }

    /// Slot count, including empty slides.
    pub fn block_count(&mut self) -> usize {
        self.ensure_parsed();
        self.blocks.len()
    }

    fn ensure_parsed(&mut self) {
        if self.parsed {
            return;
        }
        self.parsed = true;
        let Some(archive) = self.archive.as_mut() else {
            return;
        };
        for part in slide_parts(&archive.part_names()) {
            let text = match archive.read_part(&part) {
                Ok(xml) => {
                    let joined = extract_runs(&xml).join(" ");
                    truncate_chars(joined.trim(), MAX_BLOCK_CHARS).to_string()
                }
                Err(e) => {
                    warn!("slide part {part}: {e}");
                    String::new()
                }
            };
            self.blocks.push(text);
        }
        debug!("overlay: {} slide block(s)", self.blocks.len());
    }

    fn block_rect(&self, idx: usize) -> Rect {
        let width = self.canvas.width() * BOX_WIDTH_FRAC;
        let left = self.canvas.left + self.canvas.width() * BOX_LEFT_FRAC;
        let top = self.canvas.top + BOX_TOP_PX + idx as f64 * BOX_PITCH_PX;
        let h = box_height(&self.blocks[idx], width);
        Rect::new(left, top, left + width, top + h)
    }
}

impl ContentLocator for OverlayLocator {
    fn kind(&self) -> SourceKind {
        SourceKind::Overlay
    }

    fn update_viewport(&mut self, vp: &Viewport) {
        self.canvas = vp.rect().translate(-vp.scroll_x, -vp.scroll_y);
    }

    fn find_unit_at(&mut self, point: ViewportPoint) -> Option<TextUnit> {
        self.ensure_parsed();
        (0..self.blocks.len())
            .filter(|&i| !self.blocks[i].is_empty())
            .map(|i| (i, self.block_rect(i)))
            .find(|(_, r)| r.contains_point(point))
            .map(|(i, rect)| TextUnit {
                id: UnitId::new(SourceKind::Overlay, i as u64),
                text: self.blocks[i].clone(),
                rect,
            })
    }

    fn unit_text(&mut self, unit: &TextUnit) -> String {
        self.ensure_parsed();
        self.blocks
            .get(unit.id.index as usize)
            .cloned()
            .unwrap_or_default()
    }
}
