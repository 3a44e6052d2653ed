//! Page-based documents. Units are paragraphs rebuilt from a rendered text
//! layer, or one placeholder per page whose text is decoded on first use.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{ContentLocator, DocumentError, SourceKind, TextUnit, UnitId};
use crate::geometry::{Rect, Viewport, ViewportPoint};

/// Fragments whose rounded tops differ by less than this share a line.
pub const LINE_TOLERANCE_PX: f64 = 6.0;
/// A line joins the paragraph above when its top is this close to the
/// paragraph's bottom.
pub const PARAGRAPH_GAP_PX: f64 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentHandle(pub usize);

/// One positioned run of text. A fragment with a handle is live: its
/// geometry can be re-measured through the layer that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    pub text: String,
    pub rect: Rect,
    pub handle: Option<FragmentHandle>,
}

/// A rendered text layer, one fragment list per page.
pub trait TextLayer {
    fn set_viewport(&mut self, _vp: &Viewport) {}
    fn layers(&self) -> Vec<Vec<TextFragment>>;
    /// Current viewport-relative bounds of a live fragment.
    fn measure(&self, handle: FragmentHandle) -> Option<Rect>;
    fn selected_text(&self) -> String {
        String::new()
    }
}

/// Page-object access for documents without a rendered text layer.
pub trait PageSource {
    fn page_count(&self) -> usize;
    /// Text of a 1-based page.
    fn page_text(&mut self, page: usize) -> Result<String, DocumentError>;
}

#[derive(Debug, Clone)]
pub struct Line {
    pub top: f64,
    pub rect: Rect,
    pub fragments: Vec<TextFragment>,
}

impl Line {
    pub fn text(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct Paragraph {
    pub text: String,
    pub rect: Rect,
    pub handles: Vec<FragmentHandle>,
}

pub fn group_lines(fragments: &[TextFragment]) -> Vec<Line> {
    let mut lines: Vec<Line> = Vec::new();
    for frag in fragments.iter().filter(|f| !f.text.trim().is_empty()) {
        let top = frag.rect.top.round();
        match lines
            .iter_mut()
            .find(|l| (l.top - top).abs() < LINE_TOLERANCE_PX)
        {
            Some(line) => {
                line.rect = line.rect.union(&frag.rect);
                line.fragments.push(frag.clone());
            }
            None => lines.push(Line {
                top,
                rect: frag.rect,
                fragments: vec![frag.clone()],
            }),
        }
    }
    for line in &mut lines {
        line.fragments
            .sort_by(|a, b| a.rect.left.total_cmp(&b.rect.left));
    }
    lines.sort_by(|a, b| a.top.total_cmp(&b.top));
    lines
}

pub fn group_paragraphs(lines: &[Line]) -> Vec<Paragraph> {
    let mut paras: Vec<Paragraph> = Vec::new();
    for line in lines {
        let handles = line.fragments.iter().filter_map(|f| f.handle);
        match paras.last_mut() {
            Some(p) if (line.top - p.rect.bottom).abs() < PARAGRAPH_GAP_PX => {
                p.text.push('\n');
                p.text.push_str(&line.text());
                p.rect = p.rect.union(&line.rect);
                p.handles.extend(handles);
            }
            _ => paras.push(Paragraph {
                text: line.text(),
                rect: line.rect,
                handles: handles.collect(),
            }),
        }
    }
    paras
}

#[derive(Debug, Clone)]
enum Decode {
    Pending,
    Ready(String),
    Failed,
}

#[derive(Debug, Clone)]
enum Backing {
    Layer { text: String, handles: Vec<FragmentHandle> },
    Page { page: usize, decode: Decode },
}

#[derive(Debug, Clone)]
struct IndexedUnit {
    rect: Rect,
    backing: Backing,
}

pub struct PaginatedLocator {
    layer: Option<Box<dyn TextLayer + Send>>,
    pages: Option<Box<dyn PageSource + Send>>,
    viewport: Viewport,
    units: Vec<IndexedUnit>,
    indexed: bool,
}

impl PaginatedLocator {
    pub fn new(
        layer: Option<Box<dyn TextLayer + Send>>,
        pages: Option<Box<dyn PageSource + Send>>,
    ) -> Self {
        Self {
            layer,
            pages,
            viewport: Viewport::default(),
            units: Vec::new(),
            indexed: false,
        }
    }

    pub fn unit_count(&mut self) -> usize {
        self.ensure_indexed();
        self.units.len()
    }

    fn ensure_indexed(&mut self) {
        if self.indexed {
            return;
        }
        self.indexed = true;
        if let Some(layer) = &self.layer {
            for page in layer.layers() {
                let lines = group_lines(&page);
                for p in group_paragraphs(&lines) {
                    self.units.push(IndexedUnit {
                        rect: p.rect,
                        backing: Backing::Layer {
                            text: p.text,
                            handles: p.handles,
                        },
                    });
                }
            }
        }
        if self.units.is_empty() {
            let count = self.pages.as_ref().map(|p| p.page_count()).unwrap_or(0);
            for page in 1..=count {
                self.units.push(IndexedUnit {
                    rect: Rect::default(),
                    backing: Backing::Page {
                        page,
                        decode: Decode::Pending,
                    },
                });
            }
        }
        debug!("paginated index: {} unit(s)", self.units.len());
    }

    /// One viewport height per page, shifted by the current scroll.
    fn placeholder_rect(&self, page: usize) -> Rect {
        let h = self.viewport.height;
        let top = (page as f64 - 1.0) * h - self.viewport.scroll_y;
        Rect::new(0.0, top, self.viewport.width, top + h)
    }

    fn refresh_rect(&mut self, idx: usize) {
        let rect = match &self.units[idx].backing {
            Backing::Layer { handles, .. } if !handles.is_empty() => {
                let Some(layer) = &self.layer else {
                    return;
                };
                handles
                    .iter()
                    .filter_map(|h| layer.measure(*h))
                    .reduce(|a, b| a.union(&b))
            }
            Backing::Layer { .. } => None,
            Backing::Page { page, .. } => Some(self.placeholder_rect(*page)),
        };
        if let Some(r) = rect {
            self.units[idx].rect = r;
        }
    }

    fn text_of(&mut self, idx: usize) -> String {
        let Some(unit) = self.units.get_mut(idx) else {
            return String::new();
        };
        match &mut unit.backing {
            Backing::Layer { text, .. } => text.clone(),
            Backing::Page { page, decode } => match decode {
                Decode::Ready(t) => t.clone(),
                Decode::Failed => String::new(),
                Decode::Pending => {
                    let result = match self.pages.as_mut() {
                        Some(src) => src.page_text(*page),
                        None => Err(DocumentError::Decode {
                            page: *page,
                            reason: "no page source".into(),
                        }),
                    };
                    match result {
                        Ok(t) => {
                            *decode = Decode::Ready(t.clone());
                            t
                        }
                        Err(e) => {
                            warn!("page {page}: {e}");
                            *decode = Decode::Failed;
                            String::new()
                        }
                    }
                }
            },
        }
    }

    fn unit(&mut self, idx: usize) -> TextUnit {
        let text = self.text_of(idx);
        TextUnit {
            id: UnitId::new(SourceKind::Paginated, idx as u64),
            text,
            rect: self.units[idx].rect,
        }
    }
}

impl ContentLocator for PaginatedLocator {
    fn kind(&self) -> SourceKind {
        SourceKind::Paginated
    }

    fn update_viewport(&mut self, vp: &Viewport) {
        self.viewport = *vp;
        if let Some(layer) = &mut self.layer {
            layer.set_viewport(vp);
        }
    }

    fn find_unit_at(&mut self, point: ViewportPoint) -> Option<TextUnit> {
        self.ensure_indexed();
        for idx in 0..self.units.len() {
            self.refresh_rect(idx);
            if self.units[idx].rect.contains_point(point) {
                return Some(self.unit(idx));
            }
        }
        None
    }

    fn unit_text(&mut self, unit: &TextUnit) -> String {
        self.ensure_indexed();
        self.text_of(unit.id.index as usize)
    }

    fn selected_text(&self) -> String {
        self.layer
            .as_ref()
            .map(|l| l.selected_text())
            .unwrap_or_default()
    }
}

/// A captured text layer; fragment rects are in document coordinates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotTextLayer {
    pub pages: Vec<Vec<SnapshotFragment>>,
    #[serde(default)]
    pub selection: String,
    #[serde(skip)]
    scroll: (f64, f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFragment {
    pub text: String,
    pub rect: Rect,
}

impl SnapshotTextLayer {
    pub fn new(pages: Vec<Vec<SnapshotFragment>>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    fn fragment(&self, handle: FragmentHandle) -> Option<&SnapshotFragment> {
        self.pages.iter().flatten().nth(handle.0)
    }

    fn to_viewport(&self, r: &Rect) -> Rect {
        r.translate(-self.scroll.0, -self.scroll.1)
    }
}

impl TextLayer for SnapshotTextLayer {
    fn set_viewport(&mut self, vp: &Viewport) {
        self.scroll = (vp.scroll_x, vp.scroll_y);
    }

    fn layers(&self) -> Vec<Vec<TextFragment>> {
        let mut next = 0;
        self.pages
            .iter()
            .map(|page| {
                page.iter()
                    .map(|f| {
                        let handle = FragmentHandle(next);
                        next += 1;
                        TextFragment {
                            text: f.text.clone(),
                            rect: self.to_viewport(&f.rect),
                            handle: Some(handle),
                        }
                    })
                    .collect()
            })
            .collect()
    }

    fn measure(&self, handle: FragmentHandle) -> Option<Rect> {
        self.fragment(handle).map(|f| self.to_viewport(&f.rect))
    }

    fn selected_text(&self) -> String {
        self.selection.clone()
    }
}

/// Per-page text captured ahead of time; `None` marks a page that failed
/// to decode.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPages {
    pub pages: Vec<Option<String>>,
}

impl SnapshotPages {
    pub fn new(pages: Vec<Option<String>>) -> Self {
        Self { pages }
    }
}

impl PageSource for SnapshotPages {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_text(&mut self, page: usize) -> Result<String, DocumentError> {
        match self.pages.get(page.wrapping_sub(1)) {
            Some(Some(text)) => Ok(text.clone()),
            Some(None) => Err(DocumentError::Decode {
                page,
                reason: "page content unavailable".into(),
            }),
            None => Err(DocumentError::Decode {
                page,
                reason: "page out of range".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frag(text: &str, left: f64, top: f64, right: f64, bottom: f64) -> TextFragment {
        TextFragment {
            text: text.into(),
            rect: Rect::new(left, top, right, bottom),
            handle: None,
        }
    }

    fn sfrag(text: &str, left: f64, top: f64, right: f64, bottom: f64) -> SnapshotFragment {
        SnapshotFragment {
            text: text.into(),
            rect: Rect::new(left, top, right, bottom),
        }
    }

    #[test]
    fn fragments_within_six_px_share_a_line() {
        let lines = group_lines(&[
            frag("world", 60.0, 104.0, 100.0, 114.0),
            frag("hello", 10.0, 100.0, 50.0, 110.0),
            frag("  ", 10.0, 300.0, 50.0, 310.0),
        ]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text(), "hello world");
        assert_eq!(lines[0].rect, Rect::new(10.0, 100.0, 100.0, 114.0));
    }

    #[test]
    fn close_lines_merge_and_distant_lines_split() {
        let lines = group_lines(&[
            frag("first line", 10.0, 100.0, 200.0, 110.0),
            frag("second line", 10.0, 108.0, 200.0, 118.0),
            frag("far below", 10.0, 250.0, 200.0, 260.0),
        ]);
        assert_eq!(lines.len(), 3);
        let paras = group_paragraphs(&lines);
        assert_eq!(paras.len(), 2);
        assert_eq!(paras[0].text, "first line\nsecond line");
        assert_eq!(paras[0].rect, Rect::new(10.0, 100.0, 200.0, 118.0));
        assert_eq!(paras[1].text, "far below");
    }

    #[test]
    fn layer_units_follow_scrolling() {
        let layer = SnapshotTextLayer::new(vec![vec![
            sfrag("A paragraph long enough to", 10.0, 100.0, 300.0, 110.0),
            sfrag("be worth a summary.", 10.0, 112.0, 300.0, 122.0),
        ]]);
        let mut loc = PaginatedLocator::new(Some(Box::new(layer)), None);
        assert_eq!(loc.unit_count(), 1);

        let unit = loc.find_unit_at(ViewportPoint::new(50.0, 105.0)).unwrap();
        assert_eq!(unit.text, "A paragraph long enough to\nbe worth a summary.");

        let mut vp = Viewport::new(800.0, 600.0);
        vp.scroll_y = 80.0;
        loc.update_viewport(&vp);
        assert!(loc.find_unit_at(ViewportPoint::new(50.0, 105.0)).is_none());
        let moved = loc.find_unit_at(ViewportPoint::new(50.0, 30.0)).unwrap();
        assert_eq!(moved.id, unit.id);
        assert_eq!(moved.rect.top, 20.0);
    }

    struct CountingPages {
        texts: Vec<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl PageSource for CountingPages {
        fn page_count(&self) -> usize {
            self.texts.len()
        }
        fn page_text(&mut self, page: usize) -> Result<String, DocumentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.texts[page - 1].to_string())
        }
    }

    #[test]
    fn placeholder_pages_decode_once_on_hit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pages = CountingPages {
            texts: vec!["page one text", "page two text"],
            calls: Arc::clone(&calls),
        };
        let mut loc = PaginatedLocator::new(None, Some(Box::new(pages)));
        loc.update_viewport(&Viewport::new(800.0, 1000.0));
        assert_eq!(loc.unit_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let unit = loc.find_unit_at(ViewportPoint::new(100.0, 500.0)).unwrap();
        assert_eq!(unit.id.index, 0);
        assert_eq!(unit.text, "page one text");
        assert_eq!(loc.unit_text(&unit), "page one text");
        assert_eq!(loc.find_unit_at(ViewportPoint::new(5.0, 5.0)).unwrap().id, unit.id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut vp = Viewport::new(800.0, 1000.0);
        vp.scroll_y = 900.0;
        loc.update_viewport(&vp);
        let second = loc.find_unit_at(ViewportPoint::new(100.0, 500.0)).unwrap();
        assert_eq!(second.id.index, 1);
        assert_eq!(second.text, "page two text");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_page_is_empty_and_not_retried() {
        let mut loc = PaginatedLocator::new(
            None,
            Some(Box::new(SnapshotPages::new(vec![None, Some("fine".into())]))),
        );
        loc.update_viewport(&Viewport::new(800.0, 600.0));
        let unit = loc.find_unit_at(ViewportPoint::new(10.0, 10.0)).unwrap();
        assert_eq!(unit.text, "");
        assert_eq!(loc.unit_text(&unit), "");
        assert_eq!(loc.unit_text(&unit), "");
    }

    #[test]
    fn empty_layer_falls_back_to_pages() {
        let mut loc = PaginatedLocator::new(
            Some(Box::new(SnapshotTextLayer::new(vec![vec![]]))),
            Some(Box::new(SnapshotPages::new(vec![Some("only page".into())]))),
        );
        loc.update_viewport(&Viewport::new(800.0, 600.0));
        let unit = loc.find_unit_at(ViewportPoint::new(10.0, 10.0)).unwrap();
        assert_eq!(loc.unit_text(&unit), "only page");
    }

    #[test]
    fn nothing_without_any_source() {
        let mut loc = PaginatedLocator::new(None, None);
        assert!(loc.find_unit_at(ViewportPoint::new(10.0, 10.0)).is_none());
    }
}
