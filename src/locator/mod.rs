//! Mapping a viewport coordinate to the paragraph-level text unit under it.
//!
//! Three independent strategies implement [`ContentLocator`]; a document
//! session holds the ones its inspection found usable in a [`LocatorSet`],
//! which asks the structured ones first.

pub mod dom;
pub mod overlay;
pub mod paginated;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::geometry::{Rect, Viewport, ViewportPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Dom,
    Paginated,
    Overlay,
}

impl SourceKind {
    /// Lower is asked first.
    pub fn priority(self) -> u8 {
        match self {
            SourceKind::Paginated => 0,
            SourceKind::Overlay => 1,
            SourceKind::Dom => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Dom => "dom",
            SourceKind::Paginated => "paginated",
            SourceKind::Overlay => "overlay",
        }
    }
}

/// Stable identity of a unit within one document session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub source: SourceKind,
    pub index: u64,
}

impl UnitId {
    pub fn new(source: SourceKind, index: u64) -> Self {
        Self { source, index }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.as_str(), self.index)
    }
}

/// A unit as seen at lookup time. `text` is whatever was already known
/// then (possibly empty for undecoded pages); [`ContentLocator::unit_text`]
/// is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextUnit {
    pub id: UnitId,
    pub text: String,
    pub rect: Rect,
}

impl TextUnit {
    pub fn source(&self) -> SourceKind {
        self.id.source
    }
}

pub trait ContentLocator {
    fn kind(&self) -> SourceKind;

    /// Called before lookups whenever scroll or size may have changed.
    fn update_viewport(&mut self, _vp: &Viewport) {}

    fn find_unit_at(&mut self, point: ViewportPoint) -> Option<TextUnit>;

    /// Full text of a unit this locator produced. Decodes on first use and
    /// memoizes; a failed decode yields an empty string.
    fn unit_text(&mut self, unit: &TextUnit) -> String;

    fn selected_text(&self) -> String {
        String::new()
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("page {page} could not be decoded: {reason}")]
    Decode { page: usize, reason: String },
    #[error("slide archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("part {part}: {source}")]
    Part {
        part: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("document snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

pub type BoxedLocator = Box<dyn ContentLocator + Send>;

/// Locators active for one document, kept in dispatch order.
#[derive(Default)]
pub struct LocatorSet {
    locators: Vec<BoxedLocator>,
}

impl LocatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, locator: BoxedLocator) {
        self.locators.push(locator);
        self.locators.sort_by_key(|l| l.kind().priority());
    }

    pub fn with(mut self, locator: BoxedLocator) -> Self {
        self.push(locator);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.locators.iter().map(|l| l.kind()).collect()
    }

    pub fn update_viewport(&mut self, vp: &Viewport) {
        for l in &mut self.locators {
            l.update_viewport(vp);
        }
    }

    /// First hit in dispatch order.
    pub fn find_unit_at(&mut self, point: ViewportPoint) -> Option<TextUnit> {
        self.locators
            .iter_mut()
            .find_map(|l| l.find_unit_at(point))
    }

    /// Routed to the locator that produced the unit.
    pub fn unit_text(&mut self, unit: &TextUnit) -> String {
        self.locators
            .iter_mut()
            .find(|l| l.kind() == unit.source())
            .map(|l| l.unit_text(unit))
            .unwrap_or_default()
    }

    /// First non-blank selection in dispatch order.
    pub fn selected_text(&self) -> String {
        self.locators
            .iter()
            .map(|l| l.selected_text())
            .find(|s| !s.trim().is_empty())
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A locator with fixed units, for dispatch and dwell tests.
    pub struct FixedLocator {
        pub kind: SourceKind,
        pub units: Vec<(Rect, String)>,
        pub selection: String,
        pub text_calls: usize,
    }

    impl FixedLocator {
        pub fn new(kind: SourceKind, units: Vec<(Rect, &str)>) -> Self {
            Self {
                kind,
                units: units.into_iter().map(|(r, t)| (r, t.to_string())).collect(),
                selection: String::new(),
                text_calls: 0,
            }
        }
    }

    impl ContentLocator for FixedLocator {
        fn kind(&self) -> SourceKind {
            self.kind
        }
        fn find_unit_at(&mut self, point: ViewportPoint) -> Option<TextUnit> {
            self.units
                .iter()
                .enumerate()
                .find(|(_, (r, _))| r.contains_point(point))
                .map(|(i, (r, t))| TextUnit {
                    id: UnitId::new(self.kind, i as u64),
                    text: t.clone(),
                    rect: *r,
                })
        }
        fn unit_text(&mut self, unit: &TextUnit) -> String {
            self.text_calls += 1;
            self.units
                .get(unit.id.index as usize)
                .map(|(_, t)| t.clone())
                .unwrap_or_default()
        }
        fn selected_text(&self) -> String {
            self.selection.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedLocator;
    use super::*;

    fn rect() -> Rect {
        Rect::new(0.0, 0.0, 100.0, 100.0)
    }

    #[test]
    fn structured_locators_win_over_dom() {
        let mut set = LocatorSet::new()
            .with(Box::new(FixedLocator::new(SourceKind::Dom, vec![(rect(), "dom")])))
            .with(Box::new(FixedLocator::new(
                SourceKind::Overlay,
                vec![(rect(), "slide")],
            )))
            .with(Box::new(FixedLocator::new(
                SourceKind::Paginated,
                vec![(Rect::new(0.0, 0.0, 40.0, 40.0), "page")],
            )));
        assert_eq!(
            set.kinds(),
            vec![SourceKind::Paginated, SourceKind::Overlay, SourceKind::Dom]
        );

        let hit = set.find_unit_at(ViewportPoint::new(10.0, 10.0)).unwrap();
        assert_eq!(hit.source(), SourceKind::Paginated);
        assert_eq!(set.unit_text(&hit), "page");

        let hit = set.find_unit_at(ViewportPoint::new(80.0, 80.0)).unwrap();
        assert_eq!(hit.source(), SourceKind::Overlay);
        assert_eq!(set.unit_text(&hit), "slide");
    }

    #[test]
    fn dom_answers_when_nothing_structured_hits() {
        let mut set = LocatorSet::new()
            .with(Box::new(FixedLocator::new(SourceKind::Dom, vec![(rect(), "dom")])))
            .with(Box::new(FixedLocator::new(SourceKind::Paginated, vec![])));
        let hit = set.find_unit_at(ViewportPoint::new(50.0, 50.0)).unwrap();
        assert_eq!(hit.id.to_string(), "dom:0");
        assert!(set.find_unit_at(ViewportPoint::new(500.0, 500.0)).is_none());
    }

    #[test]
    fn selection_falls_back_in_dispatch_order() {
        let mut dom = FixedLocator::new(SourceKind::Dom, vec![]);
        dom.selection = "from the page".into();
        let mut pages = FixedLocator::new(SourceKind::Paginated, vec![]);
        pages.selection = "   ".into();
        let set = LocatorSet::new().with(Box::new(dom)).with(Box::new(pages));
        assert_eq!(set.selected_text(), "from the page");
        assert_eq!(LocatorSet::new().selected_text(), "");
    }
}
