//! Document snapshots: a JSON capture of one page the host is showing,
//! and the locator set that fits it.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::geometry::Viewport;
use crate::locator::dom::{DomLocator, StaticDom};
use crate::locator::overlay::{OverlayLocator, ZipSlideArchive, find_slide_source};
use crate::locator::paginated::{
    PageSource, PaginatedLocator, SnapshotPages, SnapshotTextLayer, TextLayer,
};
use crate::locator::{DocumentError, LocatorSet};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentSnapshot {
    pub url: String,
    pub viewport: Viewport,
    pub dom: StaticDom,
    pub text_layer: Option<SnapshotTextLayer>,
    /// Decoded text per page; `null` marks a page that failed to decode.
    pub pages: Option<Vec<Option<String>>>,
    /// Local slide deck backing an overlay viewer.
    pub slides: Option<PathBuf>,
    pub links: Vec<String>,
}

fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

impl DocumentSnapshot {
    pub fn from_json(txt: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(txt)?)
    }

    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let txt = fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&txt)
    }

    pub fn is_paginated(&self) -> bool {
        strip_query(&self.url).to_ascii_lowercase().ends_with(".pdf")
            || self.text_layer.is_some()
            || self.pages.is_some()
    }

    fn open_deck(
        &self,
        base_dir: &Path,
        fetch_timeout: Duration,
    ) -> Option<Result<ZipSlideArchive, DocumentError>> {
        if let Some(path) = &self.slides {
            return Some(ZipSlideArchive::open(&base_dir.join(path)));
        }
        let src = find_slide_source(&self.url, &self.links)?;
        if src.starts_with("http://") || src.starts_with("https://") {
            return Some(ZipSlideArchive::fetch(src, fetch_timeout));
        }
        let local = strip_query(src.strip_prefix("file://").unwrap_or(src));
        Some(ZipSlideArchive::open(&base_dir.join(local)))
    }

    /// Locators for this document in dispatch order. Relative deck paths
    /// resolve against `base_dir`. A deck that cannot be read leaves the
    /// overlay out; the DOM locator is always present.
    pub fn build_locators(&self, base_dir: &Path, fetch_timeout: Duration) -> LocatorSet {
        let mut set = LocatorSet::new();

        if self.is_paginated() {
            let layer = self
                .text_layer
                .clone()
                .map(|l| Box::new(l) as Box<dyn TextLayer + Send>);
            let pages = self
                .pages
                .clone()
                .map(|p| Box::new(SnapshotPages::new(p)) as Box<dyn PageSource + Send>);
            set.push(Box::new(PaginatedLocator::new(layer, pages)));
        }

        match self.open_deck(base_dir, fetch_timeout) {
            Some(Ok(deck)) => set.push(Box::new(OverlayLocator::new(Some(Box::new(deck))))),
            Some(Err(e)) => warn!("slide deck unavailable: {e}"),
            None => {}
        }

        set.push(Box::new(DomLocator::new(self.dom.clone())));
        info!("locators for '{}': {:?}", self.url, set.kinds());
        set
    }
}
