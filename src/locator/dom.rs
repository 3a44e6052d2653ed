//! Generic page locator: the nearest block-level ancestor of whatever element
//! sits under the point. Nothing is indexed; every lookup re-resolves.

use serde::{Deserialize, Serialize};

use super::{ContentLocator, SourceKind, TextUnit, UnitId};
use crate::geometry::{Rect, Viewport, ViewportPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Display {
    Block,
    ListItem,
    Table,
    Flex,
    Grid,
    #[default]
    Inline,
    InlineBlock,
    None,
    #[serde(other)]
    Other,
}

impl Display {
    pub fn is_block_level(self) -> bool {
        matches!(
            self,
            Display::Block | Display::ListItem | Display::Table | Display::Flex | Display::Grid
        )
    }
}

/// The slice of a rendered document the locator needs.
pub trait DomTree {
    fn set_viewport(&mut self, _vp: &Viewport) {}
    /// Topmost element at a viewport coordinate.
    fn element_at(&self, x: f64, y: f64) -> Option<NodeId>;
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    /// The body element; the ancestor walk stops here.
    fn is_root(&self, node: NodeId) -> bool;
    fn display(&self, node: NodeId) -> Display;
    fn rendered_text(&self, node: NodeId) -> String;
    /// Viewport-relative bounds.
    fn bounding_rect(&self, node: NodeId) -> Option<Rect>;
    fn selected_text(&self) -> String {
        String::new()
    }
}

/// Nearest block-level ancestor of `start` (inclusive), never the root.
pub fn block_ancestor<T: DomTree + ?Sized>(tree: &T, start: NodeId) -> Option<NodeId> {
    let mut cur = Some(start);
    while let Some(node) = cur {
        if tree.is_root(node) {
            return None;
        }
        if tree.display(node).is_block_level() {
            return Some(node);
        }
        cur = tree.parent(node);
    }
    None
}

pub struct DomLocator<T> {
    tree: T,
}

impl<T: DomTree> DomLocator<T> {
    pub fn new(tree: T) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &T {
        &self.tree
    }
}

impl<T: DomTree> ContentLocator for DomLocator<T> {
    fn kind(&self) -> SourceKind {
        SourceKind::Dom
    }

    fn update_viewport(&mut self, vp: &Viewport) {
        self.tree.set_viewport(vp);
    }

    fn find_unit_at(&mut self, point: ViewportPoint) -> Option<TextUnit> {
        let el = self.tree.element_at(point.x, point.y)?;
        let node = block_ancestor(&self.tree, el).unwrap_or(el);
        Some(TextUnit {
            id: UnitId::new(SourceKind::Dom, node.0),
            text: self.tree.rendered_text(node),
            rect: self.tree.bounding_rect(node).unwrap_or_default(),
        })
    }

    fn unit_text(&mut self, unit: &TextUnit) -> String {
        self.tree.rendered_text(NodeId(unit.id.index))
    }

    fn selected_text(&self) -> String {
        self.tree.selected_text()
    }
}

/// One element of a captured page, rect in document coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomNode {
    pub id: u64,
    #[serde(default)]
    pub parent: Option<u64>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub display: Display,
    pub rect: Rect,
    /// Text owned directly by this element, excluding children.
    #[serde(default)]
    pub text: String,
}

/// A page captured as a flat node arena (document order).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticDom {
    pub nodes: Vec<DomNode>,
    #[serde(default)]
    pub selection: String,
    #[serde(skip)]
    scroll: (f64, f64),
}

impl StaticDom {
    pub fn new(nodes: Vec<DomNode>) -> Self {
        Self {
            nodes,
            ..Self::default()
        }
    }

    fn node(&self, id: NodeId) -> Option<&DomNode> {
        self.nodes.iter().find(|n| n.id == id.0)
    }

    fn depth(&self, node: &DomNode) -> usize {
        let mut depth = 0;
        let mut cur = node.parent;
        while let Some(p) = cur {
            depth += 1;
            if depth > self.nodes.len() {
                break;
            }
            cur = self.node(NodeId(p)).and_then(|n| n.parent);
        }
        depth
    }

    fn collect_text(&self, id: u64, out: &mut Vec<String>, guard: usize) {
        if guard > self.nodes.len() {
            return;
        }
        let Some(node) = self.node(NodeId(id)) else {
            return;
        };
        if node.display == Display::None {
            return;
        }
        let own = node.text.trim();
        if !own.is_empty() {
            out.push(own.to_string());
        }
        for child in self.nodes.iter().filter(|n| n.parent == Some(id)) {
            self.collect_text(child.id, out, guard + 1);
        }
    }
}

impl DomTree for StaticDom {
    fn set_viewport(&mut self, vp: &Viewport) {
        self.scroll = (vp.scroll_x, vp.scroll_y);
    }

    fn element_at(&self, x: f64, y: f64) -> Option<NodeId> {
        let (dx, dy) = (x + self.scroll.0, y + self.scroll.1);
        // deepest wins; later siblings paint over earlier ones
        self.nodes
            .iter()
            .filter(|n| n.display != Display::None && n.rect.contains(dx, dy, 0.0))
            .map(|n| (self.depth(n), n.id))
            .fold(None, |best: Option<(usize, u64)>, cand| match best {
                Some(b) if b.0 > cand.0 => Some(b),
                _ => Some(cand),
            })
            .map(|(_, id)| NodeId(id))
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).and_then(|n| n.parent).map(NodeId)
    }

    fn is_root(&self, node: NodeId) -> bool {
        self.node(node)
            .map(|n| n.parent.is_none() || n.tag.eq_ignore_ascii_case("body"))
            .unwrap_or(true)
    }

    fn display(&self, node: NodeId) -> Display {
        self.node(node).map(|n| n.display).unwrap_or_default()
    }

    fn rendered_text(&self, node: NodeId) -> String {
        let mut parts = Vec::new();
        self.collect_text(node.0, &mut parts, 0);
        parts.join(" ")
    }

    fn bounding_rect(&self, node: NodeId) -> Option<Rect> {
        self.node(node)
            .map(|n| n.rect.translate(-self.scroll.0, -self.scroll.1))
    }

    fn selected_text(&self) -> String {
        self.selection.clone()
    }
}
