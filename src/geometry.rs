//! Viewport coordinates and rectangles shared by the locators and placement.

use serde::{Deserialize, Serialize};

/// Slack used when testing a point against a measured rectangle.
pub const HIT_TOLERANCE_PX: f64 = 2.0;

/// Side length of the rectangle a bare point anchor is expanded to.
pub const POINT_ANCHOR_PX: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub scroll_x: f64,
    #[serde(default)]
    pub scroll_y: f64,
    #[serde(default = "default_dpr")]
    pub device_pixel_ratio: f64,
}

fn default_dpr() -> f64 {
    1.0
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280.0,
            height: 800.0,
            scroll_x: 0.0,
            scroll_y: 0.0,
            device_pixel_ratio: 1.0,
        }
    }
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Clamp into `[0, width) × [0, height)`.
    pub fn clamp(&self, x: f64, y: f64) -> ViewportPoint {
        let max_x = (self.width - 1.0).max(0.0);
        let max_y = (self.height - 1.0).max(0.0);
        ViewportPoint {
            x: x.clamp(0.0, max_x),
            y: y.clamp(0.0, max_y),
        }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width, self.height)
    }
}

/// A point already mapped into (and clamped to) the current viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportPoint {
    pub x: f64,
    pub y: f64,
}

impl ViewportPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &ViewportPoint) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_point(x: f64, y: f64) -> Self {
        Self::new(x, y, x + POINT_ANCHOR_PX, y + POINT_ANCHOR_PX)
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }

    pub fn has_area(&self) -> bool {
        self.width() > 0.0 || self.height() > 0.0
    }

    /// Point-in-rect with `tol` pixels of slack on every side.
    pub fn contains(&self, x: f64, y: f64, tol: f64) -> bool {
        x >= self.left - tol && x <= self.right + tol && y >= self.top - tol && y <= self.bottom + tol
    }

    pub fn contains_point(&self, p: ViewportPoint) -> bool {
        self.contains(p.x, p.y, HIT_TOLERANCE_PX)
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Rect {
        Rect {
            left: self.left + dx,
            top: self.top + dy,
            right: self.right + dx,
            bottom: self.bottom + dy,
        }
    }

    /// True when the two rectangles share any extent on both axes (touching edges count).
    pub fn overlaps(&self, other: &Rect) -> bool {
        let overlap_x = !(self.right < other.left || self.left > other.right);
        let overlap_y = !(self.bottom < other.top || self.top > other.bottom);
        overlap_x && overlap_y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_keeps_points_inside_viewport() {
        let vp = Viewport::new(800.0, 600.0);
        assert_eq!(vp.clamp(-5.0, 20.0), ViewportPoint::new(0.0, 20.0));
        assert_eq!(vp.clamp(900.0, 700.0), ViewportPoint::new(799.0, 599.0));
    }

    #[test]
    fn containment_forgives_small_measurement_error() {
        let r = Rect::new(10.0, 10.0, 50.0, 30.0);
        assert!(r.contains(8.5, 31.5, HIT_TOLERANCE_PX));
        assert!(!r.contains(7.0, 20.0, HIT_TOLERANCE_PX));
        assert!(!r.contains(20.0, 33.0, HIT_TOLERANCE_PX));
    }

    #[test]
    fn overlap_needs_both_axes() {
        let a = Rect::new(0.0, 0.0, 100.0, 100.0);
        assert!(a.overlaps(&Rect::new(50.0, 50.0, 150.0, 150.0)));
        assert!(!a.overlaps(&Rect::new(50.0, 120.0, 150.0, 150.0)));
        assert!(!a.overlaps(&Rect::new(120.0, 50.0, 150.0, 150.0)));
    }
}
