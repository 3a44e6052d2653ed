//! Popup placement around an anchor rectangle.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{PinnedPopup, PopupSettings};
use crate::geometry::{Rect, Viewport};

pub const POPUP_PAD_PX: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopupSize {
    pub width: f64,
    pub height: f64,
}

impl From<&PopupSettings> for PopupSize {
    fn from(p: &PopupSettings) -> Self {
        Self {
            width: p.width,
            height: p.height,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceOptions {
    /// Region the popup must not cover, typically the live selection.
    pub avoid: Option<Rect>,
    pub pin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopupPlacement {
    pub left: f64,
    pub top: f64,
    pub pinned: bool,
}

fn clamp_axis(v: f64, size: f64, extent: f64) -> f64 {
    let max = (extent - size - POPUP_PAD_PX).max(POPUP_PAD_PX);
    v.clamp(POPUP_PAD_PX, max)
}

/// Clamp a top-left corner so the popup stays inside the padded viewport.
pub fn clamp_to_viewport(left: f64, top: f64, size: PopupSize, vp: &Viewport) -> (f64, f64) {
    (
        clamp_axis(left, size.width, vp.width),
        clamp_axis(top, size.height, vp.height),
    )
}

/// Fresh position: right of the anchor, else left, below, above, else the
/// bottom-right corner; then shifted vertically off `avoid` if they overlap.
pub fn place_fresh(size: PopupSize, anchor: &Rect, vp: &Viewport, avoid: Option<&Rect>) -> (f64, f64) {
    let pad = POPUP_PAD_PX;
    let space_right = vp.width - anchor.right - pad;
    let space_left = anchor.left - pad;
    let space_below = vp.height - anchor.bottom - pad;
    let space_above = anchor.top - pad;

    let (left, mut top) = if space_right >= size.width {
        (anchor.right + pad, anchor.top)
    } else if space_left >= size.width {
        ((anchor.left - pad - size.width).max(pad), anchor.top)
    } else if space_below >= size.height {
        (anchor.left, anchor.bottom + pad)
    } else if space_above >= size.height {
        (anchor.left, anchor.top - pad - size.height)
    } else {
        (vp.width - size.width - pad, vp.height - size.height - pad)
    };

    if let Some(sel) = avoid {
        let popup = Rect::new(left, top, left + size.width, top + size.height);
        if popup.overlaps(sel) {
            top = if sel.top - pad - size.height > pad {
                sel.top - pad - size.height
            } else if sel.bottom + pad + size.height < vp.height {
                sel.bottom + pad
            } else {
                (vp.height - size.height - pad).max(pad)
            };
        }
    }

    clamp_to_viewport(left, top, size, vp)
}

/// Placement with optional pinning. Pinned coordinates survive between
/// triggers and are re-clamped against whatever viewport they meet.
#[derive(Debug, Default)]
pub struct PlacementEngine {
    pinned: Option<(f64, f64)>,
}

impl PlacementEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pinned_coords(&self) -> Option<(f64, f64)> {
        self.pinned
    }

    pub fn place(
        &mut self,
        size: PopupSize,
        anchor: &Rect,
        vp: &Viewport,
        opts: PlaceOptions,
    ) -> PopupPlacement {
        if let (true, Some((l, t))) = (opts.pin, self.pinned) {
            let (left, top) = clamp_to_viewport(l, t, size, vp);
            return PopupPlacement {
                left,
                top,
                pinned: true,
            };
        }
        let (left, top) = place_fresh(size, anchor, vp, opts.avoid.as_ref());
        if opts.pin {
            self.pinned = Some((left, top));
        }
        PopupPlacement {
            left,
            top,
            pinned: opts.pin,
        }
    }

    /// Fix the popup where it currently is.
    pub fn pin_at(&mut self, left: f64, top: f64) {
        debug!("popup pinned at ({left:.0}, {top:.0})");
        self.pinned = Some((left, top));
    }

    pub fn unpin(&mut self) {
        self.pinned = None;
    }

    /// Re-apply a pin saved by an earlier run.
    pub fn restore(&mut self, saved: Option<PinnedPopup>) {
        self.pinned = saved.filter(|p| p.pinned).map(|p| (p.left, p.top));
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: PopupSize = PopupSize {
        width: 200.0,
        height: 100.0,
    };

    fn vp() -> Viewport {
        Viewport::new(1000.0, 700.0)
    }

    #[test]
    fn right_of_anchor_when_it_fits() {
        let anchor = Rect::new(100.0, 100.0, 300.0, 140.0);
        let p = PlacementEngine::new().place(SIZE, &anchor, &vp(), PlaceOptions::default());
        assert_eq!((p.left, p.top, p.pinned), (308.0, 100.0, false));
    }

    #[test]
    fn flips_left_then_below_then_above() {
        let v = vp();
        let left = place_fresh(SIZE, &Rect::new(700.0, 100.0, 900.0, 140.0), &v, None);
        assert_eq!(left, (492.0, 100.0));

        let wide = Rect::new(100.0, 100.0, 900.0, 140.0);
        assert_eq!(place_fresh(SIZE, &wide, &v, None), (100.0, 148.0));

        let low = Rect::new(100.0, 500.0, 900.0, 650.0);
        assert_eq!(place_fresh(SIZE, &low, &v, None), (100.0, 392.0));
    }

    #[test]
    fn bottom_right_corner_when_nothing_fits() {
        let v = vp();
        let huge = Rect::new(50.0, 50.0, 950.0, 650.0);
        assert_eq!(place_fresh(SIZE, &huge, &v, None), (792.0, 592.0));
    }

    #[test]
    fn oversized_popup_never_goes_negative() {
        let v = Viewport::new(150.0, 80.0);
        let (l, t) = place_fresh(SIZE, &Rect::from_point(10.0, 10.0), &v, None);
        assert_eq!((l, t), (8.0, 8.0));
    }

    #[test]
    fn shifts_above_an_overlapping_selection() {
        let v = vp();
        let anchor = Rect::new(100.0, 300.0, 300.0, 320.0);
        let sel = Rect::new(250.0, 300.0, 600.0, 340.0);
        assert_eq!(place_fresh(SIZE, &anchor, &v, Some(&sel)), (308.0, 192.0));

        let near_top = Rect::new(250.0, 40.0, 600.0, 80.0);
        let anchor = Rect::new(100.0, 40.0, 300.0, 60.0);
        assert_eq!(place_fresh(SIZE, &anchor, &v, Some(&near_top)), (308.0, 88.0));

        let clear = Rect::new(700.0, 500.0, 800.0, 520.0);
        let anchor = Rect::new(100.0, 100.0, 300.0, 140.0);
        assert_eq!(place_fresh(SIZE, &anchor, &v, Some(&clear)), (308.0, 100.0));
    }

    #[test]
    fn pinned_is_stable_and_reclamps_after_resize() {
        let mut eng = PlacementEngine::new();
        let anchor = Rect::new(100.0, 100.0, 300.0, 140.0);
        let pin = PlaceOptions {
            avoid: None,
            pin: true,
        };
        eng.pin_at(700.0, 500.0);
        let a = eng.place(SIZE, &anchor, &vp(), pin);
        let b = eng.place(SIZE, &anchor, &vp(), pin);
        assert_eq!(a, b);
        assert_eq!((a.left, a.top, a.pinned), (700.0, 500.0, true));

        let small = Viewport::new(600.0, 400.0);
        let c = eng.place(SIZE, &anchor, &small, pin);
        assert_eq!((c.left, c.top), (392.0, 292.0));
        assert_eq!(eng.pinned_coords(), Some((700.0, 500.0)));

        eng.unpin();
        let d = eng.place(SIZE, &anchor, &vp(), PlaceOptions::default());
        assert_eq!((d.left, d.top, d.pinned), (308.0, 100.0, false));
    }

    #[test]
    fn pin_directive_without_stored_coords_pins_fresh_spot() {
        let mut eng = PlacementEngine::new();
        let anchor = Rect::new(100.0, 100.0, 300.0, 140.0);
        let p = eng.place(
            SIZE,
            &anchor,
            &vp(),
            PlaceOptions {
                avoid: None,
                pin: true,
            },
        );
        assert!(p.pinned);
        assert_eq!(eng.pinned_coords(), Some((308.0, 100.0)));
    }

    #[test]
    fn restore_ignores_unpinned_records() {
        let mut eng = PlacementEngine::new();
        eng.restore(Some(PinnedPopup {
            pinned: false,
            left: 1.0,
            top: 2.0,
        }));
        assert!(!eng.is_pinned());
        eng.restore(Some(PinnedPopup {
            pinned: true,
            left: 40.0,
            top: 50.0,
        }));
        assert_eq!(eng.pinned_coords(), Some((40.0, 50.0)));
    }
}
