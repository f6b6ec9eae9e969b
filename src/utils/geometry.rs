// SPDX-License-Identifier: GPL-3.0-only

//! Integer rectangles and the pixel-alignment helpers used when fitting
//! source crops to hardware restrictions.

/// Round `value` down to the next multiple of `align`.
pub fn align_down(value: i32, align: i32) -> i32 {
    if align <= 1 {
        return value;
    }
    value - value.rem_euclid(align)
}

/// Round `value` up to the next multiple of `align`.
pub fn align_up(value: i32, align: i32) -> i32 {
    if align <= 1 {
        return value;
    }
    let rem = value.rem_euclid(align);
    if rem == 0 {
        value
    } else {
        value + (align - rem)
    }
}

/// An axis-aligned rectangle in display pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Rect {
        Rect { x, y, w, h }
    }

    pub const fn from_size(w: i32, h: i32) -> Rect {
        Rect { x: 0, y: 0, w, h }
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Smallest rectangle containing both `self` and `other`. Empty
    /// rectangles contribute nothing.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }

    pub fn intersection(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= x || bottom <= y {
            Rect::default()
        } else {
            Rect::new(x, y, right - x, bottom - y)
        }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    /// Clip against the display bounds `(0, 0, width, height)`: negative
    /// offsets are clamped to zero and the clamped amount is subtracted
    /// from the size, overhang on the far edges is cropped.
    pub fn clipped_to_display(&self, width: i32, height: i32) -> Rect {
        let mut out = *self;
        if out.x < 0 {
            out.w += out.x;
            out.x = 0;
        }
        if out.y < 0 {
            out.h += out.y;
            out.y = 0;
        }
        if out.right() > width {
            out.w = width - out.x;
        }
        if out.bottom() > height {
            out.h = height - out.y;
        }
        if out.is_empty() {
            Rect::default()
        } else {
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounding() {
        assert_eq!(align_down(17, 4), 16);
        assert_eq!(align_down(16, 4), 16);
        assert_eq!(align_down(3, 1), 3);
        assert_eq!(align_up(17, 4), 20);
        assert_eq!(align_up(16, 4), 16);
        assert_eq!(align_up(0, 4), 0);
    }

    #[test]
    fn union_ignores_empty() {
        let a = Rect::new(10, 10, 100, 50);
        let empty = Rect::default();
        assert_eq!(a.union(&empty), a);
        assert_eq!(empty.union(&a), a);
        let b = Rect::new(0, 40, 20, 100);
        assert_eq!(a.union(&b), Rect::new(0, 10, 110, 130));
    }

    #[test]
    fn clip_to_display_crops_all_edges() {
        let r = Rect::new(-10, -20, 120, 140);
        assert_eq!(r.clipped_to_display(100, 100), Rect::new(0, 0, 100, 100));

        let r = Rect::new(50, 60, 100, 100);
        assert_eq!(r.clipped_to_display(100, 100), Rect::new(50, 60, 50, 40));

        let offscreen = Rect::new(200, 0, 10, 10);
        assert!(offscreen.clipped_to_display(100, 100).is_empty());
    }
}
