//! Logical coordinate primitives
//!
//! All scene and output math happens in integer logical coordinates.
//! Output-local coordinates have their origin at the output's top-left
//! corner; global coordinates place every output in one shared plane.

use serde::{Deserialize, Serialize};

/// A point in logical coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl std::ops::Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// A size in logical coordinates
///
/// Negative dimensions are not meaningful; a size with a zero component
/// is treated as empty everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub w: i32,
    pub h: i32,
}

impl Size {
    pub const fn new(w: i32, h: i32) -> Self {
        Self { w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }
}

/// An axis-aligned rectangle in logical coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub loc: Point,
    pub size: Size,
}

impl Rect {
    pub const fn new(loc: Point, size: Size) -> Self {
        Self { loc, size }
    }

    pub const fn from_coords(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self {
            loc: Point::new(x, y),
            size: Size::new(w, h),
        }
    }

    /// Rectangle spanning from origin with the given size
    pub const fn from_size(size: Size) -> Self {
        Self {
            loc: Point::new(0, 0),
            size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Exclusive right edge
    pub fn right(&self) -> i32 {
        self.loc.x + self.size.w
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i32 {
        self.loc.y + self.size.h
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.loc.x && point.x < self.right() && point.y >= self.loc.y && point.y < self.bottom()
    }

    /// Whether `other` lies completely inside this rectangle
    pub fn contains_rect(&self, other: &Rect) -> bool {
        if other.is_empty() {
            return true;
        }
        other.loc.x >= self.loc.x
            && other.loc.y >= self.loc.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.loc.x < other.right()
            && other.loc.x < self.right()
            && self.loc.y < other.bottom()
            && other.loc.y < self.bottom()
    }

    /// Intersection of two rectangles, `None` if they do not overlap
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if !self.overlaps(other) {
            return None;
        }
        let x = self.loc.x.max(other.loc.x);
        let y = self.loc.y.max(other.loc.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Some(Rect::from_coords(x, y, right - x, bottom - y))
    }

    /// Smallest rectangle covering both rectangles
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.loc.x.min(other.loc.x);
        let y = self.loc.y.min(other.loc.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::from_coords(x, y, right - x, bottom - y)
    }

    pub fn translated(&self, offset: Point) -> Rect {
        Rect::new(self.loc + offset, self.size)
    }
}

/// Output transform (rotation and/or flip) applied at scanout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Transform {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl Transform {
    pub fn is_identity(&self) -> bool {
        matches!(self, Transform::Normal)
    }

    /// Whether the transform swaps width and height
    pub fn swaps_dimensions(&self) -> bool {
        matches!(
            self,
            Transform::Rotate90 | Transform::Rotate270 | Transform::Flipped90 | Transform::Flipped270
        )
    }

    pub fn map_size(&self, size: Size) -> Size {
        if self.swaps_dimensions() {
            Size::new(size.h, size.w)
        } else {
            size
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_and_union() {
        let a = Rect::from_coords(0, 0, 100, 100);
        let b = Rect::from_coords(50, 50, 100, 100);

        let i = a.intersection(&b).expect("rectangles overlap");
        assert_eq!(i, Rect::from_coords(50, 50, 50, 50));
        assert_eq!(a.union(&b), Rect::from_coords(0, 0, 150, 150));

        let c = Rect::from_coords(200, 200, 10, 10);
        assert!(a.intersection(&c).is_none());
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn containment_uses_exclusive_edges() {
        let r = Rect::from_coords(0, 0, 10, 10);
        assert!(r.contains(Point::new(0, 0)));
        assert!(r.contains(Point::new(9, 9)));
        assert!(!r.contains(Point::new(10, 10)));
        assert!(r.contains_rect(&Rect::from_coords(0, 0, 10, 10)));
        assert!(!r.contains_rect(&Rect::from_coords(5, 5, 10, 10)));
    }

    #[test]
    fn transform_swaps_sizes() {
        let size = Size::new(1920, 1080);
        assert_eq!(Transform::Rotate90.map_size(size), Size::new(1080, 1920));
        assert_eq!(Transform::Rotate180.map_size(size), size);
    }
}
