//! Rectangle set algebra for damage tracking
//!
//! A [`Region`] is a set of pixels stored as a collection of disjoint,
//! axis-aligned rectangles. Damage accumulation relies on union being
//! order-independent and idempotent: `R1 | R2 == R2 | R1` and
//! `R | R == R`, so repeated identical repaint requests collapse.
//!
//! The representation keeps rectangles disjoint at all times (new area is
//! clipped against what the region already covers before insertion) but
//! makes no attempt at band-merging adjacent rectangles; damage regions in
//! practice hold a handful of rectangles per frame.

use crate::geometry::{Point, Rect};

#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add_rect(rect);
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// The disjoint rectangles making up this region
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn bounding_rect(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::default(), |acc, rect| acc.union(rect))
    }

    /// Add a rectangle to the region
    ///
    /// Only the part of `rect` not already covered is inserted, so the
    /// stored rectangles stay disjoint.
    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut fresh = vec![rect];
        for existing in &self.rects {
            let mut next = Vec::new();
            for piece in fresh {
                next.extend(subtract_rect(&piece, existing));
            }
            fresh = next;
            if fresh.is_empty() {
                return;
            }
        }
        self.rects.extend(fresh);
    }

    pub fn add_region(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    /// Remove a rectangle from the region
    pub fn subtract_rect(&mut self, rect: &Rect) {
        if rect.is_empty() {
            return;
        }
        let mut remaining = Vec::with_capacity(self.rects.len());
        for existing in &self.rects {
            remaining.extend(subtract_rect(existing, rect));
        }
        self.rects = remaining;
    }

    pub fn subtract_region(&mut self, other: &Region) {
        for rect in &other.rects {
            self.subtract_rect(rect);
        }
    }

    /// Clip the region against a rectangle
    pub fn intersect_rect(&mut self, rect: &Rect) {
        self.rects = self
            .rects
            .iter()
            .filter_map(|existing| existing.intersection(rect))
            .collect();
    }

    pub fn intersected(&self, rect: &Rect) -> Region {
        let mut region = self.clone();
        region.intersect_rect(rect);
        region
    }

    pub fn translated(&self, offset: Point) -> Region {
        Region {
            rects: self.rects.iter().map(|rect| rect.translated(offset)).collect(),
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        self.rects.iter().any(|rect| rect.contains(point))
    }

    /// Whether `rect` is completely covered by this region
    pub fn contains_rect(&self, rect: &Rect) -> bool {
        if rect.is_empty() {
            return true;
        }
        let mut uncovered = vec![*rect];
        for existing in &self.rects {
            let mut next = Vec::new();
            for piece in uncovered {
                next.extend(subtract_rect(&piece, existing));
            }
            uncovered = next;
            if uncovered.is_empty() {
                return true;
            }
        }
        false
    }

    pub fn intersects(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|existing| existing.overlaps(rect))
    }

    /// Total number of pixels covered
    pub fn pixel_count(&self) -> u64 {
        self.rects
            .iter()
            .map(|rect| rect.size.w as u64 * rect.size.h as u64)
            .sum()
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

impl PartialEq for Region {
    /// Two regions are equal when they cover the same pixels, regardless of
    /// how the coverage is split into rectangles.
    fn eq(&self, other: &Self) -> bool {
        self.rects.iter().all(|rect| other.contains_rect(rect))
            && other.rects.iter().all(|rect| self.contains_rect(rect))
    }
}

impl Eq for Region {}

/// `a - b`, split into at most four disjoint rectangles
fn subtract_rect(a: &Rect, b: &Rect) -> Vec<Rect> {
    let Some(overlap) = a.intersection(b) else {
        return vec![*a];
    };
    if overlap == *a {
        return Vec::new();
    }

    let mut pieces = Vec::with_capacity(4);
    // band above the overlap
    if overlap.loc.y > a.loc.y {
        pieces.push(Rect::from_coords(a.loc.x, a.loc.y, a.size.w, overlap.loc.y - a.loc.y));
    }
    // band below the overlap
    if overlap.bottom() < a.bottom() {
        pieces.push(Rect::from_coords(
            a.loc.x,
            overlap.bottom(),
            a.size.w,
            a.bottom() - overlap.bottom(),
        ));
    }
    // left of the overlap, limited to the overlap's vertical band
    if overlap.loc.x > a.loc.x {
        pieces.push(Rect::from_coords(
            a.loc.x,
            overlap.loc.y,
            overlap.loc.x - a.loc.x,
            overlap.size.h,
        ));
    }
    // right of the overlap
    if overlap.right() < a.right() {
        pieces.push(Rect::from_coords(
            overlap.right(),
            overlap.loc.y,
            a.right() - overlap.right(),
            overlap.size.h,
        ));
    }
    pieces
}
