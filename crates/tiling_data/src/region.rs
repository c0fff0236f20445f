use smallvec::SmallVec;

use crate::geometry::{IntRectExt, LayerRect};

/// A set of layer-space rects. Rects may overlap; consumers only ask
/// intersection questions, so no canonical form is maintained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: SmallVec<[LayerRect; 4]>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: LayerRect) -> Self {
        let mut region = Self::new();
        region.union_rect(rect);
        region
    }

    pub fn union_rect(&mut self, rect: LayerRect) {
        if rect.is_empty() || self.rects.iter().any(|existing| existing.contains_area(&rect)) {
            return;
        }
        self.rects.retain(|existing| !rect.contains_area(existing));
        self.rects.push(rect);
    }

    pub fn union(&mut self, other: &Region) {
        for rect in other.iter() {
            self.union_rect(*rect);
        }
    }

    pub fn intersect_rect(&mut self, clip: LayerRect) {
        let clipped: SmallVec<[LayerRect; 4]> = self
            .rects
            .iter()
            .map(|rect| rect.intersect_rect(&clip))
            .filter(|rect| !rect.is_empty())
            .collect();
        self.rects = SmallVec::new();
        for rect in clipped {
            self.union_rect(rect);
        }
    }

    pub fn intersects(&self, rect: &LayerRect) -> bool {
        self.rects.iter().any(|existing| existing.intersects_rect(rect))
    }

    /// Whether the union of the region's rects covers all of `rect`.
    pub fn contains_rect(&self, rect: &LayerRect) -> bool {
        let mut uncovered: SmallVec<[LayerRect; 8]> = SmallVec::new();
        uncovered.push(*rect);
        for cover in &self.rects {
            let mut next: SmallVec<[LayerRect; 8]> = SmallVec::new();
            for piece in &uncovered {
                subtract_rect(piece, cover, &mut next);
            }
            uncovered = next;
            if uncovered.is_empty() {
                return true;
            }
        }
        uncovered.iter().all(|piece| piece.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn bounds(&self) -> LayerRect {
        self.rects
            .iter()
            .fold(LayerRect::zero(), |bounds, rect| bounds.union_rect(rect))
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerRect> {
        self.rects.iter()
    }
}

/// Pushes up to four pieces of `rect` left uncovered by `cover`.
fn subtract_rect(rect: &LayerRect, cover: &LayerRect, out: &mut SmallVec<[LayerRect; 8]>) {
    if rect.is_empty() {
        return;
    }
    let overlap = rect.intersect_rect(cover);
    if overlap.is_empty() {
        out.push(*rect);
        return;
    }
    let top = rect.origin.y;
    let bottom = rect.bottom();
    if overlap.origin.y > top {
        out.push(rect_from_edges(rect.origin.x, top, rect.right(), overlap.origin.y));
    }
    if overlap.bottom() < bottom {
        out.push(rect_from_edges(rect.origin.x, overlap.bottom(), rect.right(), bottom));
    }
    if overlap.origin.x > rect.origin.x {
        out.push(rect_from_edges(rect.origin.x, overlap.origin.y, overlap.origin.x, overlap.bottom()));
    }
    if overlap.right() < rect.right() {
        out.push(rect_from_edges(overlap.right(), overlap.origin.y, rect.right(), overlap.bottom()));
    }
}

fn rect_from_edges(left: i32, top: i32, right: i32, bottom: i32) -> LayerRect {
    crate::geometry::rect(left, top, right - left, bottom - top)
}

impl From<LayerRect> for Region {
    fn from(rect: LayerRect) -> Self {
        Self::from_rect(rect)
    }
}
