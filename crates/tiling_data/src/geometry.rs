use euclid::{Point2D, Rect, Scale, Size2D};

/// Layer space: unscaled CSS-pixel coordinates of a layer's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LayerSpace;

/// Content space: layer space scaled by a tiling's contents scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContentSpace;

/// Screen space: device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScreenSpace;

pub type LayerRect = Rect<i32, LayerSpace>;
pub type LayerSize = Size2D<i32, LayerSpace>;
pub type LayerPoint = Point2D<i32, LayerSpace>;
pub type ContentRect = Rect<i32, ContentSpace>;
pub type ContentSize = Size2D<i32, ContentSpace>;
pub type ContentPoint = Point2D<i32, ContentSpace>;
pub type ContentRectF = Rect<f32, ContentSpace>;
pub type ScreenRect = Rect<i32, ScreenSpace>;
pub type ScreenSize = Size2D<i32, ScreenSpace>;

pub fn rect<U>(x: i32, y: i32, width: i32, height: i32) -> Rect<i32, U> {
    Rect::new(Point2D::new(x, y), Size2D::new(width, height))
}

pub fn size<U>(width: i32, height: i32) -> Size2D<i32, U> {
    Size2D::new(width, height)
}

/// Integer rect operations with the compositor's conventions: an empty rect
/// never intersects anything, and unions ignore empty operands.
pub trait IntRectExt: Sized {
    fn right(&self) -> i32;
    fn bottom(&self) -> i32;
    fn intersects_rect(&self, other: &Self) -> bool;
    fn intersect_rect(&self, other: &Self) -> Self;
    fn union_rect(&self, other: &Self) -> Self;
    fn contains_point_xy(&self, x: i32, y: i32) -> bool;
    fn contains_area(&self, other: &Self) -> bool;
    fn inset(&self, left: i32, top: i32, right: i32, bottom: i32) -> Self;
    fn inflate_by(&self, amount: i32) -> Self;
    /// Manhattan distance between the closest texels of the two rects; zero
    /// when they overlap.
    fn manhattan_internal_distance(&self, other: &Self) -> i32;
}

impl<U> IntRectExt for Rect<i32, U> {
    fn right(&self) -> i32 {
        self.origin.x + self.size.width
    }

    fn bottom(&self) -> i32 {
        self.origin.y + self.size.height
    }

    fn intersects_rect(&self, other: &Self) -> bool {
        !(self.is_empty()
            || other.is_empty()
            || other.origin.x >= self.right()
            || other.right() <= self.origin.x
            || other.origin.y >= self.bottom()
            || other.bottom() <= self.origin.y)
    }

    fn intersect_rect(&self, other: &Self) -> Self {
        if !self.intersects_rect(other) {
            return Rect::zero();
        }
        let x = self.origin.x.max(other.origin.x);
        let y = self.origin.y.max(other.origin.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        rect(x, y, right - x, bottom - y)
    }

    fn union_rect(&self, other: &Self) -> Self {
        if other.is_empty() {
            return *self;
        }
        if self.is_empty() {
            return *other;
        }
        let x = self.origin.x.min(other.origin.x);
        let y = self.origin.y.min(other.origin.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        rect(x, y, right - x, bottom - y)
    }

    fn contains_point_xy(&self, x: i32, y: i32) -> bool {
        x >= self.origin.x && x < self.right() && y >= self.origin.y && y < self.bottom()
    }

    fn contains_area(&self, other: &Self) -> bool {
        other.origin.x >= self.origin.x
            && other.right() <= self.right()
            && other.origin.y >= self.origin.y
            && other.bottom() <= self.bottom()
    }

    fn inset(&self, left: i32, top: i32, right: i32, bottom: i32) -> Self {
        let width = (self.size.width - left - right).max(0);
        let height = (self.size.height - top - bottom).max(0);
        rect(self.origin.x + left, self.origin.y + top, width, height)
    }

    fn inflate_by(&self, amount: i32) -> Self {
        self.inset(-amount, -amount, -amount, -amount)
    }

    fn manhattan_internal_distance(&self, other: &Self) -> i32 {
        let left = self.origin.x.min(other.origin.x);
        let top = self.origin.y.min(other.origin.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());

        let x = (right - left - self.size.width - other.size.width + 1).max(0);
        let y = (bottom - top - self.size.height - other.size.height + 1).max(0);
        x + y
    }
}

/// Smallest integer rect containing `rect` scaled by `scale`.
pub fn scale_to_enclosing_rect<Src, Dst>(
    rect: Rect<i32, Src>,
    scale: Scale<f32, Src, Dst>,
) -> Rect<i32, Dst> {
    if rect.is_empty() {
        return Rect::zero();
    }
    let factor = scale.get();
    let x = (rect.origin.x as f32 * factor).floor() as i32;
    let y = (rect.origin.y as f32 * factor).floor() as i32;
    let right = (rect.right() as f32 * factor).ceil() as i32;
    let bottom = (rect.bottom() as f32 * factor).ceil() as i32;
    Rect::new(Point2D::new(x, y), Size2D::new(right - x, bottom - y))
}

/// Integer size enclosing `size` scaled by `scale`.
pub fn scale_to_ceiled_size<Src, Dst>(
    size: Size2D<i32, Src>,
    scale: Scale<f32, Src, Dst>,
) -> Size2D<i32, Dst> {
    let factor = scale.get();
    Size2D::new(
        (size.width as f32 * factor).ceil() as i32,
        (size.height as f32 * factor).ceil() as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rects_never_intersect() {
        let a: LayerRect = rect(0, 0, 10, 10);
        let empty: LayerRect = rect(5, 5, 0, 3);
        assert!(!a.intersects_rect(&empty));
        assert!(a.intersect_rect(&empty).is_empty());
        assert_eq!(a.union_rect(&empty), a);
        assert_eq!(empty.union_rect(&a), a);
    }

    #[test]
    fn touching_rects_do_not_intersect() {
        let a: LayerRect = rect(0, 0, 10, 10);
        let b: LayerRect = rect(10, 0, 10, 10);
        assert!(!a.intersects_rect(&b));
        // Distance is measured between texels, so neighbours are one apart.
        assert_eq!(a.manhattan_internal_distance(&b), 1);
        assert_eq!(a.manhattan_internal_distance(&rect(5, 5, 10, 10)), 0);
    }

    #[test]
    fn manhattan_distance_counts_both_axes() {
        let a: LayerRect = rect(0, 0, 10, 10);
        let b: LayerRect = rect(20, 30, 5, 5);
        // Closest points are (9, 9) and (20, 30).
        assert_eq!(a.manhattan_internal_distance(&b), 11 + 21);
        assert_eq!(b.manhattan_internal_distance(&a), 11 + 21);
    }

    #[test]
    fn enclosing_scale_rounds_outward() {
        let layer: LayerRect = rect(1, 1, 3, 3);
        let content: ContentRect = scale_to_enclosing_rect(layer, Scale::new(0.5));
        assert_eq!(content, rect(0, 0, 2, 2));
    }

    #[test]
    fn inset_clamps_to_empty() {
        let a: LayerRect = rect(0, 0, 4, 4);
        assert!(a.inset(3, 3, 3, 3).is_empty());
        assert_eq!(a.inflate_by(2), rect(-2, -2, 8, 8));
    }
}
