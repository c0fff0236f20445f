//! Grid geometry for tiled layer content.
//!
//! A [`TilingData`] splits a content-space rectangle of `tiling_size` into a
//! grid of tiles no larger than `max_texture_size`. Adjacent tiles overlap by
//! `border_texels` on each shared edge so that bilinear sampling at a seam
//! reads valid texels from either side.
//!
//! Changing the tiling size, the max texture size or the border invalidates
//! every previously computed tile index; callers treat that as a reset.

pub mod geometry;
mod iterators;
pub mod region;


use serde::{Deserialize, Serialize};
use thiserror::Error;

use geometry::{ContentRect, ContentRectF, ContentSize, IntRectExt, rect};

pub use iterators::{
    DifferenceIterator, ReverseSpiralDifferenceIterator, SpiralDifferenceIterator, TileIterator,
};
pub use region::Region;

/// Column/row of a tile inside one tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileIndex {
    pub i: i32,
    pub j: i32,
}

impl TileIndex {
    pub const fn new(i: i32, j: i32) -> Self {
        Self { i, j }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TilingDataError {
    #[error("tile index ({i}, {j}) outside a {num_tiles_x}x{num_tiles_y} grid")]
    TileIndexOutOfBounds {
        i: i32,
        j: i32,
        num_tiles_x: i32,
        num_tiles_y: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingData {
    max_texture_size: ContentSize,
    tiling_size: ContentSize,
    border_texels: i32,
    // Derived from the three fields above; recomputed on every setter.
    num_tiles_x: i32,
    num_tiles_y: i32,
}

impl Default for TilingData {
    fn default() -> Self {
        Self::new(ContentSize::zero(), ContentSize::zero(), false)
    }
}

fn compute_num_tiles(max_texture_size: i32, total_size: i32, border_texels: i32) -> i32 {
    if max_texture_size - 2 * border_texels <= 0 {
        return if total_size > 0 && max_texture_size >= total_size {
            1
        } else {
            0
        };
    }

    let num_tiles = 1.max(
        1 + (total_size - 1 - 2 * border_texels) / (max_texture_size - 2 * border_texels),
    );
    if total_size > 0 { num_tiles } else { 0 }
}

impl TilingData {
    pub fn new(
        max_texture_size: ContentSize,
        tiling_size: ContentSize,
        has_border_texels: bool,
    ) -> Self {
        Self::with_border_texels(
            max_texture_size,
            tiling_size,
            if has_border_texels { 1 } else { 0 },
        )
    }

    pub fn with_border_texels(
        max_texture_size: ContentSize,
        tiling_size: ContentSize,
        border_texels: i32,
    ) -> Self {
        assert!(border_texels >= 0, "border texels must be non-negative");
        let mut tiling_data = Self {
            max_texture_size,
            tiling_size,
            border_texels,
            num_tiles_x: 0,
            num_tiles_y: 0,
        };
        tiling_data.recompute_num_tiles();
        tiling_data
    }

    pub const fn tiling_size(&self) -> ContentSize {
        self.tiling_size
    }

    pub const fn max_texture_size(&self) -> ContentSize {
        self.max_texture_size
    }

    pub const fn border_texels(&self) -> i32 {
        self.border_texels
    }

    pub const fn num_tiles_x(&self) -> i32 {
        self.num_tiles_x
    }

    pub const fn num_tiles_y(&self) -> i32 {
        self.num_tiles_y
    }

    pub const fn has_empty_bounds(&self) -> bool {
        self.num_tiles_x <= 0 || self.num_tiles_y <= 0
    }

    pub fn tiling_rect(&self) -> ContentRect {
        rect(0, 0, self.tiling_size.width, self.tiling_size.height)
    }

    pub fn set_tiling_size(&mut self, tiling_size: ContentSize) {
        self.tiling_size = tiling_size;
        self.recompute_num_tiles();
    }

    pub fn set_max_texture_size(&mut self, max_texture_size: ContentSize) {
        self.max_texture_size = max_texture_size;
        self.recompute_num_tiles();
    }

    pub fn set_has_border_texels(&mut self, has_border_texels: bool) {
        self.set_border_texels(if has_border_texels { 1 } else { 0 });
    }

    pub fn set_border_texels(&mut self, border_texels: i32) {
        assert!(border_texels >= 0, "border texels must be non-negative");
        self.border_texels = border_texels;
        self.recompute_num_tiles();
    }

    fn recompute_num_tiles(&mut self) {
        self.num_tiles_x = compute_num_tiles(
            self.max_texture_size.width,
            self.tiling_size.width,
            self.border_texels,
        );
        self.num_tiles_y = compute_num_tiles(
            self.max_texture_size.height,
            self.tiling_size.height,
            self.border_texels,
        );
    }

    fn inner_width(&self) -> i32 {
        self.max_texture_size.width - 2 * self.border_texels
    }

    fn inner_height(&self) -> i32 {
        self.max_texture_size.height - 2 * self.border_texels
    }

    pub fn tile_index_checked(&self, i: i32, j: i32) -> Result<TileIndex, TilingDataError> {
        if i < 0 || j < 0 || i >= self.num_tiles_x || j >= self.num_tiles_y {
            return Err(TilingDataError::TileIndexOutOfBounds {
                i,
                j,
                num_tiles_x: self.num_tiles_x,
                num_tiles_y: self.num_tiles_y,
            });
        }
        Ok(TileIndex::new(i, j))
    }

    fn assert_tile(&self, i: i32, j: i32) {
        if let Err(error) = self.tile_index_checked(i, j) {
            panic!("{error}");
        }
    }

    pub fn tile_x_index_from_src_coord(&self, src_position: i32) -> i32 {
        if self.num_tiles_x <= 1 {
            return 0;
        }
        debug_assert!(self.inner_width() > 0);
        let x = (src_position - self.border_texels) / self.inner_width();
        x.clamp(0, self.num_tiles_x - 1)
    }

    pub fn tile_y_index_from_src_coord(&self, src_position: i32) -> i32 {
        if self.num_tiles_y <= 1 {
            return 0;
        }
        debug_assert!(self.inner_height() > 0);
        let y = (src_position - self.border_texels) / self.inner_height();
        y.clamp(0, self.num_tiles_y - 1)
    }

    /// Lowest column whose bordered bounds contain `src_position`.
    pub fn first_border_tile_x_index_from_src_coord(&self, src_position: i32) -> i32 {
        if self.num_tiles_x <= 1 {
            return 0;
        }
        debug_assert!(self.inner_width() > 0);
        let x = (src_position - 2 * self.border_texels) / self.inner_width();
        x.clamp(0, self.num_tiles_x - 1)
    }

    pub fn first_border_tile_y_index_from_src_coord(&self, src_position: i32) -> i32 {
        if self.num_tiles_y <= 1 {
            return 0;
        }
        debug_assert!(self.inner_height() > 0);
        let y = (src_position - 2 * self.border_texels) / self.inner_height();
        y.clamp(0, self.num_tiles_y - 1)
    }

    /// Highest column whose bordered bounds contain `src_position`.
    pub fn last_border_tile_x_index_from_src_coord(&self, src_position: i32) -> i32 {
        if self.num_tiles_x <= 1 {
            return 0;
        }
        debug_assert!(self.inner_width() > 0);
        let x = src_position / self.inner_width();
        x.clamp(0, self.num_tiles_x - 1)
    }

    pub fn last_border_tile_y_index_from_src_coord(&self, src_position: i32) -> i32 {
        if self.num_tiles_y <= 1 {
            return 0;
        }
        debug_assert!(self.inner_height() > 0);
        let y = src_position / self.inner_height();
        y.clamp(0, self.num_tiles_y - 1)
    }

    /// Expands `rect` to the union of the bordered-tile-space bounds of every
    /// tile whose bordered bounds it touches.
    pub fn expand_rect_to_tile_bounds(&self, rect: ContentRect) -> ContentRect {
        if self.has_empty_bounds()
            || rect.is_empty()
            || rect.origin.x > self.tiling_size.width
            || rect.origin.y > self.tiling_size.height
        {
            return ContentRect::zero();
        }
        let index_x = self.first_border_tile_x_index_from_src_coord(rect.origin.x);
        let index_y = self.first_border_tile_y_index_from_src_coord(rect.origin.y);
        let index_right = self.last_border_tile_x_index_from_src_coord(rect.right() - 1);
        let index_bottom = self.last_border_tile_y_index_from_src_coord(rect.bottom() - 1);

        let rect_top_left = self.tile_bounds(index_x, index_y);
        let rect_bottom_right = self.tile_bounds(index_right, index_bottom);
        rect_top_left.union_rect(&rect_bottom_right)
    }

    /// Like [`Self::expand_rect_to_tile_bounds`] but only considers tiles whose
    /// inner (borderless) bounds intersect `rect`.
    pub fn expand_rect_ignoring_borders_to_tile_bounds(&self, rect: ContentRect) -> ContentRect {
        if self.has_empty_bounds() {
            return ContentRect::zero();
        }
        let rect = rect.intersect_rect(&self.tiling_rect());
        if rect.is_empty() {
            return ContentRect::zero();
        }
        let index_x = self.tile_x_index_from_src_coord(rect.origin.x);
        let index_y = self.tile_y_index_from_src_coord(rect.origin.y);
        let index_right = self.tile_x_index_from_src_coord(rect.right() - 1);
        let index_bottom = self.tile_y_index_from_src_coord(rect.bottom() - 1);

        let rect_top_left = self.tile_bounds(index_x, index_y);
        let rect_bottom_right = self.tile_bounds(index_right, index_bottom);
        rect_top_left.union_rect(&rect_bottom_right)
    }

    /// Bounds of a tile excluding the border texels shared with neighbours.
    /// Edge tiles extend to the tiling edge.
    pub fn tile_bounds(&self, i: i32, j: i32) -> ContentRect {
        self.assert_tile(i, j);
        let inner_x = self.inner_width();
        let inner_y = self.inner_height();

        let mut lo_x = inner_x * i;
        if i != 0 {
            lo_x += self.border_texels;
        }
        let mut lo_y = inner_y * j;
        if j != 0 {
            lo_y += self.border_texels;
        }

        let mut hi_x = inner_x * (i + 1) + self.border_texels;
        if i + 1 == self.num_tiles_x {
            hi_x += self.border_texels;
        }
        let mut hi_y = inner_y * (j + 1) + self.border_texels;
        if j + 1 == self.num_tiles_y {
            hi_y += self.border_texels;
        }

        hi_x = hi_x.min(self.tiling_size.width);
        hi_y = hi_y.min(self.tiling_size.height);

        rect(lo_x, lo_y, hi_x - lo_x, hi_y - lo_y)
    }

    /// Full texture footprint of a tile, border texels included.
    pub fn tile_bounds_with_border(&self, i: i32, j: i32) -> ContentRect {
        self.assert_tile(i, j);
        let x1 = self.inner_width() * i;
        let y1 = self.inner_height() * j;
        let x2 = (x1 + self.max_texture_size.width).min(self.tiling_size.width);
        let y2 = (y1 + self.max_texture_size.height).min(self.tiling_size.height);
        rect(x1, y1, x2 - x1, y2 - y1)
    }

    /// Texel centers of a tile: the bordered bounds inset by half a texel.
    pub fn texel_extent(&self, i: i32, j: i32) -> ContentRectF {
        let bounds = self.tile_bounds_with_border(i, j);
        ContentRectF::new(
            euclid::Point2D::new(bounds.origin.x as f32 + 0.5, bounds.origin.y as f32 + 0.5),
            euclid::Size2D::new(
                (bounds.size.width as f32 - 1.0).max(0.0),
                (bounds.size.height as f32 - 1.0).max(0.0),
            ),
        )
    }

    pub fn tile_position_x(&self, x_index: i32) -> i32 {
        debug_assert!(x_index >= 0 && x_index < self.num_tiles_x);
        self.inner_width() * x_index
    }

    pub fn tile_position_y(&self, y_index: i32) -> i32 {
        debug_assert!(y_index >= 0 && y_index < self.num_tiles_y);
        self.inner_height() * y_index
    }

    /// Width of column `x_index` counting only the texels it owns.
    pub fn tile_size_x(&self, x_index: i32) -> i32 {
        assert!(
            x_index >= 0 && x_index < self.num_tiles_x,
            "column {x_index} outside {} columns",
            self.num_tiles_x
        );
        if x_index == 0 && self.num_tiles_x == 1 {
            return self.tiling_size.width;
        }
        if x_index == 0 {
            return self.max_texture_size.width - self.border_texels;
        }
        if x_index < self.num_tiles_x - 1 {
            return self.inner_width();
        }
        self.tiling_size.width - self.tile_position_x(x_index)
    }

    pub fn tile_size_y(&self, y_index: i32) -> i32 {
        assert!(
            y_index >= 0 && y_index < self.num_tiles_y,
            "row {y_index} outside {} rows",
            self.num_tiles_y
        );
        if y_index == 0 && self.num_tiles_y == 1 {
            return self.tiling_size.height;
        }
        if y_index == 0 {
            return self.max_texture_size.height - self.border_texels;
        }
        if y_index < self.num_tiles_y - 1 {
            return self.inner_height();
        }
        self.tiling_size.height - self.tile_position_y(y_index)
    }
}
