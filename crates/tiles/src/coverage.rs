use euclid::{Scale, point2, size2};
use tiling_data::TileIndex;
use tiling_data::geometry::{
    ContentRectF, ContentSpace, IntRectExt, ScreenRect, ScreenSpace, scale_to_enclosing_rect,
};

use crate::tile::TileKey;
use crate::tiling::PictureLayerTiling;

/// One piece of a coverage walk: the part of the destination rect drawn from
/// one tile cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageQuad {
    pub geometry_rect: ScreenRect,
    /// Source rect in the tile's texture, bordered origin at zero.
    pub texture_rect: ContentRectF,
    pub index: TileIndex,
    pub tile: Option<TileKey>,
}

/// Walks the tiles of a tiling that cover `coverage_rect`, row by row, with
/// geometry rects that neither overlap nor leave gaps.
#[derive(Debug)]
pub struct CoverageIterator<'a> {
    tiling: &'a PictureLayerTiling,
    coverage_rect: ScreenRect,
    coverage_to_content_scale: f32,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    tile_i: i32,
    tile_j: i32,
    current_geometry_rect: ScreenRect,
}

impl<'a> CoverageIterator<'a> {
    /// `coverage_scale` is the scale of `coverage_rect` relative to layer
    /// space.
    pub fn new(tiling: &'a PictureLayerTiling, coverage_scale: f32, coverage_rect: ScreenRect) -> Self {
        assert!(coverage_scale > 0.0, "coverage scale must be positive");
        let coverage_to_content_scale = tiling.contents_scale() / coverage_scale;
        let mut iterator = Self {
            tiling,
            coverage_rect,
            coverage_to_content_scale,
            left: 0,
            top: 0,
            right: -1,
            bottom: -1,
            tile_i: 0,
            tile_j: 0,
            current_geometry_rect: ScreenRect::zero(),
        };
        if coverage_rect.is_empty() {
            return iterator;
        }

        let scale: Scale<f32, ScreenSpace, ContentSpace> = Scale::new(coverage_to_content_scale);
        let content_rect =
            scale_to_enclosing_rect(coverage_rect, scale).intersect_rect(&tiling.tiling_rect());
        if content_rect.is_empty() {
            return iterator;
        }

        let data = tiling.tiling_data();
        iterator.left = data.tile_x_index_from_src_coord(content_rect.origin.x);
        iterator.top = data.tile_y_index_from_src_coord(content_rect.origin.y);
        iterator.right = data.tile_x_index_from_src_coord(content_rect.right() - 1);
        iterator.bottom = data.tile_y_index_from_src_coord(content_rect.bottom() - 1);
        iterator.tile_i = iterator.left - 1;
        iterator.tile_j = iterator.top;
        iterator
    }

    fn texture_rect(&self, geometry_rect: ScreenRect) -> ContentRectF {
        let scale = self.coverage_to_content_scale;
        let content = ContentRectF::new(
            point2(
                geometry_rect.origin.x as f32 * scale,
                geometry_rect.origin.y as f32 * scale,
            ),
            size2(
                geometry_rect.size.width as f32 * scale,
                geometry_rect.size.height as f32 * scale,
            ),
        );
        let tiling_size = self.tiling.tiling_data().tiling_size();
        let bounds = ContentRectF::new(
            point2(0.0, 0.0),
            size2(tiling_size.width as f32, tiling_size.height as f32),
        );
        let Some(clamped) = content.intersection(&bounds) else {
            return ContentRectF::zero();
        };
        let texture_origin = self
            .tiling
            .tiling_data()
            .tile_bounds_with_border(self.tile_i, self.tile_j)
            .origin;
        clamped.translate(-texture_origin.to_f32().to_vector())
    }
}

impl Iterator for CoverageIterator<'_> {
    type Item = CoverageQuad;

    fn next(&mut self) -> Option<CoverageQuad> {
        if self.tile_j > self.bottom || self.left > self.right {
            return None;
        }
        let first_time = self.tile_i < self.left;
        let mut new_row = false;
        self.tile_i += 1;
        if self.tile_i > self.right {
            self.tile_i = self.left;
            self.tile_j += 1;
            new_row = true;
            if self.tile_j > self.bottom {
                return None;
            }
        }

        let last_geometry_rect = self.current_geometry_rect;
        let content_rect = self
            .tiling
            .tiling_data()
            .tile_bounds(self.tile_i, self.tile_j);
        let scale: Scale<f32, ContentSpace, ScreenSpace> = Scale::new(1.0 / self.coverage_to_content_scale);
        let mut geometry_rect =
            scale_to_enclosing_rect(content_rect, scale).intersect_rect(&self.coverage_rect);

        // Enclosing rects of neighbouring tiles can share a pixel; give it to
        // the tile visited first.
        if !first_time {
            let (min_left, min_top) = if new_row {
                (self.coverage_rect.origin.x, last_geometry_rect.bottom())
            } else {
                (last_geometry_rect.right(), last_geometry_rect.origin.y)
            };
            let inset_left = (min_left - geometry_rect.origin.x).max(0);
            let inset_top = (min_top - geometry_rect.origin.y).max(0);
            geometry_rect = geometry_rect.inset(inset_left, inset_top, 0, 0);
        }
        self.current_geometry_rect = geometry_rect;

        let index = TileIndex::new(self.tile_i, self.tile_j);
        Some(CoverageQuad {
            geometry_rect,
            texture_rect: self.texture_rect(geometry_rect),
            index,
            tile: self.tiling.tile_at(index),
        })
    }
}
