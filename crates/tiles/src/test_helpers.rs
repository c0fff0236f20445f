//! Fixtures shared by unit tests here and by downstream crates' tests.

use raster_protocol::{LayerId, Occlusion, RasterSourceBuilder, Rgba8, SharedRasterSource};
use tiling_data::Region;
use tiling_data::geometry::{LayerRect, LayerSize, rect};

use crate::layer::LayerUpdate;
use crate::settings::{TileSizer, TilingSettings};

/// A fully recorded source painted with two colors, so tiles are not solid.
pub fn filled_raster_source(size: LayerSize) -> SharedRasterSource {
    RasterSourceBuilder::new(size)
        .fill_rect(rect(0, 0, size.width, size.height), Rgba8::new(40, 80, 120, 255))
        .fill_rect(
            rect(0, 0, size.width / 2 + 1, size.height / 2 + 1),
            Rgba8::new(200, 30, 30, 255),
        )
        .build()
}

pub fn sizer() -> TileSizer {
    TileSizer::new(&TilingSettings::default())
}

/// Settings with a fixed 256x256 tile size and no low-res tiling.
pub fn fixed_tile_settings() -> TilingSettings {
    TilingSettings {
        default_tile_size: tiling_data::geometry::size(256, 256),
        create_low_res_tiling: false,
        ..TilingSettings::default()
    }
}

/// A drawn layer at scale 1 showing `visible`.
pub fn layer_update(id: u64, size: LayerSize, visible: LayerRect) -> LayerUpdate {
    LayerUpdate {
        layer_id: LayerId(id),
        raster_source: filled_raster_source(size),
        invalidation: Region::new(),
        visible_layer_rect: visible,
        ideal_contents_scale: 1.0,
        occlusion: Occlusion::default(),
        is_drawn: true,
    }
}
