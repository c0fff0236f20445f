use serde::{Deserialize, Serialize};
use tiling_data::geometry::{ContentSize, size};

/// Tile sizes are rounded up to this many texels when clamped to content.
pub const TILE_ROUND_UP: i32 = 64;
pub const MIN_HEIGHT_FOR_GPU_RASTERED_TILE: i32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingSettings {
    pub default_tile_size: ContentSize,
    pub max_untiled_layer_size: ContentSize,
    pub max_texture_size: i32,
    pub tiling_interest_area_padding: i32,
    pub skewport_target_time_in_seconds: f32,
    pub skewport_extrapolation_limit_in_screen_pixels: i32,
    pub min_preraster_distance: f32,
    pub max_preraster_distance_in_screen_pixels: f32,
    pub create_low_res_tiling: bool,
    pub low_res_contents_scale_factor: f32,
}

impl Default for TilingSettings {
    fn default() -> Self {
        Self {
            default_tile_size: size(256, 256),
            max_untiled_layer_size: size(512, 512),
            max_texture_size: 16384,
            tiling_interest_area_padding: 3000,
            skewport_target_time_in_seconds: 1.0,
            skewport_extrapolation_limit_in_screen_pixels: 2000,
            min_preraster_distance: 1000.0,
            max_preraster_distance_in_screen_pixels: 1000.0,
            create_low_res_tiling: true,
            low_res_contents_scale_factor: 0.25,
        }
    }
}

/// Picks the tile size for a tiling from its content bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileSizer {
    default_tile_size: ContentSize,
    max_untiled_layer_size: ContentSize,
    max_texture_size: i32,
    gpu_raster_viewport: Option<ContentSize>,
}

fn round_up(value: i32, multiple: i32) -> i32 {
    (value + multiple - 1) / multiple * multiple
}

impl TileSizer {
    pub fn new(settings: &TilingSettings) -> Self {
        assert!(
            settings.default_tile_size.width > 0 && settings.default_tile_size.height > 0,
            "default tile size must be positive, got {:?}",
            settings.default_tile_size
        );
        Self {
            default_tile_size: settings.default_tile_size,
            max_untiled_layer_size: settings.max_untiled_layer_size,
            max_texture_size: settings.max_texture_size,
            gpu_raster_viewport: None,
        }
    }

    /// GPU raster sizes tiles from the viewport instead of the settings.
    pub fn with_gpu_raster_viewport(mut self, viewport: Option<ContentSize>) -> Self {
        self.gpu_raster_viewport = viewport;
        self
    }

    pub fn uses_gpu_rasterization(&self) -> bool {
        self.gpu_raster_viewport.is_some()
    }

    pub fn calculate_tile_size(&self, content_bounds: ContentSize) -> ContentSize {
        let (default_width, default_height) = match self.gpu_raster_viewport {
            Some(viewport) => {
                // Four tiles cover the viewport vertically; narrow content
                // gets taller tiles.
                let mut divisor = 4;
                if content_bounds.width <= viewport.width / 2 {
                    divisor = 2;
                }
                if content_bounds.width <= viewport.width / 4 {
                    divisor = 1;
                }
                let border = 2 * crate::tiling::BORDER_TEXELS;
                let height = round_up(viewport.height, divisor) / divisor + border;
                (
                    viewport.width + border,
                    height.max(MIN_HEIGHT_FOR_GPU_RASTERED_TILE),
                )
            }
            None => {
                let untiled = self.max_untiled_layer_size;
                let mut width = self.default_tile_size.width;
                let mut height = self.default_tile_size.height;
                if content_bounds.width < width {
                    height = untiled.height;
                }
                if content_bounds.height < height {
                    width = untiled.width;
                }
                if content_bounds.width < untiled.width && content_bounds.height < untiled.height {
                    width = untiled.width;
                    height = untiled.height;
                }
                (width, height)
            }
        };

        let mut tile_width = default_width;
        let mut tile_height = default_height;
        if content_bounds.width < default_width {
            tile_width = round_up(tile_width.min(content_bounds.width), TILE_ROUND_UP)
                .min(default_width);
        }
        if content_bounds.height < default_height {
            tile_height = round_up(tile_height.min(content_bounds.height), TILE_ROUND_UP)
                .min(default_height);
        }
        size(
            tile_width.min(self.max_texture_size),
            tile_height.min(self.max_texture_size),
        )
    }
}
