//! Tilings, tiles and the priority queues that order them.
//!
//! Each picture layer keeps a [`PictureLayerTilingSet`] per tree: one
//! [`PictureLayerTiling`] per contents scale, each a sparse grid of tiles
//! around the visible rect. Tiles live in a shared [`TileStore`] so the
//! active and pending tree can point at the same tile when nothing under it
//! changed. The raster queue walks tiles that need pixels, most urgent
//! first; the eviction queue walks tiles holding memory, least valuable
//! first.

mod coverage;
mod eviction_queue;
mod layer;
mod layer_trees;
mod prioritized_tile;
mod raster_queue;
mod settings;
mod tile;
mod tiling;
mod tiling_set;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

#[cfg(test)]
mod tests;

pub use coverage::{CoverageIterator, CoverageQuad};
pub use eviction_queue::EvictionTilePriorityQueue;
pub use layer::{LayerUpdate, LayerUpdateContext, PictureLayer};
pub use layer_trees::{LayerTree, LayerTrees};
pub use prioritized_tile::PrioritizedTile;
pub use raster_queue::{RasterQueueType, RasterTilePriorityQueue};
pub use settings::{MIN_HEIGHT_FOR_GPU_RASTERED_TILE, TILE_ROUND_UP, TileSizer, TilingSettings};
pub use tile::{DrawMode, Tile, TileCreateInfo, TileDrawInfo, TileKey, TileStore};
pub use tiling::{BORDER_TEXELS, PictureLayerTiling, PriorityRectType, TilingClient};
pub use tiling_set::{LayerTilings, PictureLayerTilingSet, TilingRangeType, TilingSetContext};

static_assertions::assert_impl_all!(TilingSettings: Send, Sync, Copy);
