use raster_protocol::{LayerId, SharedRasterSource, TileId, TilePriority, WhichTree};

use crate::tile::TileKey;

/// A tile as one queue saw it: the priority it was given on one tree at the
/// moment the queue visited it.
#[derive(Debug, Clone)]
pub struct PrioritizedTile {
    pub tile: TileKey,
    pub tile_id: TileId,
    pub layer_id: LayerId,
    pub tree: WhichTree,
    pub contents_scale: f32,
    pub raster_source: SharedRasterSource,
    pub priority: TilePriority,
    pub is_occluded: bool,
    pub required_for_draw: bool,
    /// Far enough from the viewport that only image decodes are worth
    /// starting.
    pub is_process_for_images_only: bool,
}

impl PrioritizedTile {
    pub fn as_value(&self) -> serde_json::Value {
        serde_json::json!({
            "tile_id": self.tile_id.0,
            "layer_id": self.layer_id.0,
            "tree": format!("{:?}", self.tree),
            "contents_scale": self.contents_scale,
            "priority": self.priority.as_value(),
            "is_occluded": self.is_occluded,
            "required_for_draw": self.required_for_draw,
            "is_process_for_images_only": self.is_process_for_images_only,
        })
    }
}
