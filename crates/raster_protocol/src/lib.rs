mod raster_source;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tiling_data::geometry::{ContentSize, LayerRect};
use tiling_data::Region;

pub use raster_source::{
    Canvas, DrawOp, ImageId, ImageProvider, RasterSource, RasterSourceBuilder, RecordedImages,
    SharedRasterSource,
};

/// Stable identifier of a layer, shared by its pending and active instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u64);

/// Process-unique tile identifier. Never reused, so it doubles as the content
/// id of whatever the tile rasterized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId(pub u64);

/// Identifies the pixels held by a resource. Zero means "unknown contents".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ContentId(pub u64);

impl ContentId {
    pub const INVALID: Self = Self(0);

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<TileId> for ContentId {
    fn from(id: TileId) -> Self {
        Self(id.0)
    }
}

/// Handle to a pooled raster resource. The generation makes handles to a
/// deleted and recycled slot detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub slot: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RasterTaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WhichTree {
    Active,
    Pending,
}

impl WhichTree {
    pub const fn twin(self) -> Self {
        match self {
            WhichTree::Active => WhichTree::Pending,
            WhichTree::Pending => WhichTree::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileResolution {
    LowResolution,
    HighResolution,
    NonIdealResolution,
}

/// Lower value means more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityBin {
    Now,
    Soon,
    Eventually,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TilePriority {
    pub resolution: TileResolution,
    pub required_for_activation: bool,
    pub priority_bin: PriorityBin,
    pub distance_to_visible: f32,
}

impl Default for TilePriority {
    fn default() -> Self {
        Self {
            resolution: TileResolution::NonIdealResolution,
            required_for_activation: false,
            priority_bin: PriorityBin::Eventually,
            distance_to_visible: f32::INFINITY,
        }
    }
}

impl TilePriority {
    pub const fn new(
        resolution: TileResolution,
        priority_bin: PriorityBin,
        distance_to_visible: f32,
    ) -> Self {
        Self {
            resolution,
            required_for_activation: false,
            priority_bin,
            distance_to_visible,
        }
    }

    /// Merges the priorities a tile has on the two trees: the better
    /// resolution, the more urgent bin, and on a bin tie the smaller distance.
    pub fn combine(active: &TilePriority, pending: &TilePriority) -> Self {
        let resolution = if active.resolution == TileResolution::HighResolution
            || pending.resolution == TileResolution::HighResolution
        {
            TileResolution::HighResolution
        } else if active.resolution == TileResolution::LowResolution
            || pending.resolution == TileResolution::LowResolution
        {
            TileResolution::LowResolution
        } else {
            TileResolution::NonIdealResolution
        };

        let (priority_bin, distance_to_visible) = if active.priority_bin < pending.priority_bin {
            (active.priority_bin, active.distance_to_visible)
        } else if active.priority_bin > pending.priority_bin {
            (pending.priority_bin, pending.distance_to_visible)
        } else {
            (
                active.priority_bin,
                active.distance_to_visible.min(pending.distance_to_visible),
            )
        };

        Self {
            resolution,
            required_for_activation: active.required_for_activation
                || pending.required_for_activation,
            priority_bin,
            distance_to_visible,
        }
    }

    pub fn is_higher_priority_than(&self, other: &TilePriority) -> bool {
        self.priority_bin < other.priority_bin
            || (self.priority_bin == other.priority_bin
                && self.distance_to_visible < other.distance_to_visible)
    }

    pub fn as_value(&self) -> serde_json::Value {
        json!({
            "resolution": format!("{:?}", self.resolution),
            "required_for_activation": self.required_for_activation,
            "priority_bin": format!("{:?}", self.priority_bin),
            "distance_to_visible": if self.distance_to_visible.is_finite() {
                json!(self.distance_to_visible)
            } else {
                json!("infinity")
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryLimitPolicy {
    AllowNothing,
    AllowAbsoluteMinimum,
    AllowPrepaintOnly,
    AllowAnything,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TreePriority {
    #[default]
    SamePriorityForBothTrees,
    SmoothnessTakesPriority,
    NewContentTakesPriority,
}

/// Snapshot of the memory budget and interaction mode, recomputed for every
/// prepare-tiles pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStateThatImpactsTilePriority {
    pub memory_limit_policy: MemoryLimitPolicy,
    pub soft_memory_limit_in_bytes: usize,
    pub hard_memory_limit_in_bytes: usize,
    pub num_resources_limit: usize,
    pub tree_priority: TreePriority,
}

impl Default for GlobalStateThatImpactsTilePriority {
    fn default() -> Self {
        Self {
            memory_limit_policy: MemoryLimitPolicy::AllowNothing,
            soft_memory_limit_in_bytes: 0,
            hard_memory_limit_in_bytes: 0,
            num_resources_limit: 0,
            tree_priority: TreePriority::SamePriorityForBothTrees,
        }
    }
}

impl GlobalStateThatImpactsTilePriority {
    pub fn allow_anything(hard_memory_limit_in_bytes: usize, num_resources_limit: usize) -> Self {
        Self {
            memory_limit_policy: MemoryLimitPolicy::AllowAnything,
            soft_memory_limit_in_bytes: hard_memory_limit_in_bytes,
            hard_memory_limit_in_bytes,
            num_resources_limit,
            tree_priority: TreePriority::SamePriorityForBothTrees,
        }
    }
}

/// Layer-space region hidden behind opaque content drawn on top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Occlusion {
    occluded: Region,
}

impl Occlusion {
    pub fn new(occluded: Region) -> Self {
        Self { occluded }
    }

    pub fn has_occlusion(&self) -> bool {
        !self.occluded.is_empty()
    }

    /// An empty rect counts as occluded.
    pub fn is_occluded(&self, layer_rect: &LayerRect) -> bool {
        if layer_rect.is_empty() {
            return true;
        }
        if !self.has_occlusion() {
            return false;
        }
        self.occluded.contains_rect(layer_rect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResourceFormat {
    #[default]
    #[serde(rename = "RGBA_8888")]
    Rgba8888,
    #[serde(rename = "BGRA_8888")]
    Bgra8888,
    #[serde(rename = "RGBA_4444")]
    Rgba4444,
}

impl ResourceFormat {
    pub const fn bits_per_pixel(self) -> usize {
        match self {
            ResourceFormat::Rgba8888 | ResourceFormat::Bgra8888 => 32,
            ResourceFormat::Rgba4444 => 16,
        }
    }

    pub const fn bytes_per_pixel(self) -> usize {
        self.bits_per_pixel() / 8
    }

    pub fn memory_size_bytes(self, size: ContentSize) -> usize {
        let width = size.width.max(0) as usize;
        let height = size.height.max(0) as usize;
        width
            .checked_mul(height)
            .and_then(|pixels| pixels.checked_mul(self.bytes_per_pixel()))
            .unwrap_or_else(|| panic!("resource memory size overflow for {size:?}"))
    }
}

/// Fence handle marking when GPU work from one context is visible to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SyncToken {
    pub command_buffer_id: u64,
    pub release_count: u64,
    pub verified_flush: bool,
}

impl SyncToken {
    pub const EMPTY: Self = Self {
        command_buffer_id: 0,
        release_count: 0,
        verified_flush: false,
    };

    pub const fn has_data(&self) -> bool {
        self.release_count != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaybackSettings {
    pub skip_images: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba8 {
    pub const TRANSPARENT: Self = Self::new(0, 0, 0, 0);
    pub const WHITE: Self = Self::new(255, 255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn is_opaque(self) -> bool {
        self.a == 255
    }
}
