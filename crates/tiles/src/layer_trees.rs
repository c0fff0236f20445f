use raster_protocol::{LayerId, Occlusion, TreePriority, WhichTree};
use serde_json::json;
use tiling_data::geometry::{ContentSize, LayerRect};

use crate::eviction_queue::EvictionTilePriorityQueue;
use crate::layer::{LayerUpdate, LayerUpdateContext, PictureLayer};
use crate::raster_queue::{RasterQueueType, RasterTilePriorityQueue};
use crate::settings::{TileSizer, TilingSettings};
use crate::tile::TileStore;
use crate::tiling_set::LayerTilings;

/// The layers of one tree.
#[derive(Debug)]
pub struct LayerTree {
    which: WhichTree,
    layers: Vec<PictureLayer>,
}

impl LayerTree {
    pub fn new(which: WhichTree) -> Self {
        Self {
            which,
            layers: Vec::new(),
        }
    }

    pub const fn which(&self) -> WhichTree {
        self.which
    }

    pub fn layers(&self) -> &[PictureLayer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&PictureLayer> {
        self.layers.iter().find(|layer| layer.id() == id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut PictureLayer> {
        self.layers.iter_mut().find(|layer| layer.id() == id)
    }

    fn take_layer(&mut self, id: LayerId) -> Option<PictureLayer> {
        let index = self.layers.iter().position(|layer| layer.id() == id)?;
        Some(self.layers.swap_remove(index))
    }

    pub fn num_tiles(&self) -> usize {
        self.layers.iter().map(|layer| layer.tilings().num_tiles()).sum()
    }
}

/// The active and pending layer trees plus the tiles both share.
///
/// A layer's pending and active instances pair up by [`LayerId`]. Tilings on
/// the two trees reference tiles in the one [`TileStore`], so a tile that did
/// not change across a commit is the same tile on both trees.
#[derive(Debug)]
pub struct LayerTrees {
    active: LayerTree,
    pending: Option<LayerTree>,
    /// Pending layers kept after activation; their tilings are empty but keep
    /// visible-rect history for the next commit.
    recycle: Option<LayerTree>,
    store: TileStore,
    settings: TilingSettings,
    sizer: TileSizer,
    requires_high_res_to_draw: bool,
    tree_priority: TreePriority,
}

impl LayerTrees {
    pub fn new(settings: TilingSettings) -> Self {
        Self {
            active: LayerTree::new(WhichTree::Active),
            pending: None,
            recycle: None,
            store: TileStore::new(),
            sizer: TileSizer::new(&settings),
            settings,
            requires_high_res_to_draw: false,
            tree_priority: TreePriority::default(),
        }
    }

    pub const fn settings(&self) -> &TilingSettings {
        &self.settings
    }

    pub const fn sizer(&self) -> &TileSizer {
        &self.sizer
    }

    /// Switches tile sizing to GPU raster for `viewport`, or back to software
    /// raster with `None`. Takes effect as tilings are resized.
    pub fn set_gpu_rasterization(&mut self, viewport: Option<ContentSize>) {
        self.sizer = TileSizer::new(&self.settings).with_gpu_raster_viewport(viewport);
    }

    pub fn uses_gpu_rasterization(&self) -> bool {
        self.sizer.uses_gpu_rasterization()
    }

    pub const fn requires_high_res_to_draw(&self) -> bool {
        self.requires_high_res_to_draw
    }

    pub fn set_requires_high_res_to_draw(&mut self, required: bool) {
        self.requires_high_res_to_draw = required;
    }

    pub const fn tree_priority(&self) -> TreePriority {
        self.tree_priority
    }

    pub fn set_tree_priority(&mut self, tree_priority: TreePriority) {
        self.tree_priority = tree_priority;
    }

    pub const fn active_tree(&self) -> &LayerTree {
        &self.active
    }

    pub fn pending_tree(&self) -> Option<&LayerTree> {
        self.pending.as_ref()
    }

    pub fn has_pending_tree(&self) -> bool {
        self.pending.is_some()
    }

    pub fn tree(&self, which: WhichTree) -> Option<&LayerTree> {
        match which {
            WhichTree::Active => Some(&self.active),
            WhichTree::Pending => self.pending.as_ref(),
        }
    }

    fn tree_mut(&mut self, which: WhichTree) -> Option<&mut LayerTree> {
        match which {
            WhichTree::Active => Some(&mut self.active),
            WhichTree::Pending => self.pending.as_mut(),
        }
    }

    pub fn layer(&self, which: WhichTree, id: LayerId) -> Option<&PictureLayer> {
        self.tree(which)?.layer(id)
    }

    pub const fn tile_store(&self) -> &TileStore {
        &self.store
    }

    pub fn tile_store_mut(&mut self) -> &mut TileStore {
        &mut self.store
    }

    /// Builds the pending tree from the main thread's layer updates.
    ///
    /// # Panics
    /// If the previous pending tree has not been activated yet.
    pub fn commit(&mut self, updates: Vec<LayerUpdate>) {
        assert!(
            self.pending.is_none(),
            "commit while a pending tree is waiting to activate"
        );
        let mut recycle = self
            .recycle
            .take()
            .unwrap_or_else(|| LayerTree::new(WhichTree::Pending));
        let mut pending = LayerTree::new(WhichTree::Pending);
        for update in updates {
            let layer = match recycle.take_layer(update.layer_id) {
                Some(mut layer) => {
                    let twin = self.active.layer(update.layer_id);
                    layer.apply_commit(
                        update,
                        twin,
                        &self.sizer,
                        &mut self.store,
                        self.requires_high_res_to_draw,
                    );
                    layer
                }
                None => PictureLayer::new(WhichTree::Pending, update, self.settings),
            };
            pending.layers.push(layer);
        }
        for mut layer in recycle.layers.drain(..) {
            layer.release_tilings(&mut self.store);
        }
        log::debug!("committed pending tree with {} layers", pending.layers.len());
        self.pending = Some(pending);
    }

    /// Applies layer updates straight to the active tree, for hosts that
    /// commit without a pending tree.
    pub fn commit_to_active_tree(&mut self, updates: Vec<LayerUpdate>) {
        let mut previous = std::mem::take(&mut self.active.layers);
        for update in updates {
            let index = previous.iter().position(|layer| layer.id() == update.layer_id);
            let layer = match index {
                Some(index) => {
                    let mut layer = previous.swap_remove(index);
                    layer.apply_commit(
                        update,
                        None,
                        &self.sizer,
                        &mut self.store,
                        self.requires_high_res_to_draw,
                    );
                    layer
                }
                None => PictureLayer::new(WhichTree::Active, update, self.settings),
            };
            self.active.layers.push(layer);
        }
        for mut layer in previous {
            layer.release_tilings(&mut self.store);
        }
    }

    /// Makes the pending tree the active one. Tiles move over by identity;
    /// active layers missing from the pending tree are dropped.
    ///
    /// # Panics
    /// If there is no pending tree.
    pub fn activate(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            panic!("activate without a pending tree");
        };
        let mut previous = std::mem::take(&mut self.active.layers);
        for pending_layer in &mut pending.layers {
            let index = previous.iter().position(|layer| layer.id() == pending_layer.id());
            let mut active_layer = match index {
                Some(index) => previous.swap_remove(index),
                None => PictureLayer::new_active_twin(pending_layer, self.settings),
            };
            active_layer.push_from_pending(pending_layer, &self.sizer, &mut self.store);
            self.active.layers.push(active_layer);
        }
        for mut layer in previous {
            layer.release_tilings(&mut self.store);
        }
        log::debug!(
            "activated {} layers, {} tiles live",
            self.active.layers.len(),
            self.store.len()
        );
        self.recycle = Some(pending);
    }

    /// Sets the visible rect of a layer on both trees.
    pub fn set_layer_visible_rect(&mut self, id: LayerId, visible_layer_rect: LayerRect) {
        for which in [WhichTree::Active, WhichTree::Pending] {
            if let Some(layer) = self.tree_mut(which).and_then(|tree| tree.layer_mut(id)) {
                layer.set_visible_layer_rect(visible_layer_rect);
            }
        }
    }

    pub fn set_layer_occlusion(&mut self, which: WhichTree, id: LayerId, occlusion: Occlusion) {
        if let Some(layer) = self.tree_mut(which).and_then(|tree| tree.layer_mut(id)) {
            layer.set_occlusion(occlusion);
        }
    }

    /// Records whether the last frame drew a layer only from low-res tiles.
    pub fn record_append_quads(&mut self, id: LayerId, only_used_low_res: bool) {
        if let Some(layer) = self.active.layer_mut(id) {
            layer.set_only_used_low_res_last_append_quads(only_used_low_res);
        }
    }

    /// Updates tilings and tile priorities on both trees for a new frame.
    /// Returns whether any layer's priorities changed.
    pub fn update_tile_priorities(&mut self, frame_time_in_seconds: f64) -> bool {
        let Self {
            active,
            pending,
            store,
            settings,
            sizer,
            requires_high_res_to_draw,
            tree_priority,
            ..
        } = self;
        let sizer: &TileSizer = sizer;
        let base = LayerUpdateContext {
            twin: None,
            sizer,
            create_low_res_tiling: settings.create_low_res_tiling && !sizer.uses_gpu_rasterization(),
            low_res_contents_scale_factor: settings.low_res_contents_scale_factor,
            requires_high_res_to_draw: *requires_high_res_to_draw,
            smoothness_takes_priority: *tree_priority == TreePriority::SmoothnessTakesPriority,
            frame_time_in_seconds,
        };

        let mut updated = false;
        for layer in &mut active.layers {
            let twin = pending.as_ref().and_then(|tree| tree.layer(layer.id()));
            updated |= layer.update_tiles(&LayerUpdateContext { twin, ..base }, store);
        }
        if let Some(pending) = pending.as_mut() {
            for layer in &mut pending.layers {
                let twin = active.layer(layer.id());
                updated |= layer.update_tiles(&LayerUpdateContext { twin, ..base }, store);
            }
        }
        updated
    }

    /// Every layer of `which` with its twin on the other tree.
    pub fn layer_tilings(&self, which: WhichTree) -> Vec<LayerTilings<'_>> {
        let (tree, twin_tree) = match which {
            WhichTree::Active => (Some(&self.active), self.pending.as_ref()),
            WhichTree::Pending => (self.pending.as_ref(), Some(&self.active)),
        };
        let Some(tree) = tree else {
            return Vec::new();
        };
        tree.layers
            .iter()
            .map(|layer| {
                let twin = twin_tree.and_then(|twin_tree| twin_tree.layer(layer.id()));
                layer.layer_tilings(twin, self.requires_high_res_to_draw)
            })
            .collect()
    }

    pub fn build_raster_queue(
        &self,
        tree_priority: TreePriority,
        queue_type: RasterQueueType,
    ) -> RasterTilePriorityQueue<'_> {
        RasterTilePriorityQueue::build(
            &self.layer_tilings(WhichTree::Active),
            &self.layer_tilings(WhichTree::Pending),
            &self.store,
            tree_priority,
            queue_type,
        )
    }

    pub fn build_eviction_queue(&self, tree_priority: TreePriority) -> EvictionTilePriorityQueue<'_> {
        EvictionTilePriorityQueue::build(
            &self.layer_tilings(WhichTree::Active),
            &self.layer_tilings(WhichTree::Pending),
            &self.store,
            tree_priority,
        )
    }

    pub fn num_tiles(&self) -> usize {
        self.active.num_tiles() + self.pending.as_ref().map_or(0, LayerTree::num_tiles)
    }

    pub fn as_value(&self) -> serde_json::Value {
        let tree_value =
            |tree: &LayerTree| serde_json::Value::Array(tree.layers.iter().map(PictureLayer::as_value).collect());
        json!({
            "active": tree_value(&self.active),
            "pending": self.pending.as_ref().map(tree_value),
            "live_tiles": self.store.len(),
            "requires_high_res_to_draw": self.requires_high_res_to_draw,
            "tree_priority": format!("{:?}", self.tree_priority),
        })
    }
}
