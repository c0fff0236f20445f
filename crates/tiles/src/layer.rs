use euclid::Scale;
use raster_protocol::{LayerId, Occlusion, SharedRasterSource, TileResolution, WhichTree};
use serde_json::json;
use tiling_data::Region;
use tiling_data::geometry::{ContentSpace, LayerRect, LayerSpace, scale_to_ceiled_size};

use crate::settings::{TileSizer, TilingSettings};
use crate::tile::TileStore;
use crate::tiling_set::{LayerTilings, PictureLayerTilingSet, TilingSetContext};

/// What the main thread hands over for one layer at commit.
#[derive(Debug, Clone)]
pub struct LayerUpdate {
    pub layer_id: LayerId,
    pub raster_source: SharedRasterSource,
    /// Layer-space area repainted since the previous commit.
    pub invalidation: Region,
    pub visible_layer_rect: LayerRect,
    pub ideal_contents_scale: f32,
    pub occlusion: Occlusion,
    pub is_drawn: bool,
}

/// Per-frame inputs of [`PictureLayer::update_tiles`].
#[derive(Debug, Clone, Copy)]
pub struct LayerUpdateContext<'a> {
    pub twin: Option<&'a PictureLayer>,
    pub sizer: &'a TileSizer,
    pub create_low_res_tiling: bool,
    pub low_res_contents_scale_factor: f32,
    pub requires_high_res_to_draw: bool,
    pub smoothness_takes_priority: bool,
    pub frame_time_in_seconds: f64,
}

/// A content layer on one tree, owning its tiling set.
#[derive(Debug)]
pub struct PictureLayer {
    id: LayerId,
    tree: WhichTree,
    raster_source: SharedRasterSource,
    tilings: PictureLayerTilingSet,
    invalidation: Region,

    ideal_contents_scale: f32,
    raster_contents_scale: f32,
    low_res_raster_contents_scale: f32,

    visible_layer_rect: LayerRect,
    occlusion: Occlusion,
    is_drawn: bool,
    only_used_low_res_last_append_quads: bool,
}

impl PictureLayer {
    pub fn new(tree: WhichTree, update: LayerUpdate, settings: TilingSettings) -> Self {
        Self {
            id: update.layer_id,
            tree,
            raster_source: update.raster_source,
            tilings: PictureLayerTilingSet::new(tree, update.layer_id, settings),
            invalidation: update.invalidation,
            ideal_contents_scale: update.ideal_contents_scale,
            raster_contents_scale: 0.0,
            low_res_raster_contents_scale: 0.0,
            visible_layer_rect: update.visible_layer_rect,
            occlusion: update.occlusion,
            is_drawn: update.is_drawn,
            only_used_low_res_last_append_quads: false,
        }
    }

    /// An empty active twin for a layer that first appears at activation.
    pub(crate) fn new_active_twin(pending: &PictureLayer, settings: TilingSettings) -> Self {
        Self {
            id: pending.id,
            tree: WhichTree::Active,
            raster_source: pending.raster_source.clone(),
            tilings: PictureLayerTilingSet::new(WhichTree::Active, pending.id, settings),
            invalidation: Region::new(),
            ideal_contents_scale: pending.ideal_contents_scale,
            raster_contents_scale: 0.0,
            low_res_raster_contents_scale: 0.0,
            visible_layer_rect: pending.visible_layer_rect,
            occlusion: pending.occlusion.clone(),
            is_drawn: pending.is_drawn,
            only_used_low_res_last_append_quads: false,
        }
    }

    pub const fn id(&self) -> LayerId {
        self.id
    }

    pub const fn tree(&self) -> WhichTree {
        self.tree
    }

    pub fn raster_source(&self) -> &SharedRasterSource {
        &self.raster_source
    }

    pub fn tilings(&self) -> &PictureLayerTilingSet {
        &self.tilings
    }

    pub fn invalidation(&self) -> &Region {
        &self.invalidation
    }

    pub const fn ideal_contents_scale(&self) -> f32 {
        self.ideal_contents_scale
    }

    pub const fn raster_contents_scale(&self) -> f32 {
        self.raster_contents_scale
    }

    pub const fn visible_layer_rect(&self) -> LayerRect {
        self.visible_layer_rect
    }

    pub fn set_visible_layer_rect(&mut self, visible_layer_rect: LayerRect) {
        self.visible_layer_rect = visible_layer_rect;
    }

    pub fn occlusion(&self) -> &Occlusion {
        &self.occlusion
    }

    pub fn set_occlusion(&mut self, occlusion: Occlusion) {
        self.occlusion = occlusion;
    }

    pub const fn is_drawn(&self) -> bool {
        self.is_drawn
    }

    /// Priorities of a layer that is not drawn, or shows nothing, are not
    /// worth acting on.
    pub fn has_valid_tile_priorities(&self) -> bool {
        self.is_drawn && !self.visible_layer_rect.is_empty()
    }

    pub fn set_only_used_low_res_last_append_quads(&mut self, only_low_res: bool) {
        self.only_used_low_res_last_append_quads = only_low_res;
    }

    /// The tilings as the priority queues see them, given the same layer on
    /// the other tree.
    pub fn layer_tilings<'a>(
        &'a self,
        twin: Option<&'a PictureLayer>,
        requires_high_res_to_draw: bool,
    ) -> LayerTilings<'a> {
        LayerTilings {
            tilings: &self.tilings,
            context: TilingSetContext {
                twin_set: twin.map(|twin| &twin.tilings),
                pending_invalidation: self.pending_invalidation(twin),
                has_valid_tile_priorities: self.has_valid_tile_priorities(),
                requires_high_res_to_draw,
            },
        }
    }

    fn pending_invalidation<'a>(&'a self, twin: Option<&'a PictureLayer>) -> Option<&'a Region> {
        match self.tree {
            WhichTree::Pending => Some(&self.invalidation),
            WhichTree::Active => twin.map(|twin| &twin.invalidation),
        }
    }

    fn can_have_tilings(&self) -> bool {
        let bounds = self.raster_source.size();
        if bounds.is_empty() || self.ideal_contents_scale <= 0.0 {
            return false;
        }
        let scale: Scale<f32, LayerSpace, ContentSpace> = Scale::new(self.ideal_contents_scale);
        !scale_to_ceiled_size(bounds, scale).is_empty()
    }

    fn should_adjust_raster_scale(&self) -> bool {
        self.raster_contents_scale != self.ideal_contents_scale
            || self
                .tilings
                .find_tiling_with_resolution(TileResolution::HighResolution)
                .is_none()
    }

    fn add_tilings_for_raster_scale(&mut self, sizer: &TileSizer, store: &mut TileStore) {
        let scale = self.raster_contents_scale;
        self.tilings.mark_all_tilings_non_ideal();
        if self.tilings.find_tiling_with_scale(scale).is_none() {
            self.tilings.add_tiling(scale, self.raster_source.clone(), sizer);
        } else if let Some(tiling) = self.tilings.find_tiling_with_scale_mut(scale) {
            // A former low-res tiling may hold blurry content; start over.
            if tiling.may_contain_low_resolution_tiles() {
                tiling.reset(store);
                tiling.reset_may_contain_low_resolution_tiles();
            }
        }
        if let Some(tiling) = self.tilings.find_tiling_with_scale_mut(scale) {
            tiling.set_resolution(TileResolution::HighResolution);
        }
        if self.tree == WhichTree::Pending {
            self.tilings.remove_non_ideal_tilings(store);
        }
        log::debug!(
            "layer {:?} on {:?} rasters at scale {}",
            self.id,
            self.tree,
            scale
        );
    }

    fn add_low_resolution_tiling_if_needed(&mut self, sizer: &TileSizer) {
        let scale = self.low_res_raster_contents_scale;
        if scale <= 0.0 || scale == self.raster_contents_scale {
            return;
        }
        let ratio: Scale<f32, LayerSpace, ContentSpace> = Scale::new(scale);
        if scale_to_ceiled_size(self.raster_source.size(), ratio).is_empty() {
            return;
        }
        if self.tilings.find_tiling_with_scale(scale).is_none() {
            self.tilings.add_tiling(scale, self.raster_source.clone(), sizer);
        }
        if let Some(tiling) = self.tilings.find_tiling_with_scale_mut(scale) {
            if tiling.resolution() != TileResolution::HighResolution {
                tiling.set_resolution(TileResolution::LowResolution);
            }
        }
    }

    /// Brings the tilings up to the current scale and visible rect and
    /// reprioritizes their tiles. Returns whether priorities changed.
    pub fn update_tiles(&mut self, context: &LayerUpdateContext<'_>, store: &mut TileStore) -> bool {
        if !self.can_have_tilings() {
            self.tilings.remove_all_tilings(store);
            return false;
        }

        if self.tree == WhichTree::Active {
            // Non-ideal tilings nobody on the pending tree still uses.
            let twin_set = context.twin.map(|twin| &twin.tilings);
            self.tilings.remove_tilings_where(store, |tiling| {
                tiling.resolution() == TileResolution::NonIdealResolution
                    && twin_set
                        .and_then(|set| set.find_tiling_with_scale(tiling.contents_scale()))
                        .is_none()
            });
        }

        if self.should_adjust_raster_scale() {
            self.raster_contents_scale = self.ideal_contents_scale;
            self.low_res_raster_contents_scale =
                self.ideal_contents_scale * context.low_res_contents_scale_factor;
            self.add_tilings_for_raster_scale(context.sizer, store);
        }
        if self.tree == WhichTree::Active && context.create_low_res_tiling {
            self.add_low_resolution_tiling_if_needed(context.sizer);
        }

        let can_require_tiles_for_activation = !self.only_used_low_res_last_append_quads
            || context.requires_high_res_to_draw
            || !context.smoothness_takes_priority;

        let set_context = TilingSetContext {
            twin_set: context.twin.map(|twin| &twin.tilings),
            pending_invalidation: match self.tree {
                WhichTree::Pending => Some(&self.invalidation),
                WhichTree::Active => context.twin.map(|twin| &twin.invalidation),
            },
            has_valid_tile_priorities: self.is_drawn && !self.visible_layer_rect.is_empty(),
            requires_high_res_to_draw: context.requires_high_res_to_draw,
        };
        self.tilings.update_tile_priorities(
            self.visible_layer_rect,
            self.raster_source.size(),
            self.ideal_contents_scale,
            context.frame_time_in_seconds,
            &self.occlusion,
            can_require_tiles_for_activation,
            store,
            &set_context,
        )
    }

    /// Commit path for a layer that already has tilings, such as a recycled
    /// pending layer or an active layer in commit-to-active mode.
    pub fn apply_commit(
        &mut self,
        update: LayerUpdate,
        twin: Option<&PictureLayer>,
        sizer: &TileSizer,
        store: &mut TileStore,
        requires_high_res_to_draw: bool,
    ) {
        debug_assert_eq!(self.id, update.layer_id);
        self.raster_source = update.raster_source;
        self.invalidation = update.invalidation;
        self.visible_layer_rect = update.visible_layer_rect;
        self.ideal_contents_scale = update.ideal_contents_scale;
        self.occlusion = update.occlusion;
        self.is_drawn = update.is_drawn;

        let context = TilingSetContext {
            twin_set: twin.map(|twin| &twin.tilings),
            pending_invalidation: match self.tree {
                WhichTree::Pending => Some(&self.invalidation),
                WhichTree::Active => None,
            },
            has_valid_tile_priorities: self.is_drawn && !self.visible_layer_rect.is_empty(),
            requires_high_res_to_draw,
        };
        self.tilings.update_tilings_to_current_raster_source_for_commit(
            &self.raster_source,
            &self.invalidation,
            sizer,
            store,
            &context,
        );
        if self.tree == WhichTree::Active {
            // Nothing on the other side consults an active-only invalidation.
            self.invalidation.clear();
        }
    }

    /// Activation: take over the pending layer's tiles and properties.
    pub fn push_from_pending(
        &mut self,
        pending: &mut PictureLayer,
        sizer: &TileSizer,
        store: &mut TileStore,
    ) {
        debug_assert_eq!(self.tree, WhichTree::Active);
        debug_assert_eq!(self.id, pending.id);
        self.raster_source = pending.raster_source.clone();
        let invalidation = std::mem::take(&mut pending.invalidation);
        self.tilings.update_tilings_to_current_raster_source_for_activation(
            &self.raster_source,
            &mut pending.tilings,
            &invalidation,
            sizer,
            store,
        );
        self.ideal_contents_scale = pending.ideal_contents_scale;
        self.raster_contents_scale = pending.raster_contents_scale;
        self.low_res_raster_contents_scale = pending.low_res_raster_contents_scale;
        self.visible_layer_rect = pending.visible_layer_rect;
        self.occlusion = pending.occlusion.clone();
        self.is_drawn = pending.is_drawn;
    }

    pub fn release_tilings(&mut self, store: &mut TileStore) {
        self.tilings.remove_all_tilings(store);
    }

    pub fn as_value(&self) -> serde_json::Value {
        json!({
            "id": self.id.0,
            "tree": format!("{:?}", self.tree),
            "ideal_contents_scale": self.ideal_contents_scale,
            "raster_contents_scale": self.raster_contents_scale,
            "is_drawn": self.is_drawn,
            "visible_layer_rect": [
                self.visible_layer_rect.origin.x,
                self.visible_layer_rect.origin.y,
                self.visible_layer_rect.size.width,
                self.visible_layer_rect.size.height,
            ],
            "tilings": self.tilings.as_value(),
        })
    }
}
