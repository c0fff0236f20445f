use std::collections::VecDeque;
use std::ops::Range;

use raster_protocol::{LayerId, Occlusion, SharedRasterSource, TileResolution, WhichTree};
use tiling_data::Region;
use tiling_data::geometry::{IntRectExt, LayerRect, LayerSize, rect};

use crate::settings::{TileSizer, TilingSettings};
use crate::tile::TileStore;
use crate::tiling::{PictureLayerTiling, TilingClient};

/// Soon-border padding, in screen pixels.
const SOON_BORDER_DISTANCE_IN_SCREEN_PIXELS: f32 = 312.0;
/// Cap on the soon-border padding as a fraction of the viewport's longer side.
const MAX_SOON_BORDER_DISTANCE_VIEWPORT_PERCENTAGE: f32 = 0.15;
const MAX_VISIBLE_RECT_HISTORY: usize = 2;

/// Layer-wide state a tiling set needs to build per-tiling clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct TilingSetContext<'a> {
    pub twin_set: Option<&'a PictureLayerTilingSet>,
    pub pending_invalidation: Option<&'a Region>,
    pub has_valid_tile_priorities: bool,
    pub requires_high_res_to_draw: bool,
}

impl<'a> TilingSetContext<'a> {
    pub fn client_for(&self, contents_scale: f32) -> TilingClient<'a> {
        TilingClient {
            twin: self
                .twin_set
                .and_then(|set| set.find_tiling_with_scale(contents_scale)),
            pending_invalidation: self.pending_invalidation,
            has_valid_tile_priorities: self.has_valid_tile_priorities,
            requires_high_res_to_draw: self.requires_high_res_to_draw,
        }
    }
}

/// One layer's tilings as the priority queues see them.
#[derive(Debug, Clone, Copy)]
pub struct LayerTilings<'a> {
    pub tilings: &'a PictureLayerTilingSet,
    pub context: TilingSetContext<'a>,
}

/// Groups of tilings the eviction queue walks separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilingRangeType {
    HigherThanHighRes,
    HighRes,
    BetweenHighAndLowRes,
    LowRes,
    LowerThanLowRes,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FrameVisibleRect {
    visible_rect_in_layer_space: LayerRect,
    frame_time_in_seconds: f64,
}

/// All tilings of one layer on one tree, sorted by contents scale, largest
/// first.
#[derive(Debug)]
pub struct PictureLayerTilingSet {
    tree: WhichTree,
    layer_id: LayerId,
    settings: TilingSettings,
    tilings: Vec<PictureLayerTiling>,

    visible_rect_history: VecDeque<FrameVisibleRect>,
    added_tilings_since_last_update: bool,
    invalidated_since_last_update: bool,

    visible_rect_in_layer_space: LayerRect,
    skewport_in_layer_space: LayerRect,
    soon_border_rect_in_layer_space: LayerRect,
    eventually_rect_in_layer_space: LayerRect,
}

impl PictureLayerTilingSet {
    pub fn new(tree: WhichTree, layer_id: LayerId, settings: TilingSettings) -> Self {
        Self {
            tree,
            layer_id,
            settings,
            tilings: Vec::new(),
            visible_rect_history: VecDeque::with_capacity(MAX_VISIBLE_RECT_HISTORY),
            added_tilings_since_last_update: false,
            invalidated_since_last_update: false,
            visible_rect_in_layer_space: LayerRect::zero(),
            skewport_in_layer_space: LayerRect::zero(),
            soon_border_rect_in_layer_space: LayerRect::zero(),
            eventually_rect_in_layer_space: LayerRect::zero(),
        }
    }

    pub const fn tree(&self) -> WhichTree {
        self.tree
    }

    pub fn num_tilings(&self) -> usize {
        self.tilings.len()
    }

    pub fn tilings(&self) -> &[PictureLayerTiling] {
        &self.tilings
    }

    pub fn tiling_at(&self, index: usize) -> &PictureLayerTiling {
        &self.tilings[index]
    }

    pub fn tiling_at_mut(&mut self, index: usize) -> &mut PictureLayerTiling {
        &mut self.tilings[index]
    }

    pub const fn visible_rect_in_layer_space(&self) -> LayerRect {
        self.visible_rect_in_layer_space
    }

    pub const fn skewport_in_layer_space(&self) -> LayerRect {
        self.skewport_in_layer_space
    }

    pub const fn soon_border_rect_in_layer_space(&self) -> LayerRect {
        self.soon_border_rect_in_layer_space
    }

    pub const fn eventually_rect_in_layer_space(&self) -> LayerRect {
        self.eventually_rect_in_layer_space
    }

    fn find_index_with_scale(&self, contents_scale: f32) -> Option<usize> {
        self.tilings
            .iter()
            .position(|tiling| tiling.contents_scale() == contents_scale)
    }

    pub fn find_tiling_with_scale(&self, contents_scale: f32) -> Option<&PictureLayerTiling> {
        self.find_index_with_scale(contents_scale)
            .map(|index| &self.tilings[index])
    }

    pub fn find_tiling_with_scale_mut(&mut self, contents_scale: f32) -> Option<&mut PictureLayerTiling> {
        self.find_index_with_scale(contents_scale)
            .map(|index| &mut self.tilings[index])
    }

    pub fn find_tiling_with_resolution(&self, resolution: TileResolution) -> Option<&PictureLayerTiling> {
        self.tilings
            .iter()
            .find(|tiling| tiling.resolution() == resolution)
    }

    pub fn add_tiling(
        &mut self,
        contents_scale: f32,
        raster_source: SharedRasterSource,
        sizer: &TileSizer,
    ) -> &mut PictureLayerTiling {
        assert!(
            self.find_index_with_scale(contents_scale).is_none(),
            "layer {:?} already has a tiling at scale {contents_scale}",
            self.layer_id
        );
        self.tilings.push(PictureLayerTiling::new(
            self.tree,
            self.layer_id,
            contents_scale,
            raster_source,
            sizer,
            &self.settings,
        ));
        self.tilings
            .sort_by(|a, b| b.contents_scale().total_cmp(&a.contents_scale()));
        self.added_tilings_since_last_update = true;
        let index = self
            .find_index_with_scale(contents_scale)
            .unwrap_or_else(|| panic!("tiling at scale {contents_scale} vanished after insert"));
        &mut self.tilings[index]
    }

    pub fn mark_all_tilings_non_ideal(&mut self) {
        for tiling in &mut self.tilings {
            tiling.set_resolution(TileResolution::NonIdealResolution);
        }
    }

    pub fn remove_all_tilings(&mut self, store: &mut TileStore) {
        for mut tiling in self.tilings.drain(..) {
            tiling.reset(store);
        }
    }

    pub fn remove_tilings_where(
        &mut self,
        store: &mut TileStore,
        mut predicate: impl FnMut(&PictureLayerTiling) -> bool,
    ) {
        let mut kept = Vec::with_capacity(self.tilings.len());
        for mut tiling in self.tilings.drain(..) {
            if predicate(&tiling) {
                tiling.reset(store);
            } else {
                kept.push(tiling);
            }
        }
        self.tilings = kept;
    }

    pub fn remove_non_ideal_tilings(&mut self, store: &mut TileStore) {
        self.remove_tilings_where(store, |tiling| {
            tiling.resolution() == TileResolution::NonIdealResolution
        });
    }

    /// Commit path: brings every tiling to the new raster source and applies
    /// the invalidation to trees that rebuild their own tiles.
    pub fn update_tilings_to_current_raster_source_for_commit(
        &mut self,
        raster_source: &SharedRasterSource,
        layer_invalidation: &Region,
        sizer: &TileSizer,
        store: &mut TileStore,
        context: &TilingSetContext<'_>,
    ) {
        for tiling in &mut self.tilings {
            let client = context.client_for(tiling.contents_scale());
            tiling.set_raster_source_and_resize(raster_source.clone(), sizer, store, &client);
            // Pending tilings recreate invalidated tiles through their twin
            // lookup instead.
            if self.tree == WhichTree::Active {
                tiling.invalidate(layer_invalidation, store);
            }
            tiling.create_missing_tiles_in_live_tiles_rect(store, &client);
        }
        if !layer_invalidation.is_empty() {
            self.invalidated_since_last_update = true;
        }
    }

    /// Activation path: moves the tiles of `pending_set` into this active set.
    /// Active tilings without a pending twin rebuild their invalidated tiles
    /// and stop being ideal.
    pub fn update_tilings_to_current_raster_source_for_activation(
        &mut self,
        raster_source: &SharedRasterSource,
        pending_set: &mut PictureLayerTilingSet,
        layer_invalidation: &Region,
        sizer: &TileSizer,
        store: &mut TileStore,
    ) {
        assert_eq!(self.tree, WhichTree::Active, "activation targets the active set");
        if pending_set.tilings.is_empty() {
            self.remove_all_tilings(store);
            return;
        }

        for pending_tiling in &mut pending_set.tilings {
            let scale = pending_tiling.contents_scale();
            if self.find_index_with_scale(scale).is_none() {
                self.add_tiling(scale, raster_source.clone(), sizer);
            }
            if let Some(active_tiling) = self.find_tiling_with_scale_mut(scale) {
                active_tiling.take_tiles_and_properties_from(
                    pending_tiling,
                    layer_invalidation,
                    sizer,
                    store,
                );
            }
        }

        let detached = TilingClient::detached();
        for tiling in &mut self.tilings {
            if pending_set.find_index_with_scale(tiling.contents_scale()).is_some() {
                continue;
            }
            tiling.set_raster_source_and_resize(raster_source.clone(), sizer, store, &detached);
            tiling.invalidate(layer_invalidation, store);
            tiling.create_missing_tiles_in_live_tiles_rect(store, &detached);
            if tiling.resolution() != TileResolution::LowResolution {
                tiling.set_resolution(TileResolution::NonIdealResolution);
            }
        }
        if !layer_invalidation.is_empty() {
            self.invalidated_since_last_update = true;
        }
    }

    fn tilings_need_update(&self, required_rect: LayerRect, frame_time_in_seconds: f64) -> bool {
        if self.tilings.is_empty() {
            return false;
        }
        if self.added_tilings_since_last_update || self.invalidated_since_last_update {
            return true;
        }
        match self.visible_rect_history.front() {
            None => true,
            Some(latest) => {
                latest.frame_time_in_seconds != frame_time_in_seconds
                    || latest.visible_rect_in_layer_space != required_rect
            }
        }
    }

    fn compute_skewport(
        &self,
        visible_rect_in_layer_space: LayerRect,
        frame_time_in_seconds: f64,
        ideal_contents_scale: f32,
    ) -> LayerRect {
        let Some(oldest) = self.visible_rect_history.back() else {
            return visible_rect_in_layer_space;
        };
        let time_delta = frame_time_in_seconds - oldest.frame_time_in_seconds;
        if time_delta <= 0.0 {
            return visible_rect_in_layer_space;
        }

        let extrapolation_multiplier =
            f64::from(self.settings.skewport_target_time_in_seconds) / time_delta;
        let old_rect = oldest.visible_rect_in_layer_space;
        let new_rect = visible_rect_in_layer_space;
        let inset = |delta: i32| (extrapolation_multiplier * f64::from(delta)) as i32;

        let mut skewport = new_rect.inset(
            inset(new_rect.origin.x - old_rect.origin.x),
            inset(new_rect.origin.y - old_rect.origin.y),
            inset(old_rect.right() - new_rect.right()),
            inset(old_rect.bottom() - new_rect.bottom()),
        );
        // Movement that grows the rect must not shrink the skewport.
        skewport = skewport.union_rect(&new_rect);

        let limit = (self.settings.skewport_extrapolation_limit_in_screen_pixels as f32
            / ideal_contents_scale) as i32;
        let max_skewport = new_rect.inflate_by(limit);
        skewport.intersect_rect(&max_skewport).union_rect(&new_rect)
    }

    fn update_priority_rects(
        &mut self,
        visible_rect_in_layer_space: LayerRect,
        layer_bounds: LayerSize,
        frame_time_in_seconds: f64,
        ideal_contents_scale: f32,
    ) {
        let padding =
            self.settings.tiling_interest_area_padding as f32 / ideal_contents_scale;
        let eventually = enclosing_inflated(visible_rect_in_layer_space, padding);
        let layer_rect = rect(0, 0, layer_bounds.width, layer_bounds.height);

        let (visible, eventually) = if eventually.intersects_rect(&layer_rect) {
            (visible_rect_in_layer_space, eventually)
        } else {
            (LayerRect::zero(), LayerRect::zero())
        };
        let skewport = self.compute_skewport(visible, frame_time_in_seconds, ideal_contents_scale);

        let max_dimension = visible.size.width.max(visible.size.height) as f32;
        let distance = (SOON_BORDER_DISTANCE_IN_SCREEN_PIXELS / ideal_contents_scale)
            .min(MAX_SOON_BORDER_DISTANCE_VIEWPORT_PERCENTAGE * max_dimension);
        // Nest the skewport inside the soon border so that each priority rect
        // contains the more urgent ones.
        let soon_border = enclosing_inflated(visible, distance).union_rect(&skewport);

        self.visible_rect_in_layer_space = visible;
        self.skewport_in_layer_space = skewport;
        self.soon_border_rect_in_layer_space = soon_border;
        self.eventually_rect_in_layer_space = eventually.union_rect(&soon_border);

        if self.visible_rect_history.len() == MAX_VISIBLE_RECT_HISTORY {
            self.visible_rect_history.pop_back();
        }
        self.visible_rect_history.push_front(FrameVisibleRect {
            visible_rect_in_layer_space: visible,
            frame_time_in_seconds,
        });
    }

    /// Recomputes the priority rects of every tiling. Returns whether
    /// anything was updated.
    #[allow(clippy::too_many_arguments)]
    pub fn update_tile_priorities(
        &mut self,
        required_rect_in_layer_space: LayerRect,
        layer_bounds: LayerSize,
        ideal_contents_scale: f32,
        frame_time_in_seconds: f64,
        occlusion_in_layer_space: &Occlusion,
        can_require_tiles_for_activation: bool,
        store: &mut TileStore,
        context: &TilingSetContext<'_>,
    ) -> bool {
        if !self.tilings_need_update(required_rect_in_layer_space, frame_time_in_seconds) {
            return false;
        }
        self.added_tilings_since_last_update = false;
        self.invalidated_since_last_update = false;

        self.update_priority_rects(
            required_rect_in_layer_space,
            layer_bounds,
            frame_time_in_seconds,
            ideal_contents_scale,
        );
        log::trace!(
            "layer {:?} {:?}: visible {:?} skewport {:?} soon {:?} eventually {:?}",
            self.layer_id,
            self.tree,
            self.visible_rect_in_layer_space,
            self.skewport_in_layer_space,
            self.soon_border_rect_in_layer_space,
            self.eventually_rect_in_layer_space
        );

        for tiling in &mut self.tilings {
            let client = context.client_for(tiling.contents_scale());
            tiling.set_can_require_tiles_for_activation(can_require_tiles_for_activation);
            tiling.compute_tile_priority_rects(
                self.visible_rect_in_layer_space,
                self.skewport_in_layer_space,
                self.soon_border_rect_in_layer_space,
                self.eventually_rect_in_layer_space,
                ideal_contents_scale,
                occlusion_in_layer_space,
                store,
                &client,
            );
        }
        true
    }

    /// Index range of the tilings in `range_type`. Tilings are sorted from
    /// the largest scale down, so the ranges partition the set in order.
    pub fn tiling_range(&self, range_type: TilingRangeType) -> Range<usize> {
        let count = self.tilings.len();
        let high_res = self
            .tilings
            .iter()
            .position(|tiling| tiling.resolution() == TileResolution::HighResolution);
        let low_res = self
            .tilings
            .iter()
            .position(|tiling| tiling.resolution() == TileResolution::LowResolution);

        let (high_res_start, high_res_end) = match high_res {
            Some(index) => (index, index + 1),
            None => (0, 0),
        };
        let (low_res_start, low_res_end) = match low_res {
            Some(index) => (index, index + 1),
            None => (count, count),
        };

        let range = match range_type {
            TilingRangeType::HigherThanHighRes => 0..high_res_start,
            TilingRangeType::HighRes => high_res_start..high_res_end,
            TilingRangeType::BetweenHighAndLowRes => high_res_end..low_res_start,
            TilingRangeType::LowRes => low_res_start..low_res_end,
            TilingRangeType::LowerThanLowRes => low_res_end..count,
        };
        if range.start >= range.end {
            return 0..0;
        }
        range
    }

    pub fn num_tiles(&self) -> usize {
        self.tilings.iter().map(PictureLayerTiling::num_tiles).sum()
    }

    pub fn as_value(&self) -> serde_json::Value {
        serde_json::Value::Array(self.tilings.iter().map(PictureLayerTiling::as_value).collect())
    }
}

/// Smallest integer rect containing `rect` grown by `distance` on each side.
fn enclosing_inflated(rect: LayerRect, distance: f32) -> LayerRect {
    if rect.is_empty() {
        return LayerRect::zero();
    }
    let left = (rect.origin.x as f32 - distance).floor() as i32;
    let top = (rect.origin.y as f32 - distance).floor() as i32;
    let right = (rect.right() as f32 + distance).ceil() as i32;
    let bottom = (rect.bottom() as f32 + distance).ceil() as i32;
    tiling_data::geometry::rect(left, top, right - left, bottom - top)
}
