use std::collections::{BTreeMap, HashMap};

use euclid::Scale;
use raster_protocol::{
    LayerId, Occlusion, PriorityBin, SharedRasterSource, TilePriority, TileResolution, WhichTree,
};
use serde_json::json;
use tiling_data::geometry::{
    ContentRect, ContentSpace, IntRectExt, LayerRect, LayerSpace, scale_to_ceiled_size,
    scale_to_enclosing_rect,
};
use tiling_data::{DifferenceIterator, Region, TileIndex, TileIterator, TilingData};

use crate::prioritized_tile::PrioritizedTile;
use crate::settings::{TileSizer, TilingSettings};
use crate::tile::{Tile, TileCreateInfo, TileKey, TileStore};

pub const BORDER_TEXELS: i32 = 1;

/// Which of the nested priority rects a tile falls in, most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityRectType {
    Visible,
    PendingVisible,
    Skewport,
    SoonBorder,
    Eventually,
}

/// What a tiling may look up on the other tree while it decides what to
/// create and how urgent a tile is.
///
/// `twin` is the tiling with the same contents scale on the other tree.
/// `pending_invalidation` is the invalidation of the pending layer, which
/// both trees consult.
#[derive(Debug, Clone, Copy, Default)]
pub struct TilingClient<'a> {
    pub twin: Option<&'a PictureLayerTiling>,
    pub pending_invalidation: Option<&'a Region>,
    pub has_valid_tile_priorities: bool,
    pub requires_high_res_to_draw: bool,
}

impl TilingClient<'_> {
    /// Client for mutations of the active tree, which never consult a twin.
    pub fn detached() -> Self {
        Self::default()
    }
}

fn tile_index(tile: &Tile) -> TileIndex {
    TileIndex::new(tile.tiling_i_index(), tile.tiling_j_index())
}

/// The tiles of one layer at one contents scale on one tree.
#[derive(Debug)]
pub struct PictureLayerTiling {
    tree: WhichTree,
    layer_id: LayerId,
    contents_scale: f32,
    raster_source: SharedRasterSource,
    tiling_data: TilingData,
    tiles: HashMap<TileIndex, TileKey>,
    resolution: TileResolution,
    may_contain_low_resolution_tiles: bool,

    live_tiles_rect: ContentRect,
    current_visible_rect: ContentRect,
    current_skewport_rect: ContentRect,
    current_soon_border_rect: ContentRect,
    current_eventually_rect: ContentRect,
    current_content_to_screen_scale: f32,
    current_occlusion_in_layer_space: Occlusion,
    max_skewport_extent_in_screen_space: f32,

    has_visible_rect_tiles: bool,
    has_skewport_rect_tiles: bool,
    has_soon_border_rect_tiles: bool,
    has_eventually_rect_tiles: bool,

    all_tiles_done: bool,
    can_require_tiles_for_activation: bool,
    min_preraster_distance: f32,
    max_preraster_distance: f32,
}

impl PictureLayerTiling {
    pub fn new(
        tree: WhichTree,
        layer_id: LayerId,
        contents_scale: f32,
        raster_source: SharedRasterSource,
        sizer: &TileSizer,
        settings: &TilingSettings,
    ) -> Self {
        assert!(
            contents_scale > 0.0,
            "tiling contents scale must be positive, got {contents_scale}"
        );
        let content_bounds = scale_to_ceiled_size(raster_source.size(), Scale::new(contents_scale));
        assert!(
            !content_bounds.is_empty(),
            "tiling for layer {:?} at scale {contents_scale} has empty content bounds",
            layer_id
        );
        let tile_size = sizer.calculate_tile_size(content_bounds);
        Self {
            tree,
            layer_id,
            contents_scale,
            raster_source,
            tiling_data: TilingData::with_border_texels(tile_size, content_bounds, BORDER_TEXELS),
            tiles: HashMap::new(),
            resolution: TileResolution::NonIdealResolution,
            may_contain_low_resolution_tiles: false,
            live_tiles_rect: ContentRect::zero(),
            current_visible_rect: ContentRect::zero(),
            current_skewport_rect: ContentRect::zero(),
            current_soon_border_rect: ContentRect::zero(),
            current_eventually_rect: ContentRect::zero(),
            current_content_to_screen_scale: 0.0,
            current_occlusion_in_layer_space: Occlusion::default(),
            max_skewport_extent_in_screen_space: 0.0,
            has_visible_rect_tiles: false,
            has_skewport_rect_tiles: false,
            has_soon_border_rect_tiles: false,
            has_eventually_rect_tiles: false,
            all_tiles_done: true,
            can_require_tiles_for_activation: false,
            min_preraster_distance: settings.min_preraster_distance,
            max_preraster_distance: settings.max_preraster_distance_in_screen_pixels,
        }
    }

    pub const fn tree(&self) -> WhichTree {
        self.tree
    }

    pub const fn layer_id(&self) -> LayerId {
        self.layer_id
    }

    pub const fn contents_scale(&self) -> f32 {
        self.contents_scale
    }

    pub fn raster_source(&self) -> &SharedRasterSource {
        &self.raster_source
    }

    pub const fn tiling_data(&self) -> &TilingData {
        &self.tiling_data
    }

    pub fn tiling_rect(&self) -> ContentRect {
        self.tiling_data.tiling_rect()
    }

    pub const fn resolution(&self) -> TileResolution {
        self.resolution
    }

    pub fn set_resolution(&mut self, resolution: TileResolution) {
        self.resolution = resolution;
        if resolution == TileResolution::LowResolution {
            self.may_contain_low_resolution_tiles = true;
        }
    }

    pub const fn may_contain_low_resolution_tiles(&self) -> bool {
        self.may_contain_low_resolution_tiles
    }

    pub fn reset_may_contain_low_resolution_tiles(&mut self) {
        self.may_contain_low_resolution_tiles = false;
    }

    pub const fn live_tiles_rect(&self) -> ContentRect {
        self.live_tiles_rect
    }

    pub const fn current_visible_rect(&self) -> ContentRect {
        self.current_visible_rect
    }

    pub const fn current_skewport_rect(&self) -> ContentRect {
        self.current_skewport_rect
    }

    pub const fn current_soon_border_rect(&self) -> ContentRect {
        self.current_soon_border_rect
    }

    pub const fn current_eventually_rect(&self) -> ContentRect {
        self.current_eventually_rect
    }

    pub const fn current_content_to_screen_scale(&self) -> f32 {
        self.current_content_to_screen_scale
    }

    pub const fn max_skewport_extent_in_screen_space(&self) -> f32 {
        self.max_skewport_extent_in_screen_space
    }

    pub const fn has_visible_rect_tiles(&self) -> bool {
        self.has_visible_rect_tiles
    }

    pub const fn has_skewport_rect_tiles(&self) -> bool {
        self.has_skewport_rect_tiles
    }

    pub const fn has_soon_border_rect_tiles(&self) -> bool {
        self.has_soon_border_rect_tiles
    }

    pub const fn has_eventually_rect_tiles(&self) -> bool {
        self.has_eventually_rect_tiles
    }

    pub const fn all_tiles_done(&self) -> bool {
        self.all_tiles_done
    }

    pub fn set_all_tiles_done(&mut self, all_tiles_done: bool) {
        self.all_tiles_done = all_tiles_done;
    }

    pub const fn can_require_tiles_for_activation(&self) -> bool {
        self.can_require_tiles_for_activation
    }

    pub fn set_can_require_tiles_for_activation(&mut self, can_require: bool) {
        self.can_require_tiles_for_activation = can_require;
    }

    pub fn has_tiles(&self) -> bool {
        !self.tiles.is_empty()
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile_at(&self, index: TileIndex) -> Option<TileKey> {
        self.tiles.get(&index).copied()
    }

    /// Every tile of the tiling, in no particular order.
    pub fn tiles(&self) -> impl Iterator<Item = (TileIndex, TileKey)> + '_ {
        self.tiles.iter().map(|(index, key)| (*index, *key))
    }

    /// Both tilings split their content with the same tile size, so a grid
    /// index names the same content on either.
    pub fn matches_tile_indices(&self, twin: &PictureLayerTiling) -> bool {
        self.tiling_data.max_texture_size() == twin.tiling_data.max_texture_size()
    }

    pub fn enclosing_contents_rect_from_layer_rect(&self, layer_rect: LayerRect) -> ContentRect {
        let scale: Scale<f32, LayerSpace, ContentSpace> = Scale::new(self.contents_scale);
        scale_to_enclosing_rect(layer_rect, scale)
    }

    pub fn enclosing_layer_rect_from_contents_rect(&self, content_rect: ContentRect) -> LayerRect {
        let scale: Scale<f32, ContentSpace, LayerSpace> = Scale::new(1.0 / self.contents_scale);
        scale_to_enclosing_rect(content_rect, scale)
    }

    pub fn create_info_for_tile(&self, i: i32, j: i32) -> TileCreateInfo {
        let mut content_rect = self.tiling_data.tile_bounds_with_border(i, j);
        content_rect.size = self.tiling_data.max_texture_size();
        TileCreateInfo {
            tiling_i_index: i,
            tiling_j_index: j,
            enclosing_layer_rect: self.enclosing_layer_rect_from_contents_rect(content_rect),
            content_rect,
            contents_scale: self.contents_scale,
        }
    }

    /// Returns `None` when the raster source cannot paint the tile.
    pub fn create_tile(&mut self, info: &TileCreateInfo, store: &mut TileStore) -> Option<TileKey> {
        let index = TileIndex::new(info.tiling_i_index, info.tiling_j_index);
        assert!(
            !self.tiles.contains_key(&index),
            "tile ({}, {}) already exists",
            index.i,
            index.j
        );
        if !self.raster_source.covers_rect(&info.enclosing_layer_rect) {
            return None;
        }
        self.all_tiles_done = false;
        let key = store.create_tile(self.layer_id, info);
        self.tiles.insert(index, key);
        Some(key)
    }

    fn remove_tile_at(&mut self, index: TileIndex, store: &mut TileStore) -> bool {
        match self.tiles.remove(&index) {
            Some(key) => {
                store.release(key);
                true
            }
            None => false,
        }
    }

    /// Drops every tile and empties the live tiles rect.
    pub fn reset(&mut self, store: &mut TileStore) {
        for (_, key) in self.tiles.drain() {
            store.release(key);
        }
        self.live_tiles_rect = ContentRect::zero();
        self.all_tiles_done = true;
    }

    pub fn should_create_tile_at(&self, info: &TileCreateInfo, client: &TilingClient<'_>) -> bool {
        if self.tree == WhichTree::Active {
            return true;
        }
        let Some(active_twin) = client.twin else {
            return true;
        };
        if !self.matches_tile_indices(active_twin) {
            return true;
        }
        if !active_twin.raster_source.covers_rect(&info.enclosing_layer_rect) {
            return true;
        }
        if let Some(invalidation) = client.pending_invalidation {
            let invalidated = invalidation.iter().any(|layer_rect| {
                self.enclosing_contents_rect_from_layer_rect(*layer_rect)
                    .intersects_rect(&info.content_rect)
            });
            if invalidated {
                return true;
            }
        }
        // Visible content missing from the active tree can only come from the
        // pending tree.
        let index = TileIndex::new(info.tiling_i_index, info.tiling_j_index);
        active_twin.tile_at(index).is_none()
            && self.current_visible_rect.intersects_rect(&info.content_rect)
    }

    fn invalidated_rect_in_tile(&self, invalidation: &Region, tile_rect: ContentRect) -> ContentRect {
        invalidation
            .iter()
            .map(|layer_rect| {
                self.enclosing_contents_rect_from_layer_rect(*layer_rect)
                    .intersect_rect(&tile_rect)
            })
            .fold(ContentRect::zero(), |union, rect| union.union_rect(&rect))
    }

    pub fn create_missing_tiles_in_live_tiles_rect(
        &mut self,
        store: &mut TileStore,
        client: &TilingClient<'_>,
    ) {
        for index in TileIterator::new(&self.tiling_data, self.live_tiles_rect, false) {
            if self.tiles.contains_key(&index) {
                continue;
            }
            let info = self.create_info_for_tile(index.i, index.j);
            if !self.should_create_tile_at(&info, client) {
                continue;
            }
            if let Some(key) = self.create_tile(&info, store) {
                self.note_replaced_active_tile(key, &info, store, client);
            }
        }
    }

    /// The active tile at a new pending tile's index holds the previous
    /// content, so only the invalidated part needs raster.
    fn note_replaced_active_tile(
        &self,
        key: TileKey,
        info: &TileCreateInfo,
        store: &mut TileStore,
        client: &TilingClient<'_>,
    ) {
        if self.tree != WhichTree::Pending {
            return;
        }
        let (Some(active_twin), Some(invalidation)) = (client.twin, client.pending_invalidation) else {
            return;
        };
        if !self.matches_tile_indices(active_twin) {
            return;
        }
        let index = TileIndex::new(info.tiling_i_index, info.tiling_j_index);
        if let Some(old_key) = active_twin.tile_at(index) {
            let invalidated = self.invalidated_rect_in_tile(invalidation, info.content_rect);
            if !invalidated.is_empty() {
                let old_id = store.tile(old_key).id();
                store.tile_mut(key).set_invalidated(invalidated, old_id);
            }
        }
    }

    pub fn set_raster_source_and_resize(
        &mut self,
        raster_source: SharedRasterSource,
        sizer: &TileSizer,
        store: &mut TileStore,
        client: &TilingClient<'_>,
    ) {
        let content_bounds = scale_to_ceiled_size(raster_source.size(), Scale::new(self.contents_scale));
        let tile_size = sizer.calculate_tile_size(content_bounds);
        self.raster_source = raster_source;

        if tile_size != self.tiling_data.max_texture_size() {
            // Grid indices change meaning with the tile size.
            self.tiling_data.set_tiling_size(content_bounds);
            self.tiling_data.set_max_texture_size(tile_size);
            self.reset(store);
            return;
        }
        if self.tiling_data.tiling_size() == content_bounds {
            return;
        }

        let live = self.live_tiles_rect;
        let before_left = self.tiling_data.tile_x_index_from_src_coord(live.origin.x);
        let before_top = self.tiling_data.tile_y_index_from_src_coord(live.origin.y);
        let before_right = self.tiling_data.tile_x_index_from_src_coord(live.right() - 1);
        let before_bottom = self.tiling_data.tile_y_index_from_src_coord(live.bottom() - 1);

        self.live_tiles_rect = live.intersect_rect(&tiling_data::geometry::rect(
            0,
            0,
            content_bounds.width,
            content_bounds.height,
        ));
        self.tiling_data.set_tiling_size(content_bounds);

        let (after_right, after_bottom) = if self.live_tiles_rect.is_empty() {
            (-1, -1)
        } else {
            (
                self.tiling_data
                    .tile_x_index_from_src_coord(self.live_tiles_rect.right() - 1),
                self.tiling_data
                    .tile_y_index_from_src_coord(self.live_tiles_rect.bottom() - 1),
            )
        };

        for i in (after_right + 1)..=before_right {
            for j in before_top..=before_bottom {
                self.remove_tile_at(TileIndex::new(i, j), store);
            }
        }
        for i in before_left..=after_right {
            for j in (after_bottom + 1)..=before_bottom {
                self.remove_tile_at(TileIndex::new(i, j), store);
            }
        }

        if after_right > before_right {
            for j in before_top..=after_bottom {
                self.create_tile_if_needed(TileIndex::new(after_right, j), store, client);
            }
        }
        if after_bottom > before_bottom {
            for i in before_left..=before_right {
                self.create_tile_if_needed(TileIndex::new(i, after_bottom), store, client);
            }
        }
    }

    fn create_tile_if_needed(&mut self, index: TileIndex, store: &mut TileStore, client: &TilingClient<'_>) {
        if self.tiles.contains_key(&index) {
            return;
        }
        let info = self.create_info_for_tile(index.i, index.j);
        if !self.should_create_tile_at(&info, client) {
            return;
        }
        if let Some(key) = self.create_tile(&info, store) {
            self.note_replaced_active_tile(key, &info, store, client);
        }
    }

    /// Removes the tiles touched by `layer_invalidation`.
    ///
    /// With `recreate` each removed tile is replaced by a fresh one that
    /// remembers the removed tile's id and the invalidated part of its rect.
    pub fn remove_tiles_in_region(
        &mut self,
        layer_invalidation: &Region,
        recreate: bool,
        store: &mut TileStore,
    ) {
        if self.live_tiles_rect.is_empty() {
            return;
        }
        let expanded_live = self.tiling_data.expand_rect_to_tile_bounds(self.live_tiles_rect);

        let mut removed: BTreeMap<TileIndex, ContentRect> = BTreeMap::new();
        for layer_rect in layer_invalidation.iter() {
            let invalid_content_rect = self.enclosing_contents_rect_from_layer_rect(*layer_rect);
            let coverage = invalid_content_rect.intersect_rect(&expanded_live);
            if coverage.is_empty() {
                continue;
            }
            // A texel in a tile's border is sampled by that tile too.
            for index in TileIterator::new(&self.tiling_data, coverage, true) {
                removed
                    .entry(index)
                    .and_modify(|rect| *rect = rect.union_rect(&invalid_content_rect))
                    .or_insert(invalid_content_rect);
            }
        }

        for (index, invalid_content_rect) in removed {
            let Some(old_key) = self.tiles.remove(&index) else {
                continue;
            };
            let old_id = store.tile(old_key).id();
            store.release(old_key);
            if !recreate {
                continue;
            }
            let info = self.create_info_for_tile(index.i, index.j);
            if let Some(key) = self.create_tile(&info, store) {
                let invalidated = invalid_content_rect.intersect_rect(&info.content_rect);
                if !invalidated.is_empty() {
                    store.tile_mut(key).set_invalidated(invalidated, old_id);
                }
            }
        }
    }

    pub fn invalidate(&mut self, layer_invalidation: &Region, store: &mut TileStore) {
        self.remove_tiles_in_region(layer_invalidation, true, store);
    }

    /// Moves the pending twin's tiles into this active tiling.
    pub fn take_tiles_and_properties_from(
        &mut self,
        pending_twin: &mut PictureLayerTiling,
        layer_invalidation: &Region,
        sizer: &TileSizer,
        store: &mut TileStore,
    ) {
        assert_eq!(self.tree, WhichTree::Active, "only an active tiling takes tiles");
        let detached = TilingClient::detached();
        self.set_raster_source_and_resize(pending_twin.raster_source.clone(), sizer, store, &detached);
        self.remove_tiles_in_region(layer_invalidation, false, store);
        self.resolution = pending_twin.resolution;
        self.may_contain_low_resolution_tiles |= pending_twin.may_contain_low_resolution_tiles;

        let create_missing_tiles = if self.live_tiles_rect.is_empty() {
            self.live_tiles_rect = pending_twin.live_tiles_rect;
            true
        } else {
            self.set_live_tiles_rect(pending_twin.live_tiles_rect, store, &detached);
            false
        };

        for (index, key) in pending_twin.tiles.drain() {
            if let Some(replaced) = self.tiles.insert(index, key) {
                store.release(replaced);
            }
        }
        self.all_tiles_done &= pending_twin.all_tiles_done;
        pending_twin.all_tiles_done = true;

        if create_missing_tiles {
            self.create_missing_tiles_in_live_tiles_rect(store, &detached);
        }

        self.set_tile_priority_rects(
            pending_twin.current_content_to_screen_scale,
            pending_twin.current_visible_rect,
            pending_twin.current_skewport_rect,
            pending_twin.current_soon_border_rect,
            pending_twin.current_eventually_rect,
            pending_twin.current_occlusion_in_layer_space.clone(),
        );
    }

    pub fn set_live_tiles_rect(
        &mut self,
        new_live_tiles_rect: ContentRect,
        store: &mut TileStore,
        client: &TilingClient<'_>,
    ) {
        assert!(
            new_live_tiles_rect.is_empty() || self.tiling_rect().contains_area(&new_live_tiles_rect),
            "live tiles rect {:?} outside tiling rect {:?}",
            new_live_tiles_rect,
            self.tiling_rect()
        );
        if self.live_tiles_rect == new_live_tiles_rect {
            return;
        }

        for index in DifferenceIterator::new(&self.tiling_data, self.live_tiles_rect, new_live_tiles_rect) {
            self.remove_tile_at(index, store);
        }

        // Non-ideal tilings only keep what they already have.
        if self.resolution == TileResolution::NonIdealResolution {
            self.live_tiles_rect = self.live_tiles_rect.intersect_rect(&new_live_tiles_rect);
            return;
        }

        for index in DifferenceIterator::new(&self.tiling_data, new_live_tiles_rect, self.live_tiles_rect) {
            self.create_tile_if_needed(index, store, client);
        }
        self.live_tiles_rect = new_live_tiles_rect;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn compute_tile_priority_rects(
        &mut self,
        visible_rect_in_layer_space: LayerRect,
        skewport_in_layer_space: LayerRect,
        soon_border_rect_in_layer_space: LayerRect,
        eventually_rect_in_layer_space: LayerRect,
        ideal_contents_scale: f32,
        occlusion_in_layer_space: &Occlusion,
        store: &mut TileStore,
        client: &TilingClient<'_>,
    ) {
        // Occlusion changes can flip tiles between needing and not needing
        // raster without any rect moving.
        if occlusion_in_layer_space.has_occlusion()
            || self.current_occlusion_in_layer_space.has_occlusion()
        {
            self.all_tiles_done = false;
        }

        let content_to_screen_scale = ideal_contents_scale / self.contents_scale;
        let visible = self.enclosing_contents_rect_from_layer_rect(visible_rect_in_layer_space);
        let skewport = self.enclosing_contents_rect_from_layer_rect(skewport_in_layer_space);
        let soon_border = self.enclosing_contents_rect_from_layer_rect(soon_border_rect_in_layer_space);
        let eventually = self.enclosing_contents_rect_from_layer_rect(eventually_rect_in_layer_space);
        let eventually = self
            .tiling_data
            .expand_rect_ignoring_borders_to_tile_bounds(eventually);

        self.set_tile_priority_rects(
            content_to_screen_scale,
            visible,
            skewport,
            soon_border,
            eventually,
            occlusion_in_layer_space.clone(),
        );
        self.set_live_tiles_rect(eventually, store, client);
    }

    pub fn set_tile_priority_rects(
        &mut self,
        content_to_screen_scale: f32,
        visible: ContentRect,
        skewport: ContentRect,
        soon_border: ContentRect,
        eventually: ContentRect,
        occlusion_in_layer_space: Occlusion,
    ) {
        self.current_visible_rect = visible;
        self.current_skewport_rect = skewport;
        self.current_soon_border_rect = soon_border;
        self.current_eventually_rect = eventually;
        self.current_occlusion_in_layer_space = occlusion_in_layer_space;
        self.current_content_to_screen_scale = content_to_screen_scale;

        let tiling_rect = self.tiling_rect();
        self.has_visible_rect_tiles = tiling_rect.intersects_rect(&visible);
        self.has_skewport_rect_tiles = tiling_rect.intersects_rect(&skewport);
        self.has_soon_border_rect_tiles = tiling_rect.intersects_rect(&soon_border);
        self.has_eventually_rect_tiles = tiling_rect.intersects_rect(&eventually);

        let left = (visible.origin.x - skewport.origin.x).max(0);
        let top = (visible.origin.y - skewport.origin.y).max(0);
        let right = (skewport.right() - visible.right()).max(0);
        let bottom = (skewport.bottom() - visible.bottom()).max(0);
        let extent = left.max(top).max(right).max(bottom);
        self.max_skewport_extent_in_screen_space = content_to_screen_scale * extent as f32;
    }

    /// The pending tree's visible rect, as seen from this tiling.
    pub fn pending_visible_rect(&self, client: &TilingClient<'_>) -> ContentRect {
        match self.tree {
            WhichTree::Pending => self.current_visible_rect,
            WhichTree::Active => client
                .twin
                .map(|pending_twin| pending_twin.current_visible_rect)
                .unwrap_or_else(ContentRect::zero),
        }
    }

    pub fn is_tile_occluded_on_current_tree(&self, tile: &Tile) -> bool {
        if !self.current_occlusion_in_layer_space.has_occlusion() {
            return false;
        }
        // Tiles outside the visible rect have unknown occlusion.
        let tile_query_rect = tile.content_rect().intersect_rect(&self.current_visible_rect);
        if tile_query_rect.is_empty() {
            return false;
        }
        let layer_rect = if self.contents_scale != 1.0 {
            self.enclosing_layer_rect_from_contents_rect(tile_query_rect)
        } else {
            tile_query_rect.cast_unit()
        };
        self.current_occlusion_in_layer_space.is_occluded(&layer_rect)
    }

    pub fn is_tile_occluded(&self, tile: &Tile, client: &TilingClient<'_>) -> bool {
        if !self.is_tile_occluded_on_current_tree(tile) {
            return false;
        }
        if self.tree == WhichTree::Pending {
            return true;
        }
        // An active tile stays unoccluded while the pending tree still needs
        // it to be visible.
        let Some(pending_twin) = client.twin else {
            return true;
        };
        if !self.matches_tile_indices(pending_twin) {
            return false;
        }
        if pending_twin.tile_at(tile_index(tile)).is_some() {
            return true;
        }
        pending_twin.is_tile_occluded_on_current_tree(tile)
    }

    pub fn is_tile_required_for_activation(&self, tile: &Tile, client: &TilingClient<'_>) -> bool {
        match self.tree {
            WhichTree::Pending => self.is_tile_required_for_activation_on_pending_tree(
                tile,
                client.twin,
                client.requires_high_res_to_draw,
            ),
            WhichTree::Active => {
                let Some(pending_twin) = client.twin else {
                    return false;
                };
                if !self.matches_tile_indices(pending_twin)
                    || pending_twin.tile_at(tile_index(tile)).is_some()
                {
                    return false;
                }
                // The pending tree shares this tile; answer from its side.
                pending_twin.is_tile_required_for_activation_on_pending_tree(
                    tile,
                    Some(self),
                    client.requires_high_res_to_draw,
                )
            }
        }
    }

    fn is_tile_required_for_activation_on_pending_tree(
        &self,
        tile: &Tile,
        active_twin: Option<&PictureLayerTiling>,
        requires_high_res_to_draw: bool,
    ) -> bool {
        if !self.can_require_tiles_for_activation
            || self.resolution != TileResolution::HighResolution
        {
            return false;
        }
        if self.is_tile_occluded_on_current_tree(tile) {
            return false;
        }
        if !tile.content_rect().intersects_rect(&self.current_visible_rect) {
            return false;
        }
        if requires_high_res_to_draw {
            return true;
        }
        let Some(active_twin) = active_twin else {
            return true;
        };
        if !self.matches_tile_indices(active_twin)
            || active_twin.raster_source.size() != self.raster_source.size()
            || active_twin.current_visible_rect != self.current_visible_rect
        {
            return true;
        }
        // Otherwise only tiles the active tree already shows are needed.
        active_twin.tile_at(tile_index(tile)).is_some()
    }

    pub fn is_tile_required_for_draw(&self, tile: &Tile) -> bool {
        self.tree == WhichTree::Active
            && self.resolution == TileResolution::HighResolution
            && tile.content_rect().intersects_rect(&self.current_visible_rect)
            && !self.is_tile_occluded_on_current_tree(tile)
    }

    pub fn update_required_states_on_tile(&self, tile: &Tile, client: &TilingClient<'_>) {
        tile.set_required_for_activation(self.is_tile_required_for_activation(tile, client));
        tile.set_required_for_draw(self.is_tile_required_for_draw(tile));
    }

    pub fn compute_priority_rect_type_for_tile(
        &self,
        tile: &Tile,
        client: &TilingClient<'_>,
    ) -> PriorityRectType {
        let bounds = self
            .tiling_data
            .tile_bounds(tile.tiling_i_index(), tile.tiling_j_index());
        if self.current_visible_rect.intersects_rect(&bounds) {
            PriorityRectType::Visible
        } else if self.pending_visible_rect(client).intersects_rect(&bounds) {
            PriorityRectType::PendingVisible
        } else if self.current_skewport_rect.intersects_rect(&bounds) {
            PriorityRectType::Skewport
        } else if self.current_soon_border_rect.intersects_rect(&bounds) {
            PriorityRectType::SoonBorder
        } else {
            PriorityRectType::Eventually
        }
    }

    pub fn compute_priority_for_tile(
        &self,
        tile: &Tile,
        rect_type: PriorityRectType,
        client: &TilingClient<'_>,
    ) -> TilePriority {
        let mut priority_bin = if client.has_valid_tile_priorities {
            PriorityBin::Now
        } else {
            PriorityBin::Eventually
        };
        match rect_type {
            PriorityRectType::Visible | PriorityRectType::PendingVisible => {
                return TilePriority::new(self.resolution, priority_bin, 0.0);
            }
            PriorityRectType::Skewport | PriorityRectType::SoonBorder => {
                priority_bin = priority_bin.max(PriorityBin::Soon);
            }
            PriorityRectType::Eventually => priority_bin = PriorityBin::Eventually,
        }

        let bounds = self
            .tiling_data
            .tile_bounds(tile.tiling_i_index(), tile.tiling_j_index());
        let distance_to_visible = self.current_content_to_screen_scale
            * self.current_visible_rect.manhattan_internal_distance(&bounds) as f32;
        TilePriority::new(self.resolution, priority_bin, distance_to_visible)
    }

    pub fn make_prioritized_tile(
        &self,
        key: TileKey,
        rect_type: PriorityRectType,
        store: &TileStore,
        client: &TilingClient<'_>,
    ) -> PrioritizedTile {
        let tile = store.tile(key);
        self.update_required_states_on_tile(tile, client);
        let mut priority = self.compute_priority_for_tile(tile, rect_type, client);
        priority.required_for_activation = tile.required_for_activation();

        let distance = priority.distance_to_visible;
        let is_process_for_images_only = distance > self.min_preraster_distance
            && (distance > self.max_preraster_distance
                || distance > self.max_skewport_extent_in_screen_space * 0.5);

        PrioritizedTile {
            tile: key,
            tile_id: tile.id(),
            layer_id: self.layer_id,
            tree: self.tree,
            contents_scale: self.contents_scale,
            raster_source: self.raster_source.clone(),
            priority,
            is_occluded: self.is_tile_occluded(tile, client),
            required_for_draw: tile.required_for_draw(),
            is_process_for_images_only,
        }
    }

    /// Prioritizes the tile at `index` by the rect it falls in.
    pub fn prioritized_tile_at(
        &self,
        index: TileIndex,
        store: &TileStore,
        client: &TilingClient<'_>,
    ) -> Option<PrioritizedTile> {
        let key = self.tile_at(index)?;
        let rect_type = self.compute_priority_rect_type_for_tile(store.tile(key), client);
        Some(self.make_prioritized_tile(key, rect_type, store, client))
    }

    pub fn as_value(&self) -> serde_json::Value {
        json!({
            "layer_id": self.layer_id.0,
            "tree": format!("{:?}", self.tree),
            "contents_scale": self.contents_scale,
            "resolution": format!("{:?}", self.resolution),
            "num_tiles": self.tiles.len(),
            "tiling_size": [self.tiling_data.tiling_size().width, self.tiling_data.tiling_size().height],
            "tile_size": [self.tiling_data.max_texture_size().width, self.tiling_data.max_texture_size().height],
            "live_tiles_rect": rect_value(&self.live_tiles_rect),
            "visible_rect": rect_value(&self.current_visible_rect),
            "skewport_rect": rect_value(&self.current_skewport_rect),
            "soon_border_rect": rect_value(&self.current_soon_border_rect),
            "eventually_rect": rect_value(&self.current_eventually_rect),
            "all_tiles_done": self.all_tiles_done,
        })
    }
}

fn rect_value(rect: &ContentRect) -> serde_json::Value {
    json!([rect.origin.x, rect.origin.y, rect.size.width, rect.size.height])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{filled_raster_source, fixed_tile_settings};
    use raster_protocol::ContentId;
    use tiling_data::geometry::{LayerSize, rect};

    fn high_res_tiling(tree: WhichTree, scale: f32) -> PictureLayerTiling {
        let settings = fixed_tile_settings();
        let mut tiling = PictureLayerTiling::new(
            tree,
            LayerId(7),
            scale,
            filled_raster_source(LayerSize::new(1000, 1000)),
            &TileSizer::new(&settings),
            &settings,
        );
        tiling.set_resolution(TileResolution::HighResolution);
        tiling
    }

    #[test]
    fn tiling_rect_follows_contents_scale() {
        let tiling = high_res_tiling(WhichTree::Active, 2.0);
        assert_eq!(tiling.tiling_rect(), rect(0, 0, 2000, 2000));
        assert_eq!(tiling.num_tiles(), 0);
    }

    #[test]
    fn live_tiles_rect_creates_and_drops_tiles() {
        let mut store = TileStore::new();
        let mut tiling = high_res_tiling(WhichTree::Active, 1.0);
        let client = TilingClient::detached();

        tiling.set_live_tiles_rect(rect(0, 0, 1000, 1000), &mut store, &client);
        assert_eq!(tiling.num_tiles(), 16);
        let before: Vec<_> = tiling.tiles().collect();

        tiling.set_live_tiles_rect(rect(0, 0, 1000, 1000), &mut store, &client);
        let mut after: Vec<_> = tiling.tiles().collect();
        let mut before = before;
        before.sort_by_key(|(index, _)| (index.j, index.i));
        after.sort_by_key(|(index, _)| (index.j, index.i));
        assert_eq!(before, after);
        assert_eq!(store.released_count(), 0);

        tiling.set_live_tiles_rect(rect(0, 0, 300, 300), &mut store, &client);
        assert_eq!(tiling.num_tiles(), 4);
        assert_eq!(store.released_count(), 12);
        assert!(tiling.tile_at(TileIndex::new(1, 1)).is_some());
        assert!(tiling.tile_at(TileIndex::new(2, 0)).is_none());
    }

    #[test]
    fn non_ideal_tiling_never_grows() {
        let mut store = TileStore::new();
        let mut tiling = high_res_tiling(WhichTree::Active, 1.0);
        let client = TilingClient::detached();
        tiling.set_live_tiles_rect(rect(0, 0, 300, 300), &mut store, &client);
        tiling.set_resolution(TileResolution::NonIdealResolution);

        tiling.set_live_tiles_rect(rect(0, 0, 1000, 1000), &mut store, &client);
        assert_eq!(tiling.num_tiles(), 4);
    }

    #[test]
    fn invalidation_recreates_the_touched_tile_and_remembers_its_content() {
        let mut store = TileStore::new();
        let mut tiling = high_res_tiling(WhichTree::Active, 1.0);
        tiling.set_live_tiles_rect(rect(0, 0, 1000, 1000), &mut store, &TilingClient::detached());
        let old_key = tiling.tile_at(TileIndex::new(1, 0)).expect("live tile");
        let old_id = store.tile(old_key).id();
        let untouched = tiling.tile_at(TileIndex::new(0, 0));

        tiling.invalidate(&Region::from_rect(rect(300, 10, 20, 20)), &mut store);

        let new_key = tiling.tile_at(TileIndex::new(1, 0)).expect("recreated tile");
        assert_ne!(new_key, old_key);
        let tile = store.tile(new_key);
        assert_eq!(tile.invalidated_content_rect(), rect(300, 10, 20, 20));
        assert_eq!(tile.invalidated_id(), ContentId::from(old_id));
        assert_eq!(tiling.tile_at(TileIndex::new(0, 0)), untouched);
        assert_eq!(tiling.num_tiles(), 16);
        assert_eq!(store.take_released(), vec![old_key]);
    }

    #[test]
    fn invalidating_a_border_texel_recreates_both_tiles_sampling_it() {
        let mut store = TileStore::new();
        let mut tiling = high_res_tiling(WhichTree::Active, 1.0);
        tiling.set_live_tiles_rect(rect(0, 0, 1000, 1000), &mut store, &TilingClient::detached());
        let border_x = tiling.tiling_data().tile_bounds(0, 0).max_x();
        assert!(tiling.tiling_data().tile_bounds_with_border(0, 0).max_x() > border_x);
        let left = tiling.tile_at(TileIndex::new(0, 0)).expect("left tile");
        let right = tiling.tile_at(TileIndex::new(1, 0)).expect("right tile");
        let below = tiling.tile_at(TileIndex::new(0, 1));

        tiling.invalidate(&Region::from_rect(rect(border_x, 10, 1, 1)), &mut store);

        let new_left = tiling.tile_at(TileIndex::new(0, 0)).expect("recreated left tile");
        let new_right = tiling.tile_at(TileIndex::new(1, 0)).expect("recreated right tile");
        assert_ne!(new_left, left);
        assert_ne!(new_right, right);
        assert_eq!(store.tile(new_left).invalidated_content_rect(), rect(border_x, 10, 1, 1));
        assert_eq!(tiling.tile_at(TileIndex::new(0, 1)), below);
        assert_eq!(tiling.num_tiles(), 16);
    }

    #[test]
    fn pending_tiling_shares_unchanged_content_with_active_twin() {
        let mut store = TileStore::new();
        let mut active = high_res_tiling(WhichTree::Active, 1.0);
        active.set_live_tiles_rect(rect(0, 0, 1000, 1000), &mut store, &TilingClient::detached());

        let mut pending = high_res_tiling(WhichTree::Pending, 1.0);
        let invalidation = Region::from_rect(rect(300, 10, 20, 20));
        let client = TilingClient {
            twin: Some(&active),
            pending_invalidation: Some(&invalidation),
            ..TilingClient::default()
        };
        pending.set_live_tiles_rect(rect(0, 0, 1000, 1000), &mut store, &client);

        // Only the invalidated tile needs a pending copy.
        let created: Vec<_> = pending.tiles().map(|(index, _)| index).collect();
        assert_eq!(created, vec![TileIndex::new(1, 0)]);
        let key = pending.tile_at(TileIndex::new(1, 0)).expect("pending tile");
        let active_id = store.tile(active.tile_at(TileIndex::new(1, 0)).expect("active tile")).id();
        assert_eq!(store.tile(key).invalidated_id(), ContentId::from(active_id));
    }
}
