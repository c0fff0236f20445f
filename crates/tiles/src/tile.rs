use std::cell::Cell;

use raster_protocol::{ContentId, LayerId, RasterTaskId, ResourceId, Rgba8, TileId};
use serde_json::json;
use slotmap::SlotMap;
use tiling_data::geometry::{ContentRect, ContentSize, LayerRect};

slotmap::new_key_type! {
    /// Handle of a [`Tile`] inside a [`TileStore`].
    pub struct TileKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    Resource(Option<ResourceId>),
    SolidColor(Rgba8),
    OutOfMemory,
}

/// What the compositor can draw for a tile right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDrawInfo {
    mode: DrawMode,
    was_ever_ready_to_draw: bool,
}

impl Default for TileDrawInfo {
    fn default() -> Self {
        Self {
            mode: DrawMode::Resource(None),
            was_ever_ready_to_draw: false,
        }
    }
}

impl TileDrawInfo {
    pub const fn mode(&self) -> DrawMode {
        self.mode
    }

    pub const fn is_ready_to_draw(&self) -> bool {
        match self.mode {
            DrawMode::Resource(resource) => resource.is_some(),
            DrawMode::SolidColor(_) | DrawMode::OutOfMemory => true,
        }
    }

    /// OOM tiles still want raster; they only count as ready so activation
    /// is not blocked on memory.
    pub const fn needs_raster(&self) -> bool {
        matches!(self.mode, DrawMode::Resource(None) | DrawMode::OutOfMemory)
    }

    pub const fn has_resource(&self) -> bool {
        matches!(self.mode, DrawMode::Resource(Some(_)))
    }

    pub const fn resource(&self) -> Option<ResourceId> {
        match self.mode {
            DrawMode::Resource(resource) => resource,
            _ => None,
        }
    }

    pub const fn solid_color(&self) -> Option<Rgba8> {
        match self.mode {
            DrawMode::SolidColor(color) => Some(color),
            _ => None,
        }
    }

    pub const fn was_ever_ready_to_draw(&self) -> bool {
        self.was_ever_ready_to_draw
    }

    pub fn set_resource(&mut self, resource: ResourceId) {
        self.mode = DrawMode::Resource(Some(resource));
        self.was_ever_ready_to_draw = true;
    }

    pub fn set_solid_color(&mut self, color: Rgba8) {
        self.mode = DrawMode::SolidColor(color);
        self.was_ever_ready_to_draw = true;
    }

    pub fn set_oom(&mut self) {
        self.mode = DrawMode::OutOfMemory;
    }

    /// Drops whatever is drawable and returns the resource, if any.
    pub fn take_resource(&mut self) -> Option<ResourceId> {
        let resource = self.resource();
        self.mode = DrawMode::Resource(None);
        resource
    }

    fn mode_name(&self) -> &'static str {
        match self.mode {
            DrawMode::Resource(_) => "resource",
            DrawMode::SolidColor(_) => "solid_color",
            DrawMode::OutOfMemory => "oom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileCreateInfo {
    pub tiling_i_index: i32,
    pub tiling_j_index: i32,
    pub enclosing_layer_rect: LayerRect,
    pub content_rect: ContentRect,
    pub contents_scale: f32,
}

#[derive(Debug)]
pub struct Tile {
    id: TileId,
    layer_id: LayerId,
    tiling_i_index: i32,
    tiling_j_index: i32,
    content_rect: ContentRect,
    enclosing_layer_rect: LayerRect,
    contents_scale: f32,
    draw_info: TileDrawInfo,
    invalidated_content_rect: ContentRect,
    invalidated_id: ContentId,
    scheduled_priority: u32,
    raster_task: Option<RasterTaskId>,
    solid_color_analysis_performed: bool,
    required_for_activation: Cell<bool>,
    required_for_draw: Cell<bool>,
}

impl Tile {
    fn new(id: TileId, layer_id: LayerId, info: &TileCreateInfo) -> Self {
        Self {
            id,
            layer_id,
            tiling_i_index: info.tiling_i_index,
            tiling_j_index: info.tiling_j_index,
            content_rect: info.content_rect,
            enclosing_layer_rect: info.enclosing_layer_rect,
            contents_scale: info.contents_scale,
            draw_info: TileDrawInfo::default(),
            invalidated_content_rect: ContentRect::zero(),
            invalidated_id: ContentId::INVALID,
            scheduled_priority: 0,
            raster_task: None,
            solid_color_analysis_performed: false,
            required_for_activation: Cell::new(false),
            required_for_draw: Cell::new(false),
        }
    }

    pub const fn id(&self) -> TileId {
        self.id
    }

    pub const fn layer_id(&self) -> LayerId {
        self.layer_id
    }

    pub const fn tiling_i_index(&self) -> i32 {
        self.tiling_i_index
    }

    pub const fn tiling_j_index(&self) -> i32 {
        self.tiling_j_index
    }

    pub const fn content_rect(&self) -> ContentRect {
        self.content_rect
    }

    pub const fn enclosing_layer_rect(&self) -> LayerRect {
        self.enclosing_layer_rect
    }

    pub const fn contents_scale(&self) -> f32 {
        self.contents_scale
    }

    pub const fn desired_texture_size(&self) -> ContentSize {
        self.content_rect.size
    }

    pub const fn draw_info(&self) -> &TileDrawInfo {
        &self.draw_info
    }

    pub fn draw_info_mut(&mut self) -> &mut TileDrawInfo {
        &mut self.draw_info
    }

    pub const fn invalidated_content_rect(&self) -> ContentRect {
        self.invalidated_content_rect
    }

    /// Content id of the tile this one replaced, when only part of it was
    /// invalidated.
    pub const fn invalidated_id(&self) -> ContentId {
        self.invalidated_id
    }

    pub(crate) fn set_invalidated(&mut self, rect: ContentRect, previous: TileId) {
        self.invalidated_content_rect = rect;
        self.invalidated_id = ContentId::from(previous);
    }

    pub const fn scheduled_priority(&self) -> u32 {
        self.scheduled_priority
    }

    pub fn set_scheduled_priority(&mut self, priority: u32) {
        self.scheduled_priority = priority;
    }

    pub const fn raster_task(&self) -> Option<RasterTaskId> {
        self.raster_task
    }

    pub fn set_raster_task(&mut self, task: Option<RasterTaskId>) {
        self.raster_task = task;
    }

    pub const fn solid_color_analysis_performed(&self) -> bool {
        self.solid_color_analysis_performed
    }

    pub fn set_solid_color_analysis_performed(&mut self, performed: bool) {
        self.solid_color_analysis_performed = performed;
    }

    pub fn required_for_activation(&self) -> bool {
        self.required_for_activation.get()
    }

    pub fn required_for_draw(&self) -> bool {
        self.required_for_draw.get()
    }

    pub(crate) fn set_required_for_activation(&self, required: bool) {
        self.required_for_activation.set(required);
    }

    pub(crate) fn set_required_for_draw(&self, required: bool) {
        self.required_for_draw.set(required);
    }

    pub fn as_value(&self) -> serde_json::Value {
        let rect = self.content_rect;
        json!({
            "id": self.id.0,
            "layer_id": self.layer_id.0,
            "index": [self.tiling_i_index, self.tiling_j_index],
            "content_rect": [rect.origin.x, rect.origin.y, rect.size.width, rect.size.height],
            "contents_scale": self.contents_scale,
            "draw_mode": self.draw_info.mode_name(),
            "has_resource": self.draw_info.has_resource(),
            "invalidated_id": self.invalidated_id.0,
            "scheduled_priority": self.scheduled_priority,
            "has_raster_task": self.raster_task.is_some(),
            "required_for_activation": self.required_for_activation(),
            "required_for_draw": self.required_for_draw(),
        })
    }
}

/// Owner of every tile in both trees.
///
/// Tilings refer to tiles by [`TileKey`]. A tile dropped by its tiling moves
/// to the released list and stays in the store until the tile manager has
/// returned its resource and no raster task references it.
#[derive(Debug, Default)]
pub struct TileStore {
    tiles: SlotMap<TileKey, Tile>,
    released: Vec<TileKey>,
    next_tile_id: u64,
}

impl TileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create_tile(&mut self, layer_id: LayerId, info: &TileCreateInfo) -> TileKey {
        // Ids start at 1 so that no tile id equals the invalid content id.
        self.next_tile_id += 1;
        let id = TileId(self.next_tile_id);
        self.tiles.insert(Tile::new(id, layer_id, info))
    }

    pub fn get(&self, key: TileKey) -> Option<&Tile> {
        self.tiles.get(key)
    }

    pub fn get_mut(&mut self, key: TileKey) -> Option<&mut Tile> {
        self.tiles.get_mut(key)
    }

    pub(crate) fn tile(&self, key: TileKey) -> &Tile {
        self.tiles
            .get(key)
            .unwrap_or_else(|| panic!("tiling references tile {key:?} missing from the store"))
    }

    pub(crate) fn tile_mut(&mut self, key: TileKey) -> &mut Tile {
        self.tiles
            .get_mut(key)
            .unwrap_or_else(|| panic!("tiling references tile {key:?} missing from the store"))
    }

    pub(crate) fn release(&mut self, key: TileKey) {
        self.released.push(key);
    }

    pub fn take_released(&mut self) -> Vec<TileKey> {
        std::mem::take(&mut self.released)
    }

    pub fn released_count(&self) -> usize {
        self.released.len()
    }

    pub fn remove(&mut self, key: TileKey) -> Option<Tile> {
        self.tiles.remove(key)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TileKey, &Tile)> {
        self.tiles.iter()
    }
}
