use std::collections::{HashMap, HashSet};
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use log::{debug, trace, warn};
use raster_buffer::{GpuInterface, RasterBufferProvider, RasterError, ResourcePool};
use raster_protocol::{
    ContentId, GlobalStateThatImpactsTilePriority, MemoryLimitPolicy, PriorityBin, RasterTaskId,
    TilePriority, TreePriority,
};
use serde_json::json;
use tiles::{EvictionTilePriorityQueue, LayerTrees, PrioritizedTile, RasterQueueType, TileKey};

use crate::settings::TileManagerSettings;
use crate::worker_pool::{RasterOutcome, RasterTask, RasterTaskCompletion, RasterWorkerPool};
use crate::{MemoryStats, TileManagerError, TileManagerNotification};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MemoryUsage {
    bytes: usize,
    resources: usize,
}

impl MemoryUsage {
    const fn new(bytes: usize, resources: usize) -> Self {
        Self { bytes, resources }
    }

    const fn exceeds(self, limit: MemoryUsage) -> bool {
        self.bytes > limit.bytes || self.resources > limit.resources
    }
}

impl Add for MemoryUsage {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.bytes + other.bytes, self.resources + other.resources)
    }
}

impl Sub for MemoryUsage {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(
            self.bytes.saturating_sub(other.bytes),
            self.resources.saturating_sub(other.resources),
        )
    }
}

fn tile_violates_memory_policy(policy: MemoryLimitPolicy, priority: &TilePriority) -> bool {
    match policy {
        MemoryLimitPolicy::AllowNothing => true,
        MemoryLimitPolicy::AllowAbsoluteMinimum => priority.priority_bin > PriorityBin::Now,
        MemoryLimitPolicy::AllowPrepaintOnly => priority.priority_bin > PriorityBin::Soon,
        MemoryLimitPolicy::AllowAnything => priority.distance_to_visible == f32::INFINITY,
    }
}

/// What one memory assignment pass decided, applied to the tiles once the
/// priority queues that borrow them are gone.
#[derive(Default)]
struct MemoryAssignment {
    tiles_to_raster: Vec<PrioritizedTile>,
    scheduled_priorities: Vec<(TileKey, u32)>,
    analyzed: Vec<TileKey>,
    solid_color: Vec<(TileKey, raster_protocol::Rgba8)>,
    evicted: Vec<TileKey>,
    had_enough_memory_for_now_tiles: bool,
    all_tiles_scheduled: bool,
}

/// Evicts tiles from `queue` until `usage + extra` fits in `limit`. With
/// `than`, only tiles of lower priority than it are evicted.
#[allow(clippy::too_many_arguments)]
fn evict_tiles_to_fit<'a>(
    trees: &'a LayerTrees,
    tree_priority: TreePriority,
    queue: &mut Option<EvictionTilePriorityQueue<'a>>,
    assignment: &mut MemoryAssignment,
    evicted: &mut HashSet<TileKey>,
    usage: &mut MemoryUsage,
    extra: MemoryUsage,
    limit: MemoryUsage,
    than: Option<&TilePriority>,
    format: raster_protocol::ResourceFormat,
) -> bool {
    let store = trees.tile_store();
    while (*usage + extra).exceeds(limit) {
        let queue = queue.get_or_insert_with(|| trees.build_eviction_queue(tree_priority));
        if queue.is_empty() {
            break;
        }
        let candidate = queue.top();
        if than.is_some_and(|priority| !priority.is_higher_priority_than(&candidate.priority)) {
            break;
        }
        let key = candidate.tile;
        queue.pop();
        let Some(tile) = store.get(key) else {
            continue;
        };
        if !tile.draw_info().has_resource() || !evicted.insert(key) {
            continue;
        }
        trace!("evicting tile {:?}", tile.id());
        *usage = *usage - MemoryUsage::new(format.memory_size_bytes(tile.desired_texture_size()), 1);
        assignment.evicted.push(key);
    }
    !(*usage + extra).exceeds(limit)
}

/// Keeps tile memory within budget and keeps raster work flowing for the
/// most important tiles of a [`LayerTrees`].
///
/// The trees are passed into every call rather than owned, so the host can
/// commit, activate and update priorities between passes.
pub struct TileManager {
    settings: TileManagerSettings,
    global_state: GlobalStateThatImpactsTilePriority,
    resource_pool: ResourcePool,
    provider: RasterBufferProvider,
    workers: RasterWorkerPool,
    completions: Receiver<RasterTaskCompletion>,
    outstanding_tasks: HashMap<RasterTaskId, TileKey>,
    next_task_id: u64,
    notifications: Vec<TileManagerNotification>,
    signaled_ready_to_activate: bool,
    signaled_ready_to_draw: bool,
    had_enough_memory_for_now_tiles: bool,
    all_tiles_that_need_to_be_rasterized_are_scheduled: bool,
    context_lost: bool,
}

impl std::fmt::Debug for TileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileManager")
            .field("settings", &self.settings)
            .field("global_state", &self.global_state)
            .field("outstanding_tasks", &self.outstanding_tasks.len())
            .field("context_lost", &self.context_lost)
            .finish_non_exhaustive()
    }
}

impl TileManager {
    pub fn new(settings: TileManagerSettings, gpu: Arc<dyn GpuInterface>) -> Result<Self, TileManagerError> {
        settings.validate()?;
        let (sender, completions) = unbounded();
        let workers = RasterWorkerPool::start(settings.num_raster_threads, sender)?;
        let provider = RasterBufferProvider::new(&settings.provider_settings(), Arc::clone(&gpu));
        Ok(Self {
            settings,
            global_state: GlobalStateThatImpactsTilePriority::default(),
            resource_pool: ResourcePool::new(gpu, 0, 0),
            provider,
            workers,
            completions,
            outstanding_tasks: HashMap::new(),
            next_task_id: 0,
            notifications: Vec::new(),
            signaled_ready_to_activate: false,
            signaled_ready_to_draw: false,
            had_enough_memory_for_now_tiles: true,
            all_tiles_that_need_to_be_rasterized_are_scheduled: true,
            context_lost: false,
        })
    }

    pub const fn settings(&self) -> &TileManagerSettings {
        &self.settings
    }

    pub const fn global_state(&self) -> &GlobalStateThatImpactsTilePriority {
        &self.global_state
    }

    pub const fn resource_pool(&self) -> &ResourcePool {
        &self.resource_pool
    }

    pub const fn raster_buffer_provider(&self) -> &RasterBufferProvider {
        &self.provider
    }

    pub fn num_scheduled_tasks(&self) -> usize {
        self.outstanding_tasks.len()
    }

    pub fn has_scheduled_tasks(&self) -> bool {
        !self.outstanding_tasks.is_empty()
    }

    pub const fn is_context_lost(&self) -> bool {
        self.context_lost
    }

    pub const fn all_tiles_that_need_to_be_rasterized_are_scheduled(&self) -> bool {
        self.all_tiles_that_need_to_be_rasterized_are_scheduled
    }

    /// Assigns memory under `state`, schedules raster for the tiles that got
    /// it and cancels work for tiles that lost it. Returns whether any raster
    /// work is now scheduled.
    ///
    /// When nothing needs raster the readiness notifications are queued
    /// before this returns.
    pub fn prepare_tiles(
        &mut self,
        trees: &mut LayerTrees,
        state: GlobalStateThatImpactsTilePriority,
    ) -> Result<bool, TileManagerError> {
        self.global_state = state;
        self.signaled_ready_to_activate = false;
        self.signaled_ready_to_draw = false;

        self.free_resources_for_released_tiles(trees)?;
        let completions: Vec<_> = self.completions.try_iter().collect();
        for completion in completions {
            self.on_raster_task_completed(trees, completion)?;
        }
        if self.context_lost {
            warn!("prepare tiles skipped, raster context is lost");
            return Err(TileManagerError::ContextLost);
        }

        let tiles_to_raster = self.assign_gpu_memory_to_tiles(trees)?;
        let scheduled = self.schedule_tasks(trees, &tiles_to_raster);
        debug!(
            "prepare tiles: {} tiles to raster, {} tasks outstanding",
            tiles_to_raster.len(),
            self.outstanding_tasks.len()
        );
        if self.outstanding_tasks.is_empty() {
            self.check_if_more_tiles_need_to_be_prepared(trees)?;
        }
        Ok(scheduled)
    }

    /// Applies every finished task without blocking. Returns whether any
    /// completion was handled.
    pub fn check_for_completed_tasks(&mut self, trees: &mut LayerTrees) -> Result<bool, TileManagerError> {
        let completions: Vec<_> = self.completions.try_iter().collect();
        self.process_completions(trees, completions)
    }

    /// Blocks until at least one outstanding task completes or `timeout`
    /// passes, then applies everything that has completed.
    pub fn wait_for_tasks(&mut self, trees: &mut LayerTrees, timeout: Duration) -> Result<bool, TileManagerError> {
        if self.outstanding_tasks.is_empty() {
            return Ok(false);
        }
        let first = match self.completions.recv_timeout(timeout) {
            Ok(completion) => completion,
            Err(RecvTimeoutError::Timeout) => return Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                panic!("raster workers dropped the completion channel")
            }
        };
        let completions: Vec<_> = std::iter::once(first).chain(self.completions.try_iter()).collect();
        self.process_completions(trees, completions)
    }

    fn process_completions(
        &mut self,
        trees: &mut LayerTrees,
        completions: Vec<RasterTaskCompletion>,
    ) -> Result<bool, TileManagerError> {
        if completions.is_empty() {
            return Ok(false);
        }
        for completion in completions {
            self.on_raster_task_completed(trees, completion)?;
        }
        if self.outstanding_tasks.is_empty() {
            self.did_finish_running_all_tile_tasks(trees)?;
        } else {
            self.check_pending_ready_signals(trees);
        }
        Ok(true)
    }

    pub fn take_notifications(&mut self) -> Vec<TileManagerNotification> {
        std::mem::take(&mut self.notifications)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            bytes_in_use: self.resource_pool.in_use_memory_usage_bytes(),
            resources_in_use: self.resource_pool.in_use_count(),
            total_bytes: self.resource_pool.memory_usage_bytes(),
            total_resources: self.resource_pool.resource_count(),
            had_enough_memory_to_schedule_tiles_needed_now: self.had_enough_memory_for_now_tiles,
        }
    }

    /// Limits for resources the pool keeps around unused.
    pub fn set_resource_usage_limits(&mut self, max_memory_usage_bytes: usize, max_resource_count: usize) {
        self.resource_pool
            .set_resource_usage_limits(max_memory_usage_bytes, max_resource_count);
    }

    pub fn reduce_resource_usage(&mut self) {
        self.resource_pool.reduce_resource_usage();
    }

    /// Whether every tile the pending tree needs for activation can draw.
    /// True when there is no pending tree.
    pub fn is_ready_to_activate(&self, trees: &LayerTrees) -> bool {
        self.all_required_tiles_ready(trees, RasterQueueType::RequiredForActivation)
    }

    pub fn is_ready_to_draw(&self, trees: &LayerTrees) -> bool {
        self.all_required_tiles_ready(trees, RasterQueueType::RequiredForDraw)
    }

    fn all_required_tiles_ready(&self, trees: &LayerTrees, queue_type: RasterQueueType) -> bool {
        let store = trees.tile_store();
        trees
            .build_raster_queue(self.global_state.tree_priority, queue_type)
            .all(|prioritized| {
                store
                    .get(prioritized.tile)
                    .is_some_and(|tile| tile.draw_info().is_ready_to_draw())
            })
    }

    fn free_resources_for_released_tiles(&mut self, trees: &mut LayerTrees) -> Result<(), TileManagerError> {
        let store = trees.tile_store_mut();
        let released = store.take_released();
        let count = released.len();
        for key in released {
            let Some(mut tile) = store.remove(key) else {
                continue;
            };
            if let Some(resource) = tile.draw_info_mut().take_resource() {
                self.resource_pool
                    .release_resource(resource, ContentId::from(tile.id()))?;
            }
        }
        if count > 0 {
            trace!("freed {count} released tiles");
        }
        Ok(())
    }

    fn assign_gpu_memory_to_tiles(&mut self, trees: &mut LayerTrees) -> Result<Vec<PrioritizedTile>, TileManagerError> {
        let state = self.global_state;
        self.resource_pool
            .set_resource_usage_limits(state.soft_memory_limit_in_bytes, state.num_resources_limit);
        let hard_limit = MemoryUsage::new(state.hard_memory_limit_in_bytes, state.num_resources_limit);
        let soft_limit = MemoryUsage::new(state.soft_memory_limit_in_bytes, state.num_resources_limit);
        let mut usage = MemoryUsage::new(
            self.resource_pool.in_use_memory_usage_bytes(),
            self.resource_pool.in_use_count(),
        );
        let format = self.provider.resource_format();
        let task_limit = self.settings.scheduled_raster_task_limit;

        let mut assignment = MemoryAssignment {
            had_enough_memory_for_now_tiles: true,
            all_tiles_scheduled: true,
            ..MemoryAssignment::default()
        };
        {
            let trees: &LayerTrees = trees;
            let store = trees.tile_store();
            let mut eviction_queue = None;
            let mut evicted = HashSet::new();
            let mut schedule_priority = 1u32;

            for prioritized in trees.build_raster_queue(state.tree_priority, RasterQueueType::All) {
                let priority = prioritized.priority;
                if tile_violates_memory_policy(state.memory_limit_policy, &priority) {
                    assignment.all_tiles_scheduled = false;
                    break;
                }
                if assignment.tiles_to_raster.len() >= task_limit {
                    assignment.all_tiles_scheduled = false;
                    break;
                }
                let Some(tile) = store.get(prioritized.tile) else {
                    continue;
                };
                assignment.scheduled_priorities.push((prioritized.tile, schedule_priority));
                schedule_priority += 1;

                if prioritized.is_process_for_images_only || !tile.draw_info().needs_raster() {
                    continue;
                }
                if !tile.solid_color_analysis_performed() {
                    assignment.analyzed.push(prioritized.tile);
                    let color = prioritized
                        .raster_source
                        .perform_solid_color_analysis(tile.content_rect(), tile.contents_scale());
                    if let Some(color) = color {
                        assignment.solid_color.push((prioritized.tile, color));
                        continue;
                    }
                }
                if tile.raster_task().is_some() {
                    assignment.tiles_to_raster.push(prioritized);
                    continue;
                }

                let tile_usage = MemoryUsage::new(format.memory_size_bytes(tile.desired_texture_size()), 1);
                let limit = if priority.priority_bin == PriorityBin::Now {
                    hard_limit
                } else {
                    soft_limit
                };
                let fits = evict_tiles_to_fit(
                    trees,
                    state.tree_priority,
                    &mut eviction_queue,
                    &mut assignment,
                    &mut evicted,
                    &mut usage,
                    tile_usage,
                    limit,
                    Some(&priority),
                    format,
                );
                if !fits {
                    if priority.priority_bin == PriorityBin::Now {
                        assignment.had_enough_memory_for_now_tiles = false;
                    }
                    assignment.all_tiles_scheduled = false;
                    break;
                }
                usage = usage + tile_usage;
                assignment.tiles_to_raster.push(prioritized);
            }

            evict_tiles_to_fit(
                trees,
                state.tree_priority,
                &mut eviction_queue,
                &mut assignment,
                &mut evicted,
                &mut usage,
                MemoryUsage::default(),
                hard_limit,
                None,
                format,
            );
        }

        let store = trees.tile_store_mut();
        for &(key, priority) in &assignment.scheduled_priorities {
            if let Some(tile) = store.get_mut(key) {
                tile.set_scheduled_priority(priority);
            }
        }
        for &key in &assignment.analyzed {
            if let Some(tile) = store.get_mut(key) {
                tile.set_solid_color_analysis_performed(true);
            }
        }
        for &(key, color) in &assignment.solid_color {
            if let Some(tile) = store.get_mut(key) {
                tile.draw_info_mut().set_solid_color(color);
                self.notifications
                    .push(TileManagerNotification::TileStateChanged(tile.id()));
            }
        }
        for &key in &assignment.evicted {
            let Some(tile) = store.get_mut(key) else {
                continue;
            };
            if let Some(resource) = tile.draw_info_mut().take_resource() {
                self.resource_pool
                    .release_resource(resource, ContentId::from(tile.id()))?;
                self.notifications
                    .push(TileManagerNotification::TileStateChanged(tile.id()));
            }
        }

        if !assignment.had_enough_memory_for_now_tiles {
            warn!(
                "not enough memory for tiles needed now: {} bytes in use, hard limit {}",
                usage.bytes, state.hard_memory_limit_in_bytes
            );
        }
        if !assignment.evicted.is_empty() {
            debug!("evicted {} tiles", assignment.evicted.len());
        }
        self.had_enough_memory_for_now_tiles = assignment.had_enough_memory_for_now_tiles;
        self.all_tiles_that_need_to_be_rasterized_are_scheduled = assignment.all_tiles_scheduled;
        Ok(assignment.tiles_to_raster)
    }

    /// Replaces the worker pool's pending work with raster for
    /// `tiles_to_raster`, keeping tasks that already exist.
    fn schedule_tasks(&mut self, trees: &mut LayerTrees, tiles_to_raster: &[PrioritizedTile]) -> bool {
        self.provider.ordering_barrier();
        let mut new_tasks = Vec::new();
        let mut retained = HashMap::new();
        for prioritized in tiles_to_raster {
            let Some(tile) = trees.tile_store().get(prioritized.tile) else {
                continue;
            };
            let priority = tile.scheduled_priority();
            if let Some(task_id) = tile.raster_task() {
                retained.insert(task_id, priority);
                continue;
            }
            let task = self.create_raster_task(trees, prioritized, priority);
            if let Some(tile) = trees.tile_store_mut().get_mut(prioritized.tile) {
                tile.set_raster_task(Some(task.id));
            }
            self.outstanding_tasks.insert(task.id, prioritized.tile);
            new_tasks.push(task);
        }
        let scheduled = !new_tasks.is_empty() || !retained.is_empty();
        debug!(
            "scheduling {} new raster tasks, retaining {}",
            new_tasks.len(),
            retained.len()
        );
        self.workers.schedule(new_tasks, &retained);
        scheduled
    }

    fn create_raster_task(&mut self, trees: &LayerTrees, prioritized: &PrioritizedTile, priority: u32) -> RasterTask {
        let tile = trees
            .tile_store()
            .get(prioritized.tile)
            .unwrap_or_else(|| panic!("raster task for missing tile {:?}", prioritized.tile_id));
        let invalidated_id = tile.invalidated_id();
        let size = tile.desired_texture_size();
        let format = self.provider.resource_format();

        let mut partial = None;
        if self.settings.use_partial_raster
            && self.provider.can_partial_raster_into_provided_resource()
            && invalidated_id.is_valid()
        {
            if let Some(resource) = self.resource_pool.try_acquire_resource_with_content_id(invalidated_id) {
                if resource.size == size && resource.format == format {
                    partial = Some(resource);
                } else if let Err(error) = self.resource_pool.release_resource(resource.id, invalidated_id) {
                    warn!("could not return mismatched resource: {error}");
                }
            }
        }
        let (resource, resource_content_id) = match partial {
            Some(resource) => (resource, invalidated_id),
            None => (self.resource_pool.acquire_resource(size, format), ContentId::INVALID),
        };
        let buffer = self
            .provider
            .acquire_buffer_for_raster(&resource, resource_content_id, invalidated_id);

        self.next_task_id += 1;
        let id = RasterTaskId(self.next_task_id);
        trace!(
            "raster task {id:?} for tile {:?}, partial: {}",
            tile.id(),
            resource_content_id.is_valid()
        );
        RasterTask {
            id,
            tile: prioritized.tile,
            tile_id: tile.id(),
            priority,
            buffer,
            raster_source: Arc::clone(&prioritized.raster_source),
            raster_full_rect: tile.content_rect(),
            raster_dirty_rect: tile.invalidated_content_rect(),
            new_content_id: ContentId::from(tile.id()),
            contents_scale: tile.contents_scale(),
            playback_settings: Default::default(),
        }
    }

    fn on_raster_task_completed(
        &mut self,
        trees: &mut LayerTrees,
        completion: RasterTaskCompletion,
    ) -> Result<(), TileManagerError> {
        let RasterTaskCompletion {
            id,
            tile: key,
            tile_id,
            buffer,
            outcome,
        } = completion;
        self.outstanding_tasks.remove(&id);
        let resource = self.provider.release_buffer_for_raster(buffer);
        let tile = trees
            .tile_store_mut()
            .get_mut(key)
            .filter(|tile| tile.raster_task() == Some(id));

        match outcome {
            RasterOutcome::Canceled => {
                if let Some(tile) = tile {
                    tile.set_raster_task(None);
                }
                self.resource_pool.release_resource(resource.id, ContentId::INVALID)?;
            }
            RasterOutcome::Finished | RasterOutcome::Failed(RasterError::ContextLost) => {
                if outcome != RasterOutcome::Finished && !self.context_lost {
                    warn!("raster context lost while rastering tile {tile_id:?}");
                    self.context_lost = true;
                }
                match tile {
                    Some(tile) => {
                        tile.set_raster_task(None);
                        tile.draw_info_mut().set_resource(resource.id);
                        trace!("tile {tile_id:?} is ready to draw");
                        self.notifications
                            .push(TileManagerNotification::TileStateChanged(tile_id));
                    }
                    None => self
                        .resource_pool
                        .release_resource(resource.id, ContentId::from(tile_id))?,
                }
            }
        }
        Ok(())
    }

    fn did_finish_running_all_tile_tasks(&mut self, trees: &mut LayerTrees) -> Result<(), TileManagerError> {
        if self.context_lost {
            self.notifications
                .push(TileManagerNotification::AllTileTasksCompleted);
            return Ok(());
        }
        self.check_if_more_tiles_need_to_be_prepared(trees)
    }

    /// Runs when no raster work is outstanding. Either schedules tiles that
    /// still need raster or, when memory allows nothing more, marks required
    /// tiles out of memory so activation and draw are not blocked forever.
    fn check_if_more_tiles_need_to_be_prepared(&mut self, trees: &mut LayerTrees) -> Result<(), TileManagerError> {
        let tiles_to_raster = self.assign_gpu_memory_to_tiles(trees)?;
        if !tiles_to_raster.is_empty() {
            self.schedule_tasks(trees, &tiles_to_raster);
            return Ok(());
        }

        self.resource_pool.reduce_resource_usage();
        let state = self.global_state;
        if state.tree_priority != TreePriority::SmoothnessTakesPriority
            && state.memory_limit_policy != MemoryLimitPolicy::AllowNothing
        {
            self.mark_required_tiles_out_of_memory(trees, RasterQueueType::RequiredForActivation);
            self.mark_required_tiles_out_of_memory(trees, RasterQueueType::RequiredForDraw);
        }
        self.check_pending_ready_signals(trees);
        self.notifications
            .push(TileManagerNotification::AllTileTasksCompleted);
        Ok(())
    }

    fn mark_required_tiles_out_of_memory(&mut self, trees: &mut LayerTrees, queue_type: RasterQueueType) {
        let keys: Vec<TileKey> = trees
            .build_raster_queue(self.global_state.tree_priority, queue_type)
            .map(|prioritized| prioritized.tile)
            .collect();
        let store = trees.tile_store_mut();
        let mut marked = 0usize;
        for key in keys {
            let Some(tile) = store.get_mut(key) else {
                continue;
            };
            if tile.draw_info().is_ready_to_draw() {
                continue;
            }
            tile.draw_info_mut().set_oom();
            marked += 1;
            self.notifications
                .push(TileManagerNotification::TileStateChanged(tile.id()));
        }
        if marked > 0 {
            warn!("{marked} required tiles marked out of memory ({queue_type:?})");
        }
    }

    fn check_pending_ready_signals(&mut self, trees: &LayerTrees) {
        if !self.signaled_ready_to_activate && trees.has_pending_tree() && self.is_ready_to_activate(trees) {
            self.signaled_ready_to_activate = true;
            self.notifications
                .push(TileManagerNotification::ReadyToActivate);
        }
        if !self.signaled_ready_to_draw && self.is_ready_to_draw(trees) {
            self.signaled_ready_to_draw = true;
            self.notifications.push(TileManagerNotification::ReadyToDraw);
        }
    }

    /// Rebuilds the pool and raster provider on a new context after loss.
    ///
    /// Waits for running tasks, drops every tile resource and deletes every
    /// texture of the old context. Tiles then need raster again.
    pub fn recreate_context(
        &mut self,
        trees: &mut LayerTrees,
        gpu: Arc<dyn GpuInterface>,
    ) -> Result<(), TileManagerError> {
        self.workers.schedule(Vec::new(), &HashMap::new());
        while !self.outstanding_tasks.is_empty() {
            let completion = self
                .completions
                .recv()
                .unwrap_or_else(|_| panic!("raster workers dropped the completion channel"));
            self.on_raster_task_completed(trees, completion)?;
        }

        let store = trees.tile_store_mut();
        let keys: Vec<TileKey> = store
            .iter()
            .filter(|(_, tile)| tile.draw_info().has_resource())
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            let Some(tile) = store.get_mut(key) else {
                continue;
            };
            if let Some(resource) = tile.draw_info_mut().take_resource() {
                self.resource_pool.release_resource(resource, ContentId::INVALID)?;
                self.notifications
                    .push(TileManagerNotification::TileStateChanged(tile.id()));
            }
        }
        self.resource_pool.set_resource_usage_limits(0, 0);
        self.provider.shutdown();

        let state = self.global_state;
        self.resource_pool = ResourcePool::new(
            Arc::clone(&gpu),
            state.soft_memory_limit_in_bytes,
            state.num_resources_limit,
        );
        self.provider = RasterBufferProvider::new(&self.settings.provider_settings(), gpu);
        self.context_lost = false;
        debug!("raster context recreated");
        Ok(())
    }

    pub fn as_value(&self) -> serde_json::Value {
        json!({
            "memory": self.memory_stats(),
            "global_state": self.global_state,
            "scheduled_tasks": self.outstanding_tasks.len(),
            "pending_tasks": self.workers.pending_count(),
            "running_tasks": self.workers.running_count(),
            "all_tiles_scheduled": self.all_tiles_that_need_to_be_rasterized_are_scheduled,
            "context_lost": self.context_lost,
            "resource_pool": self.resource_pool.as_value(),
            "raster_buffer_provider": self.provider.as_value(),
        })
    }
}

impl Drop for TileManager {
    fn drop(&mut self) {
        self.workers.schedule(Vec::new(), &HashMap::new());
        while !self.outstanding_tasks.is_empty() {
            let Ok(completion) = self.completions.recv() else {
                break;
            };
            self.outstanding_tasks.remove(&completion.id);
            let resource = self.provider.release_buffer_for_raster(completion.buffer);
            if let Err(error) = self.resource_pool.release_resource(resource.id, ContentId::INVALID) {
                warn!("dropping tile manager: {error}");
            }
        }
        self.provider.shutdown();
    }
}
