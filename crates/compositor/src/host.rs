use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use euclid::Scale;
use frame_scheduler::{
    BeginFrameArgs, CommitEarlyOutReason, DrawResult, SchedulerClient, SchedulerHandle, SchedulerMessage,
};
use log::{debug, error, info, trace, warn};
use raster_buffer::{GpuInterface, RecordingGpu};
use raster_protocol::{LayerId, TileResolution, TreePriority};
use serde::Serialize;
use serde_json::json;
use tile_manager::{TileManager, TileManagerError, TileManagerNotification};
use tiles::{CoverageIterator, DrawMode, LayerTrees, LayerUpdate};
use tiling_data::geometry::{LayerRect, LayerSpace, ScreenRect, ScreenSpace, scale_to_enclosing_rect};

use crate::settings::LayerTreeSettings;

/// Layer changes the main thread produced for one commit.
#[derive(Debug, Clone, Default)]
pub struct CommitPayload {
    pub layers: Vec<LayerUpdate>,
}

impl CommitPayload {
    /// Folds a later payload into this one. A layer updated by both keeps
    /// the later update with both invalidations.
    pub fn merge(&mut self, newer: CommitPayload) {
        for mut update in newer.layers {
            match self.layers.iter_mut().find(|layer| layer.layer_id == update.layer_id) {
                Some(existing) => {
                    update.invalidation.union(&existing.invalidation);
                    *existing = update;
                }
                None => self.layers.push(update),
            }
        }
    }
}

/// The main thread's side of the host: queues commits and asks for the
/// frames that pick them up.
#[derive(Debug, Clone)]
pub struct CommitSender {
    commits: Sender<CommitPayload>,
    scheduler: SchedulerHandle,
}

impl CommitSender {
    pub fn submit(&self, payload: CommitPayload) {
        if self.commits.send(payload).is_err() {
            debug!("compositor gone, dropping commit");
            return;
        }
        self.scheduler.send(SchedulerMessage::SetNeedsBeginMainFrame);
    }
}

/// What one draw put on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub frame_number: u64,
    pub quads: usize,
    pub resource_quads: usize,
    pub solid_color_quads: usize,
    pub oom_quads: usize,
    pub checkerboard_quads: usize,
    pub ready_to_draw: bool,
    pub forced: bool,
    pub aborted: bool,
}

/// Compositor-thread owner of the layer trees and the tile manager, driven
/// by the scheduler.
pub struct LayerTreeHostImpl {
    settings: LayerTreeSettings,
    trees: LayerTrees,
    tile_manager: TileManager,
    gpu: Arc<RecordingGpu>,
    context_id: u64,
    scheduler: SchedulerHandle,
    commits: Receiver<CommitPayload>,
    pending_commit: Option<CommitPayload>,

    timebase: Instant,
    frame_time: Instant,
    tile_priorities_dirty: bool,
    visible: bool,
    scroll_in_progress: bool,
    tree_priority: TreePriority,

    last_frame: Option<FrameStats>,
    frames_drawn: u64,
    frames_aborted: u64,
}

impl std::fmt::Debug for LayerTreeHostImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerTreeHostImpl")
            .field("context_id", &self.context_id)
            .field("visible", &self.visible)
            .field("frames_drawn", &self.frames_drawn)
            .finish_non_exhaustive()
    }
}

impl LayerTreeHostImpl {
    pub fn new(
        settings: LayerTreeSettings,
        scheduler: SchedulerHandle,
    ) -> Result<(Self, CommitSender), TileManagerError> {
        let context_id = 1;
        let gpu = Arc::new(RecordingGpu::new(context_id));
        let tile_manager = TileManager::new(settings.tile_manager, gpu.clone() as Arc<dyn GpuInterface>)?;
        let (commit_sender, commits) = unbounded();
        let now = Instant::now();
        let host = Self {
            settings,
            trees: LayerTrees::new(settings.tiling),
            tile_manager,
            gpu,
            context_id,
            scheduler: scheduler.clone(),
            commits,
            pending_commit: None,
            timebase: now,
            frame_time: now,
            tile_priorities_dirty: false,
            visible: false,
            scroll_in_progress: false,
            tree_priority: TreePriority::SamePriorityForBothTrees,
            last_frame: None,
            frames_drawn: 0,
            frames_aborted: 0,
        };
        Ok((
            host,
            CommitSender {
                commits: commit_sender,
                scheduler,
            },
        ))
    }

    pub const fn settings(&self) -> &LayerTreeSettings {
        &self.settings
    }

    pub const fn trees(&self) -> &LayerTrees {
        &self.trees
    }

    pub const fn tile_manager(&self) -> &TileManager {
        &self.tile_manager
    }

    /// The context the current output surface renders with.
    pub const fn gpu(&self) -> &Arc<RecordingGpu> {
        &self.gpu
    }

    pub const fn context_id(&self) -> u64 {
        self.context_id
    }

    pub const fn last_frame(&self) -> Option<&FrameStats> {
        self.last_frame.as_ref()
    }

    pub const fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        self.scheduler.send(SchedulerMessage::SetVisible(visible));
        self.set_needs_prepare_tiles();
    }

    /// Moves the visible rect of a layer on both trees, as an impl-side
    /// scroll does.
    pub fn scroll_layer_to(&mut self, layer_id: LayerId, visible_layer_rect: LayerRect) {
        self.trees.set_layer_visible_rect(layer_id, visible_layer_rect);
        self.scheduler.send(SchedulerMessage::SetNeedsRedraw);
        self.set_needs_prepare_tiles();
    }

    /// While a scroll animates, checkerboarded draws are aborted and raster
    /// favours the active tree.
    pub fn set_scroll_in_progress(&mut self, in_progress: bool) {
        self.scroll_in_progress = in_progress;
        self.set_tree_priority(if in_progress {
            TreePriority::SmoothnessTakesPriority
        } else {
            TreePriority::SamePriorityForBothTrees
        });
    }

    pub fn set_tree_priority(&mut self, tree_priority: TreePriority) {
        if tree_priority == self.tree_priority {
            return;
        }
        self.tree_priority = tree_priority;
        self.trees.set_tree_priority(tree_priority);
        self.scheduler.send(SchedulerMessage::SetTreePriority(tree_priority));
        self.set_needs_prepare_tiles();
    }

    pub fn set_requires_high_res_to_draw(&mut self, required: bool) {
        self.trees.set_requires_high_res_to_draw(required);
        self.set_needs_prepare_tiles();
    }

    fn set_needs_prepare_tiles(&mut self) {
        self.tile_priorities_dirty = true;
        self.scheduler.send(SchedulerMessage::SetNeedsPrepareTiles);
    }

    fn frame_time_in_seconds(&self) -> f64 {
        self.frame_time.saturating_duration_since(self.timebase).as_secs_f64()
    }

    /// Applies finished raster work without blocking. Returns whether any
    /// task completed.
    pub fn poll_completed_tasks(&mut self) -> bool {
        let result = self.tile_manager.check_for_completed_tasks(&mut self.trees);
        self.handle_tile_manager_result(result).unwrap_or(false)
    }

    /// Blocks up to `timeout` for raster work to finish. Returns false right
    /// away when nothing is scheduled.
    pub fn wait_for_tile_tasks(&mut self, timeout: Duration) -> bool {
        if !self.tile_manager.has_scheduled_tasks() {
            return false;
        }
        let result = self.tile_manager.wait_for_tasks(&mut self.trees, timeout);
        self.handle_tile_manager_result(result).unwrap_or(false)
    }

    fn handle_tile_manager_result<T>(&mut self, result: Result<T, TileManagerError>) -> Option<T> {
        let value = match result {
            Ok(value) => Some(value),
            Err(TileManagerError::ContextLost) => {
                warn!("raster context lost on context {}", self.context_id);
                self.scheduler.send(SchedulerMessage::DidLoseOutputSurface);
                None
            }
            Err(error) => {
                error!("tile manager failed: {error}");
                None
            }
        };
        self.forward_tile_manager_notifications();
        value
    }

    fn forward_tile_manager_notifications(&mut self) {
        let mut tiles_changed = 0;
        for notification in self.tile_manager.take_notifications() {
            match notification {
                TileManagerNotification::ReadyToActivate => {
                    self.scheduler.send(SchedulerMessage::NotifyReadyToActivate)
                }
                TileManagerNotification::ReadyToDraw => self.scheduler.send(SchedulerMessage::NotifyReadyToDraw),
                TileManagerNotification::AllTileTasksCompleted => trace!("all tile tasks completed"),
                TileManagerNotification::TileStateChanged(_) => tiles_changed += 1,
            }
        }
        if tiles_changed > 0 {
            trace!("{tiles_changed} tiles changed, redrawing");
            self.scheduler.send(SchedulerMessage::SetNeedsRedraw);
        }
    }

    fn context_lost(&self) -> bool {
        self.gpu.is_context_lost() || self.tile_manager.is_context_lost()
    }

    fn prepare_tiles(&mut self) {
        if self.context_lost() {
            self.scheduler.send(SchedulerMessage::DidLoseOutputSurface);
            return;
        }
        if self.tile_priorities_dirty {
            self.trees.update_tile_priorities(self.frame_time_in_seconds());
            self.tile_priorities_dirty = false;
        }
        let state = self
            .settings
            .memory_policy
            .global_state(self.visible, self.tree_priority);
        let result = self.tile_manager.prepare_tiles(&mut self.trees, state);
        if let Some(scheduled) = self.handle_tile_manager_result(result) {
            debug!(
                "prepared tiles: scheduled {scheduled}, {} tasks in flight, {:?}",
                self.tile_manager.num_scheduled_tasks(),
                self.tile_manager.memory_stats()
            );
        }
    }

    fn assemble_frame(&self, forced: bool) -> FrameStats {
        let store = self.trees.tile_store();
        let mut frame = FrameStats {
            frame_number: self.frames_drawn + self.frames_aborted + 1,
            forced,
            ..FrameStats::default()
        };
        for layer in self.trees.active_tree().layers() {
            if !layer.has_valid_tile_priorities() {
                continue;
            }
            let scale = layer.ideal_contents_scale();
            let coverage_rect: ScreenRect = scale_to_enclosing_rect(
                layer.visible_layer_rect(),
                Scale::<f32, LayerSpace, ScreenSpace>::new(scale),
            );
            let Some(tiling) = layer
                .tilings()
                .find_tiling_with_resolution(TileResolution::HighResolution)
            else {
                frame.quads += 1;
                frame.checkerboard_quads += 1;
                continue;
            };
            for quad in CoverageIterator::new(tiling, scale, coverage_rect) {
                frame.quads += 1;
                match quad.tile.and_then(|key| store.get(key)).map(|tile| tile.draw_info().mode()) {
                    Some(DrawMode::Resource(Some(_))) => frame.resource_quads += 1,
                    Some(DrawMode::SolidColor(_)) => frame.solid_color_quads += 1,
                    Some(DrawMode::OutOfMemory) => frame.oom_quads += 1,
                    Some(DrawMode::Resource(None)) | None => frame.checkerboard_quads += 1,
                }
            }
        }
        frame.ready_to_draw = self.tile_manager.is_ready_to_draw(&self.trees);
        frame
    }

    fn draw(&mut self, forced: bool) -> DrawResult {
        if self.context_lost() {
            self.scheduler.send(SchedulerMessage::DidLoseOutputSurface);
            return DrawResult::AbortedContextLost;
        }
        let mut frame = self.assemble_frame(forced);
        if !forced && frame.checkerboard_quads > 0 {
            let result = if self.scroll_in_progress {
                Some(DrawResult::AbortedCheckerboardAnimations)
            } else if self.trees.requires_high_res_to_draw() {
                Some(DrawResult::AbortedMissingHighResContent)
            } else {
                None
            };
            if let Some(result) = result {
                debug!(
                    "draw aborted with {} of {} quads checkerboarded: {result:?}",
                    frame.checkerboard_quads, frame.quads
                );
                frame.aborted = true;
                self.frames_aborted += 1;
                self.last_frame = Some(frame);
                return result;
            }
        }

        let layer_ids: Vec<LayerId> = self.trees.active_tree().layers().iter().map(|layer| layer.id()).collect();
        for layer_id in layer_ids {
            self.trees.record_append_quads(layer_id, false);
        }
        self.scheduler.send(SchedulerMessage::DidSwapBuffers);
        // Frames reach the display as soon as they are swapped.
        self.scheduler.send(SchedulerMessage::DidSwapBuffersComplete);
        self.frames_drawn += 1;
        debug!("drew frame {frame:?}");
        self.last_frame = Some(frame);
        DrawResult::Success
    }

    fn take_commit_payload(&mut self) -> Option<CommitPayload> {
        let mut payload: Option<CommitPayload> = None;
        for next in self.commits.try_iter() {
            match payload.as_mut() {
                Some(merged) => merged.merge(next),
                None => payload = Some(next),
            }
        }
        payload
    }

    pub fn as_value(&self) -> serde_json::Value {
        json!({
            "context_id": self.context_id,
            "visible": self.visible,
            "scroll_in_progress": self.scroll_in_progress,
            "tree_priority": format!("{:?}", self.tree_priority),
            "frames_drawn": self.frames_drawn,
            "frames_aborted": self.frames_aborted,
            "last_frame": self.last_frame,
            "layer_trees": self.trees.as_value(),
            "tile_manager": self.tile_manager.as_value(),
        })
    }
}

impl SchedulerClient for LayerTreeHostImpl {
    fn will_begin_impl_frame(&mut self, args: &BeginFrameArgs) {
        self.frame_time = args.frame_time;
        self.poll_completed_tasks();
    }

    fn scheduled_action_send_begin_main_frame(&mut self, args: &BeginFrameArgs) {
        self.scheduler.send(SchedulerMessage::NotifyBeginMainFrameStarted);
        match self.take_commit_payload() {
            Some(payload) => {
                trace!(
                    "main frame {} has {} layer updates",
                    args.sequence_number,
                    payload.layers.len()
                );
                self.pending_commit = Some(payload);
                self.scheduler.send(SchedulerMessage::NotifyReadyToCommit);
            }
            None => {
                trace!("main frame {} had no updates", args.sequence_number);
                self.scheduler.send(SchedulerMessage::BeginMainFrameAborted(
                    CommitEarlyOutReason::FinishedNoUpdates,
                ));
            }
        }
    }

    fn scheduled_action_commit(&mut self) {
        let payload = self
            .pending_commit
            .take()
            .unwrap_or_else(|| panic!("commit scheduled without a ready main frame"));
        let layers = payload.layers.len();
        if self.settings.scheduler.commit_to_active_tree {
            self.trees.commit_to_active_tree(payload.layers);
            self.scheduler
                .send(SchedulerMessage::SetCanDraw(!self.trees.active_tree().layers().is_empty()));
        } else {
            self.trees.commit(payload.layers);
        }
        debug!("committed {layers} layers");
        self.set_needs_prepare_tiles();
    }

    fn scheduled_action_activate_sync_tree(&mut self) {
        self.trees.activate();
        debug!("activated {} layers", self.trees.active_tree().layers().len());
        self.scheduler
            .send(SchedulerMessage::SetCanDraw(!self.trees.active_tree().layers().is_empty()));
        self.scheduler.send(SchedulerMessage::SetNeedsRedraw);
        self.set_needs_prepare_tiles();
    }

    fn scheduled_action_draw_and_swap_if_possible(&mut self) -> DrawResult {
        self.draw(false)
    }

    fn scheduled_action_draw_and_swap_forced(&mut self) -> DrawResult {
        self.draw(true)
    }

    fn scheduled_action_begin_output_surface_creation(&mut self) {
        if self.context_lost() {
            self.context_id += 1;
            let gpu = Arc::new(RecordingGpu::new(self.context_id));
            let result = self
                .tile_manager
                .recreate_context(&mut self.trees, gpu.clone() as Arc<dyn GpuInterface>);
            if self.handle_tile_manager_result(result).is_none() {
                return;
            }
            self.gpu = gpu;
            info!("output surface recreated on context {}", self.context_id);
            self.set_needs_prepare_tiles();
        }
        self.scheduler.send(SchedulerMessage::DidCreateAndInitializeOutputSurface);
    }

    fn scheduled_action_prepare_tiles(&mut self) {
        self.prepare_tiles();
    }

    fn scheduled_action_invalidate_output_surface(&mut self) {
        trace!("output surface invalidated");
    }

    fn did_finish_impl_frame(&mut self) {
        self.poll_completed_tasks();
    }
}
