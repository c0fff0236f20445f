use log::{debug, warn};
use raster_protocol::TreePriority;
use serde_json::json;

use crate::settings::SchedulerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSurfaceState {
    None,
    Active,
    Creating,
    WaitingForFirstCommit,
    WaitingForFirstActivation,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginImplFrameState {
    Idle,
    InsideBeginFrame,
    InsideDeadline,
}

/// Progress of the main thread's frame, from request to the frame being
/// visible on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginMainFrameState {
    Idle,
    Sent,
    Started,
    ReadyToCommit,
    WaitingForActivation,
    WaitingForDraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedRedrawOnTimeoutState {
    Idle,
    WaitingForCommit,
    WaitingForActivation,
    WaitingForDraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    SendBeginMainFrame,
    Commit,
    ActivateSyncTree,
    DrawAndSwapIfPossible,
    DrawAndSwapForced,
    DrawAndSwapAbort,
    BeginOutputSurfaceCreation,
    PrepareTiles,
    InvalidateOutputSurface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawResult {
    Success,
    AbortedCheckerboardAnimations,
    AbortedMissingHighResContent,
    AbortedCantDraw,
    AbortedContextLost,
}

/// Why the main thread finished a frame without producing a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitEarlyOutReason {
    AbortedOutputSurfaceLost,
    AbortedNotVisible,
    AbortedDeferredCommit,
    FinishedNoUpdates,
}

/// Decides, one action at a time, what the compositor should do next.
///
/// The machine never performs work itself. [`SchedulerStateMachine::next_action`]
/// names the action, the caller performs it and reports back through the
/// matching `will_*`/`did_*` method before asking again.
#[derive(Debug, Clone)]
pub struct SchedulerStateMachine {
    settings: SchedulerSettings,

    output_surface_state: OutputSurfaceState,
    begin_impl_frame_state: BeginImplFrameState,
    begin_main_frame_state: BeginMainFrameState,
    forced_redraw_state: ForcedRedrawOnTimeoutState,

    current_frame_number: u64,
    commit_count: u64,

    // Each allows its action once per begin frame.
    send_begin_main_frame_funnel: bool,
    request_swap_funnel: bool,
    invalidate_output_surface_funnel: bool,
    prepare_tiles_funnel: u32,

    consecutive_checkerboard_animations: u32,
    pending_swaps: u32,

    needs_redraw: bool,
    needs_prepare_tiles: bool,
    needs_begin_main_frame: bool,
    needs_one_begin_impl_frame: bool,
    visible: bool,
    can_draw: bool,
    has_pending_tree: bool,
    pending_tree_is_ready_for_activation: bool,
    active_tree_needs_first_draw: bool,
    wait_for_ready_to_draw: bool,
    did_create_and_initialize_first_output_surface: bool,
    did_perform_swap_in_last_draw: bool,
    defer_commits: bool,
    tree_priority: TreePriority,
}

impl SchedulerStateMachine {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            settings,
            output_surface_state: OutputSurfaceState::None,
            begin_impl_frame_state: BeginImplFrameState::Idle,
            begin_main_frame_state: BeginMainFrameState::Idle,
            forced_redraw_state: ForcedRedrawOnTimeoutState::Idle,
            current_frame_number: 0,
            commit_count: 0,
            send_begin_main_frame_funnel: false,
            request_swap_funnel: false,
            invalidate_output_surface_funnel: false,
            prepare_tiles_funnel: 0,
            consecutive_checkerboard_animations: 0,
            pending_swaps: 0,
            needs_redraw: false,
            needs_prepare_tiles: false,
            needs_begin_main_frame: false,
            needs_one_begin_impl_frame: false,
            visible: false,
            can_draw: false,
            has_pending_tree: false,
            pending_tree_is_ready_for_activation: false,
            active_tree_needs_first_draw: false,
            wait_for_ready_to_draw: false,
            did_create_and_initialize_first_output_surface: false,
            did_perform_swap_in_last_draw: false,
            defer_commits: false,
            tree_priority: TreePriority::default(),
        }
    }

    pub const fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub const fn output_surface_state(&self) -> OutputSurfaceState {
        self.output_surface_state
    }

    pub const fn begin_impl_frame_state(&self) -> BeginImplFrameState {
        self.begin_impl_frame_state
    }

    pub const fn begin_main_frame_state(&self) -> BeginMainFrameState {
        self.begin_main_frame_state
    }

    pub const fn forced_redraw_state(&self) -> ForcedRedrawOnTimeoutState {
        self.forced_redraw_state
    }

    pub const fn current_frame_number(&self) -> u64 {
        self.current_frame_number
    }

    pub const fn commit_count(&self) -> u64 {
        self.commit_count
    }

    pub const fn pending_swaps(&self) -> u32 {
        self.pending_swaps
    }

    pub const fn redraw_pending(&self) -> bool {
        self.needs_redraw
    }

    pub const fn prepare_tiles_pending(&self) -> bool {
        self.needs_prepare_tiles
    }

    /// A main frame has been requested or is somewhere between sent and
    /// committed.
    pub fn commit_pending(&self) -> bool {
        matches!(
            self.begin_main_frame_state,
            BeginMainFrameState::Sent | BeginMainFrameState::Started | BeginMainFrameState::ReadyToCommit
        )
    }

    pub const fn needs_begin_main_frame(&self) -> bool {
        self.needs_begin_main_frame
    }

    pub const fn has_pending_tree(&self) -> bool {
        self.has_pending_tree
    }

    pub const fn active_tree_needs_first_draw(&self) -> bool {
        self.active_tree_needs_first_draw
    }

    pub const fn visible(&self) -> bool {
        self.visible
    }

    pub const fn can_draw(&self) -> bool {
        self.can_draw
    }

    pub const fn tree_priority(&self) -> TreePriority {
        self.tree_priority
    }

    const fn output_surface_lost(&self) -> bool {
        matches!(
            self.output_surface_state,
            OutputSurfaceState::None | OutputSurfaceState::Lost
        )
    }

    const fn has_initialized_output_surface(&self) -> bool {
        matches!(
            self.output_surface_state,
            OutputSurfaceState::Active
                | OutputSurfaceState::WaitingForFirstCommit
                | OutputSurfaceState::WaitingForFirstActivation
        )
    }

    fn impl_latency_takes_priority(&self) -> bool {
        self.tree_priority == TreePriority::SmoothnessTakesPriority
    }

    const fn swap_throttled(&self) -> bool {
        self.pending_swaps >= self.settings.max_pending_swaps
    }

    fn pending_activations_should_be_forced(&self) -> bool {
        // Without a surface or while hidden nothing draws, so waiting for the
        // pending tree's raster could stall the main thread forever.
        self.output_surface_lost() || !self.visible
    }

    fn pending_draws_should_be_aborted(&self) -> bool {
        self.pending_activations_should_be_forced() || !self.can_draw
    }

    fn should_begin_output_surface_creation(&self) -> bool {
        if !self.visible {
            return false;
        }
        if self.begin_main_frame_state != BeginMainFrameState::Idle {
            return false;
        }
        if self.begin_impl_frame_state != BeginImplFrameState::Idle {
            return false;
        }
        // Drain pending draws and activations before replacing the surface.
        if self.active_tree_needs_first_draw || self.has_pending_tree {
            return false;
        }
        self.output_surface_lost()
    }

    fn should_draw(&self) -> bool {
        if self.pending_draws_should_be_aborted() {
            return self.active_tree_needs_first_draw;
        }
        if self.request_swap_funnel {
            return false;
        }
        if self.output_surface_state != OutputSurfaceState::Active {
            return false;
        }
        if self.swap_throttled() {
            return false;
        }
        if self.begin_impl_frame_state != BeginImplFrameState::InsideDeadline {
            return false;
        }
        if self.forced_redraw_state == ForcedRedrawOnTimeoutState::WaitingForDraw {
            return true;
        }
        if self.wait_for_ready_to_draw {
            return false;
        }
        self.needs_redraw
    }

    fn should_activate_pending_tree(&self) -> bool {
        if !self.has_pending_tree {
            return false;
        }
        // The active tree must be drawn, or its draw aborted, before it is
        // replaced.
        if self.active_tree_needs_first_draw {
            return false;
        }
        if self.pending_activations_should_be_forced() {
            return true;
        }
        self.pending_tree_is_ready_for_activation
    }

    fn should_commit(&self) -> bool {
        if self.begin_main_frame_state != BeginMainFrameState::ReadyToCommit {
            return false;
        }
        // The pending tree is still waiting to activate.
        if self.has_pending_tree {
            return false;
        }
        !(self.settings.commit_to_active_tree && self.active_tree_needs_first_draw)
    }

    fn should_prepare_tiles(&self) -> bool {
        if self.prepare_tiles_funnel > 0 {
            return false;
        }
        // Tiles are prepared after the draw so their priorities reflect what
        // was just shown.
        if self.begin_impl_frame_state != BeginImplFrameState::InsideDeadline {
            return false;
        }
        self.needs_prepare_tiles
    }

    fn could_send_begin_main_frame(&self) -> bool {
        self.needs_begin_main_frame && self.visible && !self.defer_commits
    }

    fn should_send_begin_main_frame(&self) -> bool {
        if !self.could_send_begin_main_frame() {
            return false;
        }
        if self.send_begin_main_frame_funnel {
            return false;
        }
        if self.begin_main_frame_state != BeginMainFrameState::Idle {
            return false;
        }
        if !self.settings.main_frame_before_activation_enabled && self.has_pending_tree {
            return false;
        }
        if self.settings.commit_to_active_tree && self.active_tree_needs_first_draw {
            return false;
        }
        if self.impl_latency_takes_priority() && (self.has_pending_tree || self.active_tree_needs_first_draw) {
            return false;
        }
        if !self.settings.using_synchronous_renderer_compositor
            && self.begin_impl_frame_state == BeginImplFrameState::Idle
        {
            return false;
        }
        if !self.has_initialized_output_surface() {
            return false;
        }
        // A frame waiting on a forced redraw needs the commit even when swaps
        // are backed up.
        if self.forced_redraw_state == ForcedRedrawOnTimeoutState::WaitingForCommit {
            return true;
        }
        let just_swapped_in_deadline =
            self.begin_impl_frame_state == BeginImplFrameState::InsideDeadline && self.request_swap_funnel;
        !(self.swap_throttled() && !just_swapped_in_deadline)
    }

    fn should_invalidate_output_surface(&self) -> bool {
        if self.invalidate_output_surface_funnel {
            return false;
        }
        if !self.settings.using_synchronous_renderer_compositor {
            return false;
        }
        if self.begin_impl_frame_state != BeginImplFrameState::InsideBeginFrame {
            return false;
        }
        self.needs_redraw || self.needs_prepare_tiles
    }

    /// The most urgent action allowed in the current state.
    pub fn next_action(&self) -> Action {
        if self.should_activate_pending_tree() {
            return Action::ActivateSyncTree;
        }
        if self.should_commit() {
            return Action::Commit;
        }
        if self.should_draw() {
            if self.pending_draws_should_be_aborted() {
                return Action::DrawAndSwapAbort;
            }
            if self.forced_redraw_state == ForcedRedrawOnTimeoutState::WaitingForDraw {
                return Action::DrawAndSwapForced;
            }
            return Action::DrawAndSwapIfPossible;
        }
        if self.should_prepare_tiles() {
            return Action::PrepareTiles;
        }
        if self.should_send_begin_main_frame() {
            return Action::SendBeginMainFrame;
        }
        if self.should_invalidate_output_surface() {
            return Action::InvalidateOutputSurface;
        }
        if self.should_begin_output_surface_creation() {
            return Action::BeginOutputSurfaceCreation;
        }
        Action::None
    }

    pub fn will_send_begin_main_frame(&mut self) {
        assert!(
            !self.has_pending_tree || self.settings.main_frame_before_activation_enabled,
            "begin main frame sent while a pending tree blocks the commit"
        );
        assert!(self.visible, "begin main frame sent while invisible");
        assert!(
            !self.send_begin_main_frame_funnel,
            "begin main frame sent twice in one frame"
        );
        self.begin_main_frame_state = BeginMainFrameState::Sent;
        self.needs_begin_main_frame = false;
        self.send_begin_main_frame_funnel = true;
    }

    pub fn will_commit(&mut self, commit_has_no_updates: bool) {
        self.commit_count += 1;
        self.begin_main_frame_state = if commit_has_no_updates || self.settings.main_frame_before_activation_enabled {
            BeginMainFrameState::Idle
        } else if self.settings.commit_to_active_tree {
            BeginMainFrameState::WaitingForDraw
        } else {
            BeginMainFrameState::WaitingForActivation
        };

        if !commit_has_no_updates {
            if self.settings.commit_to_active_tree {
                self.active_tree_needs_first_draw = true;
                self.needs_redraw = true;
                self.wait_for_ready_to_draw = true;
            } else {
                self.has_pending_tree = true;
                self.pending_tree_is_ready_for_activation = false;
            }
        }

        if self.forced_redraw_state == ForcedRedrawOnTimeoutState::WaitingForCommit {
            self.forced_redraw_state = if self.has_pending_tree {
                ForcedRedrawOnTimeoutState::WaitingForActivation
            } else {
                ForcedRedrawOnTimeoutState::WaitingForDraw
            };
        }
        if self.output_surface_state == OutputSurfaceState::WaitingForFirstCommit {
            self.output_surface_state = if self.has_pending_tree {
                OutputSurfaceState::WaitingForFirstActivation
            } else {
                OutputSurfaceState::Active
            };
        }
    }

    pub fn will_activate(&mut self) {
        assert!(self.has_pending_tree, "activation without a pending tree");
        assert!(
            !self.active_tree_needs_first_draw,
            "activation before the active tree was drawn"
        );
        if self.begin_main_frame_state == BeginMainFrameState::WaitingForActivation {
            self.begin_main_frame_state = BeginMainFrameState::Idle;
        }
        if self.output_surface_state == OutputSurfaceState::WaitingForFirstActivation {
            self.output_surface_state = OutputSurfaceState::Active;
        }
        if self.forced_redraw_state == ForcedRedrawOnTimeoutState::WaitingForActivation {
            self.forced_redraw_state = ForcedRedrawOnTimeoutState::WaitingForDraw;
        }
        self.has_pending_tree = false;
        self.pending_tree_is_ready_for_activation = false;
        self.active_tree_needs_first_draw = true;
        self.needs_redraw = true;
    }

    fn draw_done(&mut self) {
        self.needs_redraw = false;
        self.active_tree_needs_first_draw = false;
        self.wait_for_ready_to_draw = false;
        if self.begin_main_frame_state == BeginMainFrameState::WaitingForDraw {
            self.begin_main_frame_state = BeginMainFrameState::Idle;
        }
        if self.forced_redraw_state == ForcedRedrawOnTimeoutState::WaitingForDraw {
            self.forced_redraw_state = ForcedRedrawOnTimeoutState::Idle;
        }
    }

    pub fn will_draw(&mut self) {
        assert!(!self.request_swap_funnel, "drew twice in one frame");
        self.draw_done();
        self.request_swap_funnel = true;
        self.did_perform_swap_in_last_draw = false;
    }

    pub fn did_draw(&mut self, result: DrawResult) {
        match result {
            DrawResult::Success => {
                self.consecutive_checkerboard_animations = 0;
                self.forced_redraw_state = ForcedRedrawOnTimeoutState::Idle;
            }
            DrawResult::AbortedCheckerboardAnimations => {
                self.needs_begin_main_frame = true;
                self.needs_redraw = true;
                self.consecutive_checkerboard_animations += 1;
                if self.settings.timeout_and_draw_when_animation_checkerboards
                    && self.consecutive_checkerboard_animations
                        >= self.settings.maximum_number_of_failed_draws_before_draw_is_forced
                {
                    self.consecutive_checkerboard_animations = 0;
                    // Forcing only helps once a commit brings new content.
                    self.forced_redraw_state = ForcedRedrawOnTimeoutState::WaitingForCommit;
                    warn!("too many checkerboarded draws, forcing a draw after the next commit");
                }
            }
            DrawResult::AbortedMissingHighResContent => {
                // Missing content may need new pictures, so ask for a commit.
                self.needs_begin_main_frame = true;
            }
            DrawResult::AbortedCantDraw => {
                self.needs_redraw = true;
            }
            DrawResult::AbortedContextLost => {}
        }
    }

    /// Ends a draw that was never attempted, as if it had succeeded, so the
    /// pipeline keeps moving.
    pub fn abort_draw_and_swap(&mut self) {
        self.draw_done();
        self.consecutive_checkerboard_animations = 0;
        self.forced_redraw_state = ForcedRedrawOnTimeoutState::Idle;
    }

    pub fn will_prepare_tiles(&mut self) {
        self.prepare_tiles_funnel += 1;
        self.needs_prepare_tiles = false;
    }

    pub fn will_begin_output_surface_creation(&mut self) {
        assert!(
            self.output_surface_lost(),
            "output surface creation started while one exists"
        );
        assert!(
            self.begin_main_frame_state == BeginMainFrameState::Idle,
            "output surface creation started during a commit"
        );
        self.output_surface_state = OutputSurfaceState::Creating;
    }

    pub fn will_invalidate_output_surface(&mut self) {
        assert!(
            !self.invalidate_output_surface_funnel,
            "output surface invalidated twice in one frame"
        );
        self.invalidate_output_surface_funnel = true;
        // Nothing guarantees a draw follows, so do not let a commit wait on one.
        self.active_tree_needs_first_draw = false;
    }

    pub fn on_begin_impl_frame(&mut self) {
        self.begin_impl_frame_state = BeginImplFrameState::InsideBeginFrame;
        self.current_frame_number += 1;
        self.needs_one_begin_impl_frame = false;
        self.send_begin_main_frame_funnel = false;
        self.request_swap_funnel = false;
        self.invalidate_output_surface_funnel = false;
        self.prepare_tiles_funnel = self.prepare_tiles_funnel.saturating_sub(1);
    }

    pub fn on_begin_impl_frame_deadline(&mut self) {
        self.begin_impl_frame_state = BeginImplFrameState::InsideDeadline;
    }

    pub fn on_begin_impl_frame_idle(&mut self) {
        self.begin_impl_frame_state = BeginImplFrameState::Idle;
    }

    /// Whether begin frames should keep arriving.
    pub fn begin_frame_needed(&self) -> bool {
        if !self.has_initialized_output_surface() || !self.visible {
            return false;
        }
        self.begin_frame_required_for_action() || self.proactive_begin_frame_wanted()
    }

    fn begin_frame_required_for_action(&self) -> bool {
        if self.forced_redraw_state == ForcedRedrawOnTimeoutState::WaitingForDraw {
            return true;
        }
        self.needs_redraw || self.needs_one_begin_impl_frame || (self.needs_begin_main_frame && !self.defer_commits)
    }

    /// Frames that are not needed yet but likely soon: a commit or
    /// activation in flight usually ends in a draw.
    pub fn proactive_begin_frame_wanted(&self) -> bool {
        if !self.visible {
            return false;
        }
        if self.begin_main_frame_state != BeginMainFrameState::Idle && !self.defer_commits {
            return true;
        }
        self.has_pending_tree || self.needs_prepare_tiles || self.did_perform_swap_in_last_draw
    }

    /// Whether the deadline can run right away instead of waiting for the
    /// main thread.
    pub fn should_trigger_begin_impl_frame_deadline_immediately(&self) -> bool {
        if self.pending_activations_should_be_forced() && !self.has_pending_tree {
            return true;
        }
        if self.wait_for_ready_to_draw {
            return false;
        }
        if self.swap_throttled() {
            return false;
        }
        if self.active_tree_needs_first_draw {
            return true;
        }
        if !self.needs_redraw {
            return false;
        }
        // Nothing is coming from the main thread, so draw now.
        if self.begin_main_frame_state == BeginMainFrameState::Idle && !self.has_pending_tree {
            return true;
        }
        self.impl_latency_takes_priority()
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn set_can_draw(&mut self, can_draw: bool) {
        self.can_draw = can_draw;
    }

    pub fn set_needs_redraw(&mut self) {
        self.needs_redraw = true;
    }

    pub fn set_needs_prepare_tiles(&mut self) {
        self.needs_prepare_tiles = true;
    }

    pub fn set_needs_begin_main_frame(&mut self) {
        self.needs_begin_main_frame = true;
    }

    pub fn set_needs_one_begin_impl_frame(&mut self) {
        self.needs_one_begin_impl_frame = true;
    }

    pub fn set_defer_commits(&mut self, defer_commits: bool) {
        self.defer_commits = defer_commits;
    }

    pub fn set_tree_priority(&mut self, tree_priority: TreePriority) {
        self.tree_priority = tree_priority;
    }

    pub fn notify_begin_main_frame_started(&mut self) {
        assert_eq!(
            self.begin_main_frame_state,
            BeginMainFrameState::Sent,
            "main frame started without being sent"
        );
        self.begin_main_frame_state = BeginMainFrameState::Started;
    }

    pub fn notify_ready_to_commit(&mut self) {
        assert_eq!(
            self.begin_main_frame_state,
            BeginMainFrameState::Started,
            "ready to commit before the main frame started"
        );
        self.begin_main_frame_state = BeginMainFrameState::ReadyToCommit;
    }

    pub fn begin_main_frame_aborted(&mut self, reason: CommitEarlyOutReason) {
        assert_eq!(
            self.begin_main_frame_state,
            BeginMainFrameState::Started,
            "main frame aborted before it started"
        );
        debug!("main frame aborted: {reason:?}");
        match reason {
            CommitEarlyOutReason::AbortedOutputSurfaceLost
            | CommitEarlyOutReason::AbortedNotVisible
            | CommitEarlyOutReason::AbortedDeferredCommit => {
                self.begin_main_frame_state = BeginMainFrameState::Idle;
                self.set_needs_begin_main_frame();
            }
            CommitEarlyOutReason::FinishedNoUpdates => self.will_commit(true),
        }
    }

    pub fn notify_ready_to_activate(&mut self) {
        if self.has_pending_tree {
            self.pending_tree_is_ready_for_activation = true;
        }
    }

    pub fn notify_ready_to_draw(&mut self) {
        self.wait_for_ready_to_draw = false;
    }

    pub fn did_create_and_initialize_output_surface(&mut self) {
        assert_eq!(
            self.output_surface_state,
            OutputSurfaceState::Creating,
            "output surface initialized without being created"
        );
        self.output_surface_state = OutputSurfaceState::WaitingForFirstCommit;
        if self.did_create_and_initialize_first_output_surface {
            // The main thread must repaint into the replacement surface.
            self.needs_begin_main_frame = true;
        }
        self.did_create_and_initialize_first_output_surface = true;
        self.pending_swaps = 0;
    }

    pub fn did_lose_output_surface(&mut self) {
        if matches!(
            self.output_surface_state,
            OutputSurfaceState::Lost | OutputSurfaceState::Creating
        ) {
            return;
        }
        warn!("output surface lost");
        self.output_surface_state = OutputSurfaceState::Lost;
        self.needs_redraw = false;
        self.wait_for_ready_to_draw = false;
    }

    pub fn did_swap_buffers(&mut self) {
        self.pending_swaps += 1;
        self.did_perform_swap_in_last_draw = true;
    }

    pub fn did_swap_buffers_complete(&mut self) {
        assert!(self.pending_swaps > 0, "swap completed that was never issued");
        self.pending_swaps -= 1;
    }

    pub fn as_value(&self) -> serde_json::Value {
        json!({
            "major_state": {
                "next_action": format!("{:?}", self.next_action()),
                "begin_impl_frame_state": format!("{:?}", self.begin_impl_frame_state),
                "begin_main_frame_state": format!("{:?}", self.begin_main_frame_state),
                "output_surface_state": format!("{:?}", self.output_surface_state),
                "forced_redraw_state": format!("{:?}", self.forced_redraw_state),
            },
            "minor_state": {
                "commit_count": self.commit_count,
                "current_frame_number": self.current_frame_number,
                "funnels": {
                    "send_begin_main_frame": self.send_begin_main_frame_funnel,
                    "request_swap": self.request_swap_funnel,
                    "invalidate_output_surface": self.invalidate_output_surface_funnel,
                    "prepare_tiles": self.prepare_tiles_funnel,
                },
                "consecutive_checkerboard_animations": self.consecutive_checkerboard_animations,
                "pending_swaps": self.pending_swaps,
                "max_pending_swaps": self.settings.max_pending_swaps,
                "needs_redraw": self.needs_redraw,
                "needs_prepare_tiles": self.needs_prepare_tiles,
                "needs_begin_main_frame": self.needs_begin_main_frame,
                "needs_one_begin_impl_frame": self.needs_one_begin_impl_frame,
                "visible": self.visible,
                "can_draw": self.can_draw,
                "has_pending_tree": self.has_pending_tree,
                "pending_tree_is_ready_for_activation": self.pending_tree_is_ready_for_activation,
                "active_tree_needs_first_draw": self.active_tree_needs_first_draw,
                "wait_for_ready_to_draw": self.wait_for_ready_to_draw,
                "defer_commits": self.defer_commits,
                "tree_priority": format!("{:?}", self.tree_priority),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Performs `action` the way a scheduler would, drawing with `draw_result`.
    fn perform(state: &mut SchedulerStateMachine, action: Action, draw_result: DrawResult) {
        match action {
            Action::None => {
                if state.begin_impl_frame_state() == BeginImplFrameState::InsideDeadline {
                    state.on_begin_impl_frame_idle();
                }
            }
            Action::ActivateSyncTree => state.will_activate(),
            Action::SendBeginMainFrame => state.will_send_begin_main_frame(),
            Action::Commit => state.will_commit(false),
            Action::DrawAndSwapForced | Action::DrawAndSwapIfPossible => {
                state.will_draw();
                state.did_draw(draw_result);
            }
            Action::DrawAndSwapAbort => state.abort_draw_and_swap(),
            Action::BeginOutputSurfaceCreation => state.will_begin_output_surface_creation(),
            Action::PrepareTiles => state.will_prepare_tiles(),
            Action::InvalidateOutputSurface => state.will_invalidate_output_surface(),
        }
    }

    #[track_caller]
    fn expect_action(state: &mut SchedulerStateMachine, expected: Action) {
        expect_action_with(state, expected, DrawResult::Success);
    }

    #[track_caller]
    fn expect_action_with(state: &mut SchedulerStateMachine, expected: Action, draw_result: DrawResult) {
        let action = state.next_action();
        assert_eq!(action, expected, "{:#}", state.as_value());
        perform(state, action, draw_result);
    }

    /// Visible, drawable, with a surface that has seen its first commit and
    /// activation.
    fn ready_state(settings: SchedulerSettings) -> SchedulerStateMachine {
        let mut state = SchedulerStateMachine::new(settings);
        state.set_visible(true);
        expect_action(&mut state, Action::BeginOutputSurfaceCreation);
        expect_action(&mut state, Action::None);
        state.did_create_and_initialize_output_surface();
        state.set_can_draw(true);

        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);
        state.notify_ready_to_activate();
        if !state.settings().commit_to_active_tree {
            expect_action(&mut state, Action::ActivateSyncTree);
        } else {
            state.notify_ready_to_draw();
        }
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
        state.did_swap_buffers();
        state.did_swap_buffers_complete();
        expect_action(&mut state, Action::None);
        assert_eq!(state.output_surface_state(), OutputSurfaceState::Active);
        state
    }

    #[test]
    fn first_surface_is_created_once_visible() {
        let mut state = SchedulerStateMachine::new(SchedulerSettings::default());
        assert_eq!(state.next_action(), Action::None);
        state.set_visible(true);
        expect_action(&mut state, Action::BeginOutputSurfaceCreation);
        assert_eq!(state.output_surface_state(), OutputSurfaceState::Creating);
        expect_action(&mut state, Action::None);

        state.did_create_and_initialize_output_surface();
        assert_eq!(state.output_surface_state(), OutputSurfaceState::WaitingForFirstCommit);
        assert!(!state.begin_frame_needed());
    }

    #[test]
    fn begin_frame_needed_follows_redraw_and_commit_requests() {
        let mut state = ready_state(SchedulerSettings::default());
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::None);
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::None);
        // The last draw swapped, so one more frame is wanted; after an idle
        // frame nothing is.
        state.on_begin_impl_frame();
        state.on_begin_impl_frame_deadline();
        state.will_draw();
        state.did_draw(DrawResult::Success);
        state.on_begin_impl_frame_idle();
        assert!(!state.begin_frame_needed());

        state.set_needs_one_begin_impl_frame();
        assert!(state.begin_frame_needed());
        state.on_begin_impl_frame();
        state.on_begin_impl_frame_deadline();
        state.on_begin_impl_frame_idle();
        assert!(!state.begin_frame_needed());

        state.set_needs_redraw();
        assert!(state.begin_frame_needed());
        state.set_visible(false);
        assert!(!state.begin_frame_needed());
        state.set_visible(true);

        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_begin_main_frame();
        assert!(state.begin_frame_needed());
        state.set_defer_commits(true);
        state.on_begin_impl_frame();
        state.on_begin_impl_frame_deadline();
        state.will_draw();
        state.did_draw(DrawResult::Success);
        state.on_begin_impl_frame_idle();
        assert!(!state.begin_frame_needed());
    }

    #[test]
    fn begin_main_frame_waits_for_a_begin_frame() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_begin_main_frame();
        expect_action(&mut state, Action::None);
        assert_eq!(state.begin_main_frame_state(), BeginMainFrameState::Idle);
        assert!(state.begin_frame_needed());

        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        assert_eq!(state.begin_main_frame_state(), BeginMainFrameState::Sent);
        assert!(!state.needs_begin_main_frame());
        expect_action(&mut state, Action::None);
    }

    #[test]
    fn invisible_state_never_sends_begin_main_frame() {
        let mut state = SchedulerStateMachine::new(SchedulerSettings::default());
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::None);
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::None);
        assert!(state.needs_begin_main_frame());
    }

    #[test]
    fn full_cycle_commits_activates_then_draws() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_begin_main_frame();

        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        expect_action(&mut state, Action::None);
        assert!(state.commit_pending());

        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);
        assert!(state.has_pending_tree());
        assert_eq!(
            state.begin_main_frame_state(),
            BeginMainFrameState::WaitingForActivation
        );
        // Raster for the pending tree is not done yet.
        expect_action(&mut state, Action::None);
        assert!(!state.should_trigger_begin_impl_frame_deadline_immediately());

        state.notify_ready_to_activate();
        expect_action(&mut state, Action::ActivateSyncTree);
        assert!(state.redraw_pending());
        assert!(state.should_trigger_begin_impl_frame_deadline_immediately());

        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
        state.did_swap_buffers();
        expect_action(&mut state, Action::None);
        assert!(!state.redraw_pending());
        assert_eq!(state.begin_main_frame_state(), BeginMainFrameState::Idle);
        assert_eq!(state.commit_count(), 2);
    }

    #[test]
    fn main_frame_before_activation_lets_the_next_commit_start_early() {
        let settings = SchedulerSettings {
            main_frame_before_activation_enabled: true,
            ..SchedulerSettings::default()
        };
        let mut state = ready_state(settings);
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);
        assert_eq!(state.begin_main_frame_state(), BeginMainFrameState::Idle);
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::None);

        // A second main frame starts while the first commit's tree is pending.
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::None);

        state.notify_ready_to_activate();
        expect_action(&mut state, Action::ActivateSyncTree);
        expect_action(&mut state, Action::Commit);
        expect_action(&mut state, Action::None);
        assert!(state.should_trigger_begin_impl_frame_deadline_immediately());
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
    }

    #[test]
    fn checkerboarded_draw_requests_a_commit_and_retries() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_redraw();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::None);
        assert!(!state.commit_pending());

        state.on_begin_impl_frame_deadline();
        expect_action_with(
            &mut state,
            Action::DrawAndSwapIfPossible,
            DrawResult::AbortedCheckerboardAnimations,
        );
        expect_action(&mut state, Action::SendBeginMainFrame);
        expect_action(&mut state, Action::None);
        assert!(state.commit_pending());
        assert!(state.redraw_pending());

        state.on_begin_impl_frame();
        expect_action(&mut state, Action::None);
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
        assert!(!state.redraw_pending());
    }

    #[test]
    fn missing_high_res_content_waits_for_a_new_commit() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_redraw();
        state.on_begin_impl_frame();
        state.on_begin_impl_frame_deadline();
        expect_action_with(
            &mut state,
            Action::DrawAndSwapIfPossible,
            DrawResult::AbortedMissingHighResContent,
        );
        expect_action(&mut state, Action::SendBeginMainFrame);
        assert!(state.commit_pending());
        assert!(!state.redraw_pending());

        state.on_begin_impl_frame();
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::None);

        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);
        state.notify_ready_to_activate();
        expect_action(&mut state, Action::ActivateSyncTree);
        assert!(state.redraw_pending());
    }

    #[test]
    fn repeated_checkerboards_force_a_draw_after_the_next_commit() {
        let settings = SchedulerSettings {
            maximum_number_of_failed_draws_before_draw_is_forced: 1,
            ..SchedulerSettings::default()
        };
        let mut state = ready_state(settings);
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);

        state.set_needs_redraw();
        state.on_begin_impl_frame_deadline();
        expect_action_with(
            &mut state,
            Action::DrawAndSwapIfPossible,
            DrawResult::AbortedCheckerboardAnimations,
        );
        assert_eq!(
            state.forced_redraw_state(),
            ForcedRedrawOnTimeoutState::WaitingForCommit
        );
        expect_action(&mut state, Action::None);

        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);
        assert_eq!(
            state.forced_redraw_state(),
            ForcedRedrawOnTimeoutState::WaitingForActivation
        );
        state.notify_ready_to_activate();
        expect_action(&mut state, Action::ActivateSyncTree);
        assert_eq!(
            state.forced_redraw_state(),
            ForcedRedrawOnTimeoutState::WaitingForDraw
        );

        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        expect_action(&mut state, Action::None);
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapForced);
        assert_eq!(state.forced_redraw_state(), ForcedRedrawOnTimeoutState::Idle);
    }

    #[test]
    fn failed_draws_keep_waiting_for_a_commit() {
        let settings = SchedulerSettings {
            maximum_number_of_failed_draws_before_draw_is_forced: 2,
            ..SchedulerSettings::default()
        };
        let mut state = ready_state(settings);
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);

        for _ in 0..4 {
            state.set_needs_redraw();
            state.on_begin_impl_frame();
            expect_action(&mut state, Action::None);
            state.on_begin_impl_frame_deadline();
            expect_action_with(
                &mut state,
                Action::DrawAndSwapIfPossible,
                DrawResult::AbortedCheckerboardAnimations,
            );
            expect_action(&mut state, Action::None);
        }
        assert!(state.commit_pending());
        assert!(state.redraw_pending());
        assert_eq!(
            state.forced_redraw_state(),
            ForcedRedrawOnTimeoutState::WaitingForCommit
        );
    }

    #[test]
    fn draws_at_most_once_per_frame() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_redraw();
        state.on_begin_impl_frame();
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
        state.did_swap_buffers();
        state.did_swap_buffers_complete();

        state.set_needs_redraw();
        assert_eq!(state.next_action(), Action::None);
        state.on_begin_impl_frame_idle();
        assert!(state.begin_frame_needed());
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::None);
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
    }

    #[test]
    fn pending_swaps_throttle_draws() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_redraw();
        state.on_begin_impl_frame();
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
        state.did_swap_buffers();
        state.on_begin_impl_frame_idle();

        state.set_needs_redraw();
        state.on_begin_impl_frame();
        assert!(!state.should_trigger_begin_impl_frame_deadline_immediately());
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::None);

        state.did_swap_buffers_complete();
        state.on_begin_impl_frame();
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
    }

    #[test]
    fn prepare_tiles_runs_once_per_frame_after_draw() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_redraw();
        state.set_needs_prepare_tiles();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::None);

        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
        expect_action(&mut state, Action::PrepareTiles);
        state.set_needs_prepare_tiles();
        expect_action(&mut state, Action::None);
        assert!(state.prepare_tiles_pending());

        state.on_begin_impl_frame();
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::PrepareTiles);
    }

    #[test]
    fn cannot_draw_aborts_the_first_draw_of_a_new_tree() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);
        state.notify_ready_to_activate();
        expect_action(&mut state, Action::ActivateSyncTree);

        state.set_can_draw(false);
        expect_action(&mut state, Action::DrawAndSwapAbort);
        assert!(!state.active_tree_needs_first_draw());
        expect_action(&mut state, Action::None);
    }

    #[test]
    fn hidden_state_forces_activation() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);

        state.set_visible(false);
        expect_action(&mut state, Action::ActivateSyncTree);
        expect_action(&mut state, Action::DrawAndSwapAbort);
        expect_action(&mut state, Action::None);
    }

    #[test]
    fn aborted_main_frame_without_updates_keeps_no_pending_tree() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.begin_main_frame_aborted(CommitEarlyOutReason::FinishedNoUpdates);
        assert_eq!(state.begin_main_frame_state(), BeginMainFrameState::Idle);
        assert!(!state.has_pending_tree());
        assert!(!state.needs_begin_main_frame());
        expect_action(&mut state, Action::None);
    }

    #[test]
    fn aborted_main_frame_while_hidden_asks_again() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.begin_main_frame_aborted(CommitEarlyOutReason::AbortedNotVisible);
        assert_eq!(state.begin_main_frame_state(), BeginMainFrameState::Idle);
        assert!(state.needs_begin_main_frame());
    }

    #[test]
    fn lost_surface_is_recreated_once_idle() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_redraw();
        state.did_lose_output_surface();
        assert_eq!(state.output_surface_state(), OutputSurfaceState::Lost);
        assert!(!state.redraw_pending());
        assert!(!state.begin_frame_needed());

        expect_action(&mut state, Action::BeginOutputSurfaceCreation);
        state.did_create_and_initialize_output_surface();
        assert!(state.needs_begin_main_frame());
        assert!(state.begin_frame_needed());

        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);
        assert_eq!(
            state.output_surface_state(),
            OutputSurfaceState::WaitingForFirstActivation
        );
        state.notify_ready_to_activate();
        expect_action(&mut state, Action::ActivateSyncTree);
        assert_eq!(state.output_surface_state(), OutputSurfaceState::Active);
    }

    #[test]
    fn surface_is_not_recreated_during_a_commit() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.did_lose_output_surface();
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::None);
        expect_action(&mut state, Action::None);

        state.notify_begin_main_frame_started();
        state.begin_main_frame_aborted(CommitEarlyOutReason::AbortedOutputSurfaceLost);
        expect_action(&mut state, Action::BeginOutputSurfaceCreation);
    }

    #[test]
    fn commit_to_active_tree_waits_for_ready_to_draw() {
        let settings = SchedulerSettings {
            commit_to_active_tree: true,
            ..SchedulerSettings::default()
        };
        let mut state = ready_state(settings);
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);
        assert!(!state.has_pending_tree());
        assert_eq!(state.begin_main_frame_state(), BeginMainFrameState::WaitingForDraw);
        assert!(!state.should_trigger_begin_impl_frame_deadline_immediately());

        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::None);

        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        // The previous commit has not been drawn yet.
        expect_action(&mut state, Action::None);
        state.notify_ready_to_draw();
        assert!(state.should_trigger_begin_impl_frame_deadline_immediately());
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
        assert_eq!(state.begin_main_frame_state(), BeginMainFrameState::Idle);
        expect_action(&mut state, Action::SendBeginMainFrame);
    }

    #[test]
    fn smoothness_priority_holds_main_frames_behind_pending_work() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_tree_priority(TreePriority::SmoothnessTakesPriority);
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::SendBeginMainFrame);
        state.notify_begin_main_frame_started();
        state.notify_ready_to_commit();
        expect_action(&mut state, Action::Commit);
        state.notify_ready_to_activate();
        expect_action(&mut state, Action::ActivateSyncTree);

        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::None);
        assert!(state.should_trigger_begin_impl_frame_deadline_immediately());
        state.on_begin_impl_frame_deadline();
        expect_action(&mut state, Action::DrawAndSwapIfPossible);
        expect_action(&mut state, Action::SendBeginMainFrame);
    }

    #[test]
    fn deferred_commits_block_main_frames() {
        let mut state = ready_state(SchedulerSettings::default());
        state.set_defer_commits(true);
        state.set_needs_begin_main_frame();
        state.on_begin_impl_frame();
        expect_action(&mut state, Action::None);
        state.set_defer_commits(false);
        expect_action(&mut state, Action::SendBeginMainFrame);
    }

    #[test]
    #[should_panic(expected = "ready to commit before the main frame started")]
    fn ready_to_commit_requires_a_started_main_frame() {
        let mut state = ready_state(SchedulerSettings::default());
        state.notify_ready_to_commit();
    }

    #[test]
    fn as_value_names_the_major_states() {
        let state = ready_state(SchedulerSettings::default());
        let value = state.as_value();
        assert_eq!(value["major_state"]["output_surface_state"], "Active");
        assert_eq!(value["major_state"]["next_action"], "None");
        assert_eq!(value["minor_state"]["visible"], true);
    }
}
