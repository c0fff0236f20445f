use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use log::{debug, trace};
use raster_protocol::TreePriority;
use serde_json::json;

use crate::begin_frame::{BeginFrameArgs, BeginFrameArgsKind};
use crate::settings::SchedulerSettings;
use crate::state_machine::{
    Action, BeginImplFrameState, CommitEarlyOutReason, DrawResult, SchedulerStateMachine,
};
use crate::SchedulerError;

/// Performs the actions the scheduler picks. Every method runs on the
/// compositor thread inside [`Scheduler`] calls.
pub trait SchedulerClient {
    fn will_begin_impl_frame(&mut self, args: &BeginFrameArgs);
    fn scheduled_action_send_begin_main_frame(&mut self, args: &BeginFrameArgs);
    fn scheduled_action_commit(&mut self);
    fn scheduled_action_activate_sync_tree(&mut self);
    fn scheduled_action_draw_and_swap_if_possible(&mut self) -> DrawResult;
    fn scheduled_action_draw_and_swap_forced(&mut self) -> DrawResult;
    fn scheduled_action_begin_output_surface_creation(&mut self);
    fn scheduled_action_prepare_tiles(&mut self);
    fn scheduled_action_invalidate_output_surface(&mut self);
    fn did_finish_impl_frame(&mut self) {}
}

/// Everything that can change scheduler inputs from outside an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMessage {
    SetVisible(bool),
    SetCanDraw(bool),
    SetNeedsRedraw,
    SetNeedsPrepareTiles,
    SetNeedsBeginMainFrame,
    SetNeedsOneBeginImplFrame,
    SetDeferCommits(bool),
    SetTreePriority(TreePriority),
    NotifyBeginMainFrameStarted,
    NotifyReadyToCommit,
    BeginMainFrameAborted(CommitEarlyOutReason),
    NotifyReadyToActivate,
    NotifyReadyToDraw,
    DidCreateAndInitializeOutputSurface,
    DidLoseOutputSurface,
    DidSwapBuffers,
    DidSwapBuffersComplete,
}

/// Cloneable sender for [`SchedulerMessage`]s. Messages are applied before
/// the scheduler picks its next action.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    sender: Sender<SchedulerMessage>,
}

impl SchedulerHandle {
    pub fn send(&self, message: SchedulerMessage) {
        if self.sender.send(message).is_err() {
            debug!("scheduler gone, dropping {message:?}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineMode {
    /// No begin frame in progress.
    None,
    /// Run the deadline as soon as possible.
    Immediate,
    /// Run the deadline at the frame's deadline time.
    Regular,
}

pub struct Scheduler {
    state: SchedulerStateMachine,
    sender: Sender<SchedulerMessage>,
    receiver: Receiver<SchedulerMessage>,
    begin_impl_frame_args: Option<BeginFrameArgs>,
    observing_begin_frames: bool,
    frames_started: u64,
    frames_skipped: u64,
    missed_deadlines: u64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("next_action", &self.state.next_action())
            .field("begin_impl_frame_state", &self.state.begin_impl_frame_state())
            .field("observing_begin_frames", &self.observing_begin_frames)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings) -> Result<Self, SchedulerError> {
        settings.validate()?;
        let (sender, receiver) = unbounded();
        Ok(Self {
            state: SchedulerStateMachine::new(settings),
            sender,
            receiver,
            begin_impl_frame_args: None,
            observing_begin_frames: false,
            frames_started: 0,
            frames_skipped: 0,
            missed_deadlines: 0,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            sender: self.sender.clone(),
        }
    }

    pub const fn state(&self) -> &SchedulerStateMachine {
        &self.state
    }

    pub const fn settings(&self) -> &SchedulerSettings {
        self.state.settings()
    }

    pub const fn begin_impl_frame_args(&self) -> Option<&BeginFrameArgs> {
        self.begin_impl_frame_args.as_ref()
    }

    /// Whether the frame source should keep ticking.
    pub const fn observing_begin_frames(&self) -> bool {
        self.observing_begin_frames
    }

    /// Applies `message` and runs whatever actions it unblocks.
    pub fn notify(&mut self, client: &mut impl SchedulerClient, message: SchedulerMessage) {
        self.apply(message);
        self.process_scheduled_actions(client);
    }

    /// Picks up queued handle messages and runs what they unblock.
    pub fn poll(&mut self, client: &mut impl SchedulerClient) -> DeadlineMode {
        self.process_scheduled_actions(client);
        self.deadline_mode()
    }

    fn apply(&mut self, message: SchedulerMessage) {
        trace!("scheduler message {message:?}");
        match message {
            SchedulerMessage::SetVisible(visible) => self.state.set_visible(visible),
            SchedulerMessage::SetCanDraw(can_draw) => self.state.set_can_draw(can_draw),
            SchedulerMessage::SetNeedsRedraw => self.state.set_needs_redraw(),
            SchedulerMessage::SetNeedsPrepareTiles => self.state.set_needs_prepare_tiles(),
            SchedulerMessage::SetNeedsBeginMainFrame => self.state.set_needs_begin_main_frame(),
            SchedulerMessage::SetNeedsOneBeginImplFrame => self.state.set_needs_one_begin_impl_frame(),
            SchedulerMessage::SetDeferCommits(defer) => self.state.set_defer_commits(defer),
            SchedulerMessage::SetTreePriority(priority) => self.state.set_tree_priority(priority),
            SchedulerMessage::NotifyBeginMainFrameStarted => self.state.notify_begin_main_frame_started(),
            SchedulerMessage::NotifyReadyToCommit => self.state.notify_ready_to_commit(),
            SchedulerMessage::BeginMainFrameAborted(reason) => self.state.begin_main_frame_aborted(reason),
            SchedulerMessage::NotifyReadyToActivate => self.state.notify_ready_to_activate(),
            SchedulerMessage::NotifyReadyToDraw => self.state.notify_ready_to_draw(),
            SchedulerMessage::DidCreateAndInitializeOutputSurface => {
                self.state.did_create_and_initialize_output_surface()
            }
            SchedulerMessage::DidLoseOutputSurface => self.state.did_lose_output_surface(),
            SchedulerMessage::DidSwapBuffers => self.state.did_swap_buffers(),
            SchedulerMessage::DidSwapBuffersComplete => self.state.did_swap_buffers_complete(),
        }
    }

    fn drain_messages(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => self.apply(message),
                Err(TryRecvError::Empty) => return,
                // The scheduler keeps its own sender alive.
                Err(TryRecvError::Disconnected) => unreachable!("scheduler message channel disconnected"),
            }
        }
    }

    /// Starts an impl frame if one is needed.
    ///
    /// A deadline left over from the previous frame runs first, so a source
    /// that ticks faster than the deadline fires never stacks frames.
    pub fn begin_frame(&mut self, client: &mut impl SchedulerClient, args: BeginFrameArgs) -> DeadlineMode {
        self.drain_messages();
        if self.state.begin_impl_frame_state() == BeginImplFrameState::InsideBeginFrame {
            self.missed_deadlines += 1;
            debug!("running missed deadline before frame {}", args.sequence_number);
            self.on_begin_impl_frame_deadline(client);
        }

        if !self.state.begin_frame_needed() {
            self.frames_skipped += 1;
            self.update_observing_begin_frames();
            return DeadlineMode::None;
        }
        if args.kind == BeginFrameArgsKind::Missed {
            debug!("begin frame {} arrived late", args.sequence_number);
        }

        self.frames_started += 1;
        self.state.on_begin_impl_frame();
        client.will_begin_impl_frame(&args);
        self.begin_impl_frame_args = Some(args);
        self.process_scheduled_actions(client);
        self.deadline_mode()
    }

    pub fn deadline_mode(&self) -> DeadlineMode {
        if self.state.begin_impl_frame_state() != BeginImplFrameState::InsideBeginFrame {
            return DeadlineMode::None;
        }
        if self.state.should_trigger_begin_impl_frame_deadline_immediately() {
            DeadlineMode::Immediate
        } else {
            DeadlineMode::Regular
        }
    }

    /// When the pending deadline should run, if a frame is in progress.
    pub fn deadline_time(&self, now: Instant) -> Option<Instant> {
        match self.deadline_mode() {
            DeadlineMode::None => None,
            DeadlineMode::Immediate => Some(now),
            DeadlineMode::Regular => self.begin_impl_frame_args.map(|args| args.deadline),
        }
    }

    pub fn on_begin_impl_frame_deadline(&mut self, client: &mut impl SchedulerClient) {
        self.drain_messages();
        if self.state.begin_impl_frame_state() != BeginImplFrameState::InsideBeginFrame {
            return;
        }
        self.state.on_begin_impl_frame_deadline();
        self.process_scheduled_actions(client);

        self.state.on_begin_impl_frame_idle();
        self.begin_impl_frame_args = None;
        client.did_finish_impl_frame();
        // Output surface creation waits for the idle state.
        self.process_scheduled_actions(client);
    }

    pub fn process_scheduled_actions(&mut self, client: &mut impl SchedulerClient) {
        loop {
            self.drain_messages();
            let action = self.state.next_action();
            if action == Action::None {
                break;
            }
            trace!("scheduler action {action:?}");
            match action {
                Action::None => {}
                Action::SendBeginMainFrame => {
                    self.state.will_send_begin_main_frame();
                    let args = self.begin_impl_frame_args.unwrap_or_else(|| {
                        panic!("begin main frame sent outside a begin frame")
                    });
                    client.scheduled_action_send_begin_main_frame(&args);
                }
                Action::Commit => {
                    self.state.will_commit(false);
                    client.scheduled_action_commit();
                }
                Action::ActivateSyncTree => {
                    self.state.will_activate();
                    client.scheduled_action_activate_sync_tree();
                }
                Action::DrawAndSwapIfPossible => {
                    self.state.will_draw();
                    let result = client.scheduled_action_draw_and_swap_if_possible();
                    self.state.did_draw(result);
                }
                Action::DrawAndSwapForced => {
                    self.state.will_draw();
                    let result = client.scheduled_action_draw_and_swap_forced();
                    self.state.did_draw(result);
                }
                Action::DrawAndSwapAbort => self.state.abort_draw_and_swap(),
                Action::BeginOutputSurfaceCreation => {
                    self.state.will_begin_output_surface_creation();
                    client.scheduled_action_begin_output_surface_creation();
                }
                Action::PrepareTiles => {
                    self.state.will_prepare_tiles();
                    client.scheduled_action_prepare_tiles();
                }
                Action::InvalidateOutputSurface => {
                    self.state.will_invalidate_output_surface();
                    client.scheduled_action_invalidate_output_surface();
                }
            }
        }
        self.update_observing_begin_frames();
    }

    fn update_observing_begin_frames(&mut self) {
        let needed = self.state.begin_frame_needed();
        if needed != self.observing_begin_frames {
            debug!("begin frames {}", if needed { "needed" } else { "no longer needed" });
            self.observing_begin_frames = needed;
        }
    }

    pub fn as_value(&self, now: Instant) -> serde_json::Value {
        json!({
            "state_machine": self.state.as_value(),
            "observing_begin_frames": self.observing_begin_frames,
            "deadline_mode": format!("{:?}", self.deadline_mode()),
            "begin_impl_frame_args": self.begin_impl_frame_args.map(|args| args.as_value(now)),
            "frames_started": self.frames_started,
            "frames_skipped": self.frames_skipped,
            "missed_deadlines": self.missed_deadlines,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state_machine::OutputSurfaceState;

    #[derive(Default)]
    struct RecordingClient {
        actions: Vec<&'static str>,
        draw_result: Option<DrawResult>,
    }

    impl RecordingClient {
        fn take(&mut self) -> Vec<&'static str> {
            std::mem::take(&mut self.actions)
        }
    }

    impl SchedulerClient for RecordingClient {
        fn will_begin_impl_frame(&mut self, _args: &BeginFrameArgs) {
            self.actions.push("will_begin_impl_frame");
        }

        fn scheduled_action_send_begin_main_frame(&mut self, _args: &BeginFrameArgs) {
            self.actions.push("send_begin_main_frame");
        }

        fn scheduled_action_commit(&mut self) {
            self.actions.push("commit");
        }

        fn scheduled_action_activate_sync_tree(&mut self) {
            self.actions.push("activate_sync_tree");
        }

        fn scheduled_action_draw_and_swap_if_possible(&mut self) -> DrawResult {
            self.actions.push("draw_and_swap_if_possible");
            self.draw_result.unwrap_or(DrawResult::Success)
        }

        fn scheduled_action_draw_and_swap_forced(&mut self) -> DrawResult {
            self.actions.push("draw_and_swap_forced");
            DrawResult::Success
        }

        fn scheduled_action_begin_output_surface_creation(&mut self) {
            self.actions.push("begin_output_surface_creation");
        }

        fn scheduled_action_prepare_tiles(&mut self) {
            self.actions.push("prepare_tiles");
        }

        fn scheduled_action_invalidate_output_surface(&mut self) {
            self.actions.push("invalidate_output_surface");
        }

        fn did_finish_impl_frame(&mut self) {
            self.actions.push("did_finish_impl_frame");
        }
    }

    fn args(sequence_number: u64) -> BeginFrameArgs {
        BeginFrameArgs::new(Instant::now(), Duration::from_millis(16), sequence_number)
    }

    fn initialized_scheduler(client: &mut RecordingClient) -> Scheduler {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut scheduler = Scheduler::new(SchedulerSettings::default()).expect("valid settings");
        scheduler.notify(client, SchedulerMessage::SetVisible(true));
        scheduler.notify(client, SchedulerMessage::SetCanDraw(true));
        assert_eq!(client.take(), ["begin_output_surface_creation"]);
        scheduler.notify(client, SchedulerMessage::DidCreateAndInitializeOutputSurface);
        assert!(client.take().is_empty());
        scheduler
    }

    #[test]
    fn main_frame_flows_through_commit_activation_and_draw() {
        let mut client = RecordingClient::default();
        let mut scheduler = initialized_scheduler(&mut client);
        let handle = scheduler.handle();

        assert_eq!(scheduler.begin_frame(&mut client, args(1)), DeadlineMode::None);
        scheduler.notify(&mut client, SchedulerMessage::SetNeedsBeginMainFrame);
        assert!(scheduler.observing_begin_frames());

        assert_eq!(scheduler.begin_frame(&mut client, args(2)), DeadlineMode::Regular);
        assert_eq!(client.take(), ["will_begin_impl_frame", "send_begin_main_frame"]);

        handle.send(SchedulerMessage::NotifyBeginMainFrameStarted);
        handle.send(SchedulerMessage::NotifyReadyToCommit);
        assert_eq!(scheduler.poll(&mut client), DeadlineMode::Regular);
        assert_eq!(client.take(), ["commit"]);

        handle.send(SchedulerMessage::NotifyReadyToActivate);
        assert_eq!(scheduler.poll(&mut client), DeadlineMode::Immediate);
        assert_eq!(client.take(), ["activate_sync_tree"]);

        scheduler.on_begin_impl_frame_deadline(&mut client);
        assert_eq!(client.take(), ["draw_and_swap_if_possible", "did_finish_impl_frame"]);
        assert!(!scheduler.observing_begin_frames());
        assert_eq!(scheduler.begin_frame(&mut client, args(3)), DeadlineMode::None);
        assert!(client.take().is_empty());
    }

    #[test]
    fn regular_deadline_waits_for_the_frame_deadline() {
        let mut client = RecordingClient::default();
        let mut scheduler = initialized_scheduler(&mut client);
        scheduler.notify(&mut client, SchedulerMessage::SetNeedsBeginMainFrame);
        let frame = args(1);
        scheduler.begin_frame(&mut client, frame);
        let now = Instant::now();
        assert_eq!(scheduler.deadline_time(now), Some(frame.deadline));
    }

    #[test]
    fn next_begin_frame_runs_a_missed_deadline_first() {
        let mut client = RecordingClient::default();
        let mut scheduler = initialized_scheduler(&mut client);
        scheduler.notify(&mut client, SchedulerMessage::SetNeedsBeginMainFrame);
        scheduler.begin_frame(&mut client, args(1));
        client.take();

        scheduler.notify(&mut client, SchedulerMessage::SetNeedsOneBeginImplFrame);
        scheduler.begin_frame(&mut client, args(2));
        assert_eq!(
            client.take(),
            ["did_finish_impl_frame", "will_begin_impl_frame"]
        );
        assert_eq!(scheduler.as_value(Instant::now())["missed_deadlines"], 1);
    }

    #[test]
    fn redraw_request_draws_at_the_deadline_and_prepares_tiles_after() {
        let mut client = RecordingClient::default();
        let mut scheduler = initialized_scheduler(&mut client);
        // The first commit makes the surface active.
        scheduler.notify(&mut client, SchedulerMessage::SetNeedsBeginMainFrame);
        scheduler.begin_frame(&mut client, args(1));
        scheduler.notify(&mut client, SchedulerMessage::NotifyBeginMainFrameStarted);
        scheduler.notify(&mut client, SchedulerMessage::NotifyReadyToCommit);
        scheduler.notify(&mut client, SchedulerMessage::NotifyReadyToActivate);
        scheduler.on_begin_impl_frame_deadline(&mut client);
        client.take();

        scheduler.notify(&mut client, SchedulerMessage::SetNeedsRedraw);
        scheduler.notify(&mut client, SchedulerMessage::SetNeedsPrepareTiles);
        assert_eq!(scheduler.begin_frame(&mut client, args(2)), DeadlineMode::Immediate);
        scheduler.on_begin_impl_frame_deadline(&mut client);
        assert_eq!(
            client.take(),
            [
                "will_begin_impl_frame",
                "draw_and_swap_if_possible",
                "prepare_tiles",
                "did_finish_impl_frame"
            ]
        );
    }

    #[test]
    fn lost_surface_is_recreated_after_the_frame_ends() {
        let mut client = RecordingClient::default();
        let mut scheduler = initialized_scheduler(&mut client);
        let handle = scheduler.handle();
        scheduler.notify(&mut client, SchedulerMessage::SetNeedsOneBeginImplFrame);
        scheduler.begin_frame(&mut client, args(1));
        client.take();

        handle.send(SchedulerMessage::DidLoseOutputSurface);
        assert_eq!(scheduler.poll(&mut client), DeadlineMode::Immediate);
        assert!(client.take().is_empty());

        scheduler.on_begin_impl_frame_deadline(&mut client);
        assert_eq!(
            client.take(),
            ["did_finish_impl_frame", "begin_output_surface_creation"]
        );
        assert_eq!(
            scheduler.state().output_surface_state(),
            OutputSurfaceState::Creating
        );
    }

    #[test]
    fn handle_outliving_the_scheduler_is_harmless() {
        let scheduler = Scheduler::new(SchedulerSettings::default()).expect("valid settings");
        let handle = scheduler.handle();
        drop(scheduler);
        handle.send(SchedulerMessage::SetNeedsRedraw);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = SchedulerSettings {
            max_pending_swaps: 0,
            ..SchedulerSettings::default()
        };
        assert!(matches!(
            Scheduler::new(settings),
            Err(SchedulerError::InvalidSettings(_))
        ));
    }
}
