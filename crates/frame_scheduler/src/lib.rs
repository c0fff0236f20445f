//! Frame scheduling for the compositor thread.
//!
//! [`SchedulerStateMachine`] decides what to do next from the current state
//! of the main frame, the pending and active trees and the output surface.
//! [`Scheduler`] feeds it begin frames and messages and performs the chosen
//! actions through a [`SchedulerClient`].

mod begin_frame;
mod scheduler;
mod settings;
mod state_machine;

use thiserror::Error;

pub use begin_frame::{
    BeginFrameArgs, BeginFrameArgsKind, BeginFrameConsumer, BeginFrameProducer,
    SyntheticBeginFrameSource, begin_frame_mailbox,
};
pub use scheduler::{DeadlineMode, Scheduler, SchedulerClient, SchedulerHandle, SchedulerMessage};
pub use settings::SchedulerSettings;
pub use state_machine::{
    Action, BeginImplFrameState, BeginMainFrameState, CommitEarlyOutReason, DrawResult,
    ForcedRedrawOnTimeoutState, OutputSurfaceState, SchedulerStateMachine,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler settings: {0}")]
    InvalidSettings(&'static str),
}

static_assertions::assert_impl_all!(BeginFrameProducer: Send);
static_assertions::assert_not_impl_any!(BeginFrameProducer: Sync, Clone);
static_assertions::assert_impl_all!(SchedulerHandle: Send, Sync, Clone);
static_assertions::assert_impl_all!(SchedulerSettings: Send, Sync, Copy);
