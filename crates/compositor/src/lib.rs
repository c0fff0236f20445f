//! The compositor host: owns the layer trees and the tile manager and runs
//! commit, activation, draw and tile preparation when the frame scheduler
//! asks for them.

mod frame_loop;
mod host;
mod settings;

#[cfg(test)]
mod tests;

use std::path::PathBuf;

use frame_scheduler::SchedulerError;
use thiserror::Error;
use tile_manager::TileManagerError;

pub use frame_loop::run_begin_frame;
pub use host::{CommitPayload, CommitSender, FrameStats, LayerTreeHostImpl};
pub use settings::{LayerTreeSettings, MemoryPolicySettings};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings are not valid json")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    TileManager(#[from] TileManagerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

static_assertions::assert_impl_all!(CommitSender: Send, Sync, Clone);
static_assertions::assert_impl_all!(LayerTreeSettings: Send, Sync, Copy);
