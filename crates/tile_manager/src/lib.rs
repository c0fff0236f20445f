//! Decides which tiles get memory and raster work, runs that work on a
//! worker pool and reports when the trees are ready to activate or draw.
//!
//! [`TileManager::prepare_tiles`] walks the raster queue of the current
//! [`tiles::LayerTrees`] under the memory budget, evicts less valuable
//! tiles to make room and schedules one [`worker_pool::RasterTask`] per tile
//! that needs pixels. Completed tasks come back over a channel and are
//! applied on the compositor thread in [`TileManager::check_for_completed_tasks`].

mod settings;
mod manager;
mod worker_pool;

#[cfg(test)]
mod tests;

use raster_buffer::ResourcePoolError;
use raster_protocol::TileId;
use serde::Serialize;
use thiserror::Error;

pub use settings::TileManagerSettings;
pub use manager::TileManager;
pub use worker_pool::{RasterOutcome, RasterTask, RasterTaskCompletion, RasterWorkerPool};

#[derive(Debug, Error)]
pub enum TileManagerError {
    #[error("failed to spawn raster worker thread")]
    WorkerSpawn(#[source] std::io::Error),
    #[error("invalid tile manager settings: {0}")]
    InvalidSettings(&'static str),
    #[error("raster context lost; recreate it before preparing tiles")]
    ContextLost,
    #[error(transparent)]
    ResourcePool(#[from] ResourcePoolError),
}

/// Signals for the client, drained with [`TileManager::take_notifications`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileManagerNotification {
    ReadyToActivate,
    ReadyToDraw,
    AllTileTasksCompleted,
    TileStateChanged(TileId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Bytes held by tiles and running tasks.
    pub bytes_in_use: usize,
    pub resources_in_use: usize,
    /// Everything the pool owns, including unused resources kept for reuse.
    pub total_bytes: usize,
    pub total_resources: usize,
    pub had_enough_memory_to_schedule_tiles_needed_now: bool,
}

static_assertions::assert_impl_all!(RasterTask: Send);
static_assertions::assert_impl_all!(RasterTaskCompletion: Send);
static_assertions::assert_impl_all!(TileManagerSettings: Send, Sync, Copy);
