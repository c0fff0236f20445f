use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use raster_buffer::{RasterBuffer, RasterError};
use raster_protocol::{ContentId, PlaybackSettings, RasterTaskId, SharedRasterSource, TileId};
use tiles::TileKey;
use tiling_data::geometry::ContentRect;

use crate::TileManagerError;

/// Everything a worker needs to raster one tile, captured when the task is
/// created so later changes to the tile cannot race with playback.
#[derive(Debug)]
pub struct RasterTask {
    pub id: RasterTaskId,
    pub tile: TileKey,
    pub tile_id: TileId,
    /// Lower runs first.
    pub priority: u32,
    pub buffer: RasterBuffer,
    pub raster_source: SharedRasterSource,
    pub raster_full_rect: ContentRect,
    pub raster_dirty_rect: ContentRect,
    pub new_content_id: ContentId,
    pub contents_scale: f32,
    pub playback_settings: PlaybackSettings,
}

impl RasterTask {
    fn run(mut self) -> RasterTaskCompletion {
        log::trace!("raster task {:?} for tile {:?}", self.id, self.tile_id);
        let result = self.buffer.playback(
            &self.raster_source,
            self.raster_full_rect,
            self.raster_dirty_rect,
            self.new_content_id,
            self.contents_scale,
            &self.playback_settings,
        );
        let outcome = match result {
            Ok(()) => RasterOutcome::Finished,
            Err(error) => RasterOutcome::Failed(error),
        };
        self.complete(outcome)
    }

    fn complete(self, outcome: RasterOutcome) -> RasterTaskCompletion {
        RasterTaskCompletion {
            id: self.id,
            tile: self.tile,
            tile_id: self.tile_id,
            buffer: self.buffer,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterOutcome {
    Finished,
    /// Never ran; the buffer holds nothing.
    Canceled,
    Failed(RasterError),
}

/// Sent back to the compositor thread for every scheduled task, whether it
/// ran or not.
#[derive(Debug)]
pub struct RasterTaskCompletion {
    pub id: RasterTaskId,
    pub tile: TileKey,
    pub tile_id: TileId,
    pub buffer: RasterBuffer,
    pub outcome: RasterOutcome,
}

struct QueuedTask(RasterTask);

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: the smallest priority value, then the oldest task, is on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .0
            .priority
            .cmp(&self.0.priority)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

#[derive(Default)]
struct TaskQueue {
    pending: BinaryHeap<QueuedTask>,
    running: usize,
}

struct Shared {
    queue: Mutex<TaskQueue>,
    completions: Sender<RasterTaskCompletion>,
}

impl Shared {
    fn send(&self, completion: RasterTaskCompletion) {
        if self.completions.send(completion).is_err() {
            log::debug!("raster completion dropped, tile manager is gone");
        }
    }
}

/// Raster worker threads fed from one priority queue.
pub struct RasterWorkerPool {
    shared: Arc<Shared>,
    wake: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RasterWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterWorkerPool")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending_count())
            .field("running", &self.running_count())
            .finish()
    }
}

impl RasterWorkerPool {
    pub fn start(
        num_threads: usize,
        completions: Sender<RasterTaskCompletion>,
    ) -> Result<Self, TileManagerError> {
        assert!(num_threads > 0, "raster worker pool needs at least one thread");
        let shared = Arc::new(Shared {
            queue: Mutex::new(TaskQueue::default()),
            completions,
        });
        let (wake, wake_receiver) = unbounded();
        let mut pool = Self {
            shared,
            wake: Some(wake),
            workers: Vec::with_capacity(num_threads),
        };
        for index in 0..num_threads {
            let shared = Arc::clone(&pool.shared);
            let wake_receiver = wake_receiver.clone();
            let worker = std::thread::Builder::new()
                .name(format!("raster_worker_{index}"))
                .spawn(move || raster_worker_loop(&shared, &wake_receiver))
                .map_err(TileManagerError::WorkerSpawn)?;
            pool.workers.push(worker);
        }
        log::debug!("started {num_threads} raster workers");
        Ok(pool)
    }

    /// Replaces the set of pending tasks.
    ///
    /// Pending tasks listed in `retained` stay queued with their new
    /// priority; every other pending task is canceled and reported through
    /// the completion channel. Running tasks are left alone.
    pub fn schedule(&self, tasks: Vec<RasterTask>, retained: &HashMap<RasterTaskId, u32>) {
        let woken = {
            let mut queue = self.shared.queue.lock();
            let previous = std::mem::take(&mut queue.pending).into_vec();
            for QueuedTask(mut task) in previous {
                match retained.get(&task.id) {
                    Some(&priority) => {
                        task.priority = priority;
                        queue.pending.push(QueuedTask(task));
                    }
                    None => {
                        log::trace!("canceled raster task {:?}", task.id);
                        self.shared.send(task.complete(RasterOutcome::Canceled));
                    }
                }
            }
            queue.pending.extend(tasks.into_iter().map(QueuedTask));
            queue.pending.len()
        };
        if let Some(wake) = &self.wake {
            for _ in 0..woken.min(self.workers.len()) {
                let _ = wake.send(());
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.shared.queue.lock().running
    }
}

impl Drop for RasterWorkerPool {
    fn drop(&mut self) {
        self.schedule(Vec::new(), &HashMap::new());
        // Workers exit once the wake channel disconnects.
        self.wake.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("raster worker panicked");
            }
        }
    }
}

fn raster_worker_loop(shared: &Shared, wake: &Receiver<()>) {
    while wake.recv().is_ok() {
        loop {
            let task = {
                let mut queue = shared.queue.lock();
                let task = queue.pending.pop();
                if task.is_some() {
                    queue.running += 1;
                }
                task
            };
            let Some(QueuedTask(task)) = task else {
                break;
            };
            let completion = task.run();
            shared.queue.lock().running -= 1;
            shared.send(completion);
        }
    }
}
