use parking_lot::Mutex;
use raster_protocol::{ContentId, ResourceFormat};
use serde_json::json;
use tiling_data::geometry::{ContentSize, rect};

use crate::gpu::{GpuInterface, TextureId};

/// CPU memory a one-copy raster paints into before it is uploaded. Kept
/// across frames so a later raster of the same tile can repaint only what
/// changed.
#[derive(Debug)]
pub struct StagingBuffer {
    id: u64,
    size: ContentSize,
    format: ResourceFormat,
    content_id: ContentId,
    last_usage: u64,
    pub(crate) pixels: Vec<u8>,
}

impl StagingBuffer {
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub const fn size(&self) -> ContentSize {
        self.size
    }

    pub fn stride(&self) -> usize {
        self.size.width as usize * self.format.bytes_per_pixel()
    }
}

#[derive(Debug, Default)]
struct StagingState {
    free: Vec<StagingBuffer>,
    in_flight: usize,
    next_id: u64,
    usage_clock: u64,
    shut_down: bool,
}

/// Staging buffers shared by every raster worker.
#[derive(Debug)]
pub struct StagingBufferPool {
    max_staging_buffer_count: usize,
    state: Mutex<StagingState>,
}

impl StagingBufferPool {
    pub fn new(max_staging_buffer_count: usize) -> Self {
        assert!(max_staging_buffer_count > 0, "staging pool needs room for one buffer");
        Self {
            max_staging_buffer_count,
            state: Mutex::new(StagingState::default()),
        }
    }

    /// Takes a buffer for a resource of `size` and `format`, preferring the
    /// one that already holds `previous_content_id`.
    ///
    /// Never fails: with every buffer in flight a new one is allocated past
    /// the limit, and the surplus is dropped again on release.
    pub fn acquire(&self, size: ContentSize, format: ResourceFormat, previous_content_id: ContentId) -> StagingBuffer {
        let mut state = self.state.lock();
        assert!(!state.shut_down, "staging buffer acquired after shutdown");
        let matches = |buffer: &StagingBuffer| buffer.size == size && buffer.format == format;

        let with_content = state.free.iter().position(|buffer| {
            previous_content_id.is_valid() && buffer.content_id == previous_content_id && matches(buffer)
        });
        let reusable = with_content.or_else(|| {
            state
                .free
                .iter()
                .enumerate()
                .filter(|(_, buffer)| matches(buffer))
                .min_by_key(|(_, buffer)| buffer.last_usage)
                .map(|(index, _)| index)
        });
        if let Some(index) = reusable {
            state.in_flight += 1;
            return state.free.swap_remove(index);
        }

        if state.free.len() + state.in_flight >= self.max_staging_buffer_count {
            let oldest = state
                .free
                .iter()
                .enumerate()
                .min_by_key(|(_, buffer)| buffer.last_usage)
                .map(|(index, _)| index);
            match oldest {
                Some(index) => {
                    let evicted = state.free.swap_remove(index);
                    log::trace!("evicting staging buffer {} for a new size", evicted.id);
                }
                None => log::debug!(
                    "all {} staging buffers in flight, allocating past the limit of {}",
                    state.in_flight,
                    self.max_staging_buffer_count
                ),
            }
        }

        state.next_id += 1;
        state.in_flight += 1;
        StagingBuffer {
            id: state.next_id,
            size,
            format,
            content_id: ContentId::INVALID,
            last_usage: 0,
            pixels: vec![0; format.memory_size_bytes(size)],
        }
    }

    pub fn release(&self, mut buffer: StagingBuffer, content_id: ContentId) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.shut_down {
            return;
        }
        if state.free.len() + state.in_flight >= self.max_staging_buffer_count {
            log::trace!("dropping surplus staging buffer {}", buffer.id);
            return;
        }
        state.usage_clock += 1;
        buffer.content_id = content_id;
        buffer.last_usage = state.usage_clock;
        state.free.push(buffer);
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Drops every free buffer. Buffers still in flight are dropped when they
    /// come back.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        state.free.clear();
    }

    pub fn as_value(&self) -> serde_json::Value {
        let state = self.state.lock();
        json!({
            "free": state.free.len(),
            "in_flight": state.in_flight,
            "max": self.max_staging_buffer_count,
        })
    }
}

/// Bytes copied since the last flush, shared by all copies on one context.
#[derive(Debug, Default)]
pub(crate) struct CopyBudget {
    bytes_since_flush: Mutex<usize>,
}

impl CopyBudget {
    /// Uploads `staging` to `texture` in row chunks of at most
    /// `max_bytes_per_copy_operation` (rounded up to four rows), flushing
    /// whenever the bytes issued since the last flush reach that budget.
    /// Returns the number of copies issued.
    pub(crate) fn copy_in_chunks(
        &self,
        gpu: &dyn GpuInterface,
        staging: &StagingBuffer,
        texture: TextureId,
        max_bytes_per_copy_operation: usize,
    ) -> usize {
        let bytes_per_row = staging.stride();
        let height = staging.size.height.max(0) as usize;
        if bytes_per_row == 0 || height == 0 {
            return 0;
        }
        let chunk_rows = (max_bytes_per_copy_operation / bytes_per_row).max(1).next_multiple_of(4);

        // One copy stream at a time keeps the flush accounting exact.
        let mut bytes_since_flush = self.bytes_since_flush.lock();
        let mut copies = 0;
        let mut y = 0;
        while y < height {
            let rows = chunk_rows.min(height - y);
            let chunk = rect(0, y as i32, staging.size.width, rows as i32);
            let start = y * bytes_per_row;
            gpu.copy_to_texture(
                texture,
                chunk,
                &staging.pixels[start..start + rows * bytes_per_row],
                bytes_per_row,
            );
            copies += 1;
            y += rows;

            *bytes_since_flush += rows * bytes_per_row;
            if *bytes_since_flush >= max_bytes_per_copy_operation {
                gpu.flush();
                *bytes_since_flush = 0;
            }
        }
        copies
    }
}
