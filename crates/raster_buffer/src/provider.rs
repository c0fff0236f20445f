use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::MutexGuard;
use raster_protocol::{
    ContentId, ImageProvider, PlaybackSettings, RasterSource, RecordedImages, ResourceFormat,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tiling_data::geometry::{ContentRect, IntRectExt};

use crate::RasterError;
use crate::canvas::{PictureCanvas, SoftwareCanvas};
use crate::gpu::{GpuInterface, TextureId};
use crate::one_copy::{CopyBudget, StagingBufferPool};
use crate::resource_pool::ResourceHandle;

pub const DEFAULT_MAX_BYTES_PER_COPY_OPERATION: usize = 4 * 1024 * 1024;

/// Where raster output is written before the compositor can draw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RasterBackend {
    /// CPU memory the compositor draws from directly.
    Bitmap,
    /// CPU memory shared with the GPU and imported without a copy.
    ZeroCopy,
    /// A reused staging buffer, uploaded to the resource in bounded chunks.
    #[default]
    OneCopy,
    /// A recorded picture replayed on the GPU.
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub backend: RasterBackend,
    pub format: ResourceFormat,
    pub max_bytes_per_copy_operation: usize,
    pub max_staging_buffer_count: usize,
    /// Lets one-copy raster repaint only the dirty rect of a staging buffer
    /// that still holds the previous content.
    pub use_partial_raster: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            backend: RasterBackend::default(),
            format: ResourceFormat::default(),
            max_bytes_per_copy_operation: DEFAULT_MAX_BYTES_PER_COPY_OPERATION,
            max_staging_buffer_count: 32,
            use_partial_raster: false,
        }
    }
}

#[derive(Debug, Clone)]
struct OneCopyState {
    staging: Arc<StagingBufferPool>,
    budget: Arc<CopyBudget>,
    max_bytes_per_copy_operation: usize,
    use_partial_raster: bool,
}

#[derive(Debug, Clone)]
enum Backend {
    Bitmap,
    ZeroCopy,
    OneCopy(OneCopyState),
    Gpu(Arc<dyn ImageProvider>),
}

impl Backend {
    const fn kind(&self) -> RasterBackend {
        match self {
            Backend::Bitmap => RasterBackend::Bitmap,
            Backend::ZeroCopy => RasterBackend::ZeroCopy,
            Backend::OneCopy(_) => RasterBackend::OneCopy,
            Backend::Gpu(_) => RasterBackend::Gpu,
        }
    }
}

/// Hands out raster buffers for pooled resources.
#[derive(Debug)]
pub struct RasterBufferProvider {
    gpu: Arc<dyn GpuInterface>,
    format: ResourceFormat,
    backend: Backend,
    shut_down: AtomicBool,
}

impl RasterBufferProvider {
    pub fn new(settings: &ProviderSettings, gpu: Arc<dyn GpuInterface>) -> Self {
        let backend = match settings.backend {
            RasterBackend::Bitmap => Backend::Bitmap,
            RasterBackend::ZeroCopy => Backend::ZeroCopy,
            RasterBackend::OneCopy => {
                assert!(
                    settings.max_bytes_per_copy_operation > 0,
                    "one-copy raster needs a non-zero copy budget"
                );
                Backend::OneCopy(OneCopyState {
                    staging: Arc::new(StagingBufferPool::new(settings.max_staging_buffer_count)),
                    budget: Arc::new(CopyBudget::default()),
                    max_bytes_per_copy_operation: settings.max_bytes_per_copy_operation,
                    use_partial_raster: settings.use_partial_raster,
                })
            }
            RasterBackend::Gpu => Backend::Gpu(Arc::new(RecordedImages)),
        };
        log::debug!("raster buffer provider: {:?} {:?}", settings.backend, settings.format);
        Self {
            gpu,
            format: settings.format,
            backend,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Routes image ops of GPU raster through `images`. Software backends
    /// always play images back as recorded.
    pub fn with_image_provider(mut self, images: Arc<dyn ImageProvider>) -> Self {
        match &mut self.backend {
            Backend::Gpu(current) => *current = images,
            other => log::debug!("{:?} raster ignores the image provider", other.kind()),
        }
        self
    }

    pub const fn backend(&self) -> RasterBackend {
        self.backend.kind()
    }

    pub const fn resource_format(&self) -> ResourceFormat {
        self.format
    }

    /// Whether a resource that already holds a tile's previous content can
    /// be repainted in place. One-copy keeps previous content in its staging
    /// buffers instead; zero-copy buffers may still be read by the display.
    pub const fn can_partial_raster_into_provided_resource(&self) -> bool {
        matches!(self.backend, Backend::Bitmap | Backend::Gpu(_))
    }

    /// # Panics
    /// If the provider has been shut down.
    pub fn acquire_buffer_for_raster(
        &self,
        resource: &ResourceHandle,
        resource_content_id: ContentId,
        previous_content_id: ContentId,
    ) -> RasterBuffer {
        assert!(
            !self.shut_down.load(Ordering::Acquire),
            "raster buffer acquired after shutdown"
        );
        RasterBuffer {
            backend: self.backend.clone(),
            gpu: self.gpu.clone(),
            resource: resource.clone(),
            resource_content_id,
            previous_content_id,
        }
    }

    /// Takes a buffer back on the compositor thread once its task is done.
    pub fn release_buffer_for_raster(&self, buffer: RasterBuffer) -> ResourceHandle {
        log::trace!(
            "released raster buffer for {:?}, sync token {:?}",
            buffer.resource.id,
            buffer.resource.sync_token()
        );
        buffer.resource
    }

    /// Orders raster work about to be scheduled after the work already
    /// issued on the raster context.
    pub fn ordering_barrier(&self) {
        match self.backend {
            Backend::Bitmap => {}
            Backend::ZeroCopy | Backend::OneCopy(_) | Backend::Gpu(_) => self.gpu.ordering_barrier(),
        }
    }

    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Backend::OneCopy(state) = &self.backend {
            state.staging.shutdown();
        }
        log::debug!("raster buffer provider {:?} shut down", self.backend());
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn gpu(&self) -> &Arc<dyn GpuInterface> {
        &self.gpu
    }

    pub fn as_value(&self) -> serde_json::Value {
        let staging = match &self.backend {
            Backend::OneCopy(state) => state.staging.as_value(),
            _ => serde_json::Value::Null,
        };
        json!({
            "backend": self.backend(),
            "format": self.format,
            "shut_down": self.is_shut_down(),
            "staging": staging,
        })
    }
}

/// The write target of one raster task. Built on the compositor thread and
/// moved to a worker for [`RasterBuffer::playback`].
#[derive(Debug)]
pub struct RasterBuffer {
    backend: Backend,
    gpu: Arc<dyn GpuInterface>,
    resource: ResourceHandle,
    resource_content_id: ContentId,
    previous_content_id: ContentId,
}

impl RasterBuffer {
    pub const fn resource(&self) -> &ResourceHandle {
        &self.resource
    }

    /// Replays `raster_source` over `raster_full_rect` of content space.
    ///
    /// When the pixels being written already hold `previous_content_id`, only
    /// `raster_dirty_rect` is repainted. On success the resource carries an
    /// unverified sync token for the compositor to wait on.
    ///
    /// # Panics
    /// If the rect left to repaint is empty.
    pub fn playback(
        &mut self,
        raster_source: &RasterSource,
        raster_full_rect: ContentRect,
        raster_dirty_rect: ContentRect,
        new_content_id: ContentId,
        contents_scale: f32,
        settings: &PlaybackSettings,
    ) -> Result<(), RasterError> {
        if self.gpu.is_context_lost() {
            return Err(RasterError::ContextLost);
        }
        let resource = &self.resource;
        let size = resource.size;
        let format = resource.format;
        match &self.backend {
            Backend::Bitmap => {
                let playback_rect = self.playback_rect(raster_full_rect, raster_dirty_rect, self.resource_content_id);
                let mut pixels = resource.pixels.lock();
                pixels.resize(resource.memory_size_bytes(), 0);
                let mut canvas = SoftwareCanvas::new(&mut pixels, size, format);
                raster_source.playback_to_canvas(
                    &mut canvas,
                    raster_full_rect,
                    playback_rect,
                    contents_scale,
                    settings,
                );
            }
            Backend::ZeroCopy => {
                let playback_rect = self.playback_rect(raster_full_rect, raster_dirty_rect, self.resource_content_id);
                let mut mapping = ZeroCopyMapping::map(resource);
                let mut canvas = SoftwareCanvas::new(&mut mapping.pixels, size, format);
                raster_source.playback_to_canvas(
                    &mut canvas,
                    raster_full_rect,
                    playback_rect,
                    contents_scale,
                    settings,
                );
                mapping.unmap(self.gpu.as_ref(), resource.texture);
            }
            Backend::OneCopy(state) => {
                let mut staging = state.staging.acquire(size, format, self.previous_content_id);
                let staged_content_id = if state.use_partial_raster {
                    staging.content_id()
                } else {
                    ContentId::INVALID
                };
                let playback_rect = self.playback_rect(raster_full_rect, raster_dirty_rect, staged_content_id);
                let mut canvas = SoftwareCanvas::new(&mut staging.pixels, size, format);
                raster_source.playback_to_canvas(
                    &mut canvas,
                    raster_full_rect,
                    playback_rect,
                    contents_scale,
                    settings,
                );
                let copies = state.budget.copy_in_chunks(
                    self.gpu.as_ref(),
                    &staging,
                    resource.texture,
                    state.max_bytes_per_copy_operation,
                );
                log::trace!("uploaded {:?} in {copies} copies", resource.id);
                state.staging.release(staging, new_content_id);
            }
            Backend::Gpu(images) => {
                let playback_rect = self.playback_rect(raster_full_rect, raster_dirty_rect, self.resource_content_id);
                let mut picture = PictureCanvas::new();
                raster_source.playback_to_canvas_with_images(
                    &mut picture,
                    raster_full_rect,
                    playback_rect,
                    contents_scale,
                    settings,
                    images.as_ref(),
                );
                self.gpu.draw_picture(resource.texture, &picture);
            }
        }

        if self.gpu.is_context_lost() {
            return Err(RasterError::ContextLost);
        }
        let release_count = self.gpu.insert_fence();
        self.gpu.ordering_barrier();
        let token = self.gpu.generate_unverified_sync_token(release_count);
        self.resource.set_sync_token(token);
        Ok(())
    }

    fn playback_rect(
        &self,
        raster_full_rect: ContentRect,
        raster_dirty_rect: ContentRect,
        target_content_id: ContentId,
    ) -> ContentRect {
        let mut playback_rect = raster_full_rect;
        if self.previous_content_id.is_valid() && self.previous_content_id == target_content_id {
            playback_rect = playback_rect.intersect_rect(&raster_dirty_rect);
        }
        assert!(
            !playback_rect.is_empty(),
            "playback of {:?} with an empty raster rect (full {raster_full_rect:?}, dirty {raster_dirty_rect:?})",
            self.resource.id
        );
        playback_rect
    }
}

/// CPU view of a zero-copy resource's shared memory. The texture sees the
/// pixels once the mapping is unmapped.
struct ZeroCopyMapping<'a> {
    pixels: MutexGuard<'a, Vec<u8>>,
    stride: usize,
}

impl<'a> ZeroCopyMapping<'a> {
    /// # Panics
    /// If the memory is not laid out as tightly packed rows of the resource.
    fn map(resource: &'a ResourceHandle) -> Self {
        let mut pixels = resource.pixels.lock();
        if pixels.is_empty() {
            pixels.resize(resource.memory_size_bytes(), 0);
        }
        let rows = resource.size.height.max(1) as usize;
        let stride = pixels.len() / rows;
        let row_bytes = resource.size.width as usize * resource.format.bytes_per_pixel();
        assert!(
            stride == row_bytes && stride * rows == pixels.len(),
            "zero-copy memory of {:?} has stride {stride} for {} bytes, rows need {row_bytes}",
            resource.id,
            pixels.len()
        );
        Self { pixels, stride }
    }

    fn unmap(self, gpu: &dyn GpuInterface, texture: TextureId) {
        gpu.bind_tex_image(texture, &self.pixels, self.stride);
    }
}
