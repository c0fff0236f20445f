//! Raster targets for tiles: the resource pool, the software canvas, the GPU
//! seam, and the four raster buffer providers.

mod canvas;
mod gpu;
mod one_copy;
mod provider;
mod resource_pool;

use raster_protocol::ResourceId;
use thiserror::Error;

pub use canvas::{PictureCanvas, PictureOp, SoftwareCanvas, decode_pixel, encode_pixel};
pub use gpu::{GpuCommand, GpuInterface, RecordingGpu, TextureId};
pub use one_copy::{StagingBuffer, StagingBufferPool};
pub use provider::{
    ProviderSettings, RasterBackend, RasterBuffer, RasterBufferProvider,
    DEFAULT_MAX_BYTES_PER_COPY_OPERATION,
};
pub use resource_pool::{PixelMemory, PoolResource, ResourceHandle, ResourcePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourcePoolError {
    #[error("resource {0:?} is not in the pool")]
    UnknownResource(ResourceId),
    #[error("resource {id:?} is stale, the slot is at generation {current}")]
    StaleResource { id: ResourceId, current: u32 },
    #[error("resource {0:?} is not in use")]
    NotInUse(ResourceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RasterError {
    #[error("raster context lost, resource contents are undefined")]
    ContextLost,
}

static_assertions::assert_impl_all!(RasterBuffer: Send);
static_assertions::assert_impl_all!(ResourceHandle: Send, Sync);
static_assertions::assert_impl_all!(RasterBufferProvider: Send, Sync);
