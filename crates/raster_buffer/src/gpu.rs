use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use raster_protocol::{ResourceFormat, SyncToken};
use serde::{Deserialize, Serialize};
use tiling_data::geometry::{ContentRect, ContentSize, IntRectExt};

use crate::canvas::{PictureCanvas, SoftwareCanvas};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextureId(pub u64);

/// The GPU context raster work is issued on.
///
/// Calls may come from raster workers and the compositor thread at once;
/// implementations serialize them into one command stream.
pub trait GpuInterface: Send + Sync + fmt::Debug {
    fn create_texture(&self, size: ContentSize, format: ResourceFormat) -> TextureId;
    fn delete_texture(&self, texture: TextureId);
    /// Uploads `rect` of `texture` from rows of `pixels` spaced `stride`
    /// bytes apart.
    fn copy_to_texture(&self, texture: TextureId, rect: ContentRect, pixels: &[u8], stride: usize);
    /// Replays a recorded picture onto the surface backed by `texture`.
    fn draw_picture(&self, texture: TextureId, picture: &PictureCanvas);
    /// Imports a shared memory buffer as the contents of `texture`.
    fn bind_tex_image(&self, texture: TextureId, pixels: &[u8], stride: usize);
    fn flush(&self);
    fn ordering_barrier(&self);
    /// Inserts a fence and returns its release count.
    fn insert_fence(&self) -> u64;
    fn generate_unverified_sync_token(&self, release_count: u64) -> SyncToken;
    fn wait_sync_token(&self, token: SyncToken);
    fn is_context_lost(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuCommand {
    CreateTexture {
        texture: TextureId,
        size: ContentSize,
        format: ResourceFormat,
    },
    DeleteTexture(TextureId),
    CopyToTexture {
        texture: TextureId,
        rect: ContentRect,
        bytes: usize,
    },
    DrawPicture {
        texture: TextureId,
        ops: usize,
    },
    BindTexImage(TextureId),
    Flush,
    OrderingBarrier,
    InsertFence(u64),
    GenerateSyncToken(SyncToken),
    WaitSyncToken(SyncToken),
}

#[derive(Debug)]
struct Texture {
    size: ContentSize,
    format: ResourceFormat,
    pixels: Vec<u8>,
}

impl Texture {
    fn stride(&self) -> usize {
        self.size.width as usize * self.format.bytes_per_pixel()
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    commands: Vec<GpuCommand>,
    textures: HashMap<TextureId, Texture>,
}

/// An in-process GPU that keeps texture contents in memory and logs every
/// command it receives.
#[derive(Debug)]
pub struct RecordingGpu {
    command_buffer_id: u64,
    state: Mutex<RecordingState>,
    next_texture: AtomicU64,
    release_count: AtomicU64,
    context_lost: AtomicBool,
}

impl RecordingGpu {
    pub fn new(command_buffer_id: u64) -> Self {
        Self {
            command_buffer_id,
            state: Mutex::new(RecordingState::default()),
            next_texture: AtomicU64::new(1),
            release_count: AtomicU64::new(0),
            context_lost: AtomicBool::new(false),
        }
    }

    pub fn lose_context(&self) {
        log::warn!("gpu context {} lost", self.command_buffer_id);
        self.context_lost.store(true, Ordering::Release);
    }

    pub fn commands(&self) -> Vec<GpuCommand> {
        self.state.lock().commands.clone()
    }

    pub fn count_commands(&self, matches: impl Fn(&GpuCommand) -> bool) -> usize {
        self.state.lock().commands.iter().filter(|command| matches(command)).count()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    /// Tightly packed contents of `texture`, if it exists.
    pub fn texture_pixels(&self, texture: TextureId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .textures
            .get(&texture)
            .map(|texture| texture.pixels.clone())
    }

    fn record(&self, command: GpuCommand) {
        log::trace!("gpu {}: {command:?}", self.command_buffer_id);
        self.state.lock().commands.push(command);
    }

    fn with_texture(&self, texture: TextureId, command: GpuCommand, write: impl FnOnce(&mut Texture)) {
        let mut state = self.state.lock();
        state.commands.push(command);
        if self.is_context_lost() {
            return;
        }
        let target = state
            .textures
            .get_mut(&texture)
            .unwrap_or_else(|| panic!("gpu command on unknown texture {texture:?}"));
        write(target);
    }
}

impl Default for RecordingGpu {
    fn default() -> Self {
        Self::new(1)
    }
}

fn copy_rows(
    target: &mut Texture,
    rect: ContentRect,
    pixels: &[u8],
    stride: usize,
) {
    let bpp = target.format.bytes_per_pixel();
    let row_bytes = rect.size.width as usize * bpp;
    let target_stride = target.stride();
    for row in 0..rect.size.height as usize {
        let source = &pixels[row * stride..row * stride + row_bytes];
        let offset = (rect.origin.y as usize + row) * target_stride + rect.origin.x as usize * bpp;
        target.pixels[offset..offset + row_bytes].copy_from_slice(source);
    }
}

impl GpuInterface for RecordingGpu {
    fn create_texture(&self, size: ContentSize, format: ResourceFormat) -> TextureId {
        let texture = TextureId(self.next_texture.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock();
        state.commands.push(GpuCommand::CreateTexture {
            texture,
            size,
            format,
        });
        state.textures.insert(
            texture,
            Texture {
                size,
                format,
                pixels: vec![0; format.memory_size_bytes(size)],
            },
        );
        texture
    }

    fn delete_texture(&self, texture: TextureId) {
        let mut state = self.state.lock();
        state.commands.push(GpuCommand::DeleteTexture(texture));
        state.textures.remove(&texture);
    }

    fn copy_to_texture(&self, texture: TextureId, rect: ContentRect, pixels: &[u8], stride: usize) {
        let command = GpuCommand::CopyToTexture {
            texture,
            rect,
            bytes: rect.size.height.max(0) as usize * stride,
        };
        self.with_texture(texture, command, |target| {
            assert!(
                target.size.width >= rect.right() && target.size.height >= rect.bottom(),
                "copy of {rect:?} outside a {:?} texture",
                target.size
            );
            copy_rows(target, rect, pixels, stride);
        });
    }

    fn draw_picture(&self, texture: TextureId, picture: &PictureCanvas) {
        let command = GpuCommand::DrawPicture {
            texture,
            ops: picture.ops().len(),
        };
        self.with_texture(texture, command, |target| {
            let (size, format) = (target.size, target.format);
            let mut canvas = SoftwareCanvas::new(&mut target.pixels, size, format);
            picture.replay(&mut canvas);
        });
    }

    fn bind_tex_image(&self, texture: TextureId, pixels: &[u8], stride: usize) {
        self.with_texture(texture, GpuCommand::BindTexImage(texture), |target| {
            let full = tiling_data::geometry::rect(0, 0, target.size.width, target.size.height);
            copy_rows(target, full, pixels, stride);
        });
    }

    fn flush(&self) {
        self.record(GpuCommand::Flush);
    }

    fn ordering_barrier(&self) {
        self.record(GpuCommand::OrderingBarrier);
    }

    fn insert_fence(&self) -> u64 {
        let release_count = self.release_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.record(GpuCommand::InsertFence(release_count));
        release_count
    }

    fn generate_unverified_sync_token(&self, release_count: u64) -> SyncToken {
        let token = SyncToken {
            command_buffer_id: self.command_buffer_id,
            release_count,
            verified_flush: false,
        };
        self.record(GpuCommand::GenerateSyncToken(token));
        token
    }

    fn wait_sync_token(&self, token: SyncToken) {
        if token.has_data() {
            self.record(GpuCommand::WaitSyncToken(token));
        }
    }

    fn is_context_lost(&self) -> bool {
        self.context_lost.load(Ordering::Acquire)
    }
}
