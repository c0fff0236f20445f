use std::sync::Arc;

use bitvec::vec::BitVec;
use parking_lot::Mutex;
use raster_protocol::{ContentId, ResourceFormat, ResourceId, SyncToken};
use serde_json::json;
use tiling_data::geometry::ContentSize;

use crate::ResourcePoolError;
use crate::gpu::{GpuInterface, TextureId};

/// CPU pixel memory of a resource, written by raster workers. Allocated on
/// first use.
pub type PixelMemory = Arc<Mutex<Vec<u8>>>;

/// What a raster task needs to write a pooled resource. Cloning shares the
/// pixel memory and the sync token slot.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub id: ResourceId,
    pub size: ContentSize,
    pub format: ResourceFormat,
    pub texture: TextureId,
    pub pixels: PixelMemory,
    sync_token: Arc<Mutex<SyncToken>>,
}

impl ResourceHandle {
    pub fn sync_token(&self) -> SyncToken {
        *self.sync_token.lock()
    }

    /// Publishes the token the compositor waits on before reading the
    /// resource.
    pub fn set_sync_token(&self, token: SyncToken) {
        *self.sync_token.lock() = token;
    }

    pub fn memory_size_bytes(&self) -> usize {
        self.format.memory_size_bytes(self.size)
    }
}

#[derive(Debug)]
pub struct PoolResource {
    handle: ResourceHandle,
    content_id: ContentId,
    last_usage: u64,
}

impl PoolResource {
    pub const fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    pub const fn content_id(&self) -> ContentId {
        self.content_id
    }
}

/// Recycles raster resources by size and format.
///
/// Slots are reused after deletion; the generation stored next to each slot
/// is bumped on delete so ids of deleted resources are rejected.
#[derive(Debug)]
pub struct ResourcePool {
    gpu: Arc<dyn GpuInterface>,
    slots: Vec<Option<PoolResource>>,
    generations: Vec<u32>,
    free_slots: Vec<u32>,
    in_use: BitVec,
    max_memory_usage_bytes: usize,
    max_resource_count: usize,
    memory_usage_bytes: usize,
    usage_clock: u64,
}

impl ResourcePool {
    pub fn new(gpu: Arc<dyn GpuInterface>, max_memory_usage_bytes: usize, max_resource_count: usize) -> Self {
        Self {
            gpu,
            slots: Vec::new(),
            generations: Vec::new(),
            free_slots: Vec::new(),
            in_use: BitVec::new(),
            max_memory_usage_bytes,
            max_resource_count,
            memory_usage_bytes: 0,
            usage_clock: 0,
        }
    }

    /// Hands out an unused resource of `size` and `format`, creating one if
    /// none is free. The contents of a reused resource are unknown to the
    /// caller.
    pub fn acquire_resource(&mut self, size: ContentSize, format: ResourceFormat) -> ResourceHandle {
        let reusable = self
            .unused_slots()
            .filter(|&slot| {
                let handle = &self.resource_at(slot).handle;
                handle.size == size && handle.format == format
            })
            .min_by_key(|&slot| self.resource_at(slot).last_usage);
        if let Some(slot) = reusable {
            log::trace!("reusing resource in slot {slot}");
            return self.mark_in_use(slot);
        }

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(self.slots.len())
                    .unwrap_or_else(|_| panic!("resource pool slot count overflow"));
                self.slots.push(None);
                self.generations.push(0);
                self.in_use.push(false);
                slot
            }
        };
        let id = ResourceId {
            slot,
            generation: self.generations[slot as usize],
        };
        let handle = ResourceHandle {
            id,
            size,
            format,
            texture: self.gpu.create_texture(size, format),
            pixels: Arc::new(Mutex::new(Vec::new())),
            sync_token: Arc::new(Mutex::new(SyncToken::EMPTY)),
        };
        self.memory_usage_bytes += handle.memory_size_bytes();
        self.slots[slot as usize] = Some(PoolResource {
            handle,
            content_id: ContentId::INVALID,
            last_usage: 0,
        });
        log::trace!("created resource {id:?} of {size:?}");
        self.mark_in_use(slot)
    }

    /// Hands out the unused resource that holds `content_id`, for raster that
    /// only repaints the invalidated part.
    pub fn try_acquire_resource_with_content_id(&mut self, content_id: ContentId) -> Option<ResourceHandle> {
        if !content_id.is_valid() {
            return None;
        }
        let slot = self
            .unused_slots()
            .find(|&slot| self.resource_at(slot).content_id == content_id)?;
        log::trace!("reusing content {content_id:?} in slot {slot}");
        Some(self.mark_in_use(slot))
    }

    /// Returns a resource to the pool, tagged with the content it now holds.
    pub fn release_resource(&mut self, id: ResourceId, content_id: ContentId) -> Result<(), ResourcePoolError> {
        let slot = self.check_id(id)?;
        if !self.in_use[slot] {
            return Err(ResourcePoolError::NotInUse(id));
        }
        self.in_use.set(slot, false);
        self.usage_clock += 1;
        let usage = self.usage_clock;
        let resource = self.slots[slot]
            .as_mut()
            .unwrap_or_else(|| panic!("checked slot {slot} is empty"));
        resource.content_id = content_id;
        resource.last_usage = usage;
        Ok(())
    }

    pub fn resource(&self, id: ResourceId) -> Result<&PoolResource, ResourcePoolError> {
        let slot = self.check_id(id)?;
        Ok(self.resource_at(slot as u32))
    }

    pub fn set_resource_usage_limits(&mut self, max_memory_usage_bytes: usize, max_resource_count: usize) {
        self.max_memory_usage_bytes = max_memory_usage_bytes;
        self.max_resource_count = max_resource_count;
        self.reduce_resource_usage();
    }

    /// Deletes unused resources, least recently released first, until the
    /// pool is within its limits or nothing unused is left.
    pub fn reduce_resource_usage(&mut self) {
        while self.memory_usage_bytes > self.max_memory_usage_bytes
            || self.resource_count() > self.max_resource_count
        {
            let oldest = self
                .unused_slots()
                .min_by_key(|&slot| self.resource_at(slot).last_usage);
            let Some(slot) = oldest else {
                log::debug!(
                    "resource pool over its limits with {} resources in use",
                    self.in_use_count()
                );
                return;
            };
            self.delete_slot(slot);
        }
    }

    fn delete_slot(&mut self, slot: u32) {
        let index = slot as usize;
        let Some(resource) = self.slots[index].take() else {
            return;
        };
        self.memory_usage_bytes -= resource.handle.memory_size_bytes();
        self.gpu.delete_texture(resource.handle.texture);
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.in_use.set(index, false);
        self.free_slots.push(slot);
        log::trace!("deleted resource {:?}", resource.handle.id);
    }

    pub const fn memory_usage_bytes(&self) -> usize {
        self.memory_usage_bytes
    }

    pub fn resource_count(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.count_ones()
    }

    pub fn in_use_memory_usage_bytes(&self) -> usize {
        self.in_use
            .iter_ones()
            .map(|slot| self.resource_at(slot as u32).handle.memory_size_bytes())
            .sum()
    }

    pub const fn max_memory_usage_bytes(&self) -> usize {
        self.max_memory_usage_bytes
    }

    pub const fn max_resource_count(&self) -> usize {
        self.max_resource_count
    }

    pub fn gpu(&self) -> &Arc<dyn GpuInterface> {
        &self.gpu
    }

    pub fn as_value(&self) -> serde_json::Value {
        json!({
            "resource_count": self.resource_count(),
            "in_use_count": self.in_use_count(),
            "memory_usage_bytes": self.memory_usage_bytes,
            "max_memory_usage_bytes": self.max_memory_usage_bytes,
            "max_resource_count": self.max_resource_count,
        })
    }

    fn check_id(&self, id: ResourceId) -> Result<usize, ResourcePoolError> {
        let slot = id.slot as usize;
        let Some(&current) = self.generations.get(slot) else {
            return Err(ResourcePoolError::UnknownResource(id));
        };
        if current != id.generation {
            return Err(ResourcePoolError::StaleResource { id, current });
        }
        if self.slots[slot].is_none() {
            return Err(ResourcePoolError::UnknownResource(id));
        }
        Ok(slot)
    }

    fn unused_slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(slot, resource)| resource.is_some() && !self.in_use[*slot])
            .map(|(slot, _)| slot as u32)
    }

    fn resource_at(&self, slot: u32) -> &PoolResource {
        self.slots[slot as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("resource slot {slot} is empty"))
    }

    fn mark_in_use(&mut self, slot: u32) -> ResourceHandle {
        self.in_use.set(slot as usize, true);
        self.resource_at(slot).handle.clone()
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        let in_use = self.in_use_count();
        if in_use > 0 {
            log::warn!("resource pool dropped with {in_use} resources in use");
        }
        for resource in self.slots.iter().flatten() {
            self.gpu.delete_texture(resource.handle.texture);
        }
    }
}
