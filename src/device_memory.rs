//! Block-pooling device memory allocator.
//!
//! Requests are bump-allocated out of large device memory blocks. A block is returned to the
//! device once its last allocation is freed.
use crate::arena::{SlotArena, SlotId};
use crate::device::{Device, MemoryAllocation};
use crate::error::AllocError;
use crate::mem_allocator::{MappedPtr, MemAllocateInfo, MemAllocator, MemHandle, MemInfo};
use crate::range_allocator::align_up;
use crate::utilization::Utilization;
use erupt::vk;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024 * 1024;
pub const DEFAULT_PRIORITY: f32 = 0.5;

/// Configuration of a [`DeviceMemoryAllocator`]
#[derive(Clone, Debug)]
pub struct DeviceMemoryConfig {
    /// Size of pooled blocks
    pub block_size: u64,
    /// Requests larger than this get a block of their own. Defaults to two thirds of the block size.
    pub max_pooled_size: Option<u64>,
    /// Keep the first block of each memory type alive once empty, until `trim`
    pub keep_first_block: bool,
    /// Give every request its own block
    pub force_dedicated: bool,
    /// Retry failed device local allocations in host visible memory
    pub fallback_to_host_on_oom: bool,
    /// Lowers the device's per-allocation limit
    pub max_allocation_size: Option<u64>,
    /// The device has `VK_EXT_memory_priority` enabled. Priorities are ignored otherwise.
    pub supports_priority: bool,
    /// Priority of requests that don't carry their own
    pub priority: f32,
    pub debug_name: Option<String>,
}

impl Default for DeviceMemoryConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_pooled_size: None,
            keep_first_block: true,
            force_dedicated: false,
            fallback_to_host_on_oom: false,
            max_allocation_size: None,
            supports_priority: false,
            priority: DEFAULT_PRIORITY,
            debug_name: None,
        }
    }
}

impl DeviceMemoryConfig {
    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn max_pooled_size(mut self, max_pooled_size: u64) -> Self {
        self.max_pooled_size = Some(max_pooled_size);
        self
    }

    pub fn keep_first_block(mut self, keep: bool) -> Self {
        self.keep_first_block = keep;
        self
    }

    pub fn force_dedicated(mut self, force: bool) -> Self {
        self.force_dedicated = force;
        self
    }

    pub fn fallback_to_host_on_oom(mut self, fallback: bool) -> Self {
        self.fallback_to_host_on_oom = fallback;
        self
    }

    pub fn max_allocation_size(mut self, max_allocation_size: u64) -> Self {
        self.max_allocation_size = Some(max_allocation_size);
        self
    }

    pub fn supports_priority(mut self, supported: bool) -> Self {
        self.supports_priority = supported;
        self
    }

    pub fn priority(mut self, priority: f32) -> Self {
        self.priority = priority;
        self
    }

    pub fn debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }

    fn pooled_limit(&self) -> u64 {
        self.max_pooled_size
            .unwrap_or(self.block_size / 3 * 2)
            .min(self.block_size)
    }
}

/// Handle of one allocation, generation checked
pub type AllocationId = MemHandle;

struct Block<M> {
    memory: M,
    size: u64,
    /// Bump offset
    offset: u64,
    allocation_count: u32,
    memory_type_index: u32,
    linear: bool,
    device_address: bool,
    /// Only requests of the same priority share a block
    priority: f32,
    dedicated: bool,
    /// No compatible block existed when this one was created
    first: bool,
    map_count: u32,
    mapped: Option<MappedPtr>,
}

impl<M> Block<M> {
    fn mappable(&self, properties: &crate::device::MemoryProperties) -> bool {
        properties
            .flags(self.memory_type_index)
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Offset a new allocation would get, if it fits
    fn fit(&self, size: u64, alignment: u64) -> Option<u64> {
        let offset = align_up(self.offset, alignment.max(1).next_power_of_two());
        let end = offset.checked_add(size)?;
        (end <= self.size).then(|| offset)
    }
}

struct Allocation {
    block: SlotId,
    offset: u64,
    size: u64,
}

/// Per memory type statistics
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub memory_type_index: u32,
    pub block_count: u32,
    pub allocation_count: u32,
    pub utilization: Utilization,
}

/// Pools device memory into large blocks and bump-allocates from them
pub struct DeviceMemoryAllocator<D: Device> {
    device: Arc<D>,
    config: DeviceMemoryConfig,
    blocks: SlotArena<Block<D::Memory>>,
    allocations: SlotArena<Allocation>,
    allocated: u64,
    used: u64,
}

impl<D: Device> DeviceMemoryAllocator<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self::with_config(device, DeviceMemoryConfig::default())
    }

    pub fn with_config(device: Arc<D>, config: DeviceMemoryConfig) -> Self {
        Self {
            device,
            config,
            blocks: SlotArena::new(),
            allocations: SlotArena::new(),
            allocated: 0,
            used: 0,
        }
    }

    pub fn config(&self) -> &DeviceMemoryConfig {
        &self.config
    }

    /// Set the default priority of later requests, returning the previous one
    pub fn set_priority(&mut self, priority: f32) -> f32 {
        std::mem::replace(&mut self.config.priority, priority)
    }

    /// Per-allocation limit: the device's, lowered by the config
    pub fn max_allocation_size(&self) -> u64 {
        let device = self.device.max_allocation_size();
        self.config
            .max_allocation_size
            .map_or(device, |max| max.min(device))
    }

    fn priority_of(&self, info: &MemAllocateInfo<'_, D>) -> f32 {
        if self.config.supports_priority {
            info.priority.unwrap_or(self.config.priority)
        } else {
            DEFAULT_PRIORITY
        }
    }

    /// Memory, offset and size of a live allocation
    pub fn allocation(&self, id: AllocationId) -> Option<MemInfo<D::Memory>> {
        let allocation = self.allocations.get(id.0)?;
        let block = self.blocks.get(allocation.block)?;
        Some(MemInfo {
            memory: block.memory,
            offset: allocation.offset,
            size: allocation.size,
        })
    }

    pub fn active_block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Statistics for every memory type with at least one block
    pub fn type_stats(&self) -> Vec<TypeStats> {
        let mut stats: Vec<TypeStats> = Vec::new();
        for block in self.blocks.values() {
            let index = match stats
                .iter()
                .position(|s| s.memory_type_index == block.memory_type_index)
            {
                Some(index) => index,
                None => {
                    stats.push(TypeStats {
                        memory_type_index: block.memory_type_index,
                        ..Default::default()
                    });
                    stats.len() - 1
                }
            };
            let entry = &mut stats[index];
            entry.block_count += 1;
            entry.allocation_count += block.allocation_count;
            entry.utilization.allocated += block.size;
        }
        for allocation in self.allocations.values() {
            if let Some(block) = self.blocks.get(allocation.block) {
                if let Some(entry) = stats
                    .iter_mut()
                    .find(|s| s.memory_type_index == block.memory_type_index)
                {
                    entry.utilization.used += allocation.size;
                }
            }
        }
        stats.sort_by_key(|s| s.memory_type_index);
        stats
    }

    /// Log per-heap usage
    pub fn report(&self) {
        let properties = self.device.memory_properties();
        let name = self.config.debug_name.as_deref().unwrap_or("device memory");
        let total = self.utilization();
        info!(
            name,
            blocks = self.blocks.len(),
            allocations = self.allocations.len(),
            allocated = total.allocated,
            used = total.used,
            "allocator report"
        );
        for (heap_index, heap) in properties.memory_heaps.iter().enumerate() {
            let mut heap_total = Utilization::default();
            let mut blocks = 0;
            for stats in self.type_stats() {
                if properties.heap_index(stats.memory_type_index) as usize == heap_index {
                    heap_total += stats.utilization;
                    blocks += stats.block_count;
                }
            }
            if blocks == 0 {
                continue;
            }
            info!(
                heap = heap_index,
                heap_size = heap.size,
                blocks,
                allocated = heap_total.allocated,
                used = heap_total.used,
                "heap usage"
            );
        }
    }

    /// Free the blocks that are only alive because of `keep_first_block`
    pub fn trim(&mut self) {
        let empty: Vec<SlotId> = self
            .blocks
            .iter()
            .filter(|(_, block)| block.allocation_count == 0)
            .map(|(id, _)| id)
            .collect();
        for id in empty {
            self.destroy_block(id);
        }
    }

    /// Free every block, whether or not it still holds live allocations. All outstanding ids
    /// become invalid.
    pub fn free_all(&mut self) {
        if !self.allocations.is_empty() {
            debug!(count = self.allocations.len(), "free_all with live allocations");
        }
        self.allocations.drain();
        self.used = 0;
        for id in self.blocks.ids() {
            self.destroy_block(id);
        }
    }

    fn destroy_block(&mut self, id: SlotId) {
        let block = match self.blocks.remove(id) {
            Some(block) => block,
            None => return,
        };
        unsafe {
            if block.mapped.is_some() {
                if block.map_count > 0 {
                    warn!(map_count = block.map_count, "freeing a block that is still mapped");
                }
                self.device.unmap_memory(block.memory);
            }
            self.device.free_memory(block.memory);
        }
        self.allocated -= block.size;
        debug!(
            size = block.size,
            memory_type_index = block.memory_type_index,
            dedicated = block.dedicated,
            "freed memory block"
        );
    }

    fn find_block(
        &self,
        memory_type_index: u32,
        linear: bool,
        device_address: bool,
        priority: f32,
        size: u64,
        alignment: u64,
    ) -> Option<(SlotId, u64)> {
        self.blocks.iter().find_map(|(id, block)| {
            let compatible = !block.dedicated
                && block.memory_type_index == memory_type_index
                && block.linear == linear
                && block.device_address == device_address
                && block.priority == priority;
            if compatible {
                block.fit(size, alignment).map(|offset| (id, offset))
            } else {
                None
            }
        })
    }

    fn allocate_block(
        &self,
        info: &MemAllocateInfo<'_, D>,
        size: u64,
        memory_type_index: u32,
        dedicated: bool,
        priority: f32,
    ) -> Result<(D::Memory, u32), AllocError> {
        let mut memory_type_index = memory_type_index;
        let allocate = |memory_type_index| unsafe {
            self.device.allocate_memory(&MemoryAllocation {
                size,
                memory_type_index,
                dedicated: if dedicated { info.dedicated } else { None },
                device_address: info.device_address,
                priority: self.config.supports_priority.then(|| priority),
                debug_name: info.debug_name.or(self.config.debug_name.as_deref()),
            })
        };

        let result = match allocate(memory_type_index) {
            Err(err)
                if self.config.fallback_to_host_on_oom
                    && info.properties.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) =>
            {
                let host = self.device.memory_properties().find_memory_type(
                    info.requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                );
                match host {
                    Some(host) => {
                        warn!(size, ?err, "device local allocation failed, falling back to host memory");
                        memory_type_index = host;
                        allocate(host)
                    }
                    None => Err(err),
                }
            }
            other => other,
        };

        match result {
            Ok(memory) => Ok((memory, memory_type_index)),
            Err(err) => {
                error!(size, memory_type_index, ?err, "device memory allocation failed");
                Err(err.into())
            }
        }
    }
}

impl<D: Device> MemAllocator for DeviceMemoryAllocator<D> {
    type Device = D;

    fn device(&self) -> Arc<D> {
        self.device.clone()
    }

    fn alloc_memory(&mut self, info: &MemAllocateInfo<'_, D>) -> Result<MemHandle, AllocError> {
        let size = info.requirements.size;
        if size == 0 {
            return Err(AllocError::ZeroSized);
        }
        let max = self.max_allocation_size();
        if size > max {
            return Err(AllocError::TooLarge { size, max });
        }

        let memory_type_bits = info.requirements.memory_type_bits;
        let memory_type_index = self
            .device
            .memory_properties()
            .find_memory_type(memory_type_bits, info.properties)
            .ok_or(AllocError::NoCompatibleMemoryType {
                memory_type_bits,
                properties: info.properties,
            })?;

        let linear = !info.tiling_optimal;
        let priority = self.priority_of(info);
        let dedicated = info.dedicated.is_some()
            || self.config.force_dedicated
            || size > self.config.pooled_limit();

        if !dedicated {
            let found = self.find_block(
                memory_type_index,
                linear,
                info.device_address,
                priority,
                size,
                info.requirements.alignment,
            );
            if let Some((block_id, offset)) = found {
                if let Some(block) = self.blocks.get_mut(block_id) {
                    block.offset = offset + size;
                    block.allocation_count += 1;
                }
                self.used += size;
                return Ok(MemHandle(self.allocations.insert(Allocation {
                    block: block_id,
                    offset,
                    size,
                })));
            }
        }

        let first = !dedicated
            && !self.blocks.values().any(|block| {
                block.memory_type_index == memory_type_index && block.linear == linear
            });
        let block_size = if dedicated {
            size
        } else {
            self.config.block_size.min(max).max(size)
        };

        // Nothing is recorded until the device has handed out the memory, so a failure leaves
        // the block and allocation tables untouched.
        let (memory, memory_type_index) =
            self.allocate_block(info, block_size, memory_type_index, dedicated, priority)?;

        debug!(
            size = block_size,
            memory_type_index, dedicated, first, "allocated memory block"
        );
        let block = self.blocks.insert(Block {
            memory,
            size: block_size,
            offset: size,
            allocation_count: 1,
            memory_type_index,
            linear,
            device_address: info.device_address,
            priority,
            dedicated,
            first,
            map_count: 0,
            mapped: None,
        });
        self.allocated += block_size;
        self.used += size;

        Ok(MemHandle(self.allocations.insert(Allocation {
            block,
            offset: 0,
            size,
        })))
    }

    fn free_memory(&mut self, handle: MemHandle) {
        let allocation = match self.allocations.remove(handle.0) {
            Some(allocation) => allocation,
            None => {
                debug_assert!(false, "free of stale allocation {:?}", handle);
                warn!(?handle, "free of stale allocation ignored");
                return;
            }
        };
        self.used -= allocation.size;

        let keep_first = self.config.keep_first_block;
        let destroy = match self.blocks.get_mut(allocation.block) {
            Some(block) => {
                block.allocation_count -= 1;
                if block.allocation_count > 0 {
                    false
                } else if block.first && keep_first {
                    block.offset = 0;
                    false
                } else {
                    true
                }
            }
            None => false,
        };

        if destroy {
            self.destroy_block(allocation.block);
        }
    }

    fn memory_info(&self, handle: MemHandle) -> Option<MemInfo<D::Memory>> {
        self.allocation(handle)
    }

    fn map(&mut self, handle: MemHandle, offset: u64, size: u64) -> Result<NonNull<u8>, AllocError> {
        let allocation = self
            .allocations
            .get(handle.0)
            .ok_or(AllocError::InvalidHandle)?;
        debug_assert!(offset + size <= allocation.size);
        let base = allocation.offset + offset;

        let device = self.device.clone();
        let block = self
            .blocks
            .get_mut(allocation.block)
            .ok_or(AllocError::InvalidHandle)?;
        if !block.mappable(device.memory_properties()) {
            return Err(AllocError::NotMappable);
        }

        let mapped = match block.mapped {
            Some(mapped) => mapped,
            None => {
                let ptr = unsafe { device.map_memory(block.memory, 0, block.size)? };
                *block.mapped.insert(MappedPtr(ptr))
            }
        };
        block.map_count += 1;
        Ok(mapped.offset(base))
    }

    fn unmap(&mut self, handle: MemHandle) {
        let block_id = match self.allocations.get(handle.0) {
            Some(allocation) => allocation.block,
            None => {
                debug_assert!(false, "unmap of stale allocation {:?}", handle);
                return;
            }
        };

        let device = self.device.clone();
        if let Some(block) = self.blocks.get_mut(block_id) {
            debug_assert!(block.map_count > 0, "unmap without map");
            if block.map_count == 0 {
                return;
            }
            block.map_count -= 1;
            if block.map_count == 0 {
                block.mapped = None;
                unsafe { device.unmap_memory(block.memory) };
            }
        }
    }

    fn utilization(&self) -> Utilization {
        Utilization {
            allocated: self.allocated,
            used: self.used,
        }
    }
}

impl<D: Device> Drop for DeviceMemoryAllocator<D> {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            warn!(
                count = self.allocations.len(),
                used = self.used,
                "device memory allocator dropped with live allocations"
            );
        }
        self.free_all();
    }
}
