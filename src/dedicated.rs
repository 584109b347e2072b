use crate::arena::SlotArena;
use crate::device::{Device, MemoryAllocation};
use crate::error::AllocError;
use crate::mem_allocator::{MappedPtr, MemAllocateInfo, MemAllocator, MemHandle, MemInfo};
use crate::utilization::Utilization;
use erupt::vk;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

struct Allocation<M> {
    memory: M,
    size: u64,
    memory_type_index: u32,
    map_count: u32,
    mapped: Option<MappedPtr>,
}

/// One device memory object per request. Simple, and a useful baseline for debugging the pooled
/// allocators.
pub struct DedicatedMemoryAllocator<D: Device> {
    device: Arc<D>,
    allocations: SlotArena<Allocation<D::Memory>>,
    allocated: u64,
}

impl<D: Device> DedicatedMemoryAllocator<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            allocations: SlotArena::new(),
            allocated: 0,
        }
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    fn release(&mut self, allocation: Allocation<D::Memory>) {
        unsafe {
            if allocation.mapped.is_some() {
                self.device.unmap_memory(allocation.memory);
            }
            self.device.free_memory(allocation.memory);
        }
        self.allocated -= allocation.size;
    }
}

impl<D: Device> MemAllocator for DedicatedMemoryAllocator<D> {
    type Device = D;

    fn device(&self) -> Arc<D> {
        self.device.clone()
    }

    fn alloc_memory(&mut self, info: &MemAllocateInfo<'_, D>) -> Result<MemHandle, AllocError> {
        let size = info.requirements.size;
        if size == 0 {
            return Err(AllocError::ZeroSized);
        }
        let max = self.device.max_allocation_size();
        if size > max {
            return Err(AllocError::TooLarge { size, max });
        }

        let memory_type_index = self
            .device
            .memory_properties()
            .find_memory_type(info.requirements.memory_type_bits, info.properties)
            .ok_or(AllocError::NoCompatibleMemoryType {
                memory_type_bits: info.requirements.memory_type_bits,
                properties: info.properties,
            })?;

        let memory = unsafe {
            self.device.allocate_memory(&MemoryAllocation {
                size,
                memory_type_index,
                dedicated: info.dedicated,
                device_address: info.device_address,
                priority: info.priority,
                debug_name: info.debug_name,
            })?
        };
        debug!(size, memory_type_index, name = ?info.debug_name, "dedicated allocation");

        self.allocated += size;
        Ok(MemHandle(self.allocations.insert(Allocation {
            memory,
            size,
            memory_type_index,
            map_count: 0,
            mapped: None,
        })))
    }

    fn free_memory(&mut self, handle: MemHandle) {
        match self.allocations.remove(handle.0) {
            Some(allocation) => self.release(allocation),
            None => {
                debug_assert!(false, "free of stale handle {:?}", handle);
                warn!(?handle, "free of stale memory handle ignored");
            }
        }
    }

    fn memory_info(&self, handle: MemHandle) -> Option<MemInfo<D::Memory>> {
        self.allocations.get(handle.0).map(|allocation| MemInfo {
            memory: allocation.memory,
            offset: 0,
            size: allocation.size,
        })
    }

    fn map(&mut self, handle: MemHandle, offset: u64, size: u64) -> Result<NonNull<u8>, AllocError> {
        let flags = {
            let allocation = self
                .allocations
                .get(handle.0)
                .ok_or(AllocError::InvalidHandle)?;
            self.device
                .memory_properties()
                .flags(allocation.memory_type_index)
        };
        if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(AllocError::NotMappable);
        }

        let device = self.device.clone();
        let allocation = self
            .allocations
            .get_mut(handle.0)
            .ok_or(AllocError::InvalidHandle)?;
        debug_assert!(offset + size <= allocation.size);

        let mapped = match allocation.mapped {
            Some(mapped) => mapped,
            None => {
                let ptr = unsafe { device.map_memory(allocation.memory, 0, allocation.size)? };
                *allocation.mapped.insert(MappedPtr(ptr))
            }
        };
        allocation.map_count += 1;
        Ok(mapped.offset(offset))
    }

    fn unmap(&mut self, handle: MemHandle) {
        let device = self.device.clone();
        let allocation = match self.allocations.get_mut(handle.0) {
            Some(allocation) if allocation.map_count > 0 => allocation,
            _ => {
                debug_assert!(false, "unmap of unmapped or stale handle {:?}", handle);
                return;
            }
        };

        allocation.map_count -= 1;
        if allocation.map_count == 0 {
            allocation.mapped = None;
            unsafe { device.unmap_memory(allocation.memory) };
        }
    }

    fn utilization(&self) -> Utilization {
        Utilization {
            allocated: self.allocated,
            used: self.allocated,
        }
    }
}

impl<D: Device> Drop for DedicatedMemoryAllocator<D> {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            warn!(
                count = self.allocations.len(),
                "dedicated allocator dropped with live allocations"
            );
        }
        for allocation in self.allocations.drain() {
            self.release(allocation);
        }
    }
}
