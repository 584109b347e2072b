//! Sub-allocation of byte ranges out of large shared buffers.
//!
//! Each block is one buffer bound to its own memory. Requests that fit are carved out of a block
//! with a [`RangeAllocator`]; requests that are too large get a dedicated block holding exactly one
//! allocation.
use crate::arena::{SlotArena, SlotId};
use crate::device::{BufferDesc, Device};
use crate::error::AllocError;
use crate::mem_allocator::{MappedPtr, MemAllocateInfo, MemAllocator, MemHandle};
use crate::range_allocator::{align_up, RangeAllocator};
use crate::utilization::Utilization;
use erupt::vk;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

/// Granularity of offsets and sizes stored in a [`Handle`]
pub const BASE_ALIGNMENT: u64 = 16;

const BLOCK_BITS: u32 = 11;
const OFFSET_BITS: u32 = 26;
const SIZE_BITS: u32 = 26;

const BLOCK_MASK: u64 = (1 << BLOCK_BITS) - 1;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;

const OFFSET_SHIFT: u32 = BLOCK_BITS;
const SIZE_SHIFT: u32 = BLOCK_BITS + OFFSET_BITS;
const DEDICATED_SHIFT: u32 = BLOCK_BITS + OFFSET_BITS + SIZE_BITS;

/// Most blocks one sub-allocator can hold
pub const MAX_BLOCKS: usize = 1 << BLOCK_BITS;

/// Largest block whose offsets still fit in a handle
pub const MAX_BLOCK_SIZE: u64 = OFFSET_MASK * BASE_ALIGNMENT;

/// Dedicated sizes are stored across the offset and size fields
const MAX_DEDICATED_SIZE: u64 = (1 << (OFFSET_BITS + SIZE_BITS)) - 1;

/// Bit-packed sub-allocation: block index (11 bits), offset / 16 (26 bits), size / 16 (26 bits),
/// dedicated flag (1 bit). A dedicated handle stores its byte size in the 52 offset and size bits.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    pub const INVALID: Handle = Handle(u64::MAX);

    /// Pack a handle, or `None` if the fields don't survive the round trip
    pub fn pack(block_index: u32, offset: u64, size: u64, dedicated: bool) -> Option<Self> {
        let block = block_index as u64 & BLOCK_MASK;
        let (offset_field, size_field) = if dedicated {
            (size & OFFSET_MASK, (size >> OFFSET_BITS) & SIZE_MASK)
        } else {
            (
                (offset / BASE_ALIGNMENT) & OFFSET_MASK,
                (size / BASE_ALIGNMENT) & SIZE_MASK,
            )
        };

        let handle = Handle(
            block
                | offset_field << OFFSET_SHIFT
                | size_field << SIZE_SHIFT
                | (dedicated as u64) << DEDICATED_SHIFT,
        );

        let expected_offset = if dedicated { 0 } else { offset };
        let round_trips = handle.block_index() == block_index
            && handle.offset() == expected_offset
            && handle.size() == size
            && handle.is_dedicated() == dedicated;
        (round_trips && handle.is_valid()).then(|| handle)
    }

    pub fn from_bits(bits: u64) -> Self {
        Handle(bits)
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn block_index(self) -> u32 {
        (self.0 & BLOCK_MASK) as u32
    }

    pub fn is_dedicated(self) -> bool {
        self.0 >> DEDICATED_SHIFT != 0
    }

    /// Start of the reservation inside the block. Always zero for dedicated handles.
    pub fn offset(self) -> u64 {
        if self.is_dedicated() {
            0
        } else {
            ((self.0 >> OFFSET_SHIFT) & OFFSET_MASK) * BASE_ALIGNMENT
        }
    }

    /// Reserved bytes, including any padding for alignment
    pub fn size(self) -> u64 {
        let offset_field = (self.0 >> OFFSET_SHIFT) & OFFSET_MASK;
        let size_field = (self.0 >> SIZE_SHIFT) & SIZE_MASK;
        if self.is_dedicated() {
            offset_field | size_field << OFFSET_BITS
        } else {
            size_field * BASE_ALIGNMENT
        }
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("Handle(INVALID)");
        }
        f.debug_struct("Handle")
            .field("block", &self.block_index())
            .field("offset", &self.offset())
            .field("size", &self.size())
            .field("dedicated", &self.is_dedicated())
            .finish()
    }
}

/// Whether `size` at `align` can't be described by a pooled handle
pub fn needs_dedicated(size: u64, align: u64) -> bool {
    let padding = if align > BASE_ALIGNMENT { align } else { 0 };
    size.saturating_add(padding) >= (OFFSET_MASK + 1) * BASE_ALIGNMENT
}

/// A handle resolved against the live block table
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Binding<B> {
    pub buffer: B,
    pub offset: u64,
    pub size: u64,
    /// Zero unless the buffers are created with `SHADER_DEVICE_ADDRESS`
    pub address: u64,
}

#[derive(Clone, Debug)]
pub struct SubAllocatorConfig {
    pub block_size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
    /// Keep every block persistently mapped
    pub mapped: bool,
    /// More than one family shares the buffers concurrently
    pub queue_families: Vec<u32>,
    /// Keep one empty block alive instead of freeing it, until `free(true)`
    pub keep_last_block: bool,
    pub debug_name: Option<String>,
}

impl Default for SubAllocatorConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024 * 1024,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            mapped: false,
            queue_families: Vec::new(),
            keep_last_block: false,
            debug_name: None,
        }
    }
}

impl SubAllocatorConfig {
    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn memory_properties(mut self, properties: vk::MemoryPropertyFlags) -> Self {
        self.memory_properties = properties;
        self
    }

    pub fn mapped(mut self, mapped: bool) -> Self {
        self.mapped = mapped;
        self
    }

    pub fn queue_families(mut self, families: Vec<u32>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn keep_last_block(mut self, keep: bool) -> Self {
        self.keep_last_block = keep;
        self
    }

    pub fn debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }
}

pub type BufferOf<A> = <<A as MemAllocator>::Device as Device>::Buffer;

struct SubBlock<B> {
    buffer: B,
    memory: MemHandle,
    size: u64,
    mapping: Option<MappedPtr>,
    address: u64,
    /// `None` for dedicated blocks
    range: Option<RangeAllocator>,
    used: u64,
}

/// Sub-allocates byte ranges of large buffers
pub struct BufferSubAllocator<A: MemAllocator> {
    allocator: A,
    device: Arc<A::Device>,
    config: SubAllocatorConfig,
    blocks: SlotArena<SubBlock<BufferOf<A>>>,
    allocated: u64,
    used: u64,
}

impl<A: MemAllocator> BufferSubAllocator<A> {
    pub fn new(allocator: A, mut config: SubAllocatorConfig) -> Self {
        config.block_size = config.block_size.min(MAX_BLOCK_SIZE) & !(BASE_ALIGNMENT - 1);
        config.block_size = config.block_size.max(BASE_ALIGNMENT);
        Self {
            device: allocator.device(),
            allocator,
            config,
            blocks: SlotArena::new(),
            allocated: 0,
            used: 0,
        }
    }

    pub fn config(&self) -> &SubAllocatorConfig {
        &self.config
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn device(&self) -> &Arc<A::Device> {
        &self.device
    }

    pub fn set_keep_last_block(&mut self, keep: bool) {
        self.config.keep_last_block = keep;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Blocks shared by pooled allocations
    pub fn regular_block_count(&self) -> usize {
        self.blocks.values().filter(|block| block.range.is_some()).count()
    }

    pub fn block_buffer(&self, block_index: u32) -> Option<BufferOf<A>> {
        let id = self.blocks.id_at(block_index)?;
        self.blocks.get(id).map(|block| block.buffer)
    }

    pub fn utilization(&self) -> Utilization {
        Utilization {
            allocated: self.allocated,
            used: self.used,
        }
    }

    /// Reserve `size` bytes aligned to `align`, a power of two
    pub fn sub_allocate(&mut self, size: u64, align: u64) -> Result<Handle, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSized);
        }
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());

        let dedicated = needs_dedicated(size, align) || size > self.config.block_size;
        if dedicated && size >= MAX_DEDICATED_SIZE {
            return Err(AllocError::TooLarge {
                size,
                max: MAX_DEDICATED_SIZE,
            });
        }

        if !dedicated {
            if let Some(handle) = self.allocate_from_existing(size, align) {
                return Ok(handle);
            }
        }

        if self.blocks.len() >= MAX_BLOCKS {
            return Err(AllocError::TooManyBlocks(MAX_BLOCKS));
        }

        let block_size = if dedicated {
            size
        } else {
            align_up(self.config.block_size.max(size), BASE_ALIGNMENT)
        };
        let mut block = self.create_block(block_size, dedicated)?;

        let reservation = match block.range.as_mut() {
            None => Some((0, size)),
            Some(range) => range.sub_allocate(size, align).map(|sub| (sub.offset, sub.size)),
        };
        let (offset, reserved) = match reservation {
            Some(reservation) => reservation,
            None => {
                self.release_block(block);
                return Err(AllocError::TooLarge {
                    size,
                    max: block_size,
                });
            }
        };
        block.used = reserved;

        let index = self.blocks.next_index();
        let handle = pack_checked(index, offset, reserved, dedicated);

        self.allocated += block.size;
        self.used += reserved;
        let id = self.blocks.insert(block);
        debug_assert_eq!(id.index(), index);

        Ok(handle)
    }

    fn allocate_from_existing(&mut self, size: u64, align: u64) -> Option<Handle> {
        let (id, sub) = self.blocks.iter_mut().find_map(|(id, block)| {
            let sub = block.range.as_mut()?.sub_allocate(size, align)?;
            block.used += sub.size;
            Some((id, sub))
        })?;
        self.used += sub.size;
        Some(pack_checked(id.index(), sub.offset, sub.size, false))
    }

    /// Return a sub-allocation. Dedicated blocks, and pooled blocks left empty, are freed
    /// immediately unless `keep_last_block` holds the last pooled one.
    pub fn sub_free(&mut self, handle: Handle) {
        if !handle.is_valid() {
            return;
        }
        let id = match self.blocks.id_at(handle.block_index()) {
            Some(id) => id,
            None => {
                debug_assert!(false, "free of {:?} in a missing block", handle);
                warn!(?handle, "free of sub-allocation in a missing block ignored");
                return;
            }
        };

        if handle.is_dedicated() {
            // The slot may have been reused by a pooled block since this handle was issued
            let dedicated = self.blocks.get(id).map_or(false, |b| b.range.is_none());
            if !dedicated {
                debug_assert!(false, "dedicated handle {:?} refers to a pooled block", handle);
                warn!(?handle, "free of stale dedicated handle ignored");
                return;
            }
            self.destroy_block(id);
            return;
        }

        let keep = self.config.keep_last_block && self.regular_block_count() <= 1;
        let empty = match self.blocks.get_mut(id) {
            Some(SubBlock {
                range: Some(range),
                used,
                ..
            }) => {
                range.sub_free(handle.offset(), handle.size());
                *used -= handle.size();
                range.is_empty()
            }
            _ => {
                debug_assert!(false, "pooled handle {:?} refers to a dedicated block", handle);
                warn!(?handle, "free of stale pooled handle ignored");
                return;
            }
        };
        self.used -= handle.size();

        if empty && !keep {
            self.destroy_block(id);
        }
    }

    pub fn binding(&self, handle: Handle) -> Option<Binding<BufferOf<A>>> {
        self.binding_aligned(handle, 1)
    }

    /// Resolve a handle. `align` must be the alignment passed to `sub_allocate`.
    pub fn binding_aligned(&self, handle: Handle, align: u64) -> Option<Binding<BufferOf<A>>> {
        if !handle.is_valid() {
            return None;
        }
        let block = self.blocks.get(self.blocks.id_at(handle.block_index())?)?;

        let mut offset = handle.offset();
        let mut size = handle.size();
        if align > 1 {
            let aligned = align_up(offset, align);
            size = size.checked_sub(aligned - offset)?;
            offset = aligned;
        }

        Some(Binding {
            buffer: block.buffer,
            offset,
            size,
            address: if block.address != 0 {
                block.address + offset
            } else {
                0
            },
        })
    }

    /// Host pointer to the (aligned) start of a sub-allocation in a mapped allocator
    pub fn mapping(&self, handle: Handle, align: u64) -> Option<NonNull<u8>> {
        let binding = self.binding_aligned(handle, align)?;
        let block = self.blocks.get(self.blocks.id_at(handle.block_index())?)?;
        Some(block.mapping?.offset(binding.offset))
    }

    /// The first `len` mapped bytes of a sub-allocation
    pub fn mapped_slice(&mut self, handle: Handle, align: u64, len: usize) -> Option<&mut [u8]> {
        let binding = self.binding_aligned(handle, align)?;
        if len as u64 > binding.size {
            return None;
        }
        let ptr = self.mapping(handle, align)?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }

    /// Whether an existing block could take the request without creating a new one
    pub fn fits_in_allocated(&self, size: u64, align: u64) -> bool {
        let align = align.max(1);
        if size == 0 || needs_dedicated(size, align) || size > self.config.block_size {
            return false;
        }
        self.blocks
            .values()
            .filter_map(|block| block.range.as_ref())
            .any(|range| range.is_available(size, align))
    }

    /// Free empty pooled blocks, or with `only_empty == false` every block
    pub fn free(&mut self, only_empty: bool) {
        let doomed: Vec<SlotId> = self
            .blocks
            .iter()
            .filter(|(_, block)| {
                !only_empty || block.range.as_ref().map_or(false, |range| range.is_empty())
            })
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            self.destroy_block(id);
        }
    }

    fn create_block(
        &mut self,
        size: u64,
        dedicated: bool,
    ) -> Result<SubBlock<BufferOf<A>>, AllocError> {
        let device = self.device.clone();
        let desc = BufferDesc {
            size,
            usage: self.config.usage,
            queue_families: self.config.queue_families.clone(),
        };
        let buffer = unsafe { device.create_buffer(&desc)? };
        let requirements = unsafe { device.buffer_memory_requirements(buffer) };
        let device_address = self
            .config
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);

        let mut info = MemAllocateInfo::new(requirements, self.config.memory_properties)
            .device_address(device_address);
        if requirements.requires_dedicated || (dedicated && requirements.prefers_dedicated) {
            info = info.dedicated_buffer(buffer);
        }
        if let Some(name) = &self.config.debug_name {
            info = info.debug_name(name);
        }

        let memory = match self.allocator.alloc_memory(&info) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer) };
                return Err(err);
            }
        };

        let bound = match self.allocator.memory_info(memory) {
            Some(mem) => unsafe {
                device
                    .bind_buffer_memory(buffer, mem.memory, mem.offset)
                    .map_err(AllocError::from)
            },
            None => Err(AllocError::InvalidHandle),
        };
        let mapping = bound.and_then(|()| {
            if self.config.mapped {
                self.allocator.map(memory, 0, size).map(|ptr| Some(MappedPtr(ptr)))
            } else {
                Ok(None)
            }
        });
        let mapping = match mapping {
            Ok(mapping) => mapping,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer) };
                self.allocator.free_memory(memory);
                return Err(err);
            }
        };

        let address = if device_address {
            unsafe { device.buffer_device_address(buffer) }
        } else {
            0
        };

        debug!(
            size,
            dedicated,
            name = ?self.config.debug_name,
            "created buffer block"
        );
        Ok(SubBlock {
            buffer,
            memory,
            size,
            mapping,
            address,
            range: if dedicated {
                None
            } else {
                Some(RangeAllocator::new(size))
            },
            used: 0,
        })
    }

    fn destroy_block(&mut self, id: SlotId) {
        if let Some(block) = self.blocks.remove(id) {
            self.allocated -= block.size;
            self.used -= block.used;
            self.release_block(block);
        }
    }

    /// Unmap, destroy the buffer, then free its memory
    fn release_block(&mut self, block: SubBlock<BufferOf<A>>) {
        if block.mapping.is_some() {
            self.allocator.unmap(block.memory);
        }
        unsafe { self.device.destroy_buffer(block.buffer) };
        self.allocator.free_memory(block.memory);
        debug!(size = block.size, "freed buffer block");
    }
}

fn pack_checked(block_index: u32, offset: u64, size: u64, dedicated: bool) -> Handle {
    match Handle::pack(block_index, offset, size, dedicated) {
        Some(handle) => handle,
        None => panic!(
            "sub-allocation handle does not round trip: block {} offset {} size {} dedicated {}",
            block_index, offset, size, dedicated
        ),
    }
}

impl<A: MemAllocator> Drop for BufferSubAllocator<A> {
    fn drop(&mut self) {
        if self.used > 0 {
            warn!(
                used = self.used,
                name = ?self.config.debug_name,
                "buffer sub-allocator dropped with live sub-allocations"
            );
        }
        self.free(false);
    }
}
