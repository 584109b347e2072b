//! Host-visible scratch space for recorded transfers.
//!
//! Staging requests are grouped into sets. The open set collects requests until it is finalized,
//! either with an optional fence that `release_resources` polls, or as a manual set the caller
//! releases explicitly. Staging memory is only recycled once its set is released, so a transfer
//! never sees its source or destination reused while the GPU may still touch it.
use crate::arena::{SlotArena, SlotId};
use crate::buffer_suballocator::{
    Binding, BufferOf, BufferSubAllocator, Handle, SubAllocatorConfig, BASE_ALIGNMENT,
};
use crate::device::{
    texel_block, BufferCopy, BufferImageCopy, Device, Extent3D, ImageSubresourceLayers, Offset3D,
    TexelBlock,
};
use crate::error::AllocError;
use crate::mem_allocator::MemAllocator;
use crate::utilization::Utilization;
use bytemuck::Pod;
use erupt::vk;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_STAGING_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct StagingConfig {
    pub block_size: u64,
    /// Free staging blocks as soon as a release empties them
    pub free_unused_on_release: bool,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_STAGING_BLOCK_SIZE,
            free_unused_on_release: true,
        }
    }
}

impl StagingConfig {
    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn free_unused_on_release(mut self, free: bool) -> Self {
        self.free_unused_on_release = free;
        self
    }
}

/// A finalized set awaiting `release_resource_set`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SetId(SlotId);

/// Receipt for a device-to-host transfer. Its bytes can be read with
/// [`StagingMemoryManager::read`] once the transfer completed, until its set is released.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StagingRead {
    epoch: u64,
    handle: Handle,
    /// Bytes skipped to reach the copy's aligned start
    skip: u64,
    len: usize,
}

impl StagingRead {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Destination or source region of an image transfer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageRegion {
    /// Format of the image, which sets the staging offset alignment and the region's size
    pub format: vk::Format,
    pub subresource: ImageSubresourceLayers,
    pub offset: Offset3D,
    pub extent: Extent3D,
}

impl ImageRegion {
    /// Whole mip 0 of the first layer of a color image
    pub fn color(format: vk::Format, extent: Extent3D) -> Self {
        Self {
            format,
            subresource: ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            offset: Offset3D::default(),
            extent,
        }
    }

    pub fn texel_block(&self) -> Result<TexelBlock, AllocError> {
        texel_block(self.format).ok_or(AllocError::UnsupportedFormat(self.format))
    }

    /// Tightly packed size of the region's texels
    pub fn size(&self) -> Result<u64, AllocError> {
        Ok(self
            .texel_block()?
            .region_size(self.extent, self.subresource.layer_count))
    }
}

/// Staged image data whose copy is not recorded yet. See
/// [`StagingMemoryManager::stage_image_data`].
#[derive(Copy, Clone, Debug)]
pub struct PendingImageCopy<B> {
    buffer: B,
    copy: BufferImageCopy,
}

#[derive(Copy, Clone)]
struct Entry {
    handle: Handle,
    to_device: bool,
}

struct StagingSet<F> {
    epoch: u64,
    entries: Vec<Entry>,
    fence: Option<F>,
    manual: bool,
}

impl<F> StagingSet<F> {
    fn open(epoch: u64) -> Self {
        Self {
            epoch,
            entries: Vec::new(),
            fence: None,
            manual: false,
        }
    }
}

type FenceOf<A> = <<A as MemAllocator>::Device as Device>::Fence;
type CommandBufferOf<A> = <<A as MemAllocator>::Device as Device>::CommandBuffer;
type ImageOf<A> = <<A as MemAllocator>::Device as Device>::Image;

pub struct StagingMemoryManager<A: MemAllocator> {
    device: Arc<A::Device>,
    to_device: BufferSubAllocator<A>,
    from_device: BufferSubAllocator<A>,
    open: StagingSet<FenceOf<A>>,
    finalized: SlotArena<StagingSet<FenceOf<A>>>,
    next_epoch: u64,
    config: StagingConfig,
}

impl<A: MemAllocator + Clone> StagingMemoryManager<A> {
    pub fn new(allocator: A, config: StagingConfig) -> Self {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let to_device = SubAllocatorConfig::default()
            .block_size(config.block_size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .memory_properties(host)
            .mapped(true)
            .keep_last_block(!config.free_unused_on_release)
            .debug_name("staging to device");
        let from_device = SubAllocatorConfig::default()
            .block_size(config.block_size)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .memory_properties(host | vk::MemoryPropertyFlags::HOST_CACHED)
            .mapped(true)
            .keep_last_block(!config.free_unused_on_release)
            .debug_name("staging from device");

        Self {
            device: allocator.device(),
            to_device: BufferSubAllocator::new(allocator.clone(), to_device),
            from_device: BufferSubAllocator::new(allocator, from_device),
            open: StagingSet::open(0),
            finalized: SlotArena::new(),
            next_epoch: 1,
            config,
        }
    }
}

impl<A: MemAllocator> StagingMemoryManager<A> {
    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    pub fn set_free_unused_on_release(&mut self, free: bool) {
        self.config.free_unused_on_release = free;
        self.to_device.set_keep_last_block(!free);
        self.from_device.set_keep_last_block(!free);
    }

    /// Reserve staging space in the open set. The binding starts at a multiple of
    /// `offset_alignment`, `skip` bytes into the sub-allocation.
    fn stage(
        &mut self,
        to_device: bool,
        size: u64,
        offset_alignment: u64,
    ) -> Result<(Handle, Binding<BufferOf<A>>, u64), AllocError> {
        // Offsets are already multiples of the base alignment, other alignments need slack
        let padding = if BASE_ALIGNMENT % offset_alignment == 0 {
            0
        } else {
            offset_alignment
        };
        let reserved = size
            .checked_add(padding)
            .ok_or(AllocError::TooLarge { size, max: u64::MAX - padding })?;

        let pool = if to_device {
            &mut self.to_device
        } else {
            &mut self.from_device
        };
        let handle = pool.sub_allocate(reserved, BASE_ALIGNMENT)?;
        let mut binding = match pool.binding_aligned(handle, BASE_ALIGNMENT) {
            Some(binding) => binding,
            None => {
                pool.sub_free(handle);
                return Err(AllocError::InvalidHandle);
            }
        };

        let skip = (offset_alignment - binding.offset % offset_alignment) % offset_alignment;
        binding.offset += skip;
        binding.size -= skip;
        if binding.address != 0 {
            binding.address += skip;
        }
        self.open.entries.push(Entry { handle, to_device });
        Ok((handle, binding, skip))
    }

    fn staged_bytes(&mut self, handle: Handle, skip: u64, size: u64) -> Result<&mut [u8], AllocError> {
        let bytes = self
            .to_device
            .mapped_slice(handle, BASE_ALIGNMENT, (skip + size) as usize)
            .ok_or(AllocError::NotMappable)?;
        Ok(&mut bytes[skip as usize..])
    }

    /// Record a copy of `data` into `dst` at `dst_offset`
    pub fn cmd_to_buffer(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        dst: BufferOf<A>,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<(), AllocError> {
        self.cmd_to_buffer_uninit(command_buffer, dst, dst_offset, data.len() as u64)?
            .copy_from_slice(data);
        Ok(())
    }

    pub fn cmd_to_buffer_typed<T: Pod>(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        dst: BufferOf<A>,
        dst_offset: u64,
        data: &[T],
    ) -> Result<(), AllocError> {
        self.cmd_to_buffer(command_buffer, dst, dst_offset, bytemuck::cast_slice(data))
    }

    /// Record a copy of `size` staged bytes into `dst`, returning the staging memory for the
    /// caller to fill before submission
    pub fn cmd_to_buffer_uninit(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        dst: BufferOf<A>,
        dst_offset: u64,
        size: u64,
    ) -> Result<&mut [u8], AllocError> {
        let (handle, binding, skip) = self.stage(true, size, 1)?;
        let region = BufferCopy {
            src_offset: binding.offset,
            dst_offset,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(command_buffer, binding.buffer, dst, &[region])
        };
        self.staged_bytes(handle, skip, size)
    }

    /// Record a copy of `data` into an image region. `layout` is the image's current layout and
    /// must allow transfer writes. `data` must hold at least the region's tightly packed texels.
    pub fn cmd_to_image(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        image: ImageOf<A>,
        layout: vk::ImageLayout,
        region: ImageRegion,
        data: &[u8],
    ) -> Result<(), AllocError> {
        self.cmd_to_image_uninit(command_buffer, image, layout, region, data.len() as u64)?
            .copy_from_slice(data);
        Ok(())
    }

    pub fn cmd_to_image_uninit(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        image: ImageOf<A>,
        layout: vk::ImageLayout,
        region: ImageRegion,
        size: u64,
    ) -> Result<&mut [u8], AllocError> {
        let (handle, skip, pending) = self.reserve_image(region, size)?;
        self.cmd_copy_staged_image(command_buffer, image, layout, pending);
        self.staged_bytes(handle, skip, size)
    }

    /// Stage `data` for an image region without recording anything, so the copy can follow
    /// barriers that are only recorded once staging succeeded
    pub fn stage_image_data(
        &mut self,
        region: ImageRegion,
        data: &[u8],
    ) -> Result<PendingImageCopy<BufferOf<A>>, AllocError> {
        let size = data.len() as u64;
        let (handle, skip, pending) = self.reserve_image(region, size)?;
        self.staged_bytes(handle, skip, size)?.copy_from_slice(data);
        Ok(pending)
    }

    /// Record the copy of data staged with `stage_image_data`
    pub fn cmd_copy_staged_image(
        &self,
        command_buffer: CommandBufferOf<A>,
        image: ImageOf<A>,
        layout: vk::ImageLayout,
        pending: PendingImageCopy<BufferOf<A>>,
    ) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                pending.buffer,
                image,
                layout,
                &[pending.copy],
            )
        };
    }

    fn reserve_image(
        &mut self,
        region: ImageRegion,
        size: u64,
    ) -> Result<(Handle, u64, PendingImageCopy<BufferOf<A>>), AllocError> {
        let block = Self::check_region(&region, size)?;
        let (handle, binding, skip) = self.stage(true, size, block.offset_alignment())?;
        let copy = BufferImageCopy {
            buffer_offset: binding.offset,
            subresource: region.subresource,
            image_offset: region.offset,
            image_extent: region.extent,
        };
        Ok((
            handle,
            skip,
            PendingImageCopy {
                buffer: binding.buffer,
                copy,
            },
        ))
    }

    fn check_region(region: &ImageRegion, size: u64) -> Result<TexelBlock, AllocError> {
        let required = region.size()?;
        if size < required {
            return Err(AllocError::ShortImageData { size, required });
        }
        region.texel_block()
    }

    /// Record a copy of `size` bytes of `src` into staging memory
    pub fn cmd_from_buffer(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        src: BufferOf<A>,
        src_offset: u64,
        size: u64,
    ) -> Result<StagingRead, AllocError> {
        let (handle, binding, skip) = self.stage(false, size, 1)?;
        let region = BufferCopy {
            src_offset,
            dst_offset: binding.offset,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(command_buffer, src, binding.buffer, &[region])
        };
        Ok(self.receipt(handle, skip, size))
    }

    /// Record a copy of an image region into `size` bytes of staging memory. `size` must cover
    /// the region's tightly packed texels.
    pub fn cmd_from_image(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        image: ImageOf<A>,
        layout: vk::ImageLayout,
        region: ImageRegion,
        size: u64,
    ) -> Result<StagingRead, AllocError> {
        let block = Self::check_region(&region, size)?;
        let (handle, binding, skip) = self.stage(false, size, block.offset_alignment())?;
        let copy = BufferImageCopy {
            buffer_offset: binding.offset,
            subresource: region.subresource,
            image_offset: region.offset,
            image_extent: region.extent,
        };
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(command_buffer, image, layout, binding.buffer, &[copy])
        };
        Ok(self.receipt(handle, skip, size))
    }

    fn receipt(&self, handle: Handle, skip: u64, size: u64) -> StagingRead {
        StagingRead {
            epoch: self.open.epoch,
            handle,
            skip,
            len: size as usize,
        }
    }

    /// Bytes of a readback. `None` once the set it belongs to was released.
    pub fn read(&self, receipt: &StagingRead) -> Option<&[u8]> {
        let live = self.open.epoch == receipt.epoch
            || self
                .finalized
                .values()
                .any(|set| set.epoch == receipt.epoch);
        if !live {
            return None;
        }
        let ptr = self.from_device.mapping(receipt.handle, BASE_ALIGNMENT)?;
        Some(unsafe {
            std::slice::from_raw_parts(ptr.as_ptr().add(receipt.skip as usize), receipt.len)
        })
    }

    fn close_open_set(&mut self) -> Option<StagingSet<FenceOf<A>>> {
        if self.open.entries.is_empty() {
            return None;
        }
        let next = StagingSet::open(self.next_epoch);
        self.next_epoch += 1;
        Some(std::mem::replace(&mut self.open, next))
    }

    /// Close the open set. It is released by `release_resources` once `fence` signals, or on
    /// the next `release_resources` if no fence is given. Returns false if the set was empty.
    pub fn finalize_resources(&mut self, fence: Option<FenceOf<A>>) -> bool {
        match self.close_open_set() {
            Some(mut set) => {
                set.fence = fence;
                self.finalized.insert(set);
                true
            }
            None => false,
        }
    }

    /// Close the open set for release through `release_resource_set` only
    pub fn finalize_resource_set(&mut self) -> Option<SetId> {
        let mut set = self.close_open_set()?;
        set.manual = true;
        Some(SetId(self.finalized.insert(set)))
    }

    /// Release every fenced set whose fence signaled and every unfenced set. Returns the number
    /// of sets released.
    pub fn release_resources(&mut self) -> Result<usize, AllocError> {
        let mut ready = Vec::new();
        for (id, set) in self.finalized.iter() {
            if set.manual {
                continue;
            }
            let signaled = match set.fence {
                Some(fence) => unsafe { self.device.fence_signaled(fence)? },
                None => true,
            };
            if signaled {
                ready.push(id);
            }
        }

        for id in &ready {
            if let Some(set) = self.finalized.remove(*id) {
                self.release_set(set);
            }
        }
        if !ready.is_empty() {
            debug!(released = ready.len(), pending = self.finalized.len(), "released staging sets");
        }
        Ok(ready.len())
    }

    /// Release a manual set. Returns false for unknown or already released ids.
    pub fn release_resource_set(&mut self, id: SetId) -> bool {
        match self.finalized.get(id.0) {
            Some(set) if set.manual => {}
            _ => return false,
        }
        match self.finalized.remove(id.0) {
            Some(set) => {
                self.release_set(set);
                true
            }
            None => false,
        }
    }

    fn release_set(&mut self, set: StagingSet<FenceOf<A>>) {
        for entry in set.entries {
            if entry.to_device {
                self.to_device.sub_free(entry.handle);
            } else {
                self.from_device.sub_free(entry.handle);
            }
        }
    }

    /// Finalized sets not yet released
    pub fn pending_sets(&self) -> usize {
        self.finalized.len()
    }

    /// Whether `size` bytes fit in existing staging blocks, without allocating
    pub fn fits_in_allocated(&self, size: u64, to_device: bool) -> bool {
        if to_device {
            self.to_device.fits_in_allocated(size, BASE_ALIGNMENT)
        } else {
            self.from_device.fits_in_allocated(size, BASE_ALIGNMENT)
        }
    }

    /// Free empty staging blocks
    pub fn free_unused(&mut self) {
        self.to_device.free(true);
        self.from_device.free(true);
    }

    pub fn utilization(&self) -> Utilization {
        self.to_device.utilization() + self.from_device.utilization()
    }
}

impl<A: MemAllocator> Drop for StagingMemoryManager<A> {
    fn drop(&mut self) {
        let open = std::mem::replace(&mut self.open, StagingSet::open(self.next_epoch));
        self.release_set(open);
        for set in self.finalized.drain() {
            self.release_set(set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedicated::DedicatedMemoryAllocator;
    use crate::device::mock::{Command, MockDevice, MockHandle, HOST_CACHED_TYPE};
    use crate::device::{BufferDesc, MemoryAllocation};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Shared = Rc<RefCell<DedicatedMemoryAllocator<MockDevice>>>;

    fn staging(config: StagingConfig) -> (Arc<MockDevice>, StagingMemoryManager<Shared>) {
        let device = Arc::new(MockDevice::new());
        let allocator = Rc::new(RefCell::new(DedicatedMemoryAllocator::new(device.clone())));
        (device, StagingMemoryManager::new(allocator, config))
    }

    fn device_buffer(device: &MockDevice, size: u64) -> MockHandle {
        unsafe {
            let buffer = device
                .create_buffer(&BufferDesc::new(size, vk::BufferUsageFlags::TRANSFER_DST))
                .unwrap();
            let memory = device
                .allocate_memory(&MemoryAllocation {
                    size,
                    memory_type_index: 0,
                    dedicated: None,
                    device_address: false,
                    priority: None,
                    debug_name: None,
                })
                .unwrap();
            device.bind_buffer_memory(buffer, memory, 0).unwrap();
            buffer
        }
    }

    #[test]
    fn uploads_reach_the_destination() {
        let (device, mut staging) = staging(StagingConfig::default().block_size(4096));
        let dst = device_buffer(&device, 256);
        let cmd = device.command_buffer();

        staging.cmd_to_buffer(cmd, dst, 16, &[1, 2, 3, 4]).unwrap();
        staging.cmd_to_buffer_typed(cmd, dst, 32, &[0x0605_0403u32]).unwrap();
        staging.cmd_to_buffer_uninit(cmd, dst, 64, 2).unwrap().copy_from_slice(&[9, 9]);

        device.execute(cmd);
        assert_eq!(device.read_buffer(dst, 16, 4), vec![1, 2, 3, 4]);
        assert_eq!(device.read_buffer(dst, 32, 4), 0x0605_0403u32.to_ne_bytes().to_vec());
        assert_eq!(device.read_buffer(dst, 64, 2), vec![9, 9]);
        assert_eq!(staging.utilization().used, 48);
    }

    #[test]
    fn fenced_sets_wait_for_their_fence() {
        let (device, mut staging) = staging(StagingConfig::default().block_size(1024));
        let dst = device_buffer(&device, 1024);
        let cmd = device.command_buffer();
        let fence = device.create_fence(false);

        staging.cmd_to_buffer(cmd, dst, 0, &[0; 512]).unwrap();
        assert!(staging.finalize_resources(Some(fence)));
        assert_eq!(staging.release_resources().unwrap(), 0);
        assert_eq!(staging.utilization().used, 512);
        assert!(!staging.fits_in_allocated(1024, true));

        device.signal_fence(fence);
        assert_eq!(staging.release_resources().unwrap(), 1);
        assert_eq!(staging.utilization().used, 0);
        assert_eq!(staging.pending_sets(), 0);
    }

    #[test]
    fn released_space_is_reused_without_new_blocks() {
        let (device, mut staging) = staging(
            StagingConfig::default()
                .block_size(1024)
                .free_unused_on_release(false),
        );
        let dst = device_buffer(&device, 1024);
        let cmd = device.command_buffer();
        let fence = device.create_fence(false);

        staging.cmd_to_buffer(cmd, dst, 0, &[0; 1024]).unwrap();
        let allocations = device.allocations().len();
        staging.finalize_resources(Some(fence));
        device.signal_fence(fence);
        staging.release_resources().unwrap();

        assert!(staging.fits_in_allocated(1024, true));
        staging.cmd_to_buffer(cmd, dst, 0, &[0; 1024]).unwrap();
        assert_eq!(device.allocations().len(), allocations);

        staging.finalize_resources(None);
        staging.release_resources().unwrap();
        staging.free_unused();
        assert_eq!(staging.utilization().allocated, 0);
    }

    #[test]
    fn freeing_on_release_returns_blocks() {
        let (device, mut staging) = staging(StagingConfig::default().block_size(1024));
        let dst = device_buffer(&device, 64);
        let cmd = device.command_buffer();
        staging.cmd_to_buffer(cmd, dst, 0, &[1; 64]).unwrap();
        assert_eq!(staging.utilization().allocated, 1024);

        staging.finalize_resources(None);
        staging.release_resources().unwrap();
        assert_eq!(staging.utilization(), Utilization::default());
    }

    #[test]
    fn only_signaled_sets_are_released() {
        let (device, mut staging) = staging(StagingConfig::default().block_size(4096));
        let dst = device_buffer(&device, 64);
        let cmd = device.command_buffer();
        let (slow, fast) = (device.create_fence(false), device.create_fence(false));

        staging.cmd_to_buffer(cmd, dst, 0, &[1; 32]).unwrap();
        staging.finalize_resources(Some(slow));
        staging.cmd_to_buffer(cmd, dst, 0, &[2; 64]).unwrap();
        staging.finalize_resources(Some(fast));

        device.signal_fence(fast);
        assert_eq!(staging.release_resources().unwrap(), 1);
        assert_eq!(staging.utilization().used, 32);
        assert_eq!(staging.pending_sets(), 1);
    }

    #[test]
    fn manual_sets_skip_the_sweep() {
        let (device, mut staging) = staging(StagingConfig::default().block_size(4096));
        let dst = device_buffer(&device, 64);
        let cmd = device.command_buffer();

        staging.cmd_to_buffer(cmd, dst, 0, &[1; 64]).unwrap();
        let set = staging.finalize_resource_set().unwrap();
        assert_eq!(staging.release_resources().unwrap(), 0);
        assert_eq!(staging.utilization().used, 64);

        assert!(staging.release_resource_set(set));
        assert!(!staging.release_resource_set(set));
        assert_eq!(staging.utilization().used, 0);
    }

    #[test]
    fn empty_sets_are_not_finalized() {
        let (device, mut staging) = staging(StagingConfig::default());
        assert!(!staging.finalize_resources(Some(device.create_fence(true))));
        assert!(staging.finalize_resource_set().is_none());
        assert_eq!(staging.pending_sets(), 0);
    }

    #[test]
    fn readbacks_are_readable_until_release() {
        let (device, mut staging) = staging(StagingConfig::default().block_size(4096));
        let src = device_buffer(&device, 64);
        device.write_buffer(src, 8, &[5, 6, 7]);
        let cmd = device.command_buffer();

        let receipt = staging.cmd_from_buffer(cmd, src, 8, 3).unwrap();
        let pool = device.allocations().last().copied().unwrap();
        assert_eq!(pool.memory_type_index, HOST_CACHED_TYPE);
        device.execute(cmd);
        assert_eq!(staging.read(&receipt), Some(&[5u8, 6, 7][..]));
        assert_eq!(receipt.len(), 3);

        let fence = device.create_fence(true);
        staging.finalize_resources(Some(fence));
        assert!(staging.read(&receipt).is_some());
        staging.release_resources().unwrap();
        assert!(staging.read(&receipt).is_none());
    }

    #[test]
    fn image_transfers_record_their_regions() {
        let (device, mut staging) = staging(StagingConfig::default().block_size(4096));
        let cmd = device.command_buffer();
        let region = ImageRegion::color(vk::Format::R8G8B8A8_UNORM, Extent3D::new(4, 4, 1));
        let layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;

        staging.cmd_to_image(cmd, 77, layout, region, &[0xff; 64]).unwrap();
        staging
            .cmd_from_image(cmd, 77, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, region, 64)
            .unwrap();

        let commands = device.commands();
        assert_eq!(commands.len(), 2);
        match &commands[0] {
            Command::CopyBufferToImage {
                dst,
                layout: recorded,
                regions,
                ..
            } => {
                assert_eq!(*dst, 77);
                assert_eq!(*recorded, layout);
                assert_eq!(regions[0].image_extent, region.extent);
                assert_eq!(regions[0].buffer_offset % BASE_ALIGNMENT, 0);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(matches!(commands[1], Command::CopyImageToBuffer { src: 77, .. }));
        assert_eq!(staging.utilization().used, 128);
    }

    #[test]
    fn image_offsets_are_texel_multiples() {
        let (device, mut staging) = staging(StagingConfig::default().block_size(4096));
        let dst = device_buffer(&device, 64);
        let cmd = device.command_buffer();
        let layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;

        // Leaves the next reservation at offset 16, which is no multiple of 12
        staging.cmd_to_buffer(cmd, dst, 0, &[1; 16]).unwrap();
        let rgb = ImageRegion::color(vk::Format::R8G8B8_UNORM, Extent3D::new(4, 1, 1));
        let texels: Vec<u8> = (0..12).collect();
        staging.cmd_to_image(cmd, 77, layout, rgb, &texels).unwrap();

        let (upload_buffer, upload_offset) = match device.commands().last() {
            Some(Command::CopyBufferToImage { src, regions, .. }) => (*src, regions[0].buffer_offset),
            other => panic!("unexpected command {:?}", other),
        };
        assert_eq!(upload_offset % 12, 0);
        assert_eq!(upload_offset % 4, 0);
        assert_eq!(device.read_buffer(upload_buffer, upload_offset, 12), texels);

        let src = device_buffer(&device, 64);
        staging.cmd_from_buffer(cmd, src, 0, 16).unwrap();
        let receipt = staging
            .cmd_from_image(cmd, 77, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, rgb, 12)
            .unwrap();
        let (readback_buffer, readback_offset) = match device.commands().last() {
            Some(Command::CopyImageToBuffer { dst, regions, .. }) => (*dst, regions[0].buffer_offset),
            other => panic!("unexpected command {:?}", other),
        };
        assert_eq!(readback_offset % 12, 0);
        device.write_buffer(readback_buffer, readback_offset, &texels);
        assert_eq!(staging.read(&receipt), Some(&texels[..]));
    }

    #[test]
    fn short_or_unknown_image_data_records_nothing() {
        let (device, mut staging) = staging(StagingConfig::default().block_size(4096));
        let cmd = device.command_buffer();
        let layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        let region = ImageRegion::color(vk::Format::R8G8B8A8_UNORM, Extent3D::new(4, 4, 1));

        let err = staging.cmd_to_image(cmd, 77, layout, region, &[0; 60]).unwrap_err();
        assert!(matches!(err, AllocError::ShortImageData { size: 60, required: 64 }));

        let mut combined = region;
        combined.format = vk::Format::D24_UNORM_S8_UINT;
        let err = staging.cmd_to_image(cmd, 77, layout, combined, &[0; 64]).unwrap_err();
        assert!(matches!(err, AllocError::UnsupportedFormat(_)));

        assert!(device.commands().is_empty());
        assert_eq!(staging.utilization(), Utilization::default());
        assert!(!staging.finalize_resources(None));
    }
}
