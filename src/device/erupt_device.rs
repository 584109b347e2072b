use super::*;
use crate::SharedCore;
use std::ffi::c_void;

/// [`Device`] backed by a live Vulkan device
pub struct EruptDevice {
    core: SharedCore,
}

impl EruptDevice {
    pub fn new(core: SharedCore) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &SharedCore {
        &self.core
    }

    fn sharing_mode(queue_families: &[u32]) -> vk::SharingMode {
        if queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        }
    }
}

fn extent(extent: Extent3D) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: extent.depth,
    }
}

fn buffer_image_copy(region: &BufferImageCopy) -> vk::BufferImageCopyBuilder<'static> {
    let subresource = vk::ImageSubresourceLayers {
        aspect_mask: region.subresource.aspect_mask,
        mip_level: region.subresource.mip_level,
        base_array_layer: region.subresource.base_array_layer,
        layer_count: region.subresource.layer_count,
    };
    let offset = vk::Offset3D {
        x: region.image_offset.x,
        y: region.image_offset.y,
        z: region.image_offset.z,
    };
    vk::BufferImageCopyBuilder::new()
        .buffer_offset(region.buffer_offset)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(subresource)
        .image_offset(offset)
        .image_extent(extent(region.image_extent))
}

impl Device for EruptDevice {
    type Memory = vk::DeviceMemory;
    type Buffer = vk::Buffer;
    type Image = vk::Image;
    type ImageView = vk::ImageView;
    type Sampler = vk::Sampler;
    type Fence = vk::Fence;
    type CommandBuffer = vk::CommandBuffer;

    fn memory_properties(&self) -> &MemoryProperties {
        &self.core.memory_properties
    }

    fn max_allocation_size(&self) -> u64 {
        self.core.max_allocation_size()
    }

    unsafe fn allocate_memory(
        &self,
        allocation: &MemoryAllocation<'_, Self>,
    ) -> Result<vk::DeviceMemory, DeviceError> {
        let mut info = vk::MemoryAllocateInfoBuilder::new()
            .allocation_size(allocation.size)
            .memory_type_index(allocation.memory_type_index);

        // The extension structs must outlive the call, so they are built unconditionally and
        // only linked in when needed.
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfoBuilder::new();
        let mut flags_info = vk::MemoryAllocateFlagsInfoBuilder::new()
            .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut priority_info = vk::MemoryPriorityAllocateInfoEXTBuilder::new()
            .priority(allocation.priority.unwrap_or(0.5));
        let mut next: *const c_void = std::ptr::null();

        if let Some(target) = allocation.dedicated {
            dedicated_info = match target {
                DedicatedTarget::Buffer(buffer) => dedicated_info.buffer(buffer),
                DedicatedTarget::Image(image) => dedicated_info.image(image),
            };
            dedicated_info.p_next = next;
            next = &*dedicated_info as *const vk::MemoryDedicatedAllocateInfo as *const c_void;
        }

        if allocation.device_address {
            flags_info.p_next = next;
            next = &*flags_info as *const vk::MemoryAllocateFlagsInfo as *const c_void;
        }

        if allocation.priority.is_some() {
            priority_info.p_next = next;
            next = &*priority_info as *const vk::MemoryPriorityAllocateInfoEXT as *const c_void;
        }
        info.p_next = next;

        Ok(self.core.device.allocate_memory(&info, None, None).result()?)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.core.device.free_memory(Some(memory), None);
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError> {
        let mut ptr = std::ptr::null_mut();
        self.core
            .device
            .map_memory(memory, offset, size, None, &mut ptr)
            .result()?;
        NonNull::new(ptr as *mut u8).ok_or(DeviceError::MemoryMapFailed)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.core.device.unmap_memory(memory);
    }

    unsafe fn create_buffer(&self, desc: &BufferDesc) -> Result<vk::Buffer, DeviceError> {
        let ci = vk::BufferCreateInfoBuilder::new()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(Self::sharing_mode(&desc.queue_families))
            .queue_family_indices(&desc.queue_families);
        Ok(self.core.device.create_buffer(&ci, None, None).result()?)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.core.device.destroy_buffer(Some(buffer), None);
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements {
        let info = vk::BufferMemoryRequirementsInfo2Builder::new().buffer(buffer);
        let mut dedicated = vk::MemoryDedicatedRequirementsBuilder::new();
        let mut template = vk::MemoryRequirements2Builder::new();
        template.p_next = &mut *dedicated as *mut vk::MemoryDedicatedRequirements as *mut c_void;

        let reqs = self
            .core
            .device
            .get_buffer_memory_requirements2(&info, Some(template.build()))
            .memory_requirements;

        MemoryRequirements {
            size: reqs.size,
            alignment: reqs.alignment,
            memory_type_bits: reqs.memory_type_bits,
            prefers_dedicated: dedicated.prefers_dedicated_allocation != 0,
            requires_dedicated: dedicated.requires_dedicated_allocation != 0,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), DeviceError> {
        Ok(self
            .core
            .device
            .bind_buffer_memory(buffer, memory, offset)
            .result()?)
    }

    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> u64 {
        let info = vk::BufferDeviceAddressInfoBuilder::new().buffer(buffer);
        self.core.device.get_buffer_device_address(&info)
    }

    unsafe fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image, DeviceError> {
        let ci = vk::ImageCreateInfoBuilder::new()
            .flags(desc.flags)
            .image_type(desc.image_type)
            .extent(extent(desc.extent))
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(Self::sharing_mode(&desc.queue_families))
            .queue_family_indices(&desc.queue_families)
            .samples(desc.samples);
        Ok(self.core.device.create_image(&ci, None, None).result()?)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.core.device.destroy_image(Some(image), None);
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements {
        let info = vk::ImageMemoryRequirementsInfo2Builder::new().image(image);
        let mut dedicated = vk::MemoryDedicatedRequirementsBuilder::new();
        let mut template = vk::MemoryRequirements2Builder::new();
        template.p_next = &mut *dedicated as *mut vk::MemoryDedicatedRequirements as *mut c_void;

        let reqs = self
            .core
            .device
            .get_image_memory_requirements2(&info, Some(template.build()))
            .memory_requirements;

        MemoryRequirements {
            size: reqs.size,
            alignment: reqs.alignment,
            memory_type_bits: reqs.memory_type_bits,
            prefers_dedicated: dedicated.prefers_dedicated_allocation != 0,
            requires_dedicated: dedicated.requires_dedicated_allocation != 0,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), DeviceError> {
        Ok(self
            .core
            .device
            .bind_image_memory(image, memory, offset)
            .result()?)
    }

    unsafe fn create_image_view(
        &self,
        desc: &ImageViewDesc<vk::Image>,
    ) -> Result<vk::ImageView, DeviceError> {
        let range = vk::ImageSubresourceRange {
            aspect_mask: desc.range.aspect_mask,
            base_mip_level: desc.range.base_mip_level,
            level_count: desc.range.level_count,
            base_array_layer: desc.range.base_array_layer,
            layer_count: desc.range.layer_count,
        };
        let ci = vk::ImageViewCreateInfoBuilder::new()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(range);
        Ok(self.core.device.create_image_view(&ci, None, None).result()?)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.core.device.destroy_image_view(Some(view), None);
    }

    unsafe fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, DeviceError> {
        let ci = vk::SamplerCreateInfoBuilder::new()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode_u)
            .address_mode_v(desc.address_mode_v)
            .address_mode_w(desc.address_mode_w)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1) as f32)
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::NEVER))
            .min_lod(0.0)
            .max_lod(desc.max_lod as f32)
            .border_color(desc.border_color)
            .unnormalized_coordinates(desc.unnormalized_coordinates);
        Ok(self.core.device.create_sampler(&ci, None, None).result()?)
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.core.device.destroy_sampler(Some(sampler), None);
    }

    unsafe fn fence_signaled(&self, fence: vk::Fence) -> Result<bool, DeviceError> {
        match self.core.device.get_fence_status(fence).raw {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::NOT_READY => Ok(false),
            other => Err(other.into()),
        }
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[BufferCopy],
    ) {
        let regions: Vec<_> = regions
            .iter()
            .map(|region| {
                vk::BufferCopyBuilder::new()
                    .src_offset(region.src_offset)
                    .dst_offset(region.dst_offset)
                    .size(region.size)
            })
            .collect();
        self.core
            .device
            .cmd_copy_buffer(command_buffer, src, dst, &regions);
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[BufferImageCopy],
    ) {
        let regions: Vec<_> = regions.iter().map(buffer_image_copy).collect();
        self.core
            .device
            .cmd_copy_buffer_to_image(command_buffer, src, dst, layout, &regions);
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[BufferImageCopy],
    ) {
        let regions: Vec<_> = regions.iter().map(buffer_image_copy).collect();
        self.core
            .device
            .cmd_copy_image_to_buffer(command_buffer, src, layout, dst, &regions);
    }

    unsafe fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        barrier: &ImageBarrier<vk::Image>,
    ) {
        let range = vk::ImageSubresourceRange {
            aspect_mask: barrier.range.aspect_mask,
            base_mip_level: barrier.range.base_mip_level,
            level_count: barrier.range.level_count,
            base_array_layer: barrier.range.base_array_layer,
            layer_count: barrier.range.layer_count,
        };
        let image_barrier = vk::ImageMemoryBarrierBuilder::new()
            .image(barrier.image)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .subresource_range(range);

        self.core.device.cmd_pipeline_barrier(
            command_buffer,
            barrier.src_stage,
            barrier.dst_stage,
            None,
            &[],
            &[],
            &[image_barrier],
        );
    }
}
