//! The seam between the allocators and the graphics API.
//!
//! Everything above this module talks to a [`Device`]: the real one wraps an erupt
//! `DeviceLoader`, tests use a host-memory fake.
use erupt::vk;
use std::fmt::Debug;
use std::hash::Hash;
use std::ptr::NonNull;
use thiserror::Error;

mod erupt_device;
mod format;
pub use erupt_device::EruptDevice;
pub use format::{texel_block, TexelBlock};

#[cfg(test)]
pub(crate) mod mock;

/// Errors reported by the device itself
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("memory map failed")]
    MemoryMapFailed,
    #[error("device lost")]
    DeviceLost,
    #[error("vulkan error {0:?}")]
    Other(vk::Result),
}

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DeviceError::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => DeviceError::OutOfHostMemory,
            vk::Result::ERROR_MEMORY_MAP_FAILED => DeviceError::MemoryMapFailed,
            vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost,
            other => DeviceError::Other(other),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: vk::MemoryHeapFlags,
}

/// Memory types and heaps of a physical device
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

impl MemoryProperties {
    /// Index of the first memory type allowed by `type_bits` whose flags contain `flags`.
    ///
    /// An empty `flags` first looks for a type with no property flags at all, then prefers
    /// device local memory, then host visible memory.
    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        let allowed = |index: usize| index < 32 && type_bits & (1 << index) != 0;
        let find = |predicate: &dyn Fn(vk::MemoryPropertyFlags) -> bool| {
            self.memory_types
                .iter()
                .enumerate()
                .find(|(index, ty)| allowed(*index) && predicate(ty.property_flags))
                .map(|(index, _)| index as u32)
        };

        if !flags.is_empty() {
            return find(&|ty_flags| ty_flags.contains(flags));
        }

        find(&|ty_flags| ty_flags.is_empty())
            .or_else(|| find(&|ty_flags| ty_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)))
            .or_else(|| find(&|ty_flags| ty_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)))
    }

    pub fn flags(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
        self.memory_types
            .get(memory_type_index as usize)
            .map(|ty| ty.property_flags)
            .unwrap_or_else(vk::MemoryPropertyFlags::empty)
    }

    pub fn heap_index(&self, memory_type_index: u32) -> u32 {
        self.memory_types
            .get(memory_type_index as usize)
            .map(|ty| ty.heap_index)
            .unwrap_or(0)
    }
}

/// Memory requirements reported for a buffer or image, including the driver's dedicated hints
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
}

/// The object a dedicated allocation is made for
pub enum DedicatedTarget<D: Device + ?Sized> {
    Buffer(D::Buffer),
    Image(D::Image),
}

impl<D: Device + ?Sized> Clone for DedicatedTarget<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Device + ?Sized> Copy for DedicatedTarget<D> {}

impl<D: Device + ?Sized> Debug for DedicatedTarget<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DedicatedTarget::Buffer(buffer) => f.debug_tuple("Buffer").field(buffer).finish(),
            DedicatedTarget::Image(image) => f.debug_tuple("Image").field(image).finish(),
        }
    }
}

/// One raw `vkAllocateMemory` call
pub struct MemoryAllocation<'a, D: Device + ?Sized> {
    pub size: u64,
    pub memory_type_index: u32,
    pub dedicated: Option<DedicatedTarget<D>>,
    /// Allocate with `VK_MEMORY_ALLOCATE_DEVICE_ADDRESS_BIT`
    pub device_address: bool,
    /// `VK_EXT_memory_priority` priority in `[0, 1]`. Left out of the allocate info when `None`.
    pub priority: Option<f32>,
    pub debug_name: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    /// More than one family makes the buffer concurrently shared
    pub queue_families: Vec<u32>,
}

impl BufferDesc {
    pub fn new(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            queue_families: Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3D {
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Offset3D {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlagBits,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub queue_families: Vec<u32>,
}

impl ImageDesc {
    /// Single-sampled, optimally tiled 2D image with one mip level and layer
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            image_type: vk::ImageType::_2D,
            format,
            extent: Extent3D::new(width, height, 1),
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlagBits::_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            flags: vk::ImageCreateFlags::empty(),
            queue_families: Vec::new(),
        }
    }

    /// Every mip level and layer of the color aspect
    pub fn full_range(&self) -> ImageSubresourceRange {
        ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// Mip 0 of every layer
    pub fn base_layers(&self) -> ImageSubresourceLayers {
        ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// View type matching the image type, layer count and cube compatibility
    pub fn view_type(&self) -> vk::ImageViewType {
        let cube = self.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE);
        let layered = self.array_layers > 1;
        match self.image_type {
            vk::ImageType::_1D if layered => vk::ImageViewType::_1D_ARRAY,
            vk::ImageType::_1D => vk::ImageViewType::_1D,
            vk::ImageType::_3D => vk::ImageViewType::_3D,
            _ if cube && self.array_layers > 6 => vk::ImageViewType::CUBE_ARRAY,
            _ if cube => vk::ImageViewType::CUBE,
            _ if layered => vk::ImageViewType::_2D_ARRAY,
            _ => vk::ImageViewType::_2D,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageSubresourceLayers {
    pub aspect_mask: vk::ImageAspectFlags,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageSubresourceRange {
    pub aspect_mask: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

pub struct ImageViewDesc<I> {
    pub image: I,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub range: ImageSubresourceRange,
}

/// Sampler parameters. Hashable so identical samplers can be shared.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub max_anisotropy: Option<u8>,
    pub compare_op: Option<vk::CompareOp>,
    /// Highest mip level that may be sampled
    pub max_lod: u32,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerDesc {
    /// Linear filtering, repeat addressing, all mip levels
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
            compare_op: None,
            max_lod: vk::LOD_CLAMP_NONE as u32,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            unnormalized_coordinates: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub subresource: ImageSubresourceLayers,
    pub image_offset: Offset3D,
    pub image_extent: Extent3D,
}

/// Image layout transition recorded as a pipeline barrier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageBarrier<I> {
    pub image: I,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub range: ImageSubresourceRange,
}

/// Raw device operations the allocators are built on.
///
/// # Safety
/// The methods are thin wrappers around the graphics API and inherit its rules: objects must
/// be destroyed exactly once, not while the GPU still uses them, and command buffers passed to
/// the `cmd_*` methods must be in the recording state.
pub trait Device {
    type Memory: Copy + Eq + Hash + Debug;
    type Buffer: Copy + Eq + Hash + Debug;
    type Image: Copy + Eq + Hash + Debug;
    type ImageView: Copy + Eq + Hash + Debug;
    type Sampler: Copy + Eq + Hash + Debug;
    type Fence: Copy + Eq + Hash + Debug;
    type CommandBuffer: Copy + Eq + Hash + Debug;

    fn memory_properties(&self) -> &MemoryProperties;

    /// Largest size a single memory allocation may have
    fn max_allocation_size(&self) -> u64;

    unsafe fn allocate_memory(
        &self,
        allocation: &MemoryAllocation<'_, Self>,
    ) -> Result<Self::Memory, DeviceError>;
    unsafe fn free_memory(&self, memory: Self::Memory);
    unsafe fn map_memory(
        &self,
        memory: Self::Memory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError>;
    unsafe fn unmap_memory(&self, memory: Self::Memory);

    unsafe fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, DeviceError>;
    unsafe fn destroy_buffer(&self, buffer: Self::Buffer);
    unsafe fn buffer_memory_requirements(&self, buffer: Self::Buffer) -> MemoryRequirements;
    unsafe fn bind_buffer_memory(
        &self,
        buffer: Self::Buffer,
        memory: Self::Memory,
        offset: u64,
    ) -> Result<(), DeviceError>;
    unsafe fn buffer_device_address(&self, buffer: Self::Buffer) -> u64;

    unsafe fn create_image(&self, desc: &ImageDesc) -> Result<Self::Image, DeviceError>;
    unsafe fn destroy_image(&self, image: Self::Image);
    unsafe fn image_memory_requirements(&self, image: Self::Image) -> MemoryRequirements;
    unsafe fn bind_image_memory(
        &self,
        image: Self::Image,
        memory: Self::Memory,
        offset: u64,
    ) -> Result<(), DeviceError>;

    unsafe fn create_image_view(
        &self,
        desc: &ImageViewDesc<Self::Image>,
    ) -> Result<Self::ImageView, DeviceError>;
    unsafe fn destroy_image_view(&self, view: Self::ImageView);

    unsafe fn create_sampler(&self, desc: &SamplerDesc) -> Result<Self::Sampler, DeviceError>;
    unsafe fn destroy_sampler(&self, sampler: Self::Sampler);

    /// Non-blocking fence poll
    unsafe fn fence_signaled(&self, fence: Self::Fence) -> Result<bool, DeviceError>;

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        regions: &[BufferCopy],
    );
    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Image,
        layout: vk::ImageLayout,
        regions: &[BufferImageCopy],
    );
    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: Self::CommandBuffer,
        src: Self::Image,
        layout: vk::ImageLayout,
        dst: Self::Buffer,
        regions: &[BufferImageCopy],
    );
    unsafe fn cmd_image_barrier(
        &self,
        command_buffer: Self::CommandBuffer,
        barrier: &ImageBarrier<Self::Image>,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> MemoryProperties {
        use vk::MemoryPropertyFlags as F;
        let heap = MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        let ty = |property_flags| MemoryType {
            property_flags,
            heap_index: 0,
        };
        MemoryProperties {
            memory_types: vec![
                ty(F::DEVICE_LOCAL),
                ty(F::HOST_VISIBLE | F::HOST_COHERENT),
                ty(F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED),
            ],
            memory_heaps: vec![heap],
        }
    }

    #[test]
    fn first_matching_type_wins() {
        let props = properties();
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(props.find_memory_type(0b111, host), Some(1));
        assert_eq!(props.find_memory_type(0b100, host), Some(2));
        assert_eq!(props.find_memory_type(0b001, host), None);
        assert_eq!(
            props.find_memory_type(0b111, host | vk::MemoryPropertyFlags::HOST_CACHED),
            Some(2)
        );
    }

    #[test]
    fn empty_flags_prefer_device_local() {
        let props = properties();
        let none = vk::MemoryPropertyFlags::empty();
        assert_eq!(props.find_memory_type(0b111, none), Some(0));
        assert_eq!(props.find_memory_type(0b110, none), Some(1));
        assert_eq!(props.find_memory_type(0, none), None);
    }

    #[test]
    fn view_type_follows_layers_and_cube_flag() {
        let mut desc = ImageDesc::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED);
        assert_eq!(desc.view_type(), vk::ImageViewType::_2D);
        desc.array_layers = 6;
        assert_eq!(desc.view_type(), vk::ImageViewType::_2D_ARRAY);
        desc.flags = vk::ImageCreateFlags::CUBE_COMPATIBLE;
        assert_eq!(desc.view_type(), vk::ImageViewType::CUBE);
        desc.array_layers = 12;
        assert_eq!(desc.view_type(), vk::ImageViewType::CUBE_ARRAY);
    }
}
