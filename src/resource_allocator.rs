//! Buffers, images and textures backed by any [`MemAllocator`].
use crate::device::{
    BufferDesc, Device, ImageBarrier, ImageDesc, ImageViewDesc, SamplerDesc,
};
use crate::error::AllocError;
use crate::mem_allocator::{MemAllocateInfo, MemAllocator, MemHandle, Mapping};
use crate::sampler_pool::SamplerPool;
use crate::staging::{ImageRegion, StagingConfig, StagingMemoryManager};
use anyhow::{bail, format_err, Context, Result};
use bytemuck::Pod;
use drop_bomb::DropBomb;
use erupt::vk;
use std::sync::Arc;
use tracing::debug;

/// Buffer with its own memory allocation
pub struct Buffer<D: Device> {
    buffer: D::Buffer,
    memory: MemHandle,
    size: u64,
    address: u64,
    bomb: DropBomb,
}

impl<D: Device> Buffer<D> {
    pub fn buffer(&self) -> D::Buffer {
        self.buffer
    }

    pub fn memory(&self) -> MemHandle {
        self.memory
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Device address, or zero if the buffer wasn't created with `SHADER_DEVICE_ADDRESS`
    pub fn address(&self) -> u64 {
        self.address
    }
}

/// Image with its own memory allocation. Tracks the layout transitions recorded through
/// [`ResourceAllocator::cmd_transition`].
pub struct Image<D: Device> {
    image: D::Image,
    memory: MemHandle,
    desc: ImageDesc,
    layout: vk::ImageLayout,
    bomb: DropBomb,
}

impl<D: Device> Image<D> {
    pub fn image(&self) -> D::Image {
        self.image
    }

    pub fn memory(&self) -> MemHandle {
        self.memory
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }
}

/// Image plus a view of all of it, and optionally a shared sampler
pub struct Texture<D: Device> {
    image: Image<D>,
    view: D::ImageView,
    sampler: Option<D::Sampler>,
    bomb: DropBomb,
}

impl<D: Device> Texture<D> {
    pub fn image(&self) -> &Image<D> {
        &self.image
    }

    pub fn view(&self) -> D::ImageView {
        self.view
    }

    pub fn sampler(&self) -> Option<D::Sampler> {
        self.sampler
    }
}

type DeviceOf<A> = <A as MemAllocator>::Device;
type FenceOf<A> = <DeviceOf<A> as Device>::Fence;
type CommandBufferOf<A> = <DeviceOf<A> as Device>::CommandBuffer;

/// Access mask and pipeline stage that produce or consume an image in `layout`
fn layout_access(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Creates resources, binds their memory and stages their initial contents
pub struct ResourceAllocator<A: MemAllocator> {
    device: Arc<A::Device>,
    allocator: A,
    staging: StagingMemoryManager<A>,
    samplers: SamplerPool<A::Device>,
}

impl<A: MemAllocator + Clone> ResourceAllocator<A> {
    pub fn new(allocator: A, staging: StagingConfig) -> Self {
        let device = allocator.device();
        Self {
            staging: StagingMemoryManager::new(allocator.clone(), staging),
            samplers: SamplerPool::new(device.clone()),
            allocator,
            device,
        }
    }
}

impl<A: MemAllocator> ResourceAllocator<A> {
    pub fn device(&self) -> &Arc<A::Device> {
        &self.device
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    pub fn staging(&self) -> &StagingMemoryManager<A> {
        &self.staging
    }

    pub fn staging_mut(&mut self) -> &mut StagingMemoryManager<A> {
        &mut self.staging
    }

    pub fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Buffer<DeviceOf<A>>> {
        let buffer = unsafe { self.device.create_buffer(desc) }.context("Creating buffer")?;

        let requirements = unsafe { self.device.buffer_memory_requirements(buffer) };
        let device_address = desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let mut info = MemAllocateInfo::new(requirements, properties).device_address(device_address);
        if requirements.requires_dedicated {
            info = info.dedicated_buffer(buffer);
        }

        let memory = match self.allocator.alloc_memory(&info) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer) };
                return Err(err).context("Allocating buffer memory");
            }
        };

        let bound = self
            .allocator
            .memory_info(memory)
            .ok_or(AllocError::InvalidHandle)
            .map_err(anyhow::Error::from)
            .and_then(|info| {
                unsafe { self.device.bind_buffer_memory(buffer, info.memory, info.offset) }
                    .context("Binding buffer memory")
            });
        if let Err(err) = bound {
            unsafe { self.device.destroy_buffer(buffer) };
            self.allocator.free_memory(memory);
            return Err(err);
        }

        let address = if device_address {
            unsafe { self.device.buffer_device_address(buffer) }
        } else {
            0
        };

        Ok(Buffer {
            buffer,
            memory,
            size: desc.size,
            address,
            bomb: DropBomb::new("Buffer dropped without calling destroy_buffer()!"),
        })
    }

    /// Create a buffer and record the upload of its initial contents
    pub fn create_buffer_with_data(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        desc: &BufferDesc,
        properties: vk::MemoryPropertyFlags,
        data: &[u8],
    ) -> Result<Buffer<DeviceOf<A>>> {
        if data.len() as u64 > desc.size {
            bail!(
                "{} bytes of data don't fit in a {} byte buffer",
                data.len(),
                desc.size
            );
        }

        let mut desc = desc.clone();
        desc.usage |= vk::BufferUsageFlags::TRANSFER_DST;
        let buffer = self.create_buffer(&desc, properties)?;

        if !data.is_empty() {
            if let Err(err) = self.staging.cmd_to_buffer(command_buffer, buffer.buffer, 0, data) {
                self.destroy_buffer(buffer);
                return Err(err).context("Staging buffer data");
            }
        }
        Ok(buffer)
    }

    pub fn create_buffer_with_data_typed<T: Pod>(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        desc: &BufferDesc,
        properties: vk::MemoryPropertyFlags,
        data: &[T],
    ) -> Result<Buffer<DeviceOf<A>>> {
        self.create_buffer_with_data(command_buffer, desc, properties, bytemuck::cast_slice(data))
    }

    pub fn create_image(
        &mut self,
        desc: &ImageDesc,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Image<DeviceOf<A>>> {
        let image = unsafe { self.device.create_image(desc) }.context("Creating image")?;

        let requirements = unsafe { self.device.image_memory_requirements(image) };
        let mut info = MemAllocateInfo::new(requirements, properties)
            .tiling_optimal(desc.tiling == vk::ImageTiling::OPTIMAL);
        if requirements.prefers_dedicated || requirements.requires_dedicated {
            info = info.dedicated_image(image);
        }

        let memory = match self.allocator.alloc_memory(&info) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_image(image) };
                return Err(err).context("Allocating image memory");
            }
        };

        let bound = self
            .allocator
            .memory_info(memory)
            .ok_or(AllocError::InvalidHandle)
            .map_err(anyhow::Error::from)
            .and_then(|info| {
                unsafe { self.device.bind_image_memory(image, info.memory, info.offset) }
                    .context("Binding image memory")
            });
        if let Err(err) = bound {
            unsafe { self.device.destroy_image(image) };
            self.allocator.free_memory(memory);
            return Err(err);
        }

        debug!(?image, extent = ?desc.extent, format = ?desc.format, "created image");
        Ok(Image {
            image,
            memory,
            desc: desc.clone(),
            layout: vk::ImageLayout::UNDEFINED,
            bomb: DropBomb::new("Image dropped without calling destroy_image()!"),
        })
    }

    /// Create an image, record the upload of mip 0 of every layer and transition it to
    /// `final_layout`. `data` holds the tightly packed texels of every layer.
    pub fn create_image_with_data(
        &mut self,
        command_buffer: CommandBufferOf<A>,
        desc: &ImageDesc,
        properties: vk::MemoryPropertyFlags,
        data: &[u8],
        final_layout: vk::ImageLayout,
    ) -> Result<Image<DeviceOf<A>>> {
        let mut desc = desc.clone();
        desc.usage |= vk::ImageUsageFlags::TRANSFER_DST;
        let region = ImageRegion {
            format: desc.format,
            subresource: desc.base_layers(),
            offset: Default::default(),
            extent: desc.extent,
        };
        let required = region.size()?;
        if data.len() as u64 != required {
            bail!(
                "Image data is {} bytes, a {:?} {:?} image with {} layers needs {}",
                data.len(),
                desc.format,
                desc.extent,
                desc.array_layers,
                required
            );
        }

        let mut image = self.create_image(&desc, properties)?;

        // Nothing is recorded until staging succeeded
        let pending = match self.staging.stage_image_data(region, data) {
            Ok(pending) => pending,
            Err(err) => {
                self.destroy_image(image);
                return Err(err).context("Staging image data");
            }
        };
        self.cmd_transition(command_buffer, &mut image, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        self.staging.cmd_copy_staged_image(
            command_buffer,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            pending,
        );

        if final_layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            self.cmd_transition(command_buffer, &mut image, final_layout);
        }
        Ok(image)
    }

    /// Record a transition of the whole image from its tracked layout to `new_layout`
    pub fn cmd_transition(
        &self,
        command_buffer: CommandBufferOf<A>,
        image: &mut Image<DeviceOf<A>>,
        new_layout: vk::ImageLayout,
    ) {
        let (src_access, src_stage) = layout_access(image.layout);
        let (dst_access, dst_stage) = layout_access(new_layout);
        let barrier = ImageBarrier {
            image: image.image,
            old_layout: image.layout,
            new_layout,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
            range: image.desc.full_range(),
        };
        unsafe { self.device.cmd_image_barrier(command_buffer, &barrier) };
        image.layout = new_layout;
    }

    /// Wrap an image with a view covering all of it, and a pooled sampler if one is described.
    /// The image is destroyed if this fails.
    pub fn create_texture(
        &mut self,
        image: Image<DeviceOf<A>>,
        sampler: Option<&SamplerDesc>,
    ) -> Result<Texture<DeviceOf<A>>> {
        let view_desc = ImageViewDesc {
            image: image.image,
            view_type: image.desc.view_type(),
            format: image.desc.format,
            range: image.desc.full_range(),
        };
        let view = match unsafe { self.device.create_image_view(&view_desc) } {
            Ok(view) => view,
            Err(err) => {
                self.destroy_image(image);
                return Err(err).context("Creating image view");
            }
        };

        let sampler = match sampler.map(|desc| self.samplers.acquire(desc)).transpose() {
            Ok(sampler) => sampler,
            Err(err) => {
                unsafe { self.device.destroy_image_view(view) };
                self.destroy_image(image);
                return Err(err).context("Creating sampler");
            }
        };

        Ok(Texture {
            image,
            view,
            sampler,
            bomb: DropBomb::new("Texture dropped without calling destroy_texture()!"),
        })
    }

    pub fn destroy_buffer(&mut self, mut buffer: Buffer<DeviceOf<A>>) {
        unsafe { self.device.destroy_buffer(buffer.buffer) };
        self.allocator.free_memory(buffer.memory);
        buffer.bomb.defuse();
    }

    pub fn destroy_image(&mut self, mut image: Image<DeviceOf<A>>) {
        unsafe { self.device.destroy_image(image.image) };
        self.allocator.free_memory(image.memory);
        image.bomb.defuse();
    }

    pub fn destroy_texture(&mut self, texture: Texture<DeviceOf<A>>) {
        let Texture {
            image,
            view,
            sampler,
            mut bomb,
        } = texture;
        unsafe { self.device.destroy_image_view(view) };
        if let Some(sampler) = sampler {
            self.samplers.release(sampler);
        }
        self.destroy_image(image);
        bomb.defuse();
    }

    /// Map a host-visible buffer's memory
    pub fn map_buffer(&mut self, buffer: &Buffer<DeviceOf<A>>) -> Result<Mapping<'_, A>> {
        self.allocator
            .mapping(buffer.memory, 0, buffer.size)
            .map_err(|err| format_err!("Mapping buffer {:?}: {}", buffer.buffer, err))
    }

    /// Map a host-visible image's memory, typically a linearly tiled one
    pub fn map_image(&mut self, image: &Image<DeviceOf<A>>) -> Result<Mapping<'_, A>> {
        let size = self
            .allocator
            .memory_info(image.memory)
            .ok_or(AllocError::InvalidHandle)?
            .size;
        self.allocator
            .mapping(image.memory, 0, size)
            .map_err(|err| format_err!("Mapping image {:?}: {}", image.image, err))
    }

    /// Close the open staging set, see [`StagingMemoryManager::finalize_resources`]
    pub fn finalize_staging(&mut self, fence: Option<FenceOf<A>>) -> bool {
        self.staging.finalize_resources(fence)
    }

    pub fn release_staging(&mut self) -> Result<usize> {
        Ok(self.staging.release_resources()?)
    }

    pub fn finalize_and_release_staging(&mut self, fence: Option<FenceOf<A>>) -> Result<usize> {
        self.finalize_staging(fence);
        self.release_staging()
    }
}
