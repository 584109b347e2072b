//! GPU memory sub-allocation and staged transfers for Vulkan.
//!
//! The allocators are generic over [`device::Device`], implemented for a live Vulkan device by
//! [`device::EruptDevice`]. Raw memory comes from a [`mem_allocator::MemAllocator`]: either one
//! allocation per request ([`dedicated::DedicatedMemoryAllocator`]) or large pooled blocks
//! ([`device_memory::DeviceMemoryAllocator`]). On top of those sit buffer sub-allocation,
//! fenced staging, and the [`resource_allocator::ResourceAllocator`] that ties them together.
pub mod app_info;
pub mod arena;
pub mod buffer_suballocator;
pub mod core;
pub mod dedicated;
pub mod device;
pub mod device_memory;
pub mod error;
pub mod headless_backend;
pub mod mem_allocator;
pub mod range_allocator;
pub mod resource_allocator;
pub mod sampler_pool;
pub mod staging;
pub mod sync;
pub mod utilization;

/// Vulkan implementation supplied by Erupt
pub use erupt::vk;

pub const ENGINE_NAME: &str = "Stagehand";

pub mod prelude {
    pub use super::*;
    pub use app_info::AppInfo;
    pub use buffer_suballocator::{Binding, BufferSubAllocator, Handle, SubAllocatorConfig};
    pub use dedicated::DedicatedMemoryAllocator;
    pub use device::{BufferDesc, Device, EruptDevice, ImageDesc, SamplerDesc};
    pub use device_memory::{DeviceMemoryAllocator, DeviceMemoryConfig};
    pub use error::AllocError;
    pub use headless_backend::build_core;
    pub use mem_allocator::{MemAllocateInfo, MemAllocator, MemHandle};
    pub use resource_allocator::{Buffer, Image, ResourceAllocator, Texture};
    pub use staging::{StagingConfig, StagingMemoryManager};
    pub use sync::SharedMemAllocator;
    pub use utilization::Utilization;
    pub use {Core, SharedCore};
}

pub use crate::core::{Core, SharedCore};
