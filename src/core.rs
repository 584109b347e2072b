use crate::device::{MemoryHeap, MemoryProperties, MemoryType};
use erupt::vk;
use erupt::{utils::loading::DefaultEntryLoader, DeviceLoader, InstanceLoader};
use std::sync::Arc;

/// A collection of commonly referenced Vulkan context
pub struct Core {
    /// General purpose queue, must be graphics and compute capable
    pub queue: vk::Queue,

    /// Family the queue is from
    pub queue_family: u32,

    /// Vulkan device
    pub device: DeviceLoader,

    /// Vulkan physical device
    pub physical_device: vk::PhysicalDevice,

    /// Information about the device
    pub device_properties: vk::PhysicalDeviceProperties,

    /// Memory types and heaps of the physical device
    pub memory_properties: MemoryProperties,

    /// `maxMemoryAllocationSize` of the device, or its largest heap before Vulkan 1.1
    pub max_memory_allocation_size: u64,

    /// Vulkan instance
    pub instance: InstanceLoader,

    /// Erupt entry
    pub entry: DefaultEntryLoader,
}

/// An alias of `Arc<Core>`. Useful to include in subsystems for easy access to Vulkan context
pub type SharedCore = Arc<Core>;

impl Core {
    /// Largest single allocation the device accepts
    pub fn max_allocation_size(&self) -> u64 {
        self.max_memory_allocation_size
    }
}

impl MemoryProperties {
    /// Size of the largest heap
    pub fn largest_heap(&self) -> u64 {
        self.memory_heaps
            .iter()
            .map(|heap| heap.size)
            .max()
            .unwrap_or(0)
    }
}

impl From<&vk::PhysicalDeviceMemoryProperties> for MemoryProperties {
    fn from(props: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let memory_types = props.memory_types[..props.memory_type_count as usize]
            .iter()
            .map(|ty| MemoryType {
                property_flags: ty.property_flags,
                heap_index: ty.heap_index,
            })
            .collect();
        let memory_heaps = props.memory_heaps[..props.memory_heap_count as usize]
            .iter()
            .map(|heap| MemoryHeap {
                size: heap.size,
                flags: heap.flags,
            })
            .collect();
        Self {
            memory_types,
            memory_heaps,
        }
    }
}
