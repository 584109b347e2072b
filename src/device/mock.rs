//! Host-memory stand-in for a Vulkan device.
//!
//! Enforces the object lifetime rules the allocators rely on: memory can't be freed while a live
//! buffer or image is bound to it, and nothing can be destroyed twice.
use super::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

pub type MockHandle = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    CopyBuffer {
        command_buffer: MockHandle,
        src: MockHandle,
        dst: MockHandle,
        regions: Vec<BufferCopy>,
    },
    CopyBufferToImage {
        command_buffer: MockHandle,
        src: MockHandle,
        dst: MockHandle,
        layout: vk::ImageLayout,
        regions: Vec<BufferImageCopy>,
    },
    CopyImageToBuffer {
        command_buffer: MockHandle,
        src: MockHandle,
        layout: vk::ImageLayout,
        dst: MockHandle,
        regions: Vec<BufferImageCopy>,
    },
    Barrier {
        command_buffer: MockHandle,
        barrier: ImageBarrier<MockHandle>,
    },
}

/// Parameters of one successful memory allocation
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AllocationRecord {
    pub memory: MockHandle,
    pub size: u64,
    pub memory_type_index: u32,
    pub dedicated: bool,
    pub device_address: bool,
    pub priority: Option<f32>,
}

struct Memory {
    size: u64,
    memory_type_index: u32,
    data: Option<Box<[u8]>>,
    mapped: bool,
}

impl Memory {
    fn bytes(&mut self) -> &mut [u8] {
        let size = self.size as usize;
        self.data.get_or_insert_with(|| vec![0; size].into_boxed_slice())
    }
}

struct Binding {
    memory: MockHandle,
    offset: u64,
}

struct Buffer {
    size: u64,
    binding: Option<Binding>,
}

struct Image {
    binding: Option<Binding>,
}

#[derive(Default)]
struct State {
    next_handle: MockHandle,
    memory: HashMap<MockHandle, Memory>,
    buffers: HashMap<MockHandle, Buffer>,
    images: HashMap<MockHandle, Image>,
    views: HashSet<MockHandle>,
    samplers: HashMap<MockHandle, SamplerDesc>,
    fences: HashMap<MockHandle, bool>,
    commands: Vec<Command>,
    allocations: Vec<AllocationRecord>,
    device_local_budget: Option<u64>,
    device_local_used: u64,
    fail_allocations: usize,
    fail_buffer_binds: usize,
    map_calls: usize,
    image_requires_dedicated: bool,
}

impl State {
    fn handle(&mut self) -> MockHandle {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct MockDevice {
    properties: MemoryProperties,
    max_allocation_size: u64,
    state: Mutex<State>,
}

pub const DEVICE_LOCAL_TYPE: u32 = 0;
pub const HOST_COHERENT_TYPE: u32 = 1;
pub const HOST_CACHED_TYPE: u32 = 2;

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Three memory types: device local, host coherent, host cached
    pub fn new() -> Self {
        use vk::MemoryPropertyFlags as F;
        let ty = |property_flags, heap_index| MemoryType {
            property_flags,
            heap_index,
        };
        Self {
            properties: MemoryProperties {
                memory_types: vec![
                    ty(F::DEVICE_LOCAL, 0),
                    ty(F::HOST_VISIBLE | F::HOST_COHERENT, 1),
                    ty(F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED, 1),
                ],
                memory_heaps: vec![
                    MemoryHeap {
                        size: 1 << 32,
                        flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                    },
                    MemoryHeap {
                        size: 1 << 32,
                        flags: vk::MemoryHeapFlags::empty(),
                    },
                ],
            },
            max_allocation_size: 1 << 30,
            state: Mutex::default(),
        }
    }

    pub fn with_max_allocation_size(mut self, size: u64) -> Self {
        self.max_allocation_size = size;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Device local allocations beyond this many bytes fail with `OutOfDeviceMemory`
    pub fn set_device_local_budget(&self, budget: Option<u64>) {
        self.state().device_local_budget = budget;
    }

    /// The next `count` memory allocations fail with `OutOfDeviceMemory`
    pub fn fail_allocations(&self, count: usize) {
        self.state().fail_allocations = count;
    }

    /// The next `count` buffer binds fail
    pub fn fail_buffer_binds(&self, count: usize) {
        self.state().fail_buffer_binds = count;
    }

    pub fn set_image_requires_dedicated(&self, required: bool) {
        self.state().image_requires_dedicated = required;
    }

    pub fn create_fence(&self, signaled: bool) -> MockHandle {
        let mut state = self.state();
        let fence = state.handle();
        state.fences.insert(fence, signaled);
        fence
    }

    pub fn signal_fence(&self, fence: MockHandle) {
        self.state().fences.insert(fence, true);
    }

    pub fn command_buffer(&self) -> MockHandle {
        self.state().handle()
    }

    pub fn live_memory(&self) -> usize {
        self.state().memory.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state().images.len()
    }

    pub fn live_views(&self) -> usize {
        self.state().views.len()
    }

    pub fn live_samplers(&self) -> usize {
        self.state().samplers.len()
    }

    pub fn mapped_memory(&self) -> usize {
        self.state().memory.values().filter(|m| m.mapped).count()
    }

    pub fn map_calls(&self) -> usize {
        self.state().map_calls
    }

    pub fn allocations(&self) -> Vec<AllocationRecord> {
        self.state().allocations.clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state().commands.clone()
    }

    pub fn memory_size(&self, memory: MockHandle) -> Option<u64> {
        self.state().memory.get(&memory).map(|m| m.size)
    }

    pub fn memory_type_of(&self, memory: MockHandle) -> Option<u32> {
        self.state().memory.get(&memory).map(|m| m.memory_type_index)
    }

    pub fn buffer_size(&self, buffer: MockHandle) -> Option<u64> {
        self.state().buffers.get(&buffer).map(|b| b.size)
    }

    /// Read through a buffer's memory binding
    pub fn read_buffer(&self, buffer: MockHandle, offset: u64, len: usize) -> Vec<u8> {
        let mut state = self.state();
        let (memory, base) = bound_range(&state, buffer);
        let start = (base + offset) as usize;
        state.memory.get_mut(&memory).unwrap().bytes()[start..start + len].to_vec()
    }

    /// Write through a buffer's memory binding, as a GPU transfer would
    pub fn write_buffer(&self, buffer: MockHandle, offset: u64, data: &[u8]) {
        let mut state = self.state();
        let (memory, base) = bound_range(&state, buffer);
        let start = (base + offset) as usize;
        state.memory.get_mut(&memory).unwrap().bytes()[start..start + data.len()]
            .copy_from_slice(data);
    }

    /// Perform the buffer copies recorded into `command_buffer`, in order
    pub fn execute(&self, command_buffer: MockHandle) {
        let copies: Vec<_> = self
            .state()
            .commands
            .iter()
            .filter_map(|command| match command {
                Command::CopyBuffer {
                    command_buffer: cmd,
                    src,
                    dst,
                    regions,
                } if *cmd == command_buffer => Some((*src, *dst, regions.clone())),
                _ => None,
            })
            .collect();

        for (src, dst, regions) in copies {
            for region in regions {
                let data = self.read_buffer(src, region.src_offset, region.size as usize);
                self.write_buffer(dst, region.dst_offset, &data);
            }
        }
    }
}

fn bound_range(state: &State, buffer: MockHandle) -> (MockHandle, u64) {
    let binding = state.buffers[&buffer]
        .binding
        .as_ref()
        .expect("buffer has no memory bound");
    (binding.memory, binding.offset)
}

impl Device for MockDevice {
    type Memory = MockHandle;
    type Buffer = MockHandle;
    type Image = MockHandle;
    type ImageView = MockHandle;
    type Sampler = MockHandle;
    type Fence = MockHandle;
    type CommandBuffer = MockHandle;

    fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    fn max_allocation_size(&self) -> u64 {
        self.max_allocation_size
    }

    unsafe fn allocate_memory(
        &self,
        allocation: &MemoryAllocation<'_, Self>,
    ) -> Result<MockHandle, DeviceError> {
        let mut state = self.state();
        assert!(allocation.size > 0);
        assert!((allocation.memory_type_index as usize) < self.properties.memory_types.len());

        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(DeviceError::OutOfDeviceMemory);
        }

        let device_local = self
            .properties
            .flags(allocation.memory_type_index)
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        if device_local {
            if let Some(budget) = state.device_local_budget {
                if state.device_local_used + allocation.size > budget {
                    return Err(DeviceError::OutOfDeviceMemory);
                }
            }
            state.device_local_used += allocation.size;
        }

        let memory = state.handle();
        state.memory.insert(
            memory,
            Memory {
                size: allocation.size,
                memory_type_index: allocation.memory_type_index,
                data: None,
                mapped: false,
            },
        );
        state.allocations.push(AllocationRecord {
            memory,
            size: allocation.size,
            memory_type_index: allocation.memory_type_index,
            dedicated: allocation.dedicated.is_some(),
            device_address: allocation.device_address,
            priority: allocation.priority,
        });
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: MockHandle) {
        let mut state = self.state();
        let bound = |binding: &Option<Binding>| {
            binding.as_ref().map(|b| b.memory) == Some(memory)
        };
        assert!(
            !state.buffers.values().any(|b| bound(&b.binding)),
            "memory freed while a buffer is still bound to it"
        );
        assert!(
            !state.images.values().any(|i| bound(&i.binding)),
            "memory freed while an image is still bound to it"
        );

        let freed = state.memory.remove(&memory).expect("double free of memory");
        if self
            .properties
            .flags(freed.memory_type_index)
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        {
            state.device_local_used -= freed.size;
        }
    }

    unsafe fn map_memory(
        &self,
        memory: MockHandle,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError> {
        let mut state = self.state();
        state.map_calls += 1;
        let flags = {
            let mem = state.memory.get(&memory).expect("map of unknown memory");
            self.properties.flags(mem.memory_type_index)
        };
        assert!(flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));

        let mem = state.memory.get_mut(&memory).unwrap();
        assert!(!mem.mapped, "memory mapped twice");
        assert!(offset + size <= mem.size);
        mem.mapped = true;
        let ptr = mem.bytes().as_mut_ptr().add(offset as usize);
        Ok(NonNull::new_unchecked(ptr))
    }

    unsafe fn unmap_memory(&self, memory: MockHandle) {
        let mut state = self.state();
        let mem = state.memory.get_mut(&memory).expect("unmap of unknown memory");
        assert!(mem.mapped, "unmap of memory that is not mapped");
        mem.mapped = false;
    }

    unsafe fn create_buffer(&self, desc: &BufferDesc) -> Result<MockHandle, DeviceError> {
        assert!(desc.size > 0);
        let mut state = self.state();
        let buffer = state.handle();
        state.buffers.insert(
            buffer,
            Buffer {
                size: desc.size,
                binding: None,
            },
        );
        Ok(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: MockHandle) {
        self.state()
            .buffers
            .remove(&buffer)
            .expect("double destroy of buffer");
    }

    unsafe fn buffer_memory_requirements(&self, buffer: MockHandle) -> MemoryRequirements {
        let size = self.state().buffers[&buffer].size;
        MemoryRequirements {
            size: (size + 15) & !15,
            alignment: 16,
            memory_type_bits: 0b111,
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: MockHandle,
        memory: MockHandle,
        offset: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.fail_buffer_binds > 0 {
            state.fail_buffer_binds -= 1;
            return Err(DeviceError::OutOfDeviceMemory);
        }
        let mem_size = state.memory.get(&memory).expect("bind of unknown memory").size;
        let buf = state.buffers.get_mut(&buffer).expect("bind of unknown buffer");
        assert!(buf.binding.is_none(), "buffer bound twice");
        assert!(offset + buf.size <= mem_size, "buffer exceeds its memory");
        buf.binding = Some(Binding { memory, offset });
        Ok(())
    }

    unsafe fn buffer_device_address(&self, buffer: MockHandle) -> u64 {
        let state = self.state();
        let (memory, offset) = bound_range(&state, buffer);
        (memory << 32) + offset
    }

    unsafe fn create_image(&self, desc: &ImageDesc) -> Result<MockHandle, DeviceError> {
        assert!(desc.extent.width > 0 && desc.extent.height > 0 && desc.extent.depth > 0);
        let mut state = self.state();
        let image = state.handle();
        state.images.insert(image, Image { binding: None });
        Ok(image)
    }

    unsafe fn destroy_image(&self, image: MockHandle) {
        self.state()
            .images
            .remove(&image)
            .expect("double destroy of image");
    }

    unsafe fn image_memory_requirements(&self, image: MockHandle) -> MemoryRequirements {
        let state = self.state();
        assert!(state.images.contains_key(&image));
        MemoryRequirements {
            size: 4096,
            alignment: 256,
            memory_type_bits: 0b111,
            prefers_dedicated: state.image_requires_dedicated,
            requires_dedicated: state.image_requires_dedicated,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: MockHandle,
        memory: MockHandle,
        offset: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.state();
        assert!(state.memory.contains_key(&memory), "bind of unknown memory");
        let img = state.images.get_mut(&image).expect("bind of unknown image");
        assert!(img.binding.is_none(), "image bound twice");
        img.binding = Some(Binding { memory, offset });
        Ok(())
    }

    unsafe fn create_image_view(
        &self,
        desc: &ImageViewDesc<MockHandle>,
    ) -> Result<MockHandle, DeviceError> {
        let mut state = self.state();
        assert!(state.images.contains_key(&desc.image));
        let view = state.handle();
        state.views.insert(view);
        Ok(view)
    }

    unsafe fn destroy_image_view(&self, view: MockHandle) {
        assert!(self.state().views.remove(&view), "double destroy of view");
    }

    unsafe fn create_sampler(&self, desc: &SamplerDesc) -> Result<MockHandle, DeviceError> {
        let mut state = self.state();
        let sampler = state.handle();
        state.samplers.insert(sampler, *desc);
        Ok(sampler)
    }

    unsafe fn destroy_sampler(&self, sampler: MockHandle) {
        self.state()
            .samplers
            .remove(&sampler)
            .expect("double destroy of sampler");
    }

    unsafe fn fence_signaled(&self, fence: MockHandle) -> Result<bool, DeviceError> {
        self.state()
            .fences
            .get(&fence)
            .copied()
            .ok_or(DeviceError::DeviceLost)
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: MockHandle,
        src: MockHandle,
        dst: MockHandle,
        regions: &[BufferCopy],
    ) {
        self.state().commands.push(Command::CopyBuffer {
            command_buffer,
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: MockHandle,
        src: MockHandle,
        dst: MockHandle,
        layout: vk::ImageLayout,
        regions: &[BufferImageCopy],
    ) {
        self.state().commands.push(Command::CopyBufferToImage {
            command_buffer,
            src,
            dst,
            layout,
            regions: regions.to_vec(),
        });
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: MockHandle,
        src: MockHandle,
        layout: vk::ImageLayout,
        dst: MockHandle,
        regions: &[BufferImageCopy],
    ) {
        self.state().commands.push(Command::CopyImageToBuffer {
            command_buffer,
            src,
            layout,
            dst,
            regions: regions.to_vec(),
        });
    }

    unsafe fn cmd_image_barrier(&self, command_buffer: MockHandle, barrier: &ImageBarrier<MockHandle>) {
        self.state().commands.push(Command::Barrier {
            command_buffer,
            barrier: *barrier,
        });
    }
}
