//! The raw memory allocation contract shared by every allocation strategy.
use crate::arena::SlotId;
use crate::device::{DedicatedTarget, Device, MemoryRequirements};
use crate::error::AllocError;
use crate::utilization::Utilization;
use bytemuck::Pod;
use erupt::vk;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

/// Native memory handle type of an allocator's device
pub type MemoryOf<A> = <<A as MemAllocator>::Device as Device>::Memory;

/// Opaque, generation-checked reference to one memory allocation
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemHandle(pub(crate) SlotId);

/// Where an allocation lives
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemInfo<M> {
    pub memory: M,
    pub offset: u64,
    pub size: u64,
}

/// Parameters of a memory request
pub struct MemAllocateInfo<'a, D: Device + ?Sized> {
    pub requirements: MemoryRequirements,
    /// Flags the memory type must have
    pub properties: vk::MemoryPropertyFlags,
    /// Memory will back an optimally tiled image. Linear and non-linear resources never share a block.
    pub tiling_optimal: bool,
    /// Allocate memory exclusively for this object
    pub dedicated: Option<DedicatedTarget<D>>,
    /// Memory will be bound to a buffer whose device address is queried
    pub device_address: bool,
    /// Memory priority, overriding the allocator's default
    pub priority: Option<f32>,
    pub debug_name: Option<&'a str>,
}

impl<'a, D: Device + ?Sized> MemAllocateInfo<'a, D> {
    pub fn new(requirements: MemoryRequirements, properties: vk::MemoryPropertyFlags) -> Self {
        Self {
            requirements,
            properties,
            tiling_optimal: false,
            dedicated: None,
            device_address: false,
            priority: None,
            debug_name: None,
        }
    }

    pub fn tiling_optimal(mut self, tiling_optimal: bool) -> Self {
        self.tiling_optimal = tiling_optimal;
        self
    }

    pub fn dedicated_buffer(mut self, buffer: D::Buffer) -> Self {
        self.dedicated = Some(DedicatedTarget::Buffer(buffer));
        self
    }

    pub fn dedicated_image(mut self, image: D::Image) -> Self {
        self.dedicated = Some(DedicatedTarget::Image(image));
        self
    }

    pub fn device_address(mut self, device_address: bool) -> Self {
        self.device_address = device_address;
        self
    }

    pub fn priority(mut self, priority: f32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn debug_name(mut self, name: &'a str) -> Self {
        self.debug_name = Some(name);
        self
    }
}

/// Acquires, releases and maps raw device memory.
///
/// `ResourceAllocator` and `BufferSubAllocator` are generic over this so the allocation strategy
/// beneath them can be swapped.
pub trait MemAllocator {
    type Device: Device;

    fn device(&self) -> Arc<Self::Device>;

    fn alloc_memory(
        &mut self,
        info: &MemAllocateInfo<'_, Self::Device>,
    ) -> Result<MemHandle, AllocError>;

    /// Stale handles are ignored (and reported in debug builds)
    fn free_memory(&mut self, handle: MemHandle);

    fn memory_info(&self, handle: MemHandle) -> Option<MemInfo<MemoryOf<Self>>>;

    /// Host pointer to `offset` bytes into the allocation. Every successful call must be paired
    /// with an `unmap`; prefer [`MemAllocator::mapping`].
    fn map(&mut self, handle: MemHandle, offset: u64, size: u64) -> Result<NonNull<u8>, AllocError>;

    fn unmap(&mut self, handle: MemHandle);

    fn utilization(&self) -> Utilization;

    /// Map `size` bytes at `offset`, unmapping when the guard drops
    fn mapping(
        &mut self,
        handle: MemHandle,
        offset: u64,
        size: u64,
    ) -> Result<Mapping<'_, Self>, AllocError>
    where
        Self: Sized,
    {
        let ptr = self.map(handle, offset, size)?;
        Ok(Mapping {
            allocator: self,
            handle,
            ptr,
            len: size as usize,
        })
    }
}

/// A mapped memory range. Unmaps on drop.
pub struct Mapping<'a, A: MemAllocator> {
    allocator: &'a mut A,
    handle: MemHandle,
    ptr: NonNull<u8>,
    len: usize,
}

impl<A: MemAllocator> Mapping<'_, A> {
    /// Copy `data` in at `offset` bytes
    pub fn write<T: Pod>(&mut self, offset: usize, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn handle(&self) -> MemHandle {
        self.handle
    }
}

impl<A: MemAllocator> Deref for Mapping<'_, A> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<A: MemAllocator> DerefMut for Mapping<'_, A> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<A: MemAllocator> Drop for Mapping<'_, A> {
    fn drop(&mut self) {
        self.allocator.unmap(self.handle);
    }
}

/// Single-threaded sharing of one allocator between several users
impl<A: MemAllocator> MemAllocator for Rc<RefCell<A>> {
    type Device = A::Device;

    fn device(&self) -> Arc<A::Device> {
        self.borrow().device()
    }

    fn alloc_memory(
        &mut self,
        info: &MemAllocateInfo<'_, A::Device>,
    ) -> Result<MemHandle, AllocError> {
        self.borrow_mut().alloc_memory(info)
    }

    fn free_memory(&mut self, handle: MemHandle) {
        self.borrow_mut().free_memory(handle)
    }

    fn memory_info(&self, handle: MemHandle) -> Option<MemInfo<MemoryOf<A>>> {
        self.borrow().memory_info(handle)
    }

    fn map(&mut self, handle: MemHandle, offset: u64, size: u64) -> Result<NonNull<u8>, AllocError> {
        self.borrow_mut().map(handle, offset, size)
    }

    fn unmap(&mut self, handle: MemHandle) {
        self.borrow_mut().unmap(handle)
    }

    fn utilization(&self) -> Utilization {
        self.borrow().utilization()
    }
}

/// Host pointer to a persistently mapped block
#[derive(Copy, Clone, Debug)]
pub(crate) struct MappedPtr(pub NonNull<u8>);

// The pointer is only dereferenced through the allocator that owns the mapping, which requires
// `&mut` access.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    /// Pointer `offset` bytes past the start of the mapping
    pub fn offset(self, offset: u64) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(offset as usize)) }
    }
}
