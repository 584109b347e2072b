use crate::error::AllocError;
use crate::mem_allocator::{MemAllocateInfo, MemAllocator, MemHandle, MemInfo, MemoryOf};
use crate::utilization::Utilization;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Thread-safe handle to an allocator. Every operation takes one coarse lock, so concurrent
/// requests serialize.
pub struct SharedMemAllocator<A> {
    inner: Arc<Mutex<A>>,
}

impl<A> Clone for SharedMemAllocator<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: MemAllocator> SharedMemAllocator<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            inner: Arc::new(Mutex::new(allocator)),
        }
    }

    /// Lock the underlying allocator
    pub fn lock(&self) -> Result<MutexGuard<'_, A>, AllocError> {
        self.inner.lock().map_err(|_| AllocError::LockPoisoned)
    }

    /// Lock for operations that have no way to report failure. A panic while holding the lock
    /// can't leave the allocator's tables half updated, so the poison is cleared.
    fn lock_infallible(&self) -> MutexGuard<'_, A> {
        self.inner.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("allocator mutex poisoned, continuing");
            poisoned.into_inner()
        })
    }
}

impl<A: MemAllocator> MemAllocator for SharedMemAllocator<A> {
    type Device = A::Device;

    fn device(&self) -> Arc<A::Device> {
        self.lock_infallible().device()
    }

    fn alloc_memory(
        &mut self,
        info: &MemAllocateInfo<'_, A::Device>,
    ) -> Result<MemHandle, AllocError> {
        self.lock()?.alloc_memory(info)
    }

    fn free_memory(&mut self, handle: MemHandle) {
        self.lock_infallible().free_memory(handle)
    }

    fn memory_info(&self, handle: MemHandle) -> Option<MemInfo<MemoryOf<A>>> {
        self.lock_infallible().memory_info(handle)
    }

    fn map(&mut self, handle: MemHandle, offset: u64, size: u64) -> Result<NonNull<u8>, AllocError> {
        self.lock()?.map(handle, offset, size)
    }

    fn unmap(&mut self, handle: MemHandle) {
        self.lock_infallible().unmap(handle)
    }

    fn utilization(&self) -> Utilization {
        self.lock_infallible().utilization()
    }
}
