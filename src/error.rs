use crate::device::DeviceError;
use erupt::vk;
use thiserror::Error;

/// Errors reported by the allocators in this crate.
///
/// Allocation never panics on exhaustion: every `Err` leaves the allocator's bookkeeping exactly as
/// it was before the call.
#[derive(Debug, Error)]
pub enum AllocError {
    /// No memory type satisfies the requested property flags. This is a configuration error.
    #[error("no memory type in {memory_type_bits:#b} supports {properties:?}")]
    NoCompatibleMemoryType {
        memory_type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("allocation of {size} bytes exceeds the limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("zero-sized allocation")]
    ZeroSized,

    /// The memory backing this allocation is not host visible
    #[error("memory is not host visible")]
    NotMappable,

    /// Stale or foreign handle
    #[error("invalid or stale handle")]
    InvalidHandle,

    #[error("block table is full ({0} blocks)")]
    TooManyBlocks(usize),

    /// The format has no known texel size, so image copies can't be laid out for it
    #[error("staging of {0:?} images is unsupported")]
    UnsupportedFormat(vk::Format),

    /// Image data shorter than the region it is copied to
    #[error("{size} bytes can't fill an image region of {required} bytes")]
    ShortImageData { size: u64, required: u64 },

    #[error("allocator mutex poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl AllocError {
    /// Whether this error means the device (or host) ran out of memory. These are recoverable:
    /// a smaller request, or one made after freeing something, may still succeed.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            AllocError::Device(DeviceError::OutOfDeviceMemory)
                | AllocError::Device(DeviceError::OutOfHostMemory)
        )
    }
}
