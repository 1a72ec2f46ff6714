//! Error types for acceleration structure management.

use ash::vk;
use thiserror::Error;

use crate::raytracing::ObjectId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AccelError>;

/// Errors reported by the acceleration structure builder and its backends.
#[derive(Error, Debug)]
pub enum AccelError {
    /// Object was registered twice in the same structure
    #[error("Object {0:?} is already registered")]
    DuplicateObject(ObjectId),

    /// Object referenced by an update was never registered
    #[error("Object {0:?} is not registered")]
    UnknownObject(ObjectId),

    /// Object is registered but its BLAS has not been built yet
    #[error("BLAS for object {0:?} has not been built")]
    BlasNotBuilt(ObjectId),

    /// Structure level was already built; it may only be updated from now on
    #[error("{0} is already built")]
    AlreadyBuilt(&'static str),

    /// Operation requires a structure level that has not been built yet
    #[error("{0} has not been built yet")]
    NotReady(&'static str),

    /// Structure was destroyed and can no longer be used
    #[error("Acceleration structure has been destroyed")]
    Destroyed,

    /// A Vulkan call returned an error code
    #[error("{context}: {result:?}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },

    /// GPU memory allocation failed
    #[error("GPU allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// Buffer was created without `SHADER_DEVICE_ADDRESS` usage
    #[error("Buffer '{0}' has no device address")]
    MissingDeviceAddress(&'static str),

    /// Buffer is not host-visible or not persistently mapped
    #[error("Buffer is not host mapped")]
    NotMapped,

    /// Host write would run past the end of the buffer
    #[error("Write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds {
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        size: vk::DeviceSize,
    },

    /// Device or instance lacks a required capability
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl AccelError {
    /// Wrap a Vulkan result code with the name of the failing call.
    pub fn vulkan(context: &'static str, result: vk::Result) -> Self {
        Self::Vulkan { context, result }
    }

    /// Whether this error is an object integrity error that only skips
    /// the offending object rather than failing the whole batch.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::DuplicateObject(_) | Self::UnknownObject(_) | Self::BlasNotBuilt(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_classification() {
        assert!(AccelError::DuplicateObject(ObjectId(1)).is_integrity());
        assert!(AccelError::UnknownObject(ObjectId(2)).is_integrity());
        assert!(AccelError::BlasNotBuilt(ObjectId(3)).is_integrity());
        assert!(!AccelError::Destroyed.is_integrity());
        assert!(!AccelError::vulkan("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST).is_integrity());
    }

    #[test]
    fn test_vulkan_error_display() {
        let err = AccelError::vulkan("vkFlushMappedMemoryRanges", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let msg = err.to_string();
        assert!(msg.contains("vkFlushMappedMemoryRanges"));
        assert!(msg.contains("ERROR_OUT_OF_HOST_MEMORY"));
    }

    #[test]
    fn test_out_of_bounds_display() {
        let err = AccelError::OutOfBounds { offset: 64, len: 128, size: 128 };
        assert_eq!(err.to_string(), "Write of 128 bytes at offset 64 exceeds buffer size 128");
    }
}
