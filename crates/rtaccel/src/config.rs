//! Acceleration structure build configuration.
//!
//! Holds the build-flag policy for static and deforming geometry, the
//! number of frames in flight used for double-buffered TLAS inputs, and
//! device alignment limits.

use ash::vk;

use crate::vulkan::VulkanContext;

/// Default number of frames in flight for TLAS instance/scratch buffers.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Default scratch alignment when the device limit is unknown.
/// Matches the largest `minAccelerationStructureScratchOffsetAlignment`
/// reported by current drivers.
pub const DEFAULT_SCRATCH_ALIGNMENT: vk::DeviceSize = 128;

/// Smallest buffer ever allocated. Vulkan forbids zero-sized buffers, and
/// empty BLAS/TLAS still need storage.
pub const MIN_BUFFER_SIZE: vk::DeviceSize = 256;

/// Acceleration structure configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelConfig {
    /// Number of instance/scratch buffer slots for the TLAS (1 disables double buffering)
    pub frames_in_flight: usize,
    /// Required alignment of scratch buffer device addresses
    pub scratch_alignment: vk::DeviceSize,
    /// Minimum size of any allocated buffer
    pub min_buffer_size: vk::DeviceSize,
    /// BLAS flags for geometry that deforms every frame
    pub dynamic_blas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// BLAS flags for rigid geometry
    pub static_blas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// TLAS flags
    pub tlas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Flags applied to every triangle geometry
    pub geometry_flags: vk::GeometryFlagsKHR,
    /// Visibility mask written into new instance records
    pub default_mask: u8,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            scratch_alignment: DEFAULT_SCRATCH_ALIGNMENT,
            min_buffer_size: MIN_BUFFER_SIZE,
            dynamic_blas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            static_blas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            tlas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            geometry_flags: vk::GeometryFlagsKHR::OPAQUE,
            default_mask: 0xFF,
        }
    }
}

impl AccelConfig {
    /// Create a config with defaults validated against device limits.
    pub fn from_device(ctx: &VulkanContext) -> Self {
        let alignment = ctx.rt_capabilities.scratch_alignment;

        Self {
            scratch_alignment: Self::sanitize_alignment(alignment as vk::DeviceSize),
            ..Self::default()
        }
    }

    /// Set the number of frames in flight (clamped to at least one).
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    /// Set the scratch alignment (rounded up to a power of two).
    pub fn with_scratch_alignment(mut self, alignment: vk::DeviceSize) -> Self {
        self.scratch_alignment = Self::sanitize_alignment(alignment);
        self
    }

    /// Select BLAS build flags for an object.
    ///
    /// Deforming geometry trades trace quality for build speed since it is
    /// refitted every frame.
    pub fn blas_flags(&self, dynamic: bool) -> vk::BuildAccelerationStructureFlagsKHR {
        if dynamic {
            self.dynamic_blas_flags
        } else {
            self.static_blas_flags
        }
    }

    /// Round a buffer size up to the configured minimum.
    pub fn buffer_size(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        size.max(self.min_buffer_size)
    }

    fn sanitize_alignment(alignment: vk::DeviceSize) -> vk::DeviceSize {
        if alignment == 0 {
            DEFAULT_SCRATCH_ALIGNMENT
        } else {
            alignment.next_power_of_two()
        }
    }
}
