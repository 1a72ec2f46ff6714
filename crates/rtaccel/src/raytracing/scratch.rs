//! Scratch memory for acceleration structure builds.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::backend::BufferProvider;
use crate::error::{AccelError, Result};
use crate::vulkan::Buffer;

/// Round `value` up to a power-of-two `alignment`.
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Scratch size for a batch built sequentially through one buffer: the
/// largest single requirement, not the sum.
pub fn batch_scratch_size(sizes: impl IntoIterator<Item = vk::DeviceSize>) -> vk::DeviceSize {
    sizes.into_iter().max().unwrap_or(0)
}

/// Device-local scratch buffer with an aligned base address.
pub struct ScratchBuffer {
    buffer: Buffer,
    address: vk::DeviceAddress,
    size: vk::DeviceSize,
}

impl ScratchBuffer {
    /// Allocate at least `size` usable bytes starting at an `alignment`-aligned address.
    pub unsafe fn new(
        memory: &dyn BufferProvider,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        name: &'static str,
    ) -> Result<Self> {
        let size = size.max(1);
        let buffer = memory.create_buffer(
            size + alignment - 1,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let Some(base) = buffer.device_address() else {
            memory.destroy_buffer(buffer);
            return Err(AccelError::MissingDeviceAddress(name));
        };

        Ok(Self {
            buffer,
            address: align_up(base, alignment),
            size,
        })
    }

    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    /// Usable bytes from [`ScratchBuffer::address`].
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn device_or_host_address(&self) -> vk::DeviceOrHostAddressKHR {
        vk::DeviceOrHostAddressKHR { device_address: self.address }
    }

    /// Return the buffer to the provider.
    pub unsafe fn release(self, memory: &dyn BufferProvider) {
        memory.destroy_buffer(self.buffer);
    }
}
