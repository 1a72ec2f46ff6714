//! GPU memory management using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;

use super::VulkanContext;
use crate::backend::BufferProvider;
use crate::error::{AccelError, Result};

/// GPU buffer with associated memory.
///
/// Move-only: exactly one owner releases it through
/// [`BufferProvider::destroy_buffer`].
pub struct Buffer {
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    device_address: Option<vk::DeviceAddress>,
    mapped: Option<NonNull<u8>>,
}

// SAFETY: the mapped pointer is only dereferenced by the owner of the buffer,
// and the buffer is never shared between threads while mapped writes are pending.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Assemble a buffer from raw parts, for buffer providers that do not
    /// allocate through gpu-allocator.
    ///
    /// # Safety
    /// `mapped`, if present, must point to at least `size` writable bytes that
    /// stay valid until the buffer is destroyed.
    pub unsafe fn from_raw_parts(
        handle: vk::Buffer,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        device_address: Option<vk::DeviceAddress>,
        mapped: Option<NonNull<u8>>,
    ) -> Self {
        Self {
            handle,
            allocation: None,
            size,
            usage,
            location,
            device_address,
            mapped,
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }

    /// Device address, or an error naming the buffer if it has none.
    pub fn require_address(&self, name: &'static str) -> Result<vk::DeviceAddress> {
        self.device_address.ok_or(AccelError::MissingDeviceAddress(name))
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Persistently mapped host pointer, if the memory is host-visible.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Write bytes to the mapped memory at `offset`.
    ///
    /// # Safety
    /// The GPU must not be accessing the written range.
    pub unsafe fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let ptr = self.mapped.ok_or(AccelError::NotMapped)?;
        let len = data.len() as vk::DeviceSize;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(AccelError::OutOfBounds { offset, len, size: self.size });
        }
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset as usize), data.len());
        Ok(())
    }

    /// Write a slice of plain-old-data values at `offset`.
    ///
    /// # Safety
    /// Same as [`Buffer::write_bytes`].
    pub unsafe fn write<T: bytemuck::Pod>(&self, offset: vk::DeviceSize, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// View the mapped memory.
    ///
    /// # Safety
    /// The GPU must not be writing to the buffer.
    pub unsafe fn mapped_bytes(&self) -> Option<&[u8]> {
        self.mapped
            .map(|ptr| std::slice::from_raw_parts(ptr.as_ptr() as *const u8, self.size as usize))
    }
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
    non_coherent_atom_size: vk::DeviceSize,
}

impl MemoryManager {
    /// Create a new memory manager with buffer device addresses enabled.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        if !ctx.rt_capabilities.supported {
            return Err(AccelError::Unsupported(
                "buffer device address requires a ray tracing capable device".into(),
            ));
        }

        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
            non_coherent_atom_size: ctx.device_properties.limits.non_coherent_atom_size.max(1),
        })
    }
}

/// Widen a flush range to `atom` boundaries.
///
/// `memory_end` is the size of the backing `VkDeviceMemory` when known. A
/// range whose rounded end would pass it runs to `VK_WHOLE_SIZE` instead.
fn atom_aligned_range(
    atom: vk::DeviceSize,
    start: vk::DeviceSize,
    size: vk::DeviceSize,
    memory_end: Option<vk::DeviceSize>,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let aligned_start = start / atom * atom;
    let aligned_end = (start + size).div_ceil(atom) * atom;
    match memory_end {
        Some(end) if aligned_end > end => (aligned_start, vk::WHOLE_SIZE),
        _ => (aligned_start, aligned_end - aligned_start),
    }
}

impl BufferProvider for MemoryManager {
    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .map_err(|e| AccelError::vulkan("vkCreateBuffer", e))?;

        let requirements = self.device.get_buffer_memory_requirements(handle);

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .device
            .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        {
            self.device.destroy_buffer(handle, None);
            let _ = self.allocator.lock().free(allocation);
            return Err(AccelError::vulkan("vkBindBufferMemory", e));
        }

        // Get device address if usage includes it
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        let mapped = allocation.mapped_ptr().map(|p| p.cast::<u8>());

        tracing::debug!(name, size, ?location, "created buffer");

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            location,
            device_address,
            mapped,
        })
    }

    unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                tracing::error!("Failed to free buffer memory: {e}");
            }
        }
    }

    unsafe fn flush(&self, buffer: &Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<()> {
        let allocation = buffer.allocation().ok_or(AccelError::NotMapped)?;
        if !buffer.is_mapped() {
            return Err(AccelError::NotMapped);
        }
        if size == 0 {
            return Ok(());
        }

        // Dedicated allocations own their whole memory object.
        let memory_end = allocation.is_dedicated().then(|| allocation.offset() + allocation.size());
        let (aligned_offset, aligned_size) = atom_aligned_range(
            self.non_coherent_atom_size,
            allocation.offset() + offset,
            size,
            memory_end,
        );
        let range = vk::MappedMemoryRange::default()
            .memory(allocation.memory())
            .offset(aligned_offset)
            .size(aligned_size);

        self.device
            .flush_mapped_memory_ranges(&[range])
            .map_err(|e| AccelError::vulkan("vkFlushMappedMemoryRanges", e))
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: &Buffer,
        dst: &Buffer,
        region: vk::BufferCopy,
    ) {
        self.device.cmd_copy_buffer(cmd, src.handle, dst.handle, &[region]);
    }
}
