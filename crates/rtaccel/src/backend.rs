//! Device services consumed by the acceleration structure builder.
//!
//! The builder never touches a global device. Buffer allocation, command
//! submission and the KHR acceleration structure entry points are passed in
//! explicitly through [`AccelBackend`], so a headless Vulkan device, a
//! renderer's existing managers, or a host-side fake can drive it.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::error::{AccelError, Result};
use crate::vulkan::Buffer;

/// Allocates, uploads to, and copies between GPU buffers.
pub trait BufferProvider {
    /// Create a buffer with the given usage in the given memory location.
    ///
    /// Buffers created with `SHADER_DEVICE_ADDRESS` usage must report a
    /// device address; host-visible locations must be persistently mapped.
    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer>;

    /// Create a host-visible buffer and fill it with `data`.
    unsafe fn create_buffer_init(
        &self,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        data: &[u8],
        name: &str,
    ) -> Result<Buffer> {
        let buffer = self.create_buffer(data.len().max(1) as vk::DeviceSize, usage, location, name)?;
        let written = buffer
            .write_bytes(0, data)
            .and_then(|()| self.flush(&buffer, 0, data.len() as vk::DeviceSize));
        match written {
            Ok(()) => Ok(buffer),
            Err(e) => {
                self.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    /// Release a buffer and its memory.
    unsafe fn destroy_buffer(&self, buffer: Buffer);

    /// Make host writes in `offset..offset + size` visible to the device.
    unsafe fn flush(&self, buffer: &Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<()>;

    /// Record a buffer-to-buffer copy.
    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: &Buffer,
        dst: &Buffer,
        region: vk::BufferCopy,
    );
}

/// Global memory barrier between two pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl Barrier {
    /// Acceleration structure build → next build reading it or reusing scratch.
    pub const BUILD_TO_BUILD: Self = Self {
        src_access: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        src_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
    };

    /// TLAS build → ray traversal.
    pub const BUILD_TO_TRACE: Self = Self {
        src_access: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        src_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
    };

    /// Instance buffer upload → TLAS build reading it.
    pub const UPLOAD_TO_BUILD: Self = Self {
        src_access: vk::AccessFlags::TRANSFER_WRITE,
        dst_access: vk::AccessFlags::from_raw(
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR.as_raw() | vk::AccessFlags::SHADER_READ.as_raw(),
        ),
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
    };
}

/// Records and submits command buffers.
pub trait CommandExecutor {
    /// Allocate a one-shot command buffer and begin recording.
    unsafe fn begin(&self) -> Result<vk::CommandBuffer>;

    /// End, submit, and block until the GPU finishes the command buffer.
    /// The command buffer is released whether or not submission succeeds.
    unsafe fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Record a global memory barrier.
    unsafe fn insert_barrier(&self, cmd: vk::CommandBuffer, barrier: Barrier);
}

/// `VK_KHR_acceleration_structure` entry points, resolved once per device.
pub trait AccelDispatch {
    /// Query storage and scratch sizes for a build or update.
    unsafe fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static>;

    unsafe fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR>;

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);

    unsafe fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress;

    /// Record build/update commands, one range slice per build info.
    unsafe fn cmd_build(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    );
}

/// Device services handed to every build, update and destroy call.
#[derive(Clone, Copy)]
pub struct AccelBackend<'a> {
    pub memory: &'a dyn BufferProvider,
    pub commands: &'a dyn CommandExecutor,
    pub dispatch: &'a dyn AccelDispatch,
}

impl<'a> AccelBackend<'a> {
    pub fn new(
        memory: &'a dyn BufferProvider,
        commands: &'a dyn CommandExecutor,
        dispatch: &'a dyn AccelDispatch,
    ) -> Self {
        Self { memory, commands, dispatch }
    }

    /// Create a storage buffer and an acceleration structure living in it.
    ///
    /// Returns the handle, its backing buffer and its device address. The
    /// buffer is released again if structure creation fails.
    pub(crate) unsafe fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: &'static str,
    ) -> Result<(vk::AccelerationStructureKHR, Buffer, vk::DeviceAddress)> {
        let buffer = self.memory.create_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .size(size)
            .ty(ty);

        let handle = match self.dispatch.create_acceleration_structure(&create_info) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to create {name}: {e}");
                self.memory.destroy_buffer(buffer);
                return Err(e);
            }
        };

        let address = self.dispatch.acceleration_structure_address(handle);
        Ok((handle, buffer, address))
    }

    /// Submit a recorded batch, logging failures before propagating them.
    pub(crate) unsafe fn submit(&self, cmd: vk::CommandBuffer, what: &str) -> Result<()> {
        self.commands.submit_and_wait(cmd).inspect_err(|e: &AccelError| {
            tracing::error!("{what} submission failed: {e}");
        })
    }
}
