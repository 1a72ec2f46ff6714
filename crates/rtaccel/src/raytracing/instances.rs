//! TLAS instance table.
//!
//! Instance records live in a persistently mapped staging buffer, which is
//! the only surface the host mutates, and are copied into one of several
//! device-local instance buffers that the TLAS build reads.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use gpu_allocator::MemoryLocation;

use super::{ObjectIndex, MAX_CUSTOM_INDEX};
use crate::backend::{AccelBackend, Barrier, BufferProvider};
use crate::error::{AccelError, Result};
use crate::vulkan::Buffer;

/// Instance data for TLAS building.
///
/// Layout matches `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: [[f32; 4]; 3],
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

/// Size of one instance record in bytes.
pub const RECORD_SIZE: vk::DeviceSize = std::mem::size_of::<InstanceRecord>() as vk::DeviceSize;

const _: () = assert!(std::mem::size_of::<InstanceRecord>() == 64);

impl Default for InstanceRecord {
    fn default() -> Self {
        Self {
            transform: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            instance_custom_index_and_mask: 0xFF << 24,
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: 0,
        }
    }
}

impl InstanceRecord {
    /// Create a new instance with the given transform and BLAS reference.
    pub fn new(transform: [[f32; 4]; 3], custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        debug_assert!(custom_index <= MAX_CUSTOM_INDEX);
        Self {
            transform,
            instance_custom_index_and_mask: (0xFF << 24) | (custom_index & MAX_CUSTOM_INDEX),
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: blas_address,
        }
    }

    /// Instance for a registered object: row-major 3x4 transform taken from
    /// its model matrix, custom index equal to its position.
    pub fn for_object(model: &Mat4, index: ObjectIndex, blas_address: vk::DeviceAddress, mask: u8) -> Self {
        Self::new(row_major_3x4(model), index.get(), blas_address).with_mask(mask)
    }

    /// Set the visibility mask.
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.instance_custom_index_and_mask =
            ((mask as u32) << 24) | (self.instance_custom_index_and_mask & MAX_CUSTOM_INDEX);
        self
    }

    /// Set the SBT offset and flags.
    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.instance_shader_binding_table_record_offset_and_flags =
            ((flags.as_raw() as u32) << 24) | (offset & 0xFFFFFF);
        self
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & MAX_CUSTOM_INDEX
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn sbt_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & 0xFFFFFF
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.instance_shader_binding_table_record_offset_and_flags >> 24)
    }
}

/// Convert a column-major model matrix into the row-major 3x4 affine
/// layout instance records use.
pub fn row_major_3x4(model: &Mat4) -> [[f32; 4]; 3] {
    let rows = model.transpose().to_cols_array_2d();
    [rows[0], rows[1], rows[2]]
}

/// Byte offset of an object's record.
pub fn record_offset(index: ObjectIndex) -> vk::DeviceSize {
    index.get() as vk::DeviceSize * RECORD_SIZE
}

/// Staging buffer plus per-frame device-local instance buffers.
pub struct InstanceTable {
    staging: Buffer,
    device: Vec<Buffer>,
    addresses: Vec<vk::DeviceAddress>,
    count: u32,
}

impl InstanceTable {
    /// Full upload path: allocate a fresh staging buffer holding every
    /// record and `slots` device-local instance buffers.
    pub unsafe fn new(memory: &dyn BufferProvider, records: &[InstanceRecord], slots: usize) -> Result<Self> {
        let size = (records.len() as vk::DeviceSize * RECORD_SIZE).max(RECORD_SIZE);

        let staging = memory.create_buffer_init(
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &padded_bytes(records, size),
            "tlas_instances_staging",
        )?;

        let mut table = Self {
            staging,
            device: Vec::with_capacity(slots),
            addresses: Vec::with_capacity(slots),
            count: records.len() as u32,
        };

        for _ in 0..slots.max(1) {
            let buffer = memory.create_buffer(
                size,
                vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                MemoryLocation::GpuOnly,
                "tlas_instances",
            );
            let address = buffer
                .and_then(|b| match b.require_address("tlas_instances") {
                    Ok(address) => Ok((b, address)),
                    Err(e) => {
                        memory.destroy_buffer(b);
                        Err(e)
                    }
                });
            match address {
                Ok((buffer, address)) => {
                    table.device.push(buffer);
                    table.addresses.push(address);
                }
                Err(e) => {
                    table.destroy(memory);
                    return Err(e);
                }
            }
        }

        tracing::debug!(records = records.len(), slots = table.device.len(), "created instance table");
        Ok(table)
    }

    /// Partial upload path: overwrite individual records in the mapped
    /// staging memory and flush exactly the bytes written.
    pub unsafe fn write_records(
        &mut self,
        memory: &dyn BufferProvider,
        updates: &[(ObjectIndex, InstanceRecord)],
    ) -> Result<()> {
        assert!(
            self.staging.is_mapped(),
            "partial instance upload requires a persistently mapped staging buffer"
        );

        for (index, record) in updates {
            if index.get() >= self.count {
                return Err(AccelError::OutOfBounds {
                    offset: record_offset(*index),
                    len: RECORD_SIZE,
                    size: self.count as vk::DeviceSize * RECORD_SIZE,
                });
            }
            let offset = record_offset(*index);
            self.staging.write_bytes(offset, bytemuck::bytes_of(record))?;
            memory.flush(&self.staging, offset, RECORD_SIZE)?;
        }

        Ok(())
    }

    /// Record the staging → device copy for `slot` followed by the barrier
    /// that makes it visible to the TLAS build.
    ///
    /// The whole table is copied so a slot is current whenever it is selected.
    pub unsafe fn record_upload(&self, backend: &AccelBackend<'_>, cmd: vk::CommandBuffer, slot: usize) {
        let size = self.count as vk::DeviceSize * RECORD_SIZE;
        if size > 0 {
            let region = vk::BufferCopy::default().src_offset(0).dst_offset(0).size(size);
            backend
                .memory
                .cmd_copy_buffer(cmd, &self.staging, &self.device[slot], region);
        }
        backend.commands.insert_barrier(cmd, Barrier::UPLOAD_TO_BUILD);
    }

    /// Device address of the instance buffer for `slot`.
    pub fn device_address(&self, slot: usize) -> vk::DeviceAddress {
        self.addresses[slot]
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn slots(&self) -> usize {
        self.device.len()
    }

    pub fn staging(&self) -> &Buffer {
        &self.staging
    }

    pub fn device_buffer(&self, slot: usize) -> &Buffer {
        &self.device[slot]
    }

    /// Read a record back from staging memory.
    pub fn record(&self, index: ObjectIndex) -> Option<InstanceRecord> {
        if index.get() >= self.count {
            return None;
        }
        let offset = record_offset(index) as usize;
        // SAFETY: staging memory is only written by the host.
        let bytes = unsafe { self.staging.mapped_bytes()? };
        Some(bytemuck::pod_read_unaligned(&bytes[offset..offset + RECORD_SIZE as usize]))
    }

    /// All records currently in staging memory.
    pub fn records(&self) -> Vec<InstanceRecord> {
        (0..self.count)
            .filter_map(|i| self.record(ObjectIndex::from_raw(i)))
            .collect()
    }

    /// Release the staging and device buffers.
    pub unsafe fn destroy(self, memory: &dyn BufferProvider) {
        memory.destroy_buffer(self.staging);
        for buffer in self.device {
            memory.destroy_buffer(buffer);
        }
    }
}

fn padded_bytes(records: &[InstanceRecord], size: vk::DeviceSize) -> Vec<u8> {
    let mut bytes = bytemuck::cast_slice::<InstanceRecord, u8>(records).to_vec();
    bytes.resize(size as usize, 0);
    bytes
}
