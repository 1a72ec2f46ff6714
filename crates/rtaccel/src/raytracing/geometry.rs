//! Per-object triangle geometry and BLAS geometry descriptors.

use ash::vk;
use glam::Mat4;

use super::ObjectId;

/// Supplies device-resident geometry for registered objects.
///
/// Vertex positions are three `f32`s at the start of each vertex; indices
/// are `u32` triangle lists.
pub trait GeometrySource {
    fn vertex_buffer_address(&self, object: ObjectId) -> vk::DeviceAddress;

    fn index_buffer_address(&self, object: ObjectId) -> vk::DeviceAddress;

    /// Stride between vertices in bytes, shared by all objects.
    fn vertex_stride(&self) -> vk::DeviceSize;

    fn vertex_count(&self, object: ObjectId) -> u32;

    /// Number of triangles.
    fn primitive_count(&self, object: ObjectId) -> u32;

    /// Column-major model matrix.
    fn transform(&self, _object: ObjectId) -> Mat4 {
        Mat4::IDENTITY
    }

    /// Whether the geometry deforms every frame (skinning, morphing).
    fn is_dynamic(&self, _object: ObjectId) -> bool {
        false
    }
}

/// Vertex and index buffer addresses a BLAS was last built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeometryAddresses {
    pub vertex: vk::DeviceAddress,
    pub index: vk::DeviceAddress,
}

/// Triangle geometry of one object, ready to feed a BLAS build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub addresses: GeometryAddresses,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_count: u32,
    pub primitive_count: u32,
    pub flags: vk::GeometryFlagsKHR,
}

impl TriangleGeometry {
    pub const VERTEX_FORMAT: vk::Format = vk::Format::R32G32B32_SFLOAT;
    pub const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;

    /// Read the current geometry of `object`.
    pub fn query(source: &dyn GeometrySource, object: ObjectId, flags: vk::GeometryFlagsKHR) -> Self {
        Self {
            addresses: GeometryAddresses {
                vertex: source.vertex_buffer_address(object),
                index: source.index_buffer_address(object),
            },
            vertex_stride: source.vertex_stride(),
            vertex_count: source.vertex_count(object),
            primitive_count: source.primitive_count(object),
            flags,
        }
    }

    /// Highest addressable vertex index.
    pub fn max_vertex(&self) -> u32 {
        self.vertex_count.saturating_sub(1)
    }

    pub fn to_vk(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(Self::VERTEX_FORMAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: self.addresses.vertex })
            .vertex_stride(self.vertex_stride)
            .max_vertex(self.max_vertex())
            .index_type(Self::INDEX_TYPE)
            .index_data(vk::DeviceOrHostAddressConstKHR { device_address: self.addresses.index });

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(self.flags)
    }

    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
    }
}
