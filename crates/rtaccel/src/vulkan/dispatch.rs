//! `VK_KHR_acceleration_structure` function table.

use ash::khr::acceleration_structure;
use ash::vk;

use super::VulkanContext;
use crate::backend::AccelDispatch;
use crate::error::{AccelError, Result};

/// Acceleration structure entry points loaded for one device.
#[derive(Clone)]
pub struct AccelDispatchTable {
    loader: acceleration_structure::Device,
}

impl AccelDispatchTable {
    /// Resolve the extension entry points from the context.
    pub fn new(ctx: &VulkanContext) -> Result<Self> {
        let loader = ctx
            .accel_struct_loader
            .as_ref()
            .ok_or_else(|| AccelError::Unsupported("ray tracing not supported".into()))?
            .clone();

        Ok(Self { loader })
    }
}

impl AccelDispatch for AccelDispatchTable {
    unsafe fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            build_info,
            max_primitive_counts,
            &mut size_info,
        );
        size_info
    }

    unsafe fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR> {
        self.loader
            .create_acceleration_structure(create_info, None)
            .map_err(|e| AccelError::vulkan("vkCreateAccelerationStructureKHR", e))
    }

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        self.loader.destroy_acceleration_structure(handle, None);
    }

    unsafe fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(handle);
        self.loader.get_acceleration_structure_device_address(&addr_info)
    }

    unsafe fn cmd_build(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        self.loader
            .cmd_build_acceleration_structures(cmd, infos, build_range_infos);
    }
}
