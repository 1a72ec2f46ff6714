//! Headless Vulkan context: instance, physical device, logical device, and queue.

use ash::khr::{acceleration_structure, deferred_host_operations};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{c_char, CStr};

use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};
use crate::error::{AccelError, Result};

/// Acceleration structure capabilities of the selected physical device.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    pub supported: bool,
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    /// `minAccelerationStructureScratchOffsetAlignment`
    pub scratch_alignment: u32,
}

/// Vulkan context without a surface, sufficient for building
/// acceleration structures.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_family: u32,
    pub queue: vk::Queue,

    pub accel_struct_loader: Option<acceleration_structure::Device>,

    pub rt_capabilities: RtCapabilities,
    pub device_properties: vk::PhysicalDeviceProperties,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanContext {
    /// Create a headless context on the best ray tracing capable GPU.
    pub unsafe fn new(enable_validation: bool) -> Result<Self> {
        let entry = Entry::load()
            .map_err(|e| AccelError::Unsupported(format!("Vulkan loader unavailable: {e}")))?;

        let api_version = match entry
            .try_enumerate_instance_version()
            .map_err(|e| AccelError::vulkan("vkEnumerateInstanceVersion", e))?
        {
            Some(version) => version,
            None => vk::API_VERSION_1_0,
        };

        if api_version < REQUIRED_VK_VERSION {
            return Err(AccelError::Unsupported(format!(
                "Vulkan 1.2 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let instance = Self::create_instance(&entry, enable_validation)?;

        let (debug_utils_loader, debug_messenger) = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok((loader, messenger)) => (Some(loader), Some(messenger)),
                Err(e) => {
                    tracing::warn!("Validation messenger unavailable: {e}");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let picked = Self::pick_physical_device(&instance);
        let (physical_device, queue_family, rt_caps) = match picked {
            Ok(picked) => picked,
            Err(e) => {
                if let (Some(loader), Some(messenger)) = (&debug_utils_loader, debug_messenger) {
                    loader.destroy_debug_utils_messenger(messenger, None);
                }
                instance.destroy_instance(None);
                return Err(e);
            }
        };

        let device_properties = instance.get_physical_device_properties(physical_device);

        let device = match Self::create_logical_device(&instance, physical_device, queue_family, rt_caps.supported) {
            Ok(device) => device,
            Err(e) => {
                if let (Some(loader), Some(messenger)) = (&debug_utils_loader, debug_messenger) {
                    loader.destroy_debug_utils_messenger(messenger, None);
                }
                instance.destroy_instance(None);
                return Err(e);
            }
        };
        let queue = device.get_device_queue(queue_family, 0);

        let accel_struct_loader = rt_caps
            .supported
            .then(|| acceleration_structure::Device::new(&instance, &device));

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue,
            accel_struct_loader,
            rt_capabilities: rt_caps,
            device_properties,
            debug_utils_loader,
            debug_messenger,
        })
    }

    unsafe fn create_instance(entry: &Entry, enable_validation: bool) -> Result<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<*const c_char> = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        entry
            .create_instance(&create_info, None)
            .map_err(|e| AccelError::vulkan("vkCreateInstance", e))
    }

    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| AccelError::vulkan("vkCreateDebugUtilsMessengerEXT", e))?;

        Ok((debug_utils, messenger))
    }

    /// Select the best ray tracing capable physical device.
    unsafe fn pick_physical_device(instance: &Instance) -> Result<(vk::PhysicalDevice, u32, RtCapabilities)> {
        let devices = instance
            .enumerate_physical_devices()
            .map_err(|e| AccelError::vulkan("vkEnumeratePhysicalDevices", e))?;

        let mut scored_devices: Vec<_> = devices
            .iter()
            .filter_map(|&device| {
                let queue_family = Self::find_queue_family(instance, device)?;
                let rt_caps = Self::check_rt_support(instance, device);
                let score = Self::rate_device(instance, device, &rt_caps);
                (score > 0).then_some((device, queue_family, rt_caps, score))
            })
            .collect();

        scored_devices.sort_by(|a, b| b.3.cmp(&a.3));

        let (physical_device, queue_family, rt_caps, _) = scored_devices
            .into_iter()
            .next()
            .ok_or_else(|| AccelError::Unsupported("no GPU with acceleration structure support".into()))?;

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        tracing::info!(gpu = %name, queue_family, "selected ray tracing device");

        Ok((physical_device, queue_family, rt_caps))
    }

    /// Rate a physical device (higher is better, zero is unusable).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice, rt_caps: &RtCapabilities) -> u32 {
        if !rt_caps.supported {
            return 0;
        }

        let props = instance.get_physical_device_properties(device);
        let mut score = 1u32;

        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        let memory_props = instance.get_physical_device_memory_properties(device);
        for i in 0..memory_props.memory_heap_count as usize {
            let heap = memory_props.memory_heaps[i];
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score += (heap.size / (1024 * 1024)) as u32; // MB of VRAM
            }
        }

        score
    }

    /// Find a queue family that can record acceleration structure builds.
    unsafe fn find_queue_family(instance: &Instance, device: vk::PhysicalDevice) -> Option<u32> {
        let families = instance.get_physical_device_queue_family_properties(device);

        let compute = |flags: vk::QueueFlags| flags.contains(vk::QueueFlags::COMPUTE);
        families
            .iter()
            .position(|f| compute(f.queue_flags) && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .or_else(|| families.iter().position(|f| compute(f.queue_flags)))
            .map(|i| i as u32)
    }

    /// Check acceleration structure support on a physical device.
    unsafe fn check_rt_support(instance: &Instance, device: vk::PhysicalDevice) -> RtCapabilities {
        let extensions = match instance.enumerate_device_extension_properties(device) {
            Ok(ext) => ext,
            Err(_) => return RtCapabilities::default(),
        };

        let has_extension = |wanted: &CStr| {
            extensions
                .iter()
                .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == wanted)
        };

        if !has_extension(acceleration_structure::NAME) || !has_extension(deferred_host_operations::NAME) {
            return RtCapabilities::default();
        }

        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut accel_props);
        instance.get_physical_device_properties2(device, &mut props2);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut vulkan_12_features);
        instance.get_physical_device_features2(device, &mut features2);

        RtCapabilities {
            supported: accel_features.acceleration_structure == vk::TRUE
                && vulkan_12_features.buffer_device_address == vk::TRUE,
            max_geometry_count: accel_props.max_geometry_count,
            max_instance_count: accel_props.max_instance_count,
            max_primitive_count: accel_props.max_primitive_count,
            scratch_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
        }
    }

    /// Create the logical device with acceleration structure features enabled.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        enable_rt: bool,
    ) -> Result<Device> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let mut extensions: Vec<*const c_char> = Vec::new();
        if enable_rt {
            extensions.push(acceleration_structure::NAME.as_ptr());
            extensions.push(deferred_host_operations::NAME.as_ptr());
        }

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(enable_rt);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(enable_rt);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        instance
            .create_device(physical_device, &create_info, None)
            .map_err(|e| AccelError::vulkan("vkCreateDevice", e))
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle();

            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Routes validation layer messages into `tracing`.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{message}");
    }

    vk::FALSE
}
