//! Vulkan backend for acceleration structure management.
//!
//! Implements the buffer provider, command executor and acceleration
//! structure dispatch table over `ash` and `gpu-allocator`, on a headless
//! device with `VK_KHR_acceleration_structure` enabled.

pub mod commands;
pub mod context;
pub mod dispatch;
pub mod memory;

pub use commands::CommandManager;
pub use context::{RtCapabilities, VulkanContext};
pub use dispatch::AccelDispatchTable;
pub use memory::{Buffer, MemoryManager};

use ash::vk;
use std::ffi::CStr;

/// Buffer device address and acceleration structures need Vulkan 1.2.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"rtaccel";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"rtaccel";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);
