// Vulkan backend for acceleration structure construction

pub mod context;
pub mod memory;
pub mod commands;
pub mod device;

pub use context::{AccelCapabilities, VulkanContext};
pub use memory::{Buffer, MemoryManager};
pub use commands::CommandManager;
pub use device::VulkanAccelerationDevice;

use ash::vk;
use rtaccel_core::AccelError;
use std::ffi::CStr;

/// Minimum Vulkan version (buffer device address is core in 1.2).
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Application name for the Vulkan instance.
pub const APP_NAME: &CStr = c"rtaccel";

/// Engine name for the Vulkan instance.
pub const ENGINE_NAME: &CStr = c"rtaccel";

pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);

/// Map a failed Vulkan call onto the error taxonomy.
///
/// Out-of-memory results are allocation failures and a lost device is
/// unrecoverable; everything else is reported as a device error.
pub fn vk_error(what: &str, result: vk::Result) -> AccelError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => AccelError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            AccelError::Allocation(format!("Failed to {}: {:?}", what, result))
        }
        _ => AccelError::Device(format!("Failed to {}: {:?}", what, result)),
    }
}
