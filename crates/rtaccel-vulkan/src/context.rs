//! Headless Vulkan context: instance, physical device, logical device and the
//! queue acceleration structure builds are submitted to.

use ash::khr::{acceleration_structure, deferred_host_operations, ray_query};
use ash::{vk, Device, Entry, Instance};
use std::ffi::CStr;
use std::os::raw::c_char;

use rtaccel_core::{AccelError, AccelResult, DeviceLimits};

use super::{vk_error, APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Acceleration structure capabilities of the selected physical device.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccelCapabilities {
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    pub min_scratch_alignment: u32,
    pub supports_ray_query: bool,
}

impl AccelCapabilities {
    pub fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            max_geometry_count: self.max_geometry_count,
            max_instance_count: self.max_instance_count,
            max_primitive_count: self.max_primitive_count,
            scratch_alignment: (self.min_scratch_alignment as u64).max(1),
        }
    }
}

/// Core Vulkan objects for acceleration structure work.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_family: u32,
    pub queue: vk::Queue,

    pub accel_struct_loader: acceleration_structure::Device,

    pub capabilities: AccelCapabilities,
    pub device_properties: vk::PhysicalDeviceProperties,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanContext {
    /// Create a new Vulkan context without a surface.
    ///
    /// Loads the Vulkan library at runtime and picks the best device that
    /// supports `VK_KHR_acceleration_structure`.
    pub unsafe fn new(enable_validation: bool) -> AccelResult<Self> {
        let entry = Entry::load().map_err(|e| AccelError::Device(format!("Failed to load Vulkan: {:?}", e)))?;

        let api_version = match entry
            .try_enumerate_instance_version()
            .map_err(|e| vk_error("enumerate instance version", e))?
        {
            Some(version) => version,
            None => vk::API_VERSION_1_0,
        };

        if api_version < REQUIRED_VK_VERSION {
            return Err(AccelError::Device(format!(
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
                    log::warn!("Validation messages unavailable: {}", e);
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let (physical_device, queue_family, capabilities) = match Self::pick_physical_device(&instance) {
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

        let device = match Self::create_logical_device(&instance, physical_device, queue_family, &capabilities) {
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
        let accel_struct_loader = acceleration_structure::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue,
            accel_struct_loader,
            capabilities,
            device_properties,
            debug_utils_loader,
            debug_messenger,
        })
    }

    unsafe fn create_instance(entry: &Entry, enable_validation: bool) -> AccelResult<Instance> {
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

        let layer_name_ptrs: Vec<*const c_char> = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry
            .create_instance(&create_info, None)
            .map_err(|e| vk_error("create Vulkan instance", e))
    }

    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> AccelResult<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| vk_error("create debug messenger", e))?;

        Ok((debug_utils, messenger))
    }

    /// Select the best physical device that can build acceleration structures.
    unsafe fn pick_physical_device(instance: &Instance) -> AccelResult<(vk::PhysicalDevice, u32, AccelCapabilities)> {
        let devices = instance
            .enumerate_physical_devices()
            .map_err(|e| vk_error("enumerate physical devices", e))?;

        let mut scored: Vec<_> = devices
            .iter()
            .filter_map(|&device| {
                let queue_family = Self::find_queue_family(instance, device)?;
                let capabilities = Self::check_accel_support(instance, device)?;
                Some((device, queue_family, capabilities, Self::rate_device(instance, device, &capabilities)))
            })
            .collect();

        scored.sort_by(|a, b| b.3.cmp(&a.3));

        let (physical_device, queue_family, capabilities, _) = scored
            .first()
            .copied()
            .ok_or_else(|| AccelError::Device("No GPU with acceleration structure support found".to_string()))?;

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        log::info!(
            "Selected GPU: {} (max instances {}, scratch alignment {}, ray query: {})",
            name,
            capabilities.max_instance_count,
            capabilities.min_scratch_alignment,
            if capabilities.supports_ray_query { "yes" } else { "no" }
        );

        Ok((physical_device, queue_family, capabilities))
    }

    /// Rate a physical device (higher is better).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice, capabilities: &AccelCapabilities) -> u32 {
        let props = instance.get_physical_device_properties(device);
        let mut score = 0u32;

        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        if capabilities.supports_ray_query {
            score += 500;
        }

        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score = score.saturating_add((heap.size / (1024 * 1024)) as u32);
            }
        }

        score
    }

    /// First queue family able to record acceleration structure builds.
    unsafe fn find_queue_family(instance: &Instance, device: vk::PhysicalDevice) -> Option<u32> {
        let families = instance.get_physical_device_queue_family_properties(device);

        // Prefer the graphics family, where the ray tracing pass runs.
        families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .or_else(|| families.iter().position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE)))
            .map(|i| i as u32)
    }

    /// Acceleration structure limits, or `None` if the device cannot build them.
    unsafe fn check_accel_support(instance: &Instance, device: vk::PhysicalDevice) -> Option<AccelCapabilities> {
        let extensions = instance.enumerate_device_extension_properties(device).ok()?;
        let has = |wanted: &CStr| {
            extensions
                .iter()
                .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == wanted)
        };

        if !has(acceleration_structure::NAME) || !has(deferred_host_operations::NAME) {
            return None;
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

        if accel_features.acceleration_structure == vk::FALSE || vulkan_12_features.buffer_device_address == vk::FALSE {
            return None;
        }

        Some(AccelCapabilities {
            max_geometry_count: accel_props.max_geometry_count,
            max_instance_count: accel_props.max_instance_count,
            max_primitive_count: accel_props.max_primitive_count,
            min_scratch_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
            supports_ray_query: has(ray_query::NAME),
        })
    }

    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        capabilities: &AccelCapabilities,
    ) -> AccelResult<Device> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let mut extensions: Vec<*const c_char> = vec![
            acceleration_structure::NAME.as_ptr(),
            deferred_host_operations::NAME.as_ptr(),
        ];
        if capabilities.supports_ray_query {
            extensions.push(ray_query::NAME.as_ptr());
        }

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
        let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features);
        if capabilities.supports_ray_query {
            features2 = features2.push_next(&mut ray_query_features);
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        instance
            .create_device(physical_device, &create_info, None)
            .map_err(|e| vk_error("create logical device", e))
    }

    pub fn limits(&self) -> DeviceLimits {
        self.capabilities.limits()
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device_wait_idle failed: {:?}", e);
            }
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

/// Forwards validation messages to the log.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK] {}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK] {}", message);
    } else {
        log::debug!("[VK] {}", message);
    }

    vk::FALSE
}
