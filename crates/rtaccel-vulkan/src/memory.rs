//! GPU memory management using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocationError, MemoryLocation};
use parking_lot::Mutex;
use std::sync::Arc;

use rtaccel_core::{AccelError, AccelResult, BufferUsage};

use super::{vk_error, VulkanContext};

/// GPU buffer with associated memory.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: BufferUsage,
    pub device_address: vk::DeviceAddress,
}

impl Buffer {
    /// Host pointer to the buffer memory, if it is CPU-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr()).map(|p| p.as_ptr() as *mut u8)
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// # Safety
    /// The GPU must not be reading the written range.
    pub unsafe fn write(&self, offset: u64, data: &[u8]) -> AccelResult<()> {
        let fits = offset.checked_add(data.len() as u64).is_some_and(|end| end <= self.size);
        if !fits {
            return Err(AccelError::Device(format!(
                "Write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                self.size
            )));
        }

        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| AccelError::Device("Buffer is not host visible".to_string()))?;
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        Ok(())
    }
}

/// Usage flags and memory location for each kind of buffer.
pub fn buffer_kind(usage: BufferUsage) -> (vk::BufferUsageFlags, MemoryLocation) {
    match usage {
        BufferUsage::StructureStorage => (
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        ),
        BufferUsage::Scratch => (
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        ),
        BufferUsage::InstanceInput => (
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        ),
    }
}

fn allocation_error(e: AllocationError) -> AccelError {
    AccelError::Allocation(format!("Failed to allocate buffer memory: {:?}", e))
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    /// Create a new memory manager.
    pub unsafe fn new(ctx: &VulkanContext) -> AccelResult<Self> {
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
        })
        .map_err(|e| AccelError::Device(format!("Failed to create allocator: {:?}", e)))?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
        })
    }

    /// Create a buffer for the given usage.
    ///
    /// Every buffer is created with a device address; builds consume
    /// addresses rather than buffer handles.
    pub unsafe fn create_buffer(&self, size: vk::DeviceSize, usage: BufferUsage, name: &str) -> AccelResult<Buffer> {
        let (usage_flags, location) = buffer_kind(usage);

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .map_err(|e| vk_error("create buffer", e))?;

        let requirements = self.device.get_buffer_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(allocation_error(e));
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) {
            let _ = self.allocator.lock().free(allocation);
            self.device.destroy_buffer(handle, None);
            return Err(vk_error("bind buffer memory", e));
        }

        let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
        let device_address = self.device.get_buffer_device_address(&addr_info);

        log::trace!("Created buffer '{}' ({} bytes, {:?})", name, size, usage);

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            device_address,
        })
    }

    /// Destroy a buffer and free its memory.
    pub unsafe fn destroy_buffer(&self, mut buffer: Buffer) {
        if let Some(allocation) = buffer.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {:?}", e);
            }
        }
        self.device.destroy_buffer(buffer.handle, None);
    }
}
