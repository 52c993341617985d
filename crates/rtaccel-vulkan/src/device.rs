//! [`AccelerationDevice`] implementation over `VK_KHR_acceleration_structure`.

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use rtaccel_core::{
    AccelError, AccelResult, AccelerationDevice, BufferDesc, BufferHandle, BuildCommand, BuildFlags, BuildInput,
    BuildMode, BuildSizes, Command, DeviceAddress, DeviceBuffer, DeviceLimits, QueryHandle, StructureDescriptor,
    StructureHandle, StructureLevel, SubmissionId,
};

use super::{vk_error, Buffer, CommandManager, MemoryManager, VulkanContext};

/// Vulkan-backed build context.
///
/// Field order matters: buffers and the allocator are released before the
/// context destroys the logical device.
pub struct VulkanAccelerationDevice {
    buffers: Mutex<HashMap<BufferHandle, Buffer>>,
    structures: Mutex<HashSet<StructureHandle>>,
    queries: Mutex<HashSet<QueryHandle>>,
    commands: CommandManager,
    memory: MemoryManager,
    ctx: VulkanContext,
}

impl VulkanAccelerationDevice {
    /// Create a headless device, optionally with validation layers.
    pub unsafe fn new(enable_validation: bool) -> AccelResult<Self> {
        Self::from_context(VulkanContext::new(enable_validation)?)
    }

    /// Build on an existing context.
    pub unsafe fn from_context(ctx: VulkanContext) -> AccelResult<Self> {
        let memory = MemoryManager::new(&ctx)?;
        let commands = CommandManager::new(&ctx)?;

        Ok(Self {
            buffers: Mutex::new(HashMap::new()),
            structures: Mutex::new(HashSet::new()),
            queries: Mutex::new(HashSet::new()),
            commands,
            memory,
            ctx,
        })
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    /// Bind a top-level structure to an acceleration structure descriptor.
    pub unsafe fn write_descriptor(&self, set: vk::DescriptorSet, binding: u32, descriptor: &StructureDescriptor) {
        let structures = [vk::AccelerationStructureKHR::from_raw(descriptor.handle.0)];
        let mut as_write = vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&structures);

        let mut write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut as_write);
        write.descriptor_count = 1;

        self.ctx.device.update_descriptor_sets(&[write], &[]);
    }

    unsafe fn record(&self, cmd: vk::CommandBuffer, command: &Command<'_>) {
        let device = &self.ctx.device;
        let loader = &self.ctx.accel_struct_loader;

        match command {
            Command::InstanceUploadBarrier => {
                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::HOST_WRITE)
                    .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::SHADER_READ);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
            Command::Build(build) => self.record_build(cmd, build),
            Command::BuildBarrier => {
                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                    .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR | vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
            Command::WriteCompactedSize { structure, query } => {
                let pool = vk::QueryPool::from_raw(query.0);
                device.cmd_reset_query_pool(cmd, pool, 0, 1);
                loader.cmd_write_acceleration_structures_properties(
                    cmd,
                    &[vk::AccelerationStructureKHR::from_raw(structure.0)],
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    pool,
                    0,
                );
            }
            Command::CopyCompact { src, dst } => {
                let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
                    .src(vk::AccelerationStructureKHR::from_raw(src.0))
                    .dst(vk::AccelerationStructureKHR::from_raw(dst.0))
                    .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
                loader.cmd_copy_acceleration_structure(cmd, &copy_info);
            }
        }
    }

    unsafe fn record_build(&self, cmd: vk::CommandBuffer, build: &BuildCommand<'_>) {
        let (geometries, ranges) = geometries(&build.input);

        let mut build_info = build_geometry_info(build.flags, &build.input, &geometries)
            .mode(build_mode(build.mode))
            .dst_acceleration_structure(vk::AccelerationStructureKHR::from_raw(build.dst.0))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: build.scratch.0,
            });
        if let Some(src) = build.src {
            build_info = build_info.src_acceleration_structure(vk::AccelerationStructureKHR::from_raw(src.0));
        }

        self.ctx
            .accel_struct_loader
            .cmd_build_acceleration_structures(cmd, &[build_info], &[ranges.as_slice()]);
    }
}

fn structure_type(level: StructureLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        StructureLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        StructureLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn build_mode(mode: BuildMode) -> vk::BuildAccelerationStructureModeKHR {
    match mode {
        BuildMode::Build => vk::BuildAccelerationStructureModeKHR::BUILD,
        BuildMode::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
    }
}

/// Build flags share Vulkan's bit encoding.
fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    vk::BuildAccelerationStructureFlagsKHR::from_raw(flags.bits())
}

/// Driver geometry and build ranges for one build input.
fn geometries(
    input: &BuildInput<'_>,
) -> (Vec<vk::AccelerationStructureGeometryKHR<'static>>, Vec<vk::AccelerationStructureBuildRangeInfoKHR>) {
    match input {
        BuildInput::Triangles { geometries, ranges } => {
            let geometries = geometries
                .iter()
                .map(|g| {
                    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(vk::Format::R32G32B32_SFLOAT)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: g.vertex_address.0,
                        })
                        .vertex_stride(g.vertex_stride)
                        .max_vertex(g.max_vertex())
                        .index_type(vk::IndexType::UINT32)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: g.index_address.0,
                        })
                        .transform_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: g.transform_address.map_or(0, |a| a.0),
                        });

                    vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                        .flags(if g.opaque {
                            vk::GeometryFlagsKHR::OPAQUE
                        } else {
                            vk::GeometryFlagsKHR::empty()
                        })
                })
                .collect();

            let ranges = ranges
                .iter()
                .map(|r| vk::AccelerationStructureBuildRangeInfoKHR {
                    primitive_count: r.primitive_count,
                    primitive_offset: r.primitive_offset,
                    first_vertex: r.first_vertex,
                    transform_offset: r.transform_offset,
                })
                .collect();

            (geometries, ranges)
        }
        BuildInput::Instances { data, count } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR { device_address: data.0 });

            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances });

            let range = vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: *count,
                primitive_offset: 0,
                first_vertex: 0,
                transform_offset: 0,
            };

            (vec![geometry], vec![range])
        }
    }
}

fn build_geometry_info<'a>(
    flags: BuildFlags,
    input: &BuildInput<'_>,
    geometries: &'a [vk::AccelerationStructureGeometryKHR<'static>],
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(structure_type(input.level()))
        .flags(build_flags(flags))
        .geometries(geometries)
}

impl AccelerationDevice for VulkanAccelerationDevice {
    fn limits(&self) -> DeviceLimits {
        self.ctx.limits()
    }

    fn build_sizes(&self, flags: BuildFlags, input: &BuildInput<'_>) -> AccelResult<BuildSizes> {
        let (geometries, _) = geometries(input);
        let build_info =
            build_geometry_info(flags, input, &geometries).mode(vk::BuildAccelerationStructureModeKHR::BUILD);
        let max_primitive_counts = input.primitive_counts();

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.ctx.accel_struct_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &max_primitive_counts,
                &mut size_info,
            );
        }

        Ok(BuildSizes {
            structure_size: size_info.acceleration_structure_size,
            build_scratch_size: size_info.build_scratch_size,
            update_scratch_size: size_info.update_scratch_size,
        })
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> AccelResult<DeviceBuffer> {
        let buffer = unsafe { self.memory.create_buffer(desc.size, desc.usage, desc.name)? };

        let device_buffer = DeviceBuffer {
            handle: BufferHandle(buffer.handle.as_raw()),
            size: buffer.size,
            address: DeviceAddress(buffer.device_address),
            usage: buffer.usage,
        };
        self.buffers.lock().insert(device_buffer.handle, buffer);

        Ok(device_buffer)
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> AccelResult<()> {
        let buffers = self.buffers.lock();
        let target = buffers
            .get(&buffer.handle)
            .ok_or_else(|| AccelError::Device(format!("Unknown buffer {:?}", buffer.handle)))?;
        unsafe { target.write(offset, data) }
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        match self.buffers.lock().remove(&buffer.handle) {
            Some(buffer) => unsafe { self.memory.destroy_buffer(buffer) },
            None => log::warn!("Destroying unknown buffer {:?}", buffer.handle),
        }
    }

    fn create_structure(&self, level: StructureLevel, buffer: &DeviceBuffer, size: u64) -> AccelResult<StructureHandle> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(vk::Buffer::from_raw(buffer.handle.0))
            .size(size)
            .ty(structure_type(level));

        let structure = unsafe {
            self.ctx
                .accel_struct_loader
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| vk_error("create acceleration structure", e))?
        };

        let handle = StructureHandle(structure.as_raw());
        self.structures.lock().insert(handle);
        Ok(handle)
    }

    fn structure_address(&self, structure: StructureHandle) -> DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(vk::AccelerationStructureKHR::from_raw(structure.0));
        DeviceAddress(unsafe {
            self.ctx
                .accel_struct_loader
                .get_acceleration_structure_device_address(&info)
        })
    }

    fn destroy_structure(&self, structure: StructureHandle) {
        if !self.structures.lock().remove(&structure) {
            log::warn!("Destroying unknown acceleration structure {:?}", structure);
            return;
        }
        unsafe {
            self.ctx
                .accel_struct_loader
                .destroy_acceleration_structure(vk::AccelerationStructureKHR::from_raw(structure.0), None);
        }
    }

    fn create_size_query(&self) -> AccelResult<QueryHandle> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(1);

        let pool = unsafe {
            self.ctx
                .device
                .create_query_pool(&create_info, None)
                .map_err(|e| vk_error("create query pool", e))?
        };

        let handle = QueryHandle(pool.as_raw());
        self.queries.lock().insert(handle);
        Ok(handle)
    }

    fn compacted_size(&self, query: QueryHandle) -> AccelResult<u64> {
        let mut data = [0u64; 1];
        unsafe {
            self.ctx
                .device
                .get_query_pool_results(
                    vk::QueryPool::from_raw(query.0),
                    0,
                    &mut data,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .map_err(|e| vk_error("read compacted size", e))?;
        }
        Ok(data[0])
    }

    fn destroy_size_query(&self, query: QueryHandle) {
        if !self.queries.lock().remove(&query) {
            log::warn!("Destroying unknown query {:?}", query);
            return;
        }
        unsafe {
            self.ctx
                .device
                .destroy_query_pool(vk::QueryPool::from_raw(query.0), None);
        }
    }

    fn submit(&self, commands: &[Command<'_>]) -> AccelResult<SubmissionId> {
        unsafe {
            self.commands.submit_with(|cmd| {
                for command in commands {
                    self.record(cmd, command);
                }
            })
        }
    }

    fn is_complete(&self, submission: SubmissionId) -> AccelResult<bool> {
        unsafe { self.commands.is_complete(submission) }
    }

    fn wait(&self, submission: SubmissionId) -> AccelResult<()> {
        unsafe { self.commands.wait(submission) }
    }
}

impl Drop for VulkanAccelerationDevice {
    fn drop(&mut self) {
        unsafe {
            self.ctx.wait_idle();
            self.commands.destroy();

            let structures: Vec<StructureHandle> = self.structures.lock().drain().collect();
            if !structures.is_empty() {
                log::warn!("{} acceleration structures still alive at shutdown", structures.len());
            }
            for structure in structures {
                self.ctx
                    .accel_struct_loader
                    .destroy_acceleration_structure(vk::AccelerationStructureKHR::from_raw(structure.0), None);
            }

            for query in self.queries.lock().drain() {
                self.ctx
                    .device
                    .destroy_query_pool(vk::QueryPool::from_raw(query.0), None);
            }

            let buffers: Vec<Buffer> = self.buffers.lock().drain().map(|(_, b)| b).collect();
            for buffer in buffers {
                self.memory.destroy_buffer(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtaccel_core::{BuildRange, GeometryDescriptor};

    #[test]
    fn test_build_flags_pass_through() {
        let flags = BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_COMPACTION | BuildFlags::ALLOW_UPDATE;
        let vk_flags = build_flags(flags);
        assert!(vk_flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE));
        assert!(vk_flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
        assert!(vk_flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
        assert!(!vk_flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD));

        assert_eq!(
            build_flags(BuildFlags::LOW_MEMORY),
            vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY
        );
    }

    #[test]
    fn test_level_and_mode_mapping() {
        assert_eq!(structure_type(StructureLevel::Bottom), vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        assert_eq!(structure_type(StructureLevel::Top), vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        assert_eq!(build_mode(BuildMode::Update), vk::BuildAccelerationStructureModeKHR::UPDATE);
    }

    #[test]
    fn test_triangle_geometry_conversion() {
        let descriptors = [GeometryDescriptor {
            vertex_address: DeviceAddress(0x1000),
            vertex_stride: 32,
            vertex_count: 24,
            index_address: DeviceAddress(0x8000),
            triangle_count: 12,
            transform_address: None,
            opaque: true,
        }];
        let ranges = [BuildRange {
            primitive_count: 12,
            primitive_offset: 48,
            first_vertex: 4,
            transform_offset: 0,
        }];

        let input = BuildInput::Triangles { geometries: &descriptors, ranges: &ranges };
        let (geometries, vk_ranges) = geometries(&input);

        assert_eq!(geometries.len(), 1);
        assert_eq!(geometries[0].geometry_type, vk::GeometryTypeKHR::TRIANGLES);
        assert_eq!(geometries[0].flags, vk::GeometryFlagsKHR::OPAQUE);

        let triangles = unsafe { geometries[0].geometry.triangles };
        assert_eq!(triangles.vertex_format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(triangles.vertex_stride, 32);
        assert_eq!(triangles.max_vertex, 23);
        assert_eq!(triangles.index_type, vk::IndexType::UINT32);
        assert_eq!(unsafe { triangles.index_data.device_address }, 0x8000);
        assert_eq!(unsafe { triangles.transform_data.device_address }, 0);

        assert_eq!(vk_ranges[0].primitive_count, 12);
        assert_eq!(vk_ranges[0].primitive_offset, 48);
        assert_eq!(vk_ranges[0].first_vertex, 4);
    }

    #[test]
    fn test_instance_geometry_conversion() {
        let input = BuildInput::Instances { data: DeviceAddress(0x4000), count: 9 };
        let (geometries, ranges) = geometries(&input);

        assert_eq!(geometries.len(), 1);
        assert_eq!(geometries[0].geometry_type, vk::GeometryTypeKHR::INSTANCES);
        let instances = unsafe { geometries[0].geometry.instances };
        assert_eq!(instances.array_of_pointers, vk::FALSE);
        assert_eq!(unsafe { instances.data.device_address }, 0x4000);
        assert_eq!(ranges[0].primitive_count, 9);
    }
}
