//! In-memory device used by the unit tests.
//!
//! Simulates size queries, allocation (with failure injection), deferred
//! completion and compaction, and checks the usage rules a real driver
//! enforces: refits need a source built with `ALLOW_UPDATE` and an unchanged
//! primitive count, scratch must be aligned, referenced buffers must be live.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::device::*;
use crate::error::{AccelError, AccelResult};
use crate::flags::BuildFlags;
use crate::instance::{InstanceRecord, INSTANCE_RECORD_SIZE};
use crate::mesh::{HostGeometry, MeshBuffers, MeshGeometry, Submesh};

#[derive(Debug, Clone)]
pub struct FakeBuffer {
    pub name: String,
    pub usage: BufferUsage,
    pub address: DeviceAddress,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FakeStructure {
    pub level: StructureLevel,
    pub buffer: BufferHandle,
    pub size: u64,
    pub address: DeviceAddress,
    pub built: bool,
    pub flags: BuildFlags,
    pub primitive_counts: Vec<u32>,
    /// Instances captured by the last top-level build
    pub instances: Vec<InstanceRecord>,
}

/// Owned copy of a submitted command.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    InstanceUploadBarrier,
    Build {
        mode: BuildMode,
        flags: BuildFlags,
        level: StructureLevel,
        primitive_counts: Vec<u32>,
        src: Option<StructureHandle>,
        dst: StructureHandle,
    },
    BuildBarrier,
    WriteCompactedSize { structure: StructureHandle },
    CopyCompact { src: StructureHandle, dst: StructureHandle },
}

#[derive(Default)]
struct State {
    limits: DeviceLimits,
    next_id: u64,
    next_address: u64,
    address_skew: u64,
    buffers: HashMap<BufferHandle, FakeBuffer>,
    buffers_created: usize,
    structures: HashMap<StructureHandle, FakeStructure>,
    structures_created: usize,
    queries: HashMap<QueryHandle, Option<(u64, SubmissionId)>>,
    submissions: HashMap<SubmissionId, u32>,
    commands: Vec<Recorded>,
    size_queries: usize,
    violations: Vec<String>,
    fail_allocation_after: Option<usize>,
    fail_submit: bool,
    null_addresses: bool,
    completion_delay: u32,
    compaction_percent: u64,
}

pub struct FakeDevice {
    state: RefCell<State>,
}

impl FakeDevice {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            state: RefCell::new(State {
                limits: DeviceLimits::default(),
                next_id: 1,
                next_address: 0x10_0000,
                compaction_percent: 60,
                ..Default::default()
            }),
        }
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        let device = Self::new();
        device.state.borrow_mut().limits = limits;
        device
    }

    /// Offset every new buffer address by `skew` bytes.
    pub fn set_address_skew(&self, skew: u64) {
        self.state.borrow_mut().address_skew = skew;
    }

    /// Fail every allocation after `count` more succeed.
    pub fn fail_allocations_after(&self, count: usize) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.fail_allocation_after = Some(state.buffers_created + count);
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.state.borrow_mut().fail_submit = fail;
    }

    /// Report every structure address as null.
    pub fn set_null_addresses(&self, null: bool) {
        self.state.borrow_mut().null_addresses = null;
    }

    /// Number of `is_complete` polls before a submission reports completion.
    pub fn set_completion_delay(&self, polls: u32) {
        self.state.borrow_mut().completion_delay = polls;
    }

    pub fn set_compaction_percent(&self, percent: u64) {
        self.state.borrow_mut().compaction_percent = percent;
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_buffers_with_usage(&self, usage: BufferUsage) -> usize {
        self.state.borrow().buffers.values().filter(|b| b.usage == usage).count()
    }

    pub fn buffers_created(&self) -> usize {
        self.state.borrow().buffers_created
    }

    pub fn live_structures(&self) -> usize {
        self.state.borrow().structures.len()
    }

    pub fn structures_created(&self) -> usize {
        self.state.borrow().structures_created
    }

    pub fn live_queries(&self) -> usize {
        self.state.borrow().queries.len()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.borrow().submissions.len()
    }

    pub fn size_queries(&self) -> usize {
        self.state.borrow().size_queries
    }

    pub fn commands(&self) -> Vec<Recorded> {
        self.state.borrow().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.borrow_mut().commands.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    pub fn structure(&self, handle: StructureHandle) -> Option<FakeStructure> {
        self.state.borrow().structures.get(&handle).cloned()
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<FakeBuffer> {
        self.state.borrow().buffers.get(&handle).cloned()
    }

    /// Modes of every recorded build, in order.
    pub fn build_modes(&self) -> Vec<BuildMode> {
        self.state
            .borrow()
            .commands
            .iter()
            .filter_map(|c| match c {
                Recorded::Build { mode, .. } => Some(*mode),
                _ => None,
            })
            .collect()
    }
}

fn sizes_for(counts: &[u32]) -> BuildSizes {
    let prims: u64 = counts.iter().map(|&c| c as u64).sum();
    BuildSizes {
        structure_size: 1024 + 128 * prims,
        build_scratch_size: 512 + 64 * prims,
        update_scratch_size: 256 + 16 * prims,
    }
}

impl State {
    fn buffer_containing(&self, address: DeviceAddress) -> Option<&FakeBuffer> {
        self.buffers
            .values()
            .find(|b| address >= b.address && address.0 < b.address.0 + b.data.len() as u64)
    }

    fn record_build(&mut self, build: &BuildCommand<'_>) {
        let counts = build.input.primitive_counts();
        let level = build.input.level();
        let alignment = self.limits.scratch_alignment.max(1);

        if build.scratch.is_null() || build.scratch.0 % alignment != 0 {
            self.violations.push(format!("misaligned scratch {:#x}", build.scratch.0));
        }
        if self.buffer_containing(build.scratch).is_none() {
            self.violations.push("scratch not in a live buffer".to_string());
        }

        let instances = match build.input {
            BuildInput::Instances { data, count } => match self.buffer_containing(data) {
                Some(buffer) => {
                    let start = (data.0 - buffer.address.0) as usize;
                    let end = start + count as usize * INSTANCE_RECORD_SIZE;
                    match buffer.data.get(start..end) {
                        Some(bytes) => bytes
                            .chunks_exact(INSTANCE_RECORD_SIZE)
                            .map(bytemuck::pod_read_unaligned::<InstanceRecord>)
                            .collect(),
                        None => {
                            self.violations.push("instance data past end of buffer".to_string());
                            Vec::new()
                        }
                    }
                }
                None => {
                    self.violations.push("instance data not in a live buffer".to_string());
                    Vec::new()
                }
            },
            BuildInput::Triangles { .. } => Vec::new(),
        };

        if build.mode == BuildMode::Update {
            match build.src.and_then(|src| self.structures.get(&src)) {
                Some(src) => {
                    if !src.built {
                        self.violations.push("refit source never built".to_string());
                    }
                    if !src.flags.contains(BuildFlags::ALLOW_UPDATE) {
                        self.violations.push("refit source built without ALLOW_UPDATE".to_string());
                    }
                    if src.primitive_counts != counts {
                        self.violations.push("refit with changed primitive count".to_string());
                    }
                }
                None => self.violations.push("refit without source".to_string()),
            }
        }

        let required = sizes_for(&counts).structure_size;
        match self.structures.get_mut(&build.dst) {
            Some(dst) => {
                if dst.level != level {
                    self.violations.push("build level mismatch".to_string());
                }
                if dst.size < required {
                    self.violations.push(format!("structure too small: {} < {}", dst.size, required));
                }
                dst.built = true;
                if build.mode == BuildMode::Build {
                    dst.flags = build.flags;
                }
                dst.primitive_counts = counts.clone();
                dst.instances = instances;
            }
            None => self.violations.push("build into unknown structure".to_string()),
        }

        self.commands.push(Recorded::Build {
            mode: build.mode,
            flags: build.flags,
            level,
            primitive_counts: counts,
            src: build.src,
            dst: build.dst,
        });
    }
}

impl AccelerationDevice for FakeDevice {
    fn limits(&self) -> DeviceLimits {
        self.state.borrow().limits
    }

    fn build_sizes(&self, _flags: BuildFlags, input: &BuildInput<'_>) -> AccelResult<BuildSizes> {
        self.state.borrow_mut().size_queries += 1;
        Ok(sizes_for(&input.primitive_counts()))
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> AccelResult<DeviceBuffer> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if let Some(limit) = state.fail_allocation_after {
            if state.buffers_created >= limit {
                return Err(AccelError::Allocation(format!("{}: out of device memory", desc.name)));
            }
        }

        let handle = BufferHandle(state.next_id);
        state.next_id += 1;
        let address = DeviceAddress(state.next_address + state.address_skew);
        state.next_address += align_up(desc.size + state.address_skew, 0x1000) + 0x1000;
        state.buffers_created += 1;
        state.buffers.insert(
            handle,
            FakeBuffer {
                name: desc.name.to_string(),
                usage: desc.usage,
                address,
                data: vec![0; desc.size as usize],
            },
        );

        Ok(DeviceBuffer {
            handle,
            size: desc.size,
            address,
            usage: desc.usage,
        })
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> AccelResult<()> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let fake = state
            .buffers
            .get_mut(&buffer.handle)
            .ok_or_else(|| AccelError::Device("write to destroyed buffer".into()))?;
        if fake.usage != BufferUsage::InstanceInput {
            return Err(AccelError::Device(format!("{} is not host visible", fake.name)));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > fake.data.len() {
            return Err(AccelError::Device(format!("write past end of {}", fake.name)));
        }
        fake.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.buffers.remove(&buffer.handle).is_none() {
            state.violations.push("double free of buffer".to_string());
        }
    }

    fn create_structure(&self, level: StructureLevel, buffer: &DeviceBuffer, size: u64) -> AccelResult<StructureHandle> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let address = match state.buffers.get(&buffer.handle) {
            Some(fake) if fake.data.len() as u64 >= size => fake.address,
            Some(_) => return Err(AccelError::Device("structure larger than its buffer".into())),
            None => return Err(AccelError::Device("structure on destroyed buffer".into())),
        };
        let handle = StructureHandle(state.next_id);
        state.next_id += 1;
        state.structures_created += 1;
        state.structures.insert(
            handle,
            FakeStructure {
                level,
                buffer: buffer.handle,
                size,
                address,
                built: false,
                flags: BuildFlags::empty(),
                primitive_counts: Vec::new(),
                instances: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn structure_address(&self, structure: StructureHandle) -> DeviceAddress {
        let state = self.state.borrow();
        if state.null_addresses {
            return DeviceAddress::NULL;
        }
        state.structures.get(&structure).map(|s| s.address).unwrap_or(DeviceAddress::NULL)
    }

    fn destroy_structure(&self, structure: StructureHandle) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.structures.remove(&structure).is_none() {
            state.violations.push("double free of structure".to_string());
        }
    }

    fn create_size_query(&self) -> AccelResult<QueryHandle> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let handle = QueryHandle(state.next_id);
        state.next_id += 1;
        state.queries.insert(handle, None);
        Ok(handle)
    }

    fn compacted_size(&self, query: QueryHandle) -> AccelResult<u64> {
        let state = self.state.borrow();
        match state.queries.get(&query) {
            Some(Some((size, submission))) => {
                if state.submissions.contains_key(submission) {
                    Err(AccelError::Device("query read before completion".into()))
                } else {
                    Ok(*size)
                }
            }
            Some(None) => Err(AccelError::Device("query never written".into())),
            None => Err(AccelError::Device("unknown query".into())),
        }
    }

    fn destroy_size_query(&self, query: QueryHandle) {
        self.state.borrow_mut().queries.remove(&query);
    }

    fn submit(&self, commands: &[Command<'_>]) -> AccelResult<SubmissionId> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.fail_submit {
            return Err(AccelError::Device("queue submit failed".into()));
        }
        let id = SubmissionId(state.next_id);
        state.next_id += 1;

        for command in commands {
            match command {
                Command::InstanceUploadBarrier => state.commands.push(Recorded::InstanceUploadBarrier),
                Command::BuildBarrier => state.commands.push(Recorded::BuildBarrier),
                Command::Build(build) => state.record_build(build),
                Command::WriteCompactedSize { structure, query } => {
                    let size = match state.structures.get(structure) {
                        Some(s) if s.built => {
                            let required = sizes_for(&s.primitive_counts).structure_size;
                            align_up(required * state.compaction_percent / 100, 256)
                        }
                        _ => {
                            state.violations.push("size query on unbuilt structure".to_string());
                            0
                        }
                    };
                    state.queries.insert(*query, Some((size, id)));
                    state.commands.push(Recorded::WriteCompactedSize { structure: *structure });
                }
                Command::CopyCompact { src, dst } => {
                    match state.structures.get(src).cloned() {
                        Some(source) if source.built => {
                            if let Some(target) = state.structures.get_mut(dst) {
                                target.built = true;
                                target.flags = source.flags;
                                target.primitive_counts = source.primitive_counts.clone();
                            } else {
                                state.violations.push("compact into unknown structure".to_string());
                            }
                        }
                        _ => state.violations.push("compact from unbuilt structure".to_string()),
                    }
                    state.commands.push(Recorded::CopyCompact { src: *src, dst: *dst });
                }
            }
        }

        let delay = state.completion_delay;
        state.submissions.insert(id, delay);
        Ok(id)
    }

    fn is_complete(&self, submission: SubmissionId) -> AccelResult<bool> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        match state.submissions.get_mut(&submission) {
            Some(0) => {
                state.submissions.remove(&submission);
                Ok(true)
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn wait(&self, submission: SubmissionId) -> AccelResult<()> {
        self.state.borrow_mut().submissions.remove(&submission);
        Ok(())
    }
}

// ============================================================
// Mesh fixtures
// ============================================================


fn fixture_buffers(vertex_count: u32, index_count: u32) -> MeshBuffers {
    MeshBuffers {
        vertex_address: DeviceAddress(0x4000_0000),
        vertex_stride: 12,
        vertex_count,
        index_address: DeviceAddress(0x5000_0000),
        index_count,
        transform_address: None,
    }
}

/// Mesh with one submesh per entry of `triangles`, laid out back to back.
/// No host copy, so only counts are validated.
pub fn mesh_with_triangles(name: &str, triangles: &[u32]) -> MeshGeometry {
    let mut submeshes = Vec::new();
    let mut base_vertex = 0;
    let mut base_index = 0;
    for &count in triangles {
        let vertices = count * 3;
        submeshes.push(Submesh::new(base_vertex, base_index, vertices, count * 3));
        base_vertex += vertices;
        base_index += count * 3;
    }
    MeshGeometry::new(name, fixture_buffers(base_vertex, base_index), submeshes)
}

/// A single right triangle with a host copy.
pub fn unit_triangle_mesh(name: &str) -> MeshGeometry {
    MeshGeometry::new(name, fixture_buffers(3, 3), vec![Submesh::new(0, 0, 3, 3)]).with_host_geometry(HostGeometry {
        positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        indices: vec![0, 1, 2],
    })
}

/// A triangle whose corners are collinear.
pub fn degenerate_mesh(name: &str) -> MeshGeometry {
    MeshGeometry::new(name, fixture_buffers(3, 3), vec![Submesh::new(0, 0, 3, 3)]).with_host_geometry(HostGeometry {
        positions: vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0]],
        indices: vec![0, 1, 2],
    })
}
