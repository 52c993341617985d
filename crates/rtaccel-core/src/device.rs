//! The device seam.
//!
//! Builders never talk to a graphics API directly; they go through an
//! [`AccelerationDevice`], an explicit build context owned by the renderer and
//! passed into every build call. Handles crossing this boundary are opaque
//! 64-bit values, so the core logic can be exercised without a GPU.

use crate::error::AccelResult;
use crate::flags::BuildFlags;
use crate::geometry::{BuildRange, GeometryDescriptor};

/// GPU-visible address of a buffer or structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub const NULL: DeviceAddress = DeviceAddress(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque acceleration structure handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructureHandle(pub u64);

/// Opaque compacted-size query handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHandle(pub u64);

/// Identifies one submitted batch of commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub u64);

/// Which level of the two-level hierarchy a structure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructureLevel {
    Bottom,
    Top,
}

/// Build from scratch, or refit an existing structure in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildMode {
    Build,
    Update,
}

/// Memory requirements reported by the driver for one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    pub structure_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

impl BuildSizes {
    /// Scratch bytes needed for the given mode.
    pub fn scratch_size(&self, mode: BuildMode) -> u64 {
        match mode {
            BuildMode::Build => self.build_scratch_size,
            BuildMode::Update => self.update_scratch_size,
        }
    }
}

/// What a buffer will be used for. Determines usage flags and memory location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Device-local backing storage for a structure.
    StructureStorage,
    /// Device-local scratch memory for a build.
    Scratch,
    /// Host-visible, read-only build input (instance records).
    InstanceInput,
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: BufferUsage,
    pub name: &'a str,
}

/// A buffer allocated through the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub handle: BufferHandle,
    pub size: u64,
    pub address: DeviceAddress,
    pub usage: BufferUsage,
}

/// Limits relevant to acceleration structure builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    /// Required alignment of scratch buffer addresses.
    pub scratch_alignment: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_geometry_count: 1 << 24,
            max_instance_count: 1 << 24,
            max_primitive_count: 1 << 29,
            scratch_alignment: 256,
        }
    }
}

/// Geometry consumed by a build.
#[derive(Debug, Clone, Copy)]
pub enum BuildInput<'a> {
    /// One triangle geometry per descriptor, ranges in the same order.
    Triangles {
        geometries: &'a [GeometryDescriptor],
        ranges: &'a [BuildRange],
    },
    /// A packed array of instance records at `data`.
    Instances { data: DeviceAddress, count: u32 },
}

impl BuildInput<'_> {
    pub fn level(&self) -> StructureLevel {
        match self {
            BuildInput::Triangles { .. } => StructureLevel::Bottom,
            BuildInput::Instances { .. } => StructureLevel::Top,
        }
    }

    /// Maximum primitive count per geometry, as the size query expects.
    pub fn primitive_counts(&self) -> Vec<u32> {
        match self {
            BuildInput::Triangles { ranges, .. } => ranges.iter().map(|r| r.primitive_count).collect(),
            BuildInput::Instances { count, .. } => vec![*count],
        }
    }
}

/// A single structure build.
#[derive(Debug, Clone, Copy)]
pub struct BuildCommand<'a> {
    pub mode: BuildMode,
    pub flags: BuildFlags,
    pub input: BuildInput<'a>,
    /// Refit source. Required for [`BuildMode::Update`].
    pub src: Option<StructureHandle>,
    pub dst: StructureHandle,
    pub scratch: DeviceAddress,
}

/// A command recorded into one submission.
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    /// Make host writes to instance buffers visible to structure builds.
    InstanceUploadBarrier,
    Build(BuildCommand<'a>),
    /// Make structure writes visible to later structure reads.
    BuildBarrier,
    /// Reset `query` and write the compacted size of `structure` into it.
    WriteCompactedSize {
        structure: StructureHandle,
        query: QueryHandle,
    },
    /// Copy `src` into the smaller `dst` in compacted form.
    CopyCompact {
        src: StructureHandle,
        dst: StructureHandle,
    },
}

/// Driver operations needed to build acceleration structures.
///
/// Implementations use interior mutability; all methods take `&self`.
pub trait AccelerationDevice {
    fn limits(&self) -> DeviceLimits;

    /// Worst-case backing and scratch sizes for a build.
    fn build_sizes(&self, flags: BuildFlags, input: &BuildInput<'_>) -> AccelResult<BuildSizes>;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> AccelResult<DeviceBuffer>;

    /// Copy `data` into a host-visible buffer at `offset`.
    fn write_buffer(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> AccelResult<()>;

    fn destroy_buffer(&self, buffer: DeviceBuffer);

    /// Create a structure object over `size` bytes of `buffer`.
    fn create_structure(
        &self,
        level: StructureLevel,
        buffer: &DeviceBuffer,
        size: u64,
    ) -> AccelResult<StructureHandle>;

    fn structure_address(&self, structure: StructureHandle) -> DeviceAddress;

    fn destroy_structure(&self, structure: StructureHandle);

    fn create_size_query(&self) -> AccelResult<QueryHandle>;

    /// Read back a compacted size written by [`Command::WriteCompactedSize`].
    /// Only valid once the writing submission has completed.
    fn compacted_size(&self, query: QueryHandle) -> AccelResult<u64>;

    fn destroy_size_query(&self, query: QueryHandle);

    /// Record `commands` into one command buffer and submit it. Does not wait.
    fn submit(&self, commands: &[Command<'_>]) -> AccelResult<SubmissionId>;

    /// Non-blocking completion check.
    fn is_complete(&self, submission: SubmissionId) -> AccelResult<bool>;

    /// Block until the submission has completed and release its resources.
    fn wait(&self, submission: SubmissionId) -> AccelResult<()>;
}

/// Round `value` up to a multiple of `alignment` (a power of two, or zero).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}
