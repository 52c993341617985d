#![allow(clippy::too_many_arguments, clippy::new_without_default)]
// Acceleration structure construction for hardware ray tracing

// Device seam and shared types
pub mod device;
pub mod error;
pub mod flags;
pub mod config;

// Mesh input
pub mod mesh;
pub mod offsets;
pub mod validate;
pub mod geometry;

// Builders
pub mod scratch;
pub mod blas;
pub mod cache;
pub mod instance;
pub mod tlas;
pub mod frame;

#[cfg(test)]
pub(crate) mod test_device;

pub use blas::{BlasPoll, BlasState, BottomLevelBuilder, BottomLevelStructure, PendingBlas};
pub use cache::BlasCache;
pub use config::{AccelConfig, ScratchPolicy, TlasGrowth, DEFAULT_FRAMES_IN_FLIGHT, DEFAULT_INSTANCE_CAPACITY};
pub use device::{
    AccelerationDevice, BufferDesc, BufferHandle, BufferUsage, BuildCommand, BuildInput, BuildMode, BuildSizes,
    Command, DeviceAddress, DeviceBuffer, DeviceLimits, QueryHandle, StructureHandle, StructureLevel, SubmissionId,
};
pub use error::{AccelError, AccelResult, BuildFailure};
pub use flags::{BuildFlags, BuildRequest, InstanceFlags};
pub use frame::{FrameAccelerationContext, SlotState, SlotStats};
pub use geometry::{BuildRange, ExtractedGeometry, GeometryDescriptor, MeshGeometryExtractor};
pub use instance::{BlasLookup, InstanceAssembler, InstanceRecord, SceneEntry};
pub use mesh::{HostGeometry, MeshBuffers, MeshGeometry, MeshId, Submesh};
pub use offsets::{GeometryOffsetTable, SubmeshHit, SubmeshOffsetTable};
pub use tlas::{StructureDescriptor, TopLevelBuilder, TopLevelStructure};
