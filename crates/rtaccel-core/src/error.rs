//! Error taxonomy for acceleration structure construction.
//!
//! Two very different classes of failure flow through the same `Result`:
//! resource exhaustion (allocation failure, lost device), which aborts the
//! build and is never retried, and geometry build failures, which are reported
//! per mesh so the caller can drop that mesh from ray tracing and carry on.

use crate::device::StructureLevel;

/// Reason a mesh could not be turned into a bottom-level structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildFailure {
    /// Generic build failure (bad indices, driver rejected the build).
    Failure,
    /// The mesh has no triangle with a non-zero area.
    ZeroAreaTestFailed,
    /// The mesh exceeds the device primitive or geometry limit.
    PolygonLimitReached,
    /// At least one triangle edge exceeds the configured size limit.
    LargeTriangle,
}

impl std::fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildFailure::Failure => write!(f, "build failed"),
            BuildFailure::ZeroAreaTestFailed => write!(f, "zero-area test failed"),
            BuildFailure::PolygonLimitReached => write!(f, "polygon limit reached"),
            BuildFailure::LargeTriangle => write!(f, "triangle too large"),
        }
    }
}

/// Errors produced by the acceleration structure subsystem.
#[derive(Debug, Clone, PartialEq)]
pub enum AccelError {
    /// Device memory could not be allocated. Fatal for the build in progress.
    Allocation(String),
    /// The device was lost. Nothing can be recovered.
    DeviceLost,
    /// A driver call failed.
    Device(String),
    /// The geometry could not be built.
    Build(BuildFailure),
    /// A frame slot index outside the configured frames in flight.
    InvalidFrameSlot { index: usize, count: usize },
    /// The frame slot was destroyed at shutdown.
    SlotDestroyed(usize),
    /// A structure needs more backing memory than the fixed growth policy allows.
    CapacityExceeded {
        level: StructureLevel,
        required: u64,
        capacity: u64,
    },
    /// More instances than the device supports in one top-level structure.
    TooManyInstances { count: usize, max: u64 },
}

impl AccelError {
    /// Whether this error signals resource exhaustion outside the subsystem's
    /// control. Fatal errors are propagated; everything else is handled at
    /// mesh granularity.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AccelError::Allocation(_) | AccelError::DeviceLost)
    }

    /// The build failure carried by this error, if it is one. Driver errors
    /// from build or submit calls are converted to [`BuildFailure::Failure`]
    /// where they happen; any other [`AccelError::Device`] is not a mesh
    /// problem and has no build failure.
    pub fn build_failure(&self) -> Option<BuildFailure> {
        match self {
            AccelError::Build(failure) => Some(*failure),
            _ => None,
        }
    }
}

impl From<BuildFailure> for AccelError {
    fn from(failure: BuildFailure) -> Self {
        AccelError::Build(failure)
    }
}

impl std::fmt::Display for AccelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccelError::Allocation(msg) => write!(f, "Device allocation failed: {}", msg),
            AccelError::DeviceLost => write!(f, "Device lost"),
            AccelError::Device(msg) => write!(f, "Device error: {}", msg),
            AccelError::Build(failure) => write!(f, "Acceleration structure {}", failure),
            AccelError::InvalidFrameSlot { index, count } => {
                write!(f, "Frame slot {} out of range ({} frames in flight)", index, count)
            }
            AccelError::SlotDestroyed(index) => write!(f, "Frame slot {} already destroyed", index),
            AccelError::CapacityExceeded { level, required, capacity } => write!(
                f,
                "{:?} structure needs {} bytes but capacity is fixed at {}",
                level, required, capacity
            ),
            AccelError::TooManyInstances { count, max } => {
                write!(f, "{} instances exceed the device limit of {}", count, max)
            }
        }
    }
}

impl std::error::Error for AccelError {}

/// Result alias used throughout the crate.
pub type AccelResult<T> = Result<T, AccelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_and_device_lost_are_fatal() {
        assert!(AccelError::Allocation("oom".into()).is_fatal());
        assert!(AccelError::DeviceLost.is_fatal());
    }

    #[test]
    fn test_build_failures_are_recoverable() {
        let err = AccelError::from(BuildFailure::ZeroAreaTestFailed);
        assert!(!err.is_fatal());
        assert_eq!(err.build_failure(), Some(BuildFailure::ZeroAreaTestFailed));
    }

    #[test]
    fn test_device_error_is_not_a_build_failure() {
        let err = AccelError::Device("VK_ERROR_UNKNOWN".into());
        assert!(!err.is_fatal());
        assert_eq!(err.build_failure(), None);
    }

    #[test]
    fn test_display_mentions_failure_kind() {
        let s = AccelError::Build(BuildFailure::PolygonLimitReached).to_string();
        assert!(s.contains("polygon limit"));
        let s = AccelError::InvalidFrameSlot { index: 4, count: 3 }.to_string();
        assert!(s.contains('4') && s.contains('3'));
    }
}
