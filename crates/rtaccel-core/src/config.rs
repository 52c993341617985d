//! Acceleration structure configuration.
//!
//! Holds frame pipelining depth, instance buffer sizing, build preferences and
//! the growth policy for top-level backing memory. Values are validated
//! against the limits the device reports.

use crate::device::DeviceLimits;
use crate::flags::{normalize, BuildFlags, BuildRequest};

/// Number of frame slots when nothing else is configured.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 3;

/// Instance records each slot's instance buffer holds before it must grow.
pub const DEFAULT_INSTANCE_CAPACITY: u32 = 1000;

/// What to do when a top-level build needs more memory than the slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasGrowth {
    /// Reallocate to the next power of two of the required size.
    OnDemand,
    /// Never reallocate; fail the update with `CapacityExceeded`.
    Fixed,
}

/// Lifetime of top-level scratch memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchPolicy {
    /// Keep one scratch buffer per slot, grown on demand.
    Retained,
    /// Allocate before each build and free once it completes.
    PerBuild,
}

/// Acceleration structure settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelConfig {
    /// Number of frame slots (2 or 3 in practice)
    pub frames_in_flight: usize,
    /// Instance records allocated per slot on first use
    pub instance_capacity: u32,
    /// Default request for bottom-level builds
    pub blas_request: BuildRequest,
    /// Flags for top-level builds. `ALLOW_UPDATE` is always added.
    pub tlas_flags: BuildFlags,
    pub tlas_growth: TlasGrowth,
    pub scratch_policy: ScratchPolicy,
    /// Longest triangle edge accepted by validation, in mesh units
    pub large_triangle_limit: f32,
    /// Scene entry count from which instance assembly runs in parallel
    pub parallel_assembly_threshold: usize,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            instance_capacity: DEFAULT_INSTANCE_CAPACITY,
            blas_request: BuildRequest::compacted(),
            tlas_flags: BuildFlags::PREFER_FAST_BUILD | BuildFlags::ALLOW_UPDATE,
            tlas_growth: TlasGrowth::OnDemand,
            scratch_policy: ScratchPolicy::Retained,
            large_triangle_limit: 500.0,
            parallel_assembly_threshold: 256,
        }
    }
}

impl AccelConfig {
    /// Clamp every field into the range the device supports.
    pub fn clamped_to(mut self, limits: &DeviceLimits) -> Self {
        self.frames_in_flight = self.frames_in_flight.clamp(1, 8);

        let max_instances = limits.max_instance_count.min(u32::MAX as u64) as u32;
        self.instance_capacity = self.instance_capacity.clamp(1, max_instances.max(1));

        self.blas_request = BuildRequest::new(self.blas_request.flags - BuildFlags::ALLOW_UPDATE);
        self.tlas_flags = normalize(self.tlas_flags | BuildFlags::ALLOW_UPDATE) - BuildFlags::ALLOW_COMPACTION;

        if !self.large_triangle_limit.is_finite() || self.large_triangle_limit <= 0.0 {
            self.large_triangle_limit = f32::MAX;
        }

        self
    }
}
