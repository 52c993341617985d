//! Build and instance flags.
//!
//! Bit values follow the Vulkan encoding (`VkBuildAccelerationStructureFlagBitsKHR`
//! and `VkGeometryInstanceFlagBitsKHR`) so a backend can pass them through
//! unchanged.

bitflags::bitflags! {
    /// Flags controlling how a structure is built.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE      = 0x01;
        const ALLOW_COMPACTION  = 0x02;
        const PREFER_FAST_TRACE = 0x04;
        const PREFER_FAST_BUILD = 0x08;
        const LOW_MEMORY        = 0x10;
    }
}

bitflags::bitflags! {
    /// Per-instance flags stored in the top 8 bits of an instance record.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_FACING_CULL_DISABLE = 0x01;
        const TRIANGLE_FLIP_FACING         = 0x02;
        const FORCE_OPAQUE                 = 0x04;
        const FORCE_NO_OPAQUE              = 0x08;
    }
}

/// A bottom-level build request.
///
/// Compaction and trace/build preference travel as flags rather than as
/// separate booleans, so every build path reads the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildRequest {
    pub flags: BuildFlags,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self::compacted()
    }
}

impl BuildRequest {
    /// Request with explicit flags, normalised.
    pub fn new(flags: BuildFlags) -> Self {
        Self { flags: normalize(flags) }
    }

    /// Fast-trace build without compaction.
    pub fn fast_trace() -> Self {
        Self::new(BuildFlags::PREFER_FAST_TRACE)
    }

    /// Fast-trace build followed by compaction.
    pub fn compacted() -> Self {
        Self::new(BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_COMPACTION)
    }

    /// Whether the build is followed by a compacting copy.
    pub fn wants_compaction(&self) -> bool {
        self.flags.contains(BuildFlags::ALLOW_COMPACTION)
    }

    /// Same request with compaction switched on or off.
    pub fn with_compaction(self, enabled: bool) -> Self {
        let mut flags = self.flags;
        flags.set(BuildFlags::ALLOW_COMPACTION, enabled);
        Self::new(flags)
    }
}

/// Drop mutually exclusive preferences. Fast trace wins over fast build.
pub fn normalize(flags: BuildFlags) -> BuildFlags {
    if flags.contains(BuildFlags::PREFER_FAST_TRACE | BuildFlags::PREFER_FAST_BUILD) {
        flags - BuildFlags::PREFER_FAST_BUILD
    } else {
        flags
    }
}
