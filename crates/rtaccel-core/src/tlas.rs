//! Top-level acceleration structures.
//!
//! The builder owns the build-versus-refit decision for one frame slot and
//! the sizing of its backing memory. A refit reuses the previous contents as
//! its source and is only valid while the instance count and the backing
//! buffer stay the same; anything else is rebuilt from scratch.

use crate::config::{AccelConfig, ScratchPolicy, TlasGrowth};
use crate::device::{
    AccelerationDevice, BufferDesc, BufferUsage, BuildCommand, BuildInput, BuildMode, BuildSizes, Command,
    DeviceAddress, DeviceBuffer, StructureHandle, StructureLevel, SubmissionId,
};
use crate::error::{AccelError, AccelResult};
use crate::flags::{normalize, BuildFlags};
use crate::scratch::{ensure_scratch, ScratchBuffer};

/// What the ray tracing pass binds for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureDescriptor {
    pub handle: StructureHandle,
    pub address: DeviceAddress,
}

/// A top-level structure and its backing buffer.
#[derive(Debug)]
pub struct TopLevelStructure {
    handle: StructureHandle,
    buffer: DeviceBuffer,
    address: DeviceAddress,
    instance_count: u32,
    built: bool,
}

impl TopLevelStructure {
    /// Create an empty structure over `capacity` bytes.
    pub fn allocate<D: AccelerationDevice + ?Sized>(device: &D, capacity: u64, name: &str) -> AccelResult<Self> {
        let buffer = device.create_buffer(&BufferDesc {
            size: capacity,
            usage: BufferUsage::StructureStorage,
            name,
        })?;
        let handle = match device.create_structure(StructureLevel::Top, &buffer, capacity) {
            Ok(handle) => handle,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };
        let address = device.structure_address(handle);

        Ok(Self {
            handle,
            buffer,
            address,
            instance_count: 0,
            built: false,
        })
    }

    pub fn handle(&self) -> StructureHandle {
        self.handle
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Bytes available to builds.
    pub fn capacity(&self) -> u64 {
        self.buffer.size
    }

    /// Instances in the last build.
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Whether the contents are valid as a refit source.
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Forget the contents so the next build cannot refit from them.
    pub(crate) fn invalidate(&mut self) {
        self.built = false;
    }

    pub fn descriptor(&self) -> StructureDescriptor {
        StructureDescriptor {
            handle: self.handle,
            address: self.address,
        }
    }

    pub fn destroy<D: AccelerationDevice + ?Sized>(self, device: &D) {
        device.destroy_structure(self.handle);
        device.destroy_buffer(self.buffer);
    }
}

/// A submitted top-level build.
#[derive(Debug)]
pub struct TlasSubmission {
    pub submission: SubmissionId,
    pub mode: BuildMode,
    /// The backing buffer was replaced by this build.
    pub reallocated: bool,
    /// Scratch to release once the submission completes.
    pub transient_scratch: Option<ScratchBuffer>,
}

/// Builds and refits top-level structures.
#[derive(Debug, Clone, Copy)]
pub struct TopLevelBuilder {
    flags: BuildFlags,
    growth: TlasGrowth,
    scratch_policy: ScratchPolicy,
}

impl Default for TopLevelBuilder {
    fn default() -> Self {
        Self::new(&AccelConfig::default())
    }
}

impl TopLevelBuilder {
    pub fn new(config: &AccelConfig) -> Self {
        Self {
            flags: normalize(config.tlas_flags | BuildFlags::ALLOW_UPDATE) - BuildFlags::ALLOW_COMPACTION,
            growth: config.tlas_growth,
            scratch_policy: config.scratch_policy,
        }
    }

    pub fn flags(&self) -> BuildFlags {
        self.flags
    }

    /// Build or refit `target` over `count` instance records at `instances`.
    ///
    /// The first allocation is sized for `reserve` instances. When a build
    /// needs more than the current buffer holds, the structure is replaced
    /// with one of the next power-of-two size, or the call fails under
    /// [`TlasGrowth::Fixed`]. The command buffer starts with a barrier that
    /// makes the host's instance writes visible to the build.
    pub fn submit<D: AccelerationDevice + ?Sized>(
        &self,
        device: &D,
        target: &mut Option<TopLevelStructure>,
        scratch: &mut Option<ScratchBuffer>,
        instances: DeviceAddress,
        count: u32,
        reserve: u32,
    ) -> AccelResult<TlasSubmission> {
        let input = BuildInput::Instances { data: instances, count };
        let sizes = device.build_sizes(self.flags, &input)?;
        let reallocated = self.ensure_capacity(device, target, &sizes, instances, count, reserve)?;

        let tlas = match target.as_mut() {
            Some(tlas) => tlas,
            None => return Err(AccelError::Device("top-level structure missing after allocation".into())),
        };

        let mode = if tlas.built && tlas.instance_count == count {
            BuildMode::Update
        } else {
            BuildMode::Build
        };

        let scratch_size = sizes.scratch_size(mode);
        let (scratch_address, transient_scratch) = match self.scratch_policy {
            ScratchPolicy::Retained => (ensure_scratch(scratch, device, scratch_size, "tlas_scratch")?, None),
            ScratchPolicy::PerBuild => {
                let buffer = ScratchBuffer::allocate(device, scratch_size, "tlas_scratch")?;
                (buffer.address(), Some(buffer))
            }
        };

        let commands = [
            Command::InstanceUploadBarrier,
            Command::Build(BuildCommand {
                mode,
                flags: self.flags,
                input,
                src: if mode == BuildMode::Update { Some(tlas.handle) } else { None },
                dst: tlas.handle,
                scratch: scratch_address,
            }),
            Command::BuildBarrier,
        ];

        // Contents are undefined from here until the build succeeds.
        tlas.built = false;
        let submission = match device.submit(&commands) {
            Ok(submission) => submission,
            Err(e) => {
                if let Some(buffer) = transient_scratch {
                    buffer.release(device);
                }
                return Err(e);
            }
        };
        tlas.built = true;
        tlas.instance_count = count;

        log::debug!("TLAS: {:?} with {} instances", mode, count);

        Ok(TlasSubmission {
            submission,
            mode,
            reallocated,
            transient_scratch,
        })
    }

    /// Blocking [`TopLevelBuilder::submit`].
    pub fn build<D: AccelerationDevice + ?Sized>(
        &self,
        device: &D,
        target: &mut Option<TopLevelStructure>,
        scratch: &mut Option<ScratchBuffer>,
        instances: DeviceAddress,
        count: u32,
    ) -> AccelResult<BuildMode> {
        let submitted = self.submit(device, target, scratch, instances, count, count)?;
        let result = device.wait(submitted.submission);
        if let Some(buffer) = submitted.transient_scratch {
            buffer.release(device);
        }
        result.map(|()| submitted.mode)
    }

    fn ensure_capacity<D: AccelerationDevice + ?Sized>(
        &self,
        device: &D,
        target: &mut Option<TopLevelStructure>,
        sizes: &BuildSizes,
        instances: DeviceAddress,
        count: u32,
        reserve: u32,
    ) -> AccelResult<bool> {
        let required = sizes.structure_size;

        if let Some(existing) = target.as_ref() {
            if existing.capacity() >= required {
                return Ok(false);
            }
            if self.growth == TlasGrowth::Fixed {
                return Err(AccelError::CapacityExceeded {
                    level: StructureLevel::Top,
                    required,
                    capacity: existing.capacity(),
                });
            }
        }

        let replaced = match target.take() {
            Some(old) => {
                log::debug!("TLAS: growing from {} to hold {} bytes", old.capacity(), required);
                old.destroy(device);
                true
            }
            None => false,
        };

        let capacity = if replaced {
            required.next_power_of_two()
        } else {
            // First allocation covers the reserved instance count.
            let reserved = if reserve > count {
                let input = BuildInput::Instances { data: instances, count: reserve };
                device.build_sizes(self.flags, &input)?.structure_size.max(required)
            } else {
                required
            };
            match self.growth {
                TlasGrowth::OnDemand => reserved.next_power_of_two(),
                TlasGrowth::Fixed => reserved,
            }
        };

        *target = Some(TopLevelStructure::allocate(device, capacity, "tlas")?);
        Ok(replaced)
    }
}
