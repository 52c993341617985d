//! Per-frame-in-flight top-level structures.
//!
//! Each slot owns its own TLAS, instance buffer and scratch memory, so the
//! CPU can prepare one frame while the GPU traces another. Slot resources are
//! created on first use. The caller selects the slot from its frame index and
//! only reuses a slot once the GPU work of the frame that last used it has
//! finished, the same contract its command buffers already follow.

use crate::config::{AccelConfig, TlasGrowth};
use crate::device::{
    AccelerationDevice, BufferDesc, BufferUsage, BuildMode, DeviceAddress, DeviceBuffer, DeviceLimits, StructureLevel,
    SubmissionId,
};
use crate::error::{AccelError, AccelResult};
use crate::instance::{InstanceRecord, INSTANCE_RECORD_SIZE};
use crate::scratch::ScratchBuffer;
use crate::tlas::{StructureDescriptor, TlasSubmission, TopLevelBuilder, TopLevelStructure};

/// Lifecycle of one frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SlotState {
    #[default]
    Uninitialized,
    /// Last update was a full build.
    Built,
    /// Last update refitted the previous build.
    Updated,
    Destroyed,
}

/// Counters for one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub builds: u64,
    pub refits: u64,
    /// Structure or instance buffer replacements.
    pub reallocations: u64,
    pub instance_count: u32,
}

#[derive(Debug, Default)]
struct FrameSlot {
    state: SlotState,
    tlas: Option<TopLevelStructure>,
    instances: Option<DeviceBuffer>,
    instance_capacity: u32,
    scratch: Option<ScratchBuffer>,
    pending: Option<TlasSubmission>,
    stats: SlotStats,
}

impl FrameSlot {
    /// Wait for the slot's outstanding build and free its transient scratch.
    fn retire<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> AccelResult<()> {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        let result = device.wait(pending.submission);
        if let Some(scratch) = pending.transient_scratch {
            scratch.release(device);
        }
        if result.is_err() {
            if let Some(tlas) = self.tlas.as_mut() {
                tlas.invalidate();
            }
        }
        result
    }

    fn ensure_instance_buffer<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        count: u32,
        initial_capacity: u32,
        growth: TlasGrowth,
    ) -> AccelResult<DeviceAddress> {
        if let Some(buffer) = &self.instances {
            if count <= self.instance_capacity {
                return Ok(buffer.address);
            }
            if growth == TlasGrowth::Fixed {
                return Err(AccelError::CapacityExceeded {
                    level: StructureLevel::Top,
                    required: count as u64 * INSTANCE_RECORD_SIZE as u64,
                    capacity: self.instance_capacity as u64 * INSTANCE_RECORD_SIZE as u64,
                });
            }
        }

        let capacity = match self.instances.take() {
            Some(old) => {
                device.destroy_buffer(old);
                self.stats.reallocations += 1;
                count.checked_next_power_of_two().unwrap_or(count)
            }
            None => initial_capacity.max(count),
        };
        log::debug!("TLAS instance buffer: {} records", capacity);

        let buffer = device.create_buffer(&BufferDesc {
            size: capacity.max(1) as u64 * INSTANCE_RECORD_SIZE as u64,
            usage: BufferUsage::InstanceInput,
            name: "tlas_instances",
        })?;
        let address = buffer.address;
        self.instances = Some(buffer);
        self.instance_capacity = capacity;
        Ok(address)
    }

    fn release<D: AccelerationDevice + ?Sized>(&mut self, device: &D) {
        if let Some(tlas) = self.tlas.take() {
            tlas.destroy(device);
        }
        if let Some(buffer) = self.instances.take() {
            device.destroy_buffer(buffer);
        }
        if let Some(scratch) = self.scratch.take() {
            scratch.release(device);
        }
        self.instance_capacity = 0;
    }
}

/// Top-level structures for every frame in flight.
#[derive(Debug)]
pub struct FrameAccelerationContext {
    builder: TopLevelBuilder,
    growth: TlasGrowth,
    initial_capacity: u32,
    max_instances: u64,
    slots: Vec<FrameSlot>,
}

impl FrameAccelerationContext {
    pub fn new(config: &AccelConfig, limits: &DeviceLimits) -> Self {
        let config = config.clamped_to(limits);
        log::info!(
            "Acceleration structures: {} frames in flight, {} instances per slot",
            config.frames_in_flight,
            config.instance_capacity
        );

        Self {
            builder: TopLevelBuilder::new(&config),
            growth: config.tlas_growth,
            initial_capacity: config.instance_capacity,
            max_instances: limits.max_instance_count,
            slots: (0..config.frames_in_flight).map(|_| FrameSlot::default()).collect(),
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Slot used by an ever-increasing frame number.
    pub fn slot_index(&self, frame_number: u64) -> usize {
        (frame_number % self.slots.len() as u64) as usize
    }

    /// Upload `instances`, build or refit the slot's TLAS and wait for it.
    pub fn update_acceleration_structure<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        instances: &[InstanceRecord],
        frame: usize,
    ) -> AccelResult<StructureDescriptor> {
        self.submit_update(device, instances, frame)?;
        self.complete_update(device, frame)
    }

    /// Record and submit the slot's update without waiting for the GPU.
    ///
    /// A previous update of the same slot that is still in flight is waited
    /// for first, since its instance buffer is about to be overwritten.
    pub fn submit_update<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        instances: &[InstanceRecord],
        frame: usize,
    ) -> AccelResult<SubmissionId> {
        if instances.len() as u64 > self.max_instances {
            return Err(AccelError::TooManyInstances {
                count: instances.len(),
                max: self.max_instances,
            });
        }
        let count = instances.len() as u32;
        let builder = self.builder;
        let growth = self.growth;
        let initial_capacity = self.initial_capacity;

        let slot = self.slot_mut(frame)?;
        slot.retire(device)?;

        let instance_address = slot.ensure_instance_buffer(device, count, initial_capacity, growth)?;
        if let Some(buffer) = &slot.instances {
            if !instances.is_empty() {
                device.write_buffer(buffer, 0, bytemuck::cast_slice(instances))?;
            }
        }

        let submitted = builder.submit(
            device,
            &mut slot.tlas,
            &mut slot.scratch,
            instance_address,
            count,
            slot.instance_capacity,
        )?;

        if submitted.reallocated {
            slot.stats.reallocations += 1;
        }
        match submitted.mode {
            BuildMode::Build => {
                slot.stats.builds += 1;
                slot.state = SlotState::Built;
            }
            BuildMode::Update => {
                slot.stats.refits += 1;
                slot.state = SlotState::Updated;
            }
        }
        slot.stats.instance_count = count;

        let submission = submitted.submission;
        slot.pending = Some(submitted);
        Ok(submission)
    }

    /// Wait for the slot's submitted update and return its descriptor.
    pub fn complete_update<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        frame: usize,
    ) -> AccelResult<StructureDescriptor> {
        let slot = self.slot_mut(frame)?;
        slot.retire(device)?;
        match &slot.tlas {
            Some(tlas) if tlas.is_built() => Ok(tlas.descriptor()),
            _ => Err(AccelError::Device(format!("frame slot {} has no built structure", frame))),
        }
    }

    /// Non-blocking check. Returns true once the slot has no work in flight.
    pub fn poll_update<D: AccelerationDevice + ?Sized>(&mut self, device: &D, frame: usize) -> AccelResult<bool> {
        let slot = self.slot_mut(frame)?;
        let complete = match &slot.pending {
            Some(pending) => device.is_complete(pending.submission)?,
            None => return Ok(true),
        };
        if complete {
            slot.retire(device)?;
        }
        Ok(complete)
    }

    /// Descriptor to bind for `frame`, once the slot has been built.
    pub fn descriptor(&self, frame: usize) -> AccelResult<Option<StructureDescriptor>> {
        let slot = self.slot(frame)?;
        Ok(match slot.state {
            SlotState::Built | SlotState::Updated => slot.tlas.as_ref().map(TopLevelStructure::descriptor),
            SlotState::Uninitialized | SlotState::Destroyed => None,
        })
    }

    pub fn slot_state(&self, frame: usize) -> AccelResult<SlotState> {
        self.slot(frame).map(|slot| slot.state)
    }

    pub fn stats(&self, frame: usize) -> AccelResult<SlotStats> {
        self.slot(frame).map(|slot| slot.stats)
    }

    /// Instance records the slot holds before its buffer must grow.
    pub fn instance_capacity(&self, frame: usize) -> AccelResult<u32> {
        self.slot(frame).map(|slot| slot.instance_capacity)
    }

    /// Wait for outstanding work and release every slot.
    pub fn destroy<D: AccelerationDevice + ?Sized>(&mut self, device: &D) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Err(e) = slot.retire(device) {
                log::warn!("Frame slot {}: {}", index, e);
            }
            slot.release(device);
            if slot.state != SlotState::Uninitialized {
                log::debug!(
                    "Frame slot {}: {} builds, {} refits, {} reallocations",
                    index,
                    slot.stats.builds,
                    slot.stats.refits,
                    slot.stats.reallocations
                );
            }
            slot.state = SlotState::Destroyed;
        }
    }

    fn slot(&self, frame: usize) -> AccelResult<&FrameSlot> {
        self.slots.get(frame).ok_or(AccelError::InvalidFrameSlot {
            index: frame,
            count: self.slots.len(),
        })
    }

    fn slot_mut(&mut self, frame: usize) -> AccelResult<&mut FrameSlot> {
        let count = self.slots.len();
        match self.slots.get_mut(frame) {
            Some(slot) if slot.state == SlotState::Destroyed => Err(AccelError::SlotDestroyed(frame)),
            Some(slot) => Ok(slot),
            None => Err(AccelError::InvalidFrameSlot { index: frame, count }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StructureHandle;
    use crate::mesh::{transform_rows, IDENTITY};
    use crate::test_device::FakeDevice;

    fn context(device: &FakeDevice) -> FrameAccelerationContext {
        FrameAccelerationContext::new(&AccelConfig::default(), &device.limits())
    }

    fn record(index: u32, x: f32) -> InstanceRecord {
        let mut m = IDENTITY;
        m[3][0] = x;
        InstanceRecord::new(transform_rows(&m), index, DeviceAddress(0xB1A5_0000 + index as u64 * 0x1000))
    }

    fn structure_of(ctx: &FrameAccelerationContext, frame: usize) -> StructureHandle {
        ctx.descriptor(frame).unwrap().unwrap().handle
    }

    // ============================================================
    // First build
    // ============================================================

    #[test]
    fn test_slots_created_lazily() {
        let device = FakeDevice::new();
        let ctx = context(&device);
        assert_eq!(ctx.frames_in_flight(), 3);
        assert_eq!(device.buffers_created(), 0);
        assert_eq!(ctx.slot_state(0).unwrap(), SlotState::Uninitialized);
        assert_eq!(ctx.descriptor(0).unwrap(), None);
    }

    #[test]
    fn test_empty_first_update_builds() {
        let device = FakeDevice::new();
        let mut ctx = context(&device);

        let descriptor = ctx.update_acceleration_structure(&device, &[], 0).unwrap();

        assert!(!descriptor.address.is_null());
        assert_eq!(ctx.slot_state(0).unwrap(), SlotState::Built);
        assert_eq!(device.build_modes(), vec![BuildMode::Build]);
        assert!(device.structure(descriptor.handle).unwrap().instances.is_empty());
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_first_use_of_each_slot_builds() {
        let device = FakeDevice::new();
        let mut ctx = context(&device);
        let instances = [record(0, 0.0)];

        ctx.update_acceleration_structure(&device, &instances, 0).unwrap();
        ctx.update_acceleration_structure(&device, &instances, 1).unwrap();

        assert_eq!(device.build_modes(), vec![BuildMode::Build, BuildMode::Build]);
        assert_ne!(structure_of(&ctx, 0), structure_of(&ctx, 1));
    }

    // ============================================================
    // Refit
    // ============================================================

    #[test]
    fn test_unchanged_instances_refit_to_same_contents() {
        let device = FakeDevice::new();
        let mut ctx = context(&device);
        let instances = [record(0, 1.0), record(1, 2.0)];

        let first = ctx.update_acceleration_structure(&device, &instances, 0).unwrap();
        let before = device.structure(first.handle).unwrap().instances;
        let second = ctx.update_acceleration_structure(&device, &instances, 0).unwrap();
        let after = device.structure(second.handle).unwrap().instances;

        assert_eq!(first, second);
        assert_eq!(before, after);
        assert_eq!(ctx.slot_state(0).unwrap(), SlotState::Updated);
        assert_eq!(device.build_modes(), vec![BuildMode::Build, BuildMode::Update]);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_refit_sees_new_transform() {
        let device = FakeDevice::new();
        let mut ctx = context(&device);

        ctx.update_acceleration_structure(&device, &[record(0, 0.0), record(1, 5.0)], 0).unwrap();
        let descriptor = ctx
            .update_acceleration_structure(&device, &[record(0, 0.0), record(1, 9.0)], 0)
            .unwrap();

        let built = device.structure(descriptor.handle).unwrap().instances;
        assert_eq!(built[1].transform[3], 9.0);
        assert_eq!(built[0].transform[3], 0.0);
        assert_eq!(device.build_modes().last(), Some(&BuildMode::Update));
    }

    #[test]
    fn test_empty_scene_refits() {
        let device = FakeDevice::new();
        let mut ctx = context(&device);
        ctx.update_acceleration_structure(&device, &[], 2).unwrap();
        ctx.update_acceleration_structure(&device, &[], 2).unwrap();
        assert_eq!(device.build_modes(), vec![BuildMode::Build, BuildMode::Update]);
    }

    #[test]
    fn test_count_change_rebuilds() {
        let device = FakeDevice::new();
        let mut ctx = context(&device);

        ctx.update_acceleration_structure(&device, &[record(0, 0.0)], 0).unwrap();
        let handle = structure_of(&ctx, 0);
        ctx.update_acceleration_structure(&device, &[record(0, 0.0), record(1, 1.0)], 0).unwrap();

        assert_eq!(device.build_modes(), vec![BuildMode::Build, BuildMode::Build]);
        assert_eq!(ctx.slot_state(0).unwrap(), SlotState::Built);
        assert_eq!(structure_of(&ctx, 0), handle);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_retained_scratch_not_reallocated() {
        let device = FakeDevice::new();
        let mut ctx = context(&device);
        let instances = [record(0, 0.0)];

        ctx.update_acceleration_structure(&device, &instances, 0).unwrap();
        let created = device.buffers_created();
        for _ in 0..5 {
            ctx.update_acceleration_structure(&device, &instances, 0).unwrap();
        }
        assert_eq!(device.buffers_created(), created);
        assert_eq!(ctx.stats(0).unwrap().refits, 5);
    }

    // ============================================================
    // Growth
    // ============================================================

    #[test]
    fn test_instance_buffer_grows() {
        let device = FakeDevice::new();
        let config = AccelConfig { instance_capacity: 4, ..Default::default() };
        let mut ctx = FrameAccelerationContext::new(&config, &device.limits());

        ctx.update_acceleration_structure(&device, &[record(0, 0.0)], 0).unwrap();
        assert_eq!(ctx.instance_capacity(0).unwrap(), 4);

        let many: Vec<InstanceRecord> = (0..10).map(|i| record(i, i as f32)).collect();
        let descriptor = ctx.update_acceleration_structure(&device, &many, 0).unwrap();

        assert_eq!(ctx.instance_capacity(0).unwrap(), 16);
        assert!(ctx.stats(0).unwrap().reallocations >= 1);
        assert_eq!(device.structure(descriptor.handle).unwrap().instances, many);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_fixed_instance_capacity_refuses() {
        let device = FakeDevice::new();
        let config = AccelConfig {
            instance_capacity: 2,
            tlas_growth: TlasGrowth::Fixed,
            ..Default::default()
        };
        let mut ctx = FrameAccelerationContext::new(&config, &device.limits());

        ctx.update_acceleration_structure(&device, &[record(0, 0.0)], 0).unwrap();
        let many: Vec<InstanceRecord> = (0..3).map(|i| record(i, 0.0)).collect();
        let err = ctx.update_acceleration_structure(&device, &many, 0).unwrap_err();
        assert!(matches!(err, AccelError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_too_many_instances_for_device() {
        let device = FakeDevice::with_limits(DeviceLimits {
            max_instance_count: 2,
            ..Default::default()
        });
        let mut ctx = FrameAccelerationContext::new(&AccelConfig::default(), &device.limits());
        let many: Vec<InstanceRecord> = (0..3).map(|i| record(i, 0.0)).collect();

        let err = ctx.update_acceleration_structure(&device, &many, 0).unwrap_err();
        assert_eq!(err, AccelError::TooManyInstances { count: 3, max: 2 });
        assert_eq!(device.buffers_created(), 0);
    }

    // ============================================================
    // Record / wait split
    // ============================================================

    #[test]
    fn test_submit_then_complete() {
        let device = FakeDevice::new();
        device.set_completion_delay(1);
        let mut ctx = context(&device);

        ctx.submit_update(&device, &[record(0, 0.0)], 0).unwrap();
        assert!(!ctx.poll_update(&device, 0).unwrap());
        assert!(ctx.poll_update(&device, 0).unwrap());
        let descriptor = ctx.complete_update(&device, 0).unwrap();
        assert!(!descriptor.address.is_null());
        assert_eq!(device.pending_submissions(), 0);
    }

    #[test]
    fn test_resubmit_waits_for_previous() {
        let device = FakeDevice::new();
        device.set_completion_delay(10);
        let mut ctx = context(&device);

        ctx.submit_update(&device, &[record(0, 0.0)], 1).unwrap();
        ctx.submit_update(&device, &[record(0, 3.0)], 1).unwrap();
        assert_eq!(device.pending_submissions(), 1);
        ctx.complete_update(&device, 1).unwrap();
        assert_eq!(device.pending_submissions(), 0);
    }

    #[test]
    fn test_per_build_scratch_released_on_complete() {
        let device = FakeDevice::new();
        let config = AccelConfig {
            scratch_policy: crate::config::ScratchPolicy::PerBuild,
            ..Default::default()
        };
        let mut ctx = FrameAccelerationContext::new(&config, &device.limits());

        ctx.update_acceleration_structure(&device, &[record(0, 0.0)], 0).unwrap();
        // structure storage + instance buffer
        assert_eq!(device.live_buffers(), 2);
    }

    // ============================================================
    // Slot bookkeeping
    // ============================================================

    #[test]
    fn test_invalid_frame_slot() {
        let device = FakeDevice::new();
        let mut ctx = context(&device);
        let err = ctx.update_acceleration_structure(&device, &[], 3).unwrap_err();
        assert_eq!(err, AccelError::InvalidFrameSlot { index: 3, count: 3 });
        assert!(ctx.descriptor(7).is_err());
    }

    #[test]
    fn test_slot_index_wraps() {
        let device = FakeDevice::new();
        let ctx = context(&device);
        assert_eq!(ctx.slot_index(0), 0);
        assert_eq!(ctx.slot_index(4), 1);
        assert_eq!(ctx.slot_index(5), 2);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let device = FakeDevice::new();
        device.set_completion_delay(3);
        let mut ctx = context(&device);

        ctx.update_acceleration_structure(&device, &[record(0, 0.0)], 0).unwrap();
        ctx.submit_update(&device, &[record(0, 0.0)], 1).unwrap();
        ctx.destroy(&device);

        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_structures(), 0);
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(ctx.slot_state(0).unwrap(), SlotState::Destroyed);
        assert_eq!(ctx.descriptor(0).unwrap(), None);
        assert_eq!(
            ctx.update_acceleration_structure(&device, &[], 0).unwrap_err(),
            AccelError::SlotDestroyed(0)
        );
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_instance_buffer_is_host_visible() {
        let device = FakeDevice::new();
        let mut ctx = context(&device);
        ctx.update_acceleration_structure(&device, &[record(0, 0.0)], 0).unwrap();
        assert_eq!(device.live_buffers_with_usage(BufferUsage::InstanceInput), 1);
        assert_eq!(device.live_buffers_with_usage(BufferUsage::Scratch), 1);
    }
}
