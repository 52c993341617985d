//! Per-frame instance assembly.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::blas::BottomLevelStructure;
use crate::config::AccelConfig;
use crate::device::DeviceAddress;
use crate::flags::InstanceFlags;
use crate::mesh::{transform_rows, MeshId};

/// Size of one instance record in the instance buffer.
pub const INSTANCE_RECORD_SIZE: usize = 64;

/// Largest custom index that fits in the 24-bit field.
pub const MAX_CUSTOM_INDEX: u32 = 0x00FF_FFFF;

/// Instance record in the layout the driver reads from the instance buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, visibility mask in the high 8
    pub custom_index_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

const _: () = assert!(std::mem::size_of::<InstanceRecord>() == INSTANCE_RECORD_SIZE);

impl InstanceRecord {
    pub fn new(transform: [f32; 12], custom_index: u32, blas_address: DeviceAddress) -> Self {
        Self {
            transform,
            custom_index_and_mask: (0xFF << 24) | (custom_index & MAX_CUSTOM_INDEX),
            sbt_offset_and_flags: 0,
            blas_address: blas_address.0,
        }
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.custom_index_and_mask = ((mask as u32) << 24) | (self.custom_index_and_mask & MAX_CUSTOM_INDEX);
        self
    }

    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.sbt_offset_and_flags = ((flags.bits() as u32) << 24) | (self.sbt_offset_and_flags & 0x00FF_FFFF);
        self
    }

    pub fn with_sbt_offset(mut self, offset: u32) -> Self {
        self.sbt_offset_and_flags = (self.sbt_offset_and_flags & 0xFF00_0000) | (offset & 0x00FF_FFFF);
        self
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & MAX_CUSTOM_INDEX
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.sbt_offset_and_flags >> 24) as u8)
    }

    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & 0x00FF_FFFF
    }

    pub fn blas_address(&self) -> DeviceAddress {
        DeviceAddress(self.blas_address)
    }
}

/// One visible object this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneEntry {
    pub mesh: MeshId,
    /// Column-major 4x4 world transform
    pub transform: [[f32; 4]; 4],
    pub mask: u8,
    pub flags: InstanceFlags,
}

impl SceneEntry {
    pub fn new(mesh: MeshId, transform: [[f32; 4]; 4]) -> Self {
        Self {
            mesh,
            transform,
            mask: 0xFF,
            flags: InstanceFlags::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Resolves a mesh to the device address of its consumable BLAS.
pub trait BlasLookup {
    fn blas_address(&self, mesh: MeshId) -> Option<DeviceAddress>;
}

impl BlasLookup for HashMap<MeshId, BottomLevelStructure> {
    fn blas_address(&self, mesh: MeshId) -> Option<DeviceAddress> {
        self.get(&mesh).and_then(BottomLevelStructure::device_address)
    }
}

impl BlasLookup for HashMap<MeshId, DeviceAddress> {
    fn blas_address(&self, mesh: MeshId) -> Option<DeviceAddress> {
        self.get(&mesh).copied()
    }
}

/// Turns scene entries into instance records.
#[derive(Debug, Clone, Copy)]
pub struct InstanceAssembler {
    parallel_threshold: usize,
}

impl Default for InstanceAssembler {
    fn default() -> Self {
        Self::from_config(&AccelConfig::default())
    }
}

impl InstanceAssembler {
    pub fn new(parallel_threshold: usize) -> Self {
        Self {
            parallel_threshold: parallel_threshold.max(1),
        }
    }

    pub fn from_config(config: &AccelConfig) -> Self {
        Self::new(config.parallel_assembly_threshold)
    }

    /// Whether `entries` scene entries are assembled on the rayon pool.
    pub fn runs_parallel(&self, entries: usize) -> bool {
        entries >= self.parallel_threshold
    }

    /// One record per entry whose mesh has a usable BLAS, in entry order.
    ///
    /// The custom index is the entry's position in `entries`, so skipped
    /// entries leave gaps and a hit can be mapped back to the caller's own
    /// per-entry table.
    pub fn assemble<L>(&self, entries: &[SceneEntry], lookup: &L) -> Vec<InstanceRecord>
    where
        L: BlasLookup + Sync,
    {
        if entries.len() > MAX_CUSTOM_INDEX as usize + 1 {
            log::warn!(
                "{} scene entries, only the first {} fit the custom index",
                entries.len(),
                MAX_CUSTOM_INDEX as usize + 1
            );
        }

        let records: Vec<InstanceRecord> = if self.runs_parallel(entries.len()) {
            entries
                .par_iter()
                .enumerate()
                .filter_map(|(index, entry)| assemble_one(index, entry, lookup))
                .collect()
        } else {
            entries
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| assemble_one(index, entry, lookup))
                .collect()
        };

        if records.len() < entries.len() {
            log::trace!("{} of {} scene entries have no BLAS yet", entries.len() - records.len(), entries.len());
        }
        records
    }
}

fn assemble_one<L: BlasLookup>(index: usize, entry: &SceneEntry, lookup: &L) -> Option<InstanceRecord> {
    if index > MAX_CUSTOM_INDEX as usize {
        return None;
    }
    let address = lookup.blas_address(entry.mesh)?;
    Some(
        InstanceRecord::new(transform_rows(&entry.transform), index as u32, address)
            .with_mask(entry.mask)
            .with_flags(entry.flags),
    )
}
