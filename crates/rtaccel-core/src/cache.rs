//! Per-mesh BLAS storage.
//!
//! Owns every bottom-level structure for the lifetime of its mesh, the builds
//! still in flight, and the meshes excluded from ray tracing because their
//! build failed.

use std::collections::HashMap;

use crate::blas::{BlasPoll, BlasState, BottomLevelBuilder, BottomLevelStructure, PendingBlas};
use crate::config::AccelConfig;
use crate::device::{AccelerationDevice, DeviceAddress};
use crate::error::{AccelResult, BuildFailure};
use crate::flags::BuildRequest;
use crate::instance::BlasLookup;
use crate::mesh::{MeshGeometry, MeshId};

#[derive(Debug, Default)]
pub struct BlasCache {
    builder: BottomLevelBuilder,
    built: HashMap<MeshId, BottomLevelStructure>,
    pending: HashMap<MeshId, PendingBlas>,
    excluded: HashMap<MeshId, BuildFailure>,
}

impl BlasCache {
    pub fn new(config: &AccelConfig) -> Self {
        Self {
            builder: BottomLevelBuilder::new(config),
            ..Default::default()
        }
    }

    /// Build a mesh's BLAS and wait for it.
    ///
    /// Returns `Ok(None)` when the mesh cannot be built; it is then excluded
    /// from ray tracing and the reason is available from
    /// [`BlasCache::exclusion`]. Fatal errors are returned.
    pub fn load_mesh<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        id: MeshId,
        mesh: &MeshGeometry,
    ) -> AccelResult<Option<DeviceAddress>> {
        self.load_mesh_with(device, id, mesh, self.builder.request())
    }

    pub fn load_mesh_with<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        id: MeshId,
        mesh: &MeshGeometry,
        request: BuildRequest,
    ) -> AccelResult<Option<DeviceAddress>> {
        self.unload_mesh(device, id);
        let result = self.builder.build(device, mesh, request);
        self.settle(id, result)
    }

    /// Submit a mesh's build and return immediately.
    ///
    /// Completion is picked up by [`BlasCache::poll_pending`]. Geometry
    /// rejected before submission is excluded right away.
    pub fn load_mesh_async<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        id: MeshId,
        mesh: &MeshGeometry,
    ) -> AccelResult<()> {
        self.unload_mesh(device, id);
        match self.builder.begin(device, mesh, self.builder.request()) {
            Ok(pending) => {
                self.pending.insert(id, pending);
                Ok(())
            }
            Err(e) => self.settle(id, Err(e)).map(|_| ()),
        }
    }

    /// Advance every in-flight build. Returns how many finished this call.
    ///
    /// Builds are all advanced even if one fails fatally; the first fatal
    /// error is returned afterwards.
    pub fn poll_pending<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> AccelResult<usize> {
        let mut finished = 0;
        let mut fatal = None;

        for (id, pending) in std::mem::take(&mut self.pending) {
            match pending.poll(device) {
                Ok(BlasPoll::Pending(pending)) => {
                    self.pending.insert(id, pending);
                }
                Ok(BlasPoll::Ready(structure)) => {
                    self.built.insert(id, structure);
                    finished += 1;
                }
                Err(e) => {
                    finished += 1;
                    if let Err(e) = self.settle(id, Err(e)) {
                        fatal.get_or_insert(e);
                    }
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(finished),
        }
    }

    /// Block until every in-flight build has finished.
    pub fn wait_pending<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> AccelResult<()> {
        let mut fatal = None;
        for (id, pending) in std::mem::take(&mut self.pending) {
            let result = pending.wait(device);
            if let Err(e) = self.settle(id, result) {
                fatal.get_or_insert(e);
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release a mesh's BLAS, cancelling an in-flight build.
    ///
    /// The caller guarantees no frame still in flight references it.
    pub fn unload_mesh<D: AccelerationDevice + ?Sized>(&mut self, device: &D, id: MeshId) -> bool {
        let mut removed = self.excluded.remove(&id).is_some();
        if let Some(pending) = self.pending.remove(&id) {
            pending.abandon(device);
            removed = true;
        }
        if let Some(mut structure) = self.built.remove(&id) {
            structure.destroy(device);
            removed = true;
        }
        removed
    }

    pub fn get(&self, id: MeshId) -> Option<&BottomLevelStructure> {
        self.built.get(&id)
    }

    pub fn state(&self, id: MeshId) -> BlasState {
        if let Some(structure) = self.built.get(&id) {
            structure.state()
        } else if let Some(pending) = self.pending.get(&id) {
            pending.state()
        } else {
            BlasState::Uninitialized
        }
    }

    /// Why a mesh was excluded from ray tracing, if it was.
    pub fn exclusion(&self, id: MeshId) -> Option<BuildFailure> {
        self.excluded.get(&id).copied()
    }

    pub fn is_excluded(&self, id: MeshId) -> bool {
        self.excluded.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.built.len()
    }

    pub fn is_empty(&self) -> bool {
        self.built.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Bytes saved by compaction across all cached structures.
    pub fn compaction_savings(&self) -> u64 {
        self.built.values().map(|s| s.original_size() - s.size()).sum()
    }

    pub fn destroy<D: AccelerationDevice + ?Sized>(&mut self, device: &D) {
        for (_, pending) in self.pending.drain() {
            pending.abandon(device);
        }
        for (_, mut structure) in self.built.drain() {
            structure.destroy(device);
        }
        self.excluded.clear();
    }

    fn settle(&mut self, id: MeshId, result: AccelResult<BottomLevelStructure>) -> AccelResult<Option<DeviceAddress>> {
        match result {
            Ok(structure) => {
                let address = structure.device_address();
                self.built.insert(id, structure);
                Ok(address)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => match e.build_failure() {
                Some(failure) => {
                    log::warn!("Mesh {:?} excluded from ray tracing: {}", id, e);
                    self.excluded.insert(id, failure);
                    Ok(None)
                }
                None => Err(e),
            },
        }
    }
}

impl BlasLookup for BlasCache {
    fn blas_address(&self, mesh: MeshId) -> Option<DeviceAddress> {
        self.built.get(&mesh).and_then(BottomLevelStructure::device_address)
    }
}
