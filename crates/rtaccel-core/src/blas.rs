//! Bottom-level acceleration structures.
//!
//! One structure per mesh, built once at load time. A build is split into
//! [`BottomLevelBuilder::begin`], which validates the mesh, allocates and
//! submits, and a [`PendingBlas`] that is either polled from the render loop
//! or waited on. When compaction is requested the pending build goes through
//! a second submission that copies the result into a smaller buffer; the
//! original structure is released once the copy has completed.

use crate::config::AccelConfig;
use crate::device::{
    AccelerationDevice, BufferDesc, BufferUsage, BuildCommand, BuildInput, BuildMode, Command, DeviceAddress,
    DeviceBuffer, QueryHandle, StructureHandle, StructureLevel, SubmissionId,
};
use crate::error::{AccelError, AccelResult, BuildFailure};
use crate::flags::{BuildFlags, BuildRequest};
use crate::geometry::MeshGeometryExtractor;
use crate::mesh::MeshGeometry;
use crate::offsets::{GeometryOffsetTable, SubmeshHit, SubmeshOffsetTable};
use crate::scratch::ScratchBuffer;
use crate::validate::validate_mesh;

/// Lifecycle of a bottom-level structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlasState {
    Uninitialized,
    Building,
    Built,
    Compacting,
    Compacted,
    Destroyed,
}

impl BlasState {
    /// Whether instances may reference the structure in this state.
    pub fn is_consumable(self) -> bool {
        matches!(self, BlasState::Built | BlasState::Compacted)
    }
}

/// A built bottom-level structure and the memory backing it.
#[derive(Debug)]
pub struct BottomLevelStructure {
    name: String,
    handle: StructureHandle,
    buffer: Option<DeviceBuffer>,
    size: u64,
    original_size: u64,
    address: DeviceAddress,
    offsets: SubmeshOffsetTable,
    geometries: GeometryOffsetTable,
    state: BlasState,
}

impl BottomLevelStructure {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BlasState {
        self.state
    }

    pub fn handle(&self) -> StructureHandle {
        self.handle
    }

    /// Device address for instance records. `None` once destroyed.
    pub fn device_address(&self) -> Option<DeviceAddress> {
        if self.state.is_consumable() {
            Some(self.address)
        } else {
            None
        }
    }

    /// Size of the backing buffer in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size reported for the uncompacted build.
    pub fn original_size(&self) -> u64 {
        self.original_size
    }

    pub fn offsets(&self) -> &SubmeshOffsetTable {
        &self.offsets
    }

    /// Map a global primitive index from a hit back to its submesh.
    pub fn locate(&self, primitive: u32) -> Option<SubmeshHit> {
        self.offsets.locate(primitive)
    }

    /// Offsets of the geometries handed to the driver. Submeshes without
    /// triangles have no geometry, so this can be shorter than
    /// [`BottomLevelStructure::offsets`].
    pub fn geometry_offsets(&self) -> &GeometryOffsetTable {
        &self.geometries
    }

    /// Map a hit's geometry index and geometry-local primitive back to its
    /// submesh.
    pub fn locate_geometry(&self, geometry: u32, primitive: u32) -> Option<SubmeshHit> {
        self.geometries.locate(geometry as usize, primitive)
    }

    /// Release the structure and its buffer. The caller guarantees no
    /// in-flight work still references it.
    pub fn destroy<D: AccelerationDevice + ?Sized>(&mut self, device: &D) {
        if self.state == BlasState::Destroyed {
            return;
        }
        device.destroy_structure(self.handle);
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
        self.state = BlasState::Destroyed;
        log::debug!("BLAS {}: destroyed", self.name);
    }
}

/// A driver error from a size query or build submission means the driver
/// refused this mesh. Other errors pass through unchanged.
fn rejected_by_driver(name: &str, error: AccelError) -> AccelError {
    match error {
        AccelError::Device(msg) => {
            log::warn!("BLAS {}: driver rejected build: {}", name, msg);
            BuildFailure::Failure.into()
        }
        other => other,
    }
}

/// Result of polling a [`PendingBlas`].
#[derive(Debug)]
pub enum BlasPoll {
    Pending(PendingBlas),
    Ready(BottomLevelStructure),
}

/// A submitted bottom-level build, in the Building or Compacting state.
#[derive(Debug)]
pub struct PendingBlas {
    name: String,
    state: BlasState,
    submission: SubmissionId,
    offsets: SubmeshOffsetTable,
    geometries: GeometryOffsetTable,
    structure: StructureHandle,
    buffer: DeviceBuffer,
    size: u64,
    scratch: Option<ScratchBuffer>,
    query: Option<QueryHandle>,
    compacted: Option<(StructureHandle, DeviceBuffer)>,
}

impl PendingBlas {
    pub fn state(&self) -> BlasState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advance without blocking.
    pub fn poll<D: AccelerationDevice + ?Sized>(self, device: &D) -> AccelResult<BlasPoll> {
        match device.is_complete(self.submission) {
            Ok(true) => self.advance(device),
            Ok(false) => Ok(BlasPoll::Pending(self)),
            Err(e) => {
                self.abandon(device);
                Err(e)
            }
        }
    }

    /// Block until the structure is usable.
    pub fn wait<D: AccelerationDevice + ?Sized>(mut self, device: &D) -> AccelResult<BottomLevelStructure> {
        loop {
            if let Err(e) = device.wait(self.submission) {
                self.release(device);
                return Err(e);
            }
            match self.advance(device)? {
                BlasPoll::Ready(structure) => return Ok(structure),
                BlasPoll::Pending(next) => self = next,
            }
        }
    }

    /// Wait for outstanding work, then release everything.
    pub fn abandon<D: AccelerationDevice + ?Sized>(self, device: &D) {
        if let Err(e) = device.wait(self.submission) {
            log::warn!("BLAS {}: wait before release failed: {}", self.name, e);
        }
        self.release(device);
    }

    fn record_build<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        flags: BuildFlags,
        input: BuildInput<'_>,
        scratch_size: u64,
    ) -> AccelResult<()> {
        let scratch = ScratchBuffer::allocate(device, scratch_size, "blas_scratch")?;
        let scratch_address = scratch.address();
        self.scratch = Some(scratch);

        if flags.contains(BuildFlags::ALLOW_COMPACTION) {
            self.query = Some(device.create_size_query()?);
        }

        let mut commands = vec![
            Command::Build(BuildCommand {
                mode: BuildMode::Build,
                flags,
                input,
                src: None,
                dst: self.structure,
                scratch: scratch_address,
            }),
            Command::BuildBarrier,
        ];
        if let Some(query) = self.query {
            commands.push(Command::WriteCompactedSize {
                structure: self.structure,
                query,
            });
        }

        self.submission = device
            .submit(&commands)
            .map_err(|e| rejected_by_driver(&self.name, e))?;
        Ok(())
    }

    /// Called once the current submission has completed.
    fn advance<D: AccelerationDevice + ?Sized>(mut self, device: &D) -> AccelResult<BlasPoll> {
        match self.state {
            BlasState::Building => {
                if let Some(scratch) = self.scratch.take() {
                    scratch.release(device);
                }

                let query = match self.query.take() {
                    Some(query) => query,
                    None => return self.finish(device).map(BlasPoll::Ready),
                };
                let result = device.compacted_size(query);
                device.destroy_size_query(query);
                let compacted_size = match result {
                    Ok(size) => size,
                    Err(e) => {
                        self.release(device);
                        return Err(e);
                    }
                };

                if compacted_size == 0 || compacted_size >= self.size {
                    log::debug!(
                        "BLAS {}: compaction skipped ({} of {} bytes)",
                        self.name,
                        compacted_size,
                        self.size
                    );
                    return self.finish(device).map(BlasPoll::Ready);
                }

                match self.start_compaction(device, compacted_size) {
                    Ok(()) => Ok(BlasPoll::Pending(self)),
                    Err(e) => {
                        self.release(device);
                        Err(e)
                    }
                }
            }
            BlasState::Compacting => self.finish(device).map(BlasPoll::Ready),
            other => {
                let name = self.name.clone();
                self.release(device);
                Err(AccelError::Device(format!("BLAS {}: pending build in state {:?}", name, other)))
            }
        }
    }

    fn start_compaction<D: AccelerationDevice + ?Sized>(&mut self, device: &D, compacted_size: u64) -> AccelResult<()> {
        let buffer = device.create_buffer(&BufferDesc {
            size: compacted_size,
            usage: BufferUsage::StructureStorage,
            name: &self.name,
        })?;
        let structure = match device.create_structure(StructureLevel::Bottom, &buffer, compacted_size) {
            Ok(structure) => structure,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };
        self.compacted = Some((structure, buffer));

        self.submission = device
            .submit(&[Command::CopyCompact {
                src: self.structure,
                dst: structure,
            }])
            .map_err(|e| rejected_by_driver(&self.name, e))?;
        self.state = BlasState::Compacting;
        Ok(())
    }

    fn finish<D: AccelerationDevice + ?Sized>(self, device: &D) -> AccelResult<BottomLevelStructure> {
        let original_size = self.size;
        let (handle, buffer, state) = match self.compacted {
            Some((handle, buffer)) => {
                device.destroy_structure(self.structure);
                device.destroy_buffer(self.buffer);
                (handle, buffer, BlasState::Compacted)
            }
            None => (self.structure, self.buffer, BlasState::Built),
        };

        let address = device.structure_address(handle);
        if address.is_null() {
            device.destroy_structure(handle);
            device.destroy_buffer(buffer);
            return Err(AccelError::Device(format!("BLAS {}: null device address", self.name)));
        }

        if state == BlasState::Compacted {
            log::info!(
                "BLAS {}: compacted {} -> {} bytes ({}% saved)",
                self.name,
                original_size,
                buffer.size,
                100 - buffer.size * 100 / original_size.max(1)
            );
        } else {
            log::debug!("BLAS {}: built, {} bytes", self.name, original_size);
        }

        Ok(BottomLevelStructure {
            name: self.name,
            handle,
            size: buffer.size,
            buffer: Some(buffer),
            original_size,
            address,
            offsets: self.offsets,
            geometries: self.geometries,
            state,
        })
    }

    fn release<D: AccelerationDevice + ?Sized>(self, device: &D) {
        if let Some(query) = self.query {
            device.destroy_size_query(query);
        }
        if let Some(scratch) = self.scratch {
            scratch.release(device);
        }
        if let Some((structure, buffer)) = self.compacted {
            device.destroy_structure(structure);
            device.destroy_buffer(buffer);
        }
        device.destroy_structure(self.structure);
        device.destroy_buffer(self.buffer);
    }
}

/// Builds bottom-level structures from mesh geometry.
#[derive(Debug, Clone, Copy)]
pub struct BottomLevelBuilder {
    extractor: MeshGeometryExtractor,
    request: BuildRequest,
    large_triangle_limit: f32,
}

impl Default for BottomLevelBuilder {
    fn default() -> Self {
        Self::new(&AccelConfig::default())
    }
}

impl BottomLevelBuilder {
    pub fn new(config: &AccelConfig) -> Self {
        Self {
            extractor: MeshGeometryExtractor::default(),
            request: config.blas_request,
            large_triangle_limit: config.large_triangle_limit,
        }
    }

    pub fn with_extractor(mut self, extractor: MeshGeometryExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Request used by [`BottomLevelBuilder::build_default`].
    pub fn request(&self) -> BuildRequest {
        self.request
    }

    /// Validate, allocate and submit a build. Returns before the GPU finishes.
    ///
    /// Geometry problems come back as [`AccelError::Build`] before anything is
    /// allocated. Allocation failures are fatal. Every resource acquired
    /// before an error is released again.
    pub fn begin<D: AccelerationDevice + ?Sized>(
        &self,
        device: &D,
        mesh: &MeshGeometry,
        request: BuildRequest,
    ) -> AccelResult<PendingBlas> {
        validate_mesh(mesh, &device.limits(), self.large_triangle_limit)?;

        let geometry = self.extractor.extract(mesh);
        if geometry.is_empty() {
            return Err(BuildFailure::ZeroAreaTestFailed.into());
        }

        let flags = request.flags - BuildFlags::ALLOW_UPDATE;
        let input = BuildInput::Triangles {
            geometries: &geometry.descriptors,
            ranges: &geometry.ranges,
        };
        let sizes = device
            .build_sizes(flags, &input)
            .map_err(|e| rejected_by_driver(&mesh.name, e))?;
        if sizes.structure_size == 0 {
            return Err(BuildFailure::Failure.into());
        }

        log::debug!(
            "BLAS {}: {} geometries, {} triangles, {} bytes (scratch {})",
            mesh.name,
            geometry.descriptors.len(),
            geometry.primitive_count(),
            sizes.structure_size,
            sizes.build_scratch_size
        );

        let buffer = device.create_buffer(&BufferDesc {
            size: sizes.structure_size,
            usage: BufferUsage::StructureStorage,
            name: &mesh.name,
        })?;
        let structure = match device.create_structure(StructureLevel::Bottom, &buffer, sizes.structure_size) {
            Ok(structure) => structure,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        let mut pending = PendingBlas {
            name: mesh.name.clone(),
            state: BlasState::Building,
            submission: SubmissionId(0),
            offsets: geometry.offsets.clone(),
            geometries: geometry.geometries.clone(),
            structure,
            buffer,
            size: sizes.structure_size,
            scratch: None,
            query: None,
            compacted: None,
        };

        match pending.record_build(device, flags, input, sizes.build_scratch_size) {
            Ok(()) => Ok(pending),
            Err(e) => {
                pending.release(device);
                Err(e)
            }
        }
    }

    /// Build and wait for the result.
    pub fn build<D: AccelerationDevice + ?Sized>(
        &self,
        device: &D,
        mesh: &MeshGeometry,
        request: BuildRequest,
    ) -> AccelResult<BottomLevelStructure> {
        self.begin(device, mesh, request)?.wait(device)
    }

    /// [`BottomLevelBuilder::build`] with the configured request.
    pub fn build_default<D: AccelerationDevice + ?Sized>(
        &self,
        device: &D,
        mesh: &MeshGeometry,
    ) -> AccelResult<BottomLevelStructure> {
        self.build(device, mesh, self.request)
    }
}
