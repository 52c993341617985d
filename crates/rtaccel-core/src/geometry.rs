//! Mesh to triangle-geometry conversion.
//!
//! Every submesh becomes one triangle geometry over the mesh's shared vertex
//! and index buffers. The buffer addresses are read once per mesh; submeshes
//! differ only in the offsets of their build range.

use crate::device::DeviceAddress;
use crate::mesh::{MeshGeometry, PACKED_TRANSFORM_SIZE};
use crate::offsets::{GeometryOffsetTable, SubmeshOffsetTable};

/// Size of one index in bytes. Indices are always 32-bit.
pub const INDEX_SIZE: u32 = 4;

/// Triangle geometry handed to the driver for one submesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDescriptor {
    pub vertex_address: DeviceAddress,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub index_address: DeviceAddress,
    pub triangle_count: u32,
    /// Packed 3x4 transforms; the build range selects one.
    pub transform_address: Option<DeviceAddress>,
    pub opaque: bool,
}

impl GeometryDescriptor {
    /// Highest vertex index the geometry may reference.
    pub fn max_vertex(&self) -> u32 {
        self.vertex_count.saturating_sub(1)
    }
}

/// Which part of the shared buffers a geometry covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildRange {
    pub primitive_count: u32,
    /// Byte offset into the index buffer.
    pub primitive_offset: u32,
    /// Added to every index before fetching a vertex.
    pub first_vertex: u32,
    /// Byte offset into the transform buffer.
    pub transform_offset: u32,
}

/// Output of [`MeshGeometryExtractor::extract`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedGeometry {
    pub descriptors: Vec<GeometryDescriptor>,
    pub ranges: Vec<BuildRange>,
    /// One entry per descriptor, naming its source submesh.
    pub geometries: GeometryOffsetTable,
    /// One entry per submesh, including skipped ones.
    pub offsets: SubmeshOffsetTable,
}

impl ExtractedGeometry {
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn primitive_count(&self) -> u32 {
        self.ranges.iter().map(|r| r.primitive_count).sum()
    }
}

/// Converts a mesh's submesh table into build geometries.
#[derive(Debug, Clone, Copy)]
pub struct MeshGeometryExtractor {
    pub opaque: bool,
}

impl Default for MeshGeometryExtractor {
    fn default() -> Self {
        Self { opaque: true }
    }
}

impl MeshGeometryExtractor {
    /// Describe every submesh with at least one triangle.
    ///
    /// Submeshes without triangles produce no geometry but still occupy their
    /// slot in the offset table.
    pub fn extract(&self, mesh: &MeshGeometry) -> ExtractedGeometry {
        let buffers = &mesh.buffers;
        let offsets = SubmeshOffsetTable::from_submeshes(&mesh.submeshes);

        let mut descriptors = Vec::with_capacity(mesh.submeshes.len());
        let mut ranges = Vec::with_capacity(mesh.submeshes.len());
        let mut sources = Vec::with_capacity(mesh.submeshes.len());

        for (i, submesh) in mesh.submeshes.iter().enumerate() {
            let triangle_count = submesh.triangle_count();
            if triangle_count == 0 {
                log::debug!("{}: skipping empty submesh {}", mesh.name, i);
                continue;
            }

            descriptors.push(GeometryDescriptor {
                vertex_address: buffers.vertex_address,
                vertex_stride: buffers.vertex_stride,
                vertex_count: buffers.vertex_count,
                index_address: buffers.index_address,
                triangle_count,
                transform_address: buffers.transform_address,
                opaque: self.opaque,
            });

            ranges.push(BuildRange {
                primitive_count: triangle_count,
                primitive_offset: saturate(index_byte_offset(submesh.base_index)),
                first_vertex: submesh.base_vertex,
                transform_offset: if buffers.transform_address.is_some() {
                    saturate(transform_byte_offset(i))
                } else {
                    0
                },
            });

            sources.push((i, triangle_count));
        }

        ExtractedGeometry {
            descriptors,
            ranges,
            geometries: GeometryOffsetTable::from_geometries(sources),
            offsets,
        }
    }
}

/// Byte offset of the first index of a submesh.
pub fn index_byte_offset(base_index: u32) -> u64 {
    base_index as u64 * INDEX_SIZE as u64
}

/// Byte offset of a submesh's packed transform.
pub fn transform_byte_offset(submesh: usize) -> u64 {
    submesh as u64 * PACKED_TRANSFORM_SIZE
}

// Meshes whose offsets do not fit are rejected by validation before this point.
fn saturate(bytes: u64) -> u32 {
    u32::try_from(bytes).unwrap_or(u32::MAX)
}
