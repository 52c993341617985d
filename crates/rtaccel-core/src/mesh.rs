//! Mesh data consumed from the asset system.
//!
//! A mesh owns one vertex buffer and one index buffer shared by all of its
//! submeshes. This subsystem only reads the submesh table and the buffers'
//! device addresses; it never modifies either.

use crate::device::DeviceAddress;

/// Column-major 4x4 identity.
pub const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Size in bytes of one packed 3x4 transform.
pub const PACKED_TRANSFORM_SIZE: u64 = 48;

/// Stable identifier of a mesh asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u64);

/// One drawable range of a mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Submesh {
    pub base_vertex: u32,
    pub base_index: u32,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Column-major local transform
    pub transform: [[f32; 4]; 4],
}

impl Submesh {
    pub fn new(base_vertex: u32, base_index: u32, vertex_count: u32, index_count: u32) -> Self {
        Self {
            base_vertex,
            base_index,
            vertex_count,
            index_count,
            transform: IDENTITY,
        }
    }

    pub fn with_transform(mut self, transform: [[f32; 4]; 4]) -> Self {
        self.transform = transform;
        self
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// GPU-resident buffers of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBuffers {
    /// Positions are three `f32` at the start of each vertex.
    pub vertex_address: DeviceAddress,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    /// 32-bit indices.
    pub index_address: DeviceAddress,
    pub index_count: u32,
    /// Packed 3x4 submesh transforms, one per submesh, if uploaded.
    pub transform_address: Option<DeviceAddress>,
}

/// CPU copy of a mesh's positions and indices, kept by the asset system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostGeometry {
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

/// Everything needed to build a mesh's bottom-level structure.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshGeometry {
    pub name: String,
    pub buffers: MeshBuffers,
    pub submeshes: Vec<Submesh>,
    /// Enables per-triangle validation when present.
    pub host: Option<HostGeometry>,
}

impl MeshGeometry {
    pub fn new(name: impl Into<String>, buffers: MeshBuffers, submeshes: Vec<Submesh>) -> Self {
        Self {
            name: name.into(),
            buffers,
            submeshes,
            host: None,
        }
    }

    pub fn with_host_geometry(mut self, host: HostGeometry) -> Self {
        self.host = Some(host);
        self
    }

    /// Triangles across all submeshes.
    pub fn triangle_count(&self) -> u64 {
        self.submeshes.iter().map(|s| s.triangle_count() as u64).sum()
    }

    /// Submesh transforms in the layout the transform buffer expects.
    pub fn packed_submesh_transforms(&self) -> Vec<[f32; 12]> {
        self.submeshes.iter().map(|s| transform_rows(&s.transform)).collect()
    }
}

/// Convert a column-major 4x4 affine matrix into a row-major 3x4 matrix.
pub fn transform_rows(m: &[[f32; 4]; 4]) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        for col in 0..4 {
            out[row * 4 + col] = m[col][row];
        }
    }
    out
}
