//! Pre-build geometry validation.
//!
//! Runs before any size query so that meshes the driver would reject, or that
//! would produce a structure no ray can hit, are reported as a typed
//! [`BuildFailure`] instead of reaching the device.

use crate::device::DeviceLimits;
use crate::error::BuildFailure;
use crate::geometry::{index_byte_offset, transform_byte_offset};
use crate::mesh::{HostGeometry, MeshGeometry, Submesh};

/// Twice the area below which a triangle counts as degenerate, squared.
const DEGENERATE_CROSS_SQ: f32 = 1.0e-12;

/// Check a mesh against the device limits and, when available, its host copy.
pub fn validate_mesh(
    mesh: &MeshGeometry,
    limits: &DeviceLimits,
    large_triangle_limit: f32,
) -> Result<(), BuildFailure> {
    let buffers = &mesh.buffers;

    for submesh in &mesh.submeshes {
        if submesh.index_count % 3 != 0 {
            return Err(BuildFailure::Failure);
        }
        let index_end = submesh.base_index as u64 + submesh.index_count as u64;
        let vertex_end = submesh.base_vertex as u64 + submesh.vertex_count as u64;
        if index_end > buffers.index_count as u64 || vertex_end > buffers.vertex_count as u64 {
            return Err(BuildFailure::Failure);
        }
        // Build ranges address the index buffer with 32-bit byte offsets.
        if index_byte_offset(submesh.base_index) > u32::MAX as u64 {
            return Err(BuildFailure::PolygonLimitReached);
        }
    }

    if buffers.transform_address.is_some() {
        let last = mesh.submeshes.len().saturating_sub(1);
        if transform_byte_offset(last) > u32::MAX as u64 {
            return Err(BuildFailure::PolygonLimitReached);
        }
    }

    let triangles = mesh.triangle_count();
    if triangles == 0 {
        return Err(BuildFailure::ZeroAreaTestFailed);
    }

    let geometries = mesh.submeshes.iter().filter(|s| s.triangle_count() > 0).count() as u64;
    if triangles > limits.max_primitive_count || geometries > limits.max_geometry_count {
        return Err(BuildFailure::PolygonLimitReached);
    }

    match &mesh.host {
        Some(host) => validate_triangles(host, &mesh.submeshes, large_triangle_limit),
        None => Ok(()),
    }
}

fn validate_triangles(
    host: &HostGeometry,
    submeshes: &[Submesh],
    large_triangle_limit: f32,
) -> Result<(), BuildFailure> {
    let limit_sq = large_triangle_limit * large_triangle_limit;
    let mut any_area = false;

    for submesh in submeshes {
        let start = submesh.base_index as usize;
        let end = start + submesh.index_count as usize;
        let indices = host.indices.get(start..end).ok_or(BuildFailure::Failure)?;

        for tri in indices.chunks_exact(3) {
            let mut corners = [[0.0f32; 3]; 3];
            for (corner, &index) in corners.iter_mut().zip(tri) {
                let vertex = submesh.base_vertex as usize + index as usize;
                *corner = *host.positions.get(vertex).ok_or(BuildFailure::Failure)?;
            }

            let e0 = sub(corners[1], corners[0]);
            let e1 = sub(corners[2], corners[0]);
            let e2 = sub(corners[2], corners[1]);
            if [e0, e1, e2].iter().any(|e| length_sq(*e) > limit_sq) {
                return Err(BuildFailure::LargeTriangle);
            }

            if length_sq(cross(e0, e1)) > DEGENERATE_CROSS_SQ {
                any_area = true;
            }
        }
    }

    if any_area {
        Ok(())
    } else {
        Err(BuildFailure::ZeroAreaTestFailed)
    }
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn length_sq(v: [f32; 3]) -> f32 {
    v[0] * v[0] + v[1] * v[1] + v[2] * v[2]
}
