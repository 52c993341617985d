//! Global primitive index to submesh lookup.
//!
//! A bottom-level structure numbers primitives across all of its submeshes.
//! The table stores, for every submesh, the number of triangles that precede
//! it, so a hit shader (or the CPU) can recover the owning submesh and its
//! material from a single global primitive index.
//!
//! Submeshes without triangles emit no driver geometry, so the geometry index
//! a hit reports is not always a submesh index. [`GeometryOffsetTable`] keeps
//! one entry per emitted geometry together with the submesh it came from.

use crate::mesh::Submesh;

/// Result of resolving a global primitive index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmeshHit {
    pub submesh: usize,
    /// Primitive index relative to the submesh's first triangle.
    pub local_primitive: u32,
}

/// Cumulative primitive offsets, one per submesh. Never decreasing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmeshOffsetTable {
    offsets: Vec<u32>,
    total: u32,
}

impl SubmeshOffsetTable {
    /// Build from per-submesh triangle counts. Empty submeshes keep an entry
    /// equal to the next submesh's offset.
    pub fn from_triangle_counts<I>(counts: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let mut offsets = Vec::new();
        let mut total = 0u32;
        for count in counts {
            offsets.push(total);
            total = total.saturating_add(count);
        }
        Self { offsets, total }
    }

    pub fn from_submeshes(submeshes: &[Submesh]) -> Self {
        Self::from_triangle_counts(submeshes.iter().map(Submesh::triangle_count))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Total primitives covered by the table.
    pub fn primitive_count(&self) -> u32 {
        self.total
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.offsets
    }

    /// Primitive offset of one submesh.
    pub fn offset(&self, submesh: usize) -> Option<u32> {
        self.offsets.get(submesh).copied()
    }

    /// Find the submesh owning `primitive`.
    ///
    /// Picks the last submesh whose offset does not exceed the index, which
    /// skips over empty submeshes sharing an offset with their successor.
    pub fn locate(&self, primitive: u32) -> Option<SubmeshHit> {
        if primitive >= self.total {
            return None;
        }
        let submesh = self.offsets.partition_point(|&offset| offset <= primitive).checked_sub(1)?;
        Some(SubmeshHit {
            submesh,
            local_primitive: primitive - self.offsets[submesh],
        })
    }
}

/// Per-geometry offsets of a built structure, in driver geometry order.
///
/// This is the table to upload for hit shaders: entry `g` is the global
/// primitive offset of geometry `g`, and [`GeometryOffsetTable::submesh`]
/// names the submesh that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeometryOffsetTable {
    offsets: Vec<u32>,
    counts: Vec<u32>,
    submeshes: Vec<usize>,
}

impl GeometryOffsetTable {
    /// Build from `(submesh index, triangle count)` pairs in geometry order.
    pub fn from_geometries<I>(geometries: I) -> Self
    where
        I: IntoIterator<Item = (usize, u32)>,
    {
        let mut table = Self::default();
        let mut total = 0u32;
        for (submesh, count) in geometries {
            table.offsets.push(total);
            table.counts.push(count);
            table.submeshes.push(submesh);
            total = total.saturating_add(count);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.offsets
    }

    /// Source submesh of every geometry.
    pub fn submesh_indices(&self) -> &[usize] {
        &self.submeshes
    }

    pub fn submesh(&self, geometry: usize) -> Option<usize> {
        self.submeshes.get(geometry).copied()
    }

    /// Resolve a hit reported as (geometry index, primitive within geometry).
    pub fn locate(&self, geometry: usize, primitive: u32) -> Option<SubmeshHit> {
        let count = *self.counts.get(geometry)?;
        if primitive >= count {
            return None;
        }
        Some(SubmeshHit {
            submesh: self.submeshes[geometry],
            local_primitive: primitive,
        })
    }
}
