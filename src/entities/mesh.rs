//! Triangle mesh records.
//!
//! `Triangle` is `Pod` so a loaded model can be handed to a vertex buffer
//! upload as raw bytes without copying.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// One facet: unit normal plus three vertices, 48 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Triangle {
    pub normal: [f32; 3],
    pub vertices: [[f32; 3]; 3],
}

impl Triangle {
    pub fn new(normal: [f32; 3], vertices: [[f32; 3]; 3]) -> Self {
        Self { normal, vertices }
    }

    pub fn vertex(&self, i: usize) -> Vec3 {
        Vec3::from_array(self.vertices[i])
    }

    /// Normal from vertex winding (stored normals are often zero)
    pub fn face_normal(&self) -> Vec3 {
        let a = self.vertex(0);
        (self.vertex(1) - a).cross(self.vertex(2) - a).normalize_or_zero()
    }

    pub fn area(&self) -> f32 {
        let a = self.vertex(0);
        (self.vertex(1) - a).cross(self.vertex(2) - a).length() * 0.5
    }

    pub fn is_finite(&self) -> bool {
        self.normal.iter().chain(self.vertices.iter().flatten()).all(|v| v.is_finite())
    }
}

/// Raw bytes of a triangle slice (vertex buffer upload)
pub fn as_bytes(triangles: &[Triangle]) -> &[u8] {
    bytemuck::cast_slice(triangles)
}

/// Axis-aligned bounds of a mesh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshBounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl MeshBounds {
    /// Bounds of all vertices, `None` for an empty mesh
    pub fn from_triangles(triangles: &[Triangle]) -> Option<Self> {
        let mut iter = triangles
            .iter()
            .flat_map(|t| t.vertices.iter())
            .map(|v| Vec3::from_array(*v));
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Some(Self { min, max })
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn merge(&self, other: &MeshBounds) -> MeshBounds {
        MeshBounds {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}
