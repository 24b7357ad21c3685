//! Render meshes derived from decoded anchor geometry.

use crate::geometry::DecodedGeometry;
use glam::Vec3;
use thiserror::Error;

/// Distance along the vertex normal applied to the occlusion mesh, in meters.
/// Negative: the occluder sits just inside the real surface.
pub const OCCLUSION_OFFSET: f32 = -0.01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("face {face} references vertex {index} but the mesh has {vertex_count} vertices")]
    IndexOutOfRange {
        face: usize,
        index: u32,
        vertex_count: usize,
    },
}

/// Indexed triangle list, faces in buffer order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TriangleMesh {
    pub positions: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
}

impl TriangleMesh {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }
}

/// The two meshes rendered for every anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshPair {
    pub primary: TriangleMesh,
    pub occlusion: TriangleMesh,
}

impl MeshPair {
    /// Builds both meshes. Zero faces yields two empty meshes; a face pointing
    /// past the vertex array is rejected.
    ///
    /// Without normals the occlusion mesh reuses the primary positions.
    pub fn build(geometry: &DecodedGeometry) -> Result<Self, MeshError> {
        let vertex_count = geometry.vertices.len();
        for (face, tri) in geometry.faces.iter().enumerate() {
            if let Some(&index) = tri.iter().find(|&&i| i as usize >= vertex_count) {
                return Err(MeshError::IndexOutOfRange {
                    face,
                    index,
                    vertex_count,
                });
            }
        }

        let occlusion_positions = match geometry.normals.as_deref() {
            Some(normals) => offset_along_normals(&geometry.vertices, normals, OCCLUSION_OFFSET),
            None => geometry.vertices.clone(),
        };

        Ok(Self {
            primary: TriangleMesh {
                positions: geometry.vertices.clone(),
                triangles: geometry.faces.clone(),
            },
            occlusion: TriangleMesh {
                positions: occlusion_positions,
                triangles: geometry.faces.clone(),
            },
        })
    }
}

/// `v + n * offset` per vertex. `normals` must be as long as `vertices`.
pub fn offset_along_normals(vertices: &[Vec3], normals: &[Vec3], offset: f32) -> Vec<Vec3> {
    vertices
        .iter()
        .zip(normals)
        .map(|(&v, &n)| v + n * offset)
        .collect()
}
