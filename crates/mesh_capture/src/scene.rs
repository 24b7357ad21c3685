//! Boundary to the renderer: per-anchor scene nodes under one root.

use crate::material::Material;
use anchor_mesh::{AnchorId, TriangleMesh};
use glam::Mat4;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshRole {
    Primary,
    Occlusion,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SceneError {
    #[error("scene node {0:?} does not exist")]
    UnknownNode(NodeId),
    #[error("mesh with {vertices} vertices exceeds the {limit} vertex limit")]
    MeshTooLarge { vertices: usize, limit: usize },
}

/// Operations the pipeline needs from the rendering engine.
///
/// Nodes are children of the scene root, placed at the anchor transform.
pub trait SceneGraph {
    fn attach(
        &mut self,
        anchor: AnchorId,
        role: MeshRole,
        mesh: &TriangleMesh,
        transform: Mat4,
    ) -> Result<NodeId, SceneError>;

    /// Swaps the mesh and transform of an existing node.
    fn update(&mut self, node: NodeId, mesh: &TriangleMesh, transform: Mat4)
        -> Result<(), SceneError>;

    fn detach(&mut self, node: NodeId);

    fn set_material(&mut self, node: NodeId, material: &Material) -> Result<(), SceneError>;
}

#[derive(Debug, Clone)]
pub struct SceneNode {
    pub anchor: AnchorId,
    pub role: MeshRole,
    pub transform: Mat4,
    pub vertex_count: usize,
    pub triangle_count: usize,
    pub material: Option<Material>,
    /// Bumped on every mesh update.
    pub revision: u64,
}

/// Headless scene used by the replay binary and in tests.
#[derive(Debug, Default)]
pub struct InMemoryScene {
    nodes: HashMap<NodeId, SceneNode>,
    next_id: u64,
    vertex_limit: Option<usize>,
}

impl InMemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects meshes larger than `limit` vertices, like a fixed-size GPU buffer would.
    pub fn with_vertex_limit(limit: usize) -> Self {
        Self {
            vertex_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&SceneNode> {
        self.nodes.get(&id)
    }

    pub fn nodes_for(&self, anchor: AnchorId) -> impl Iterator<Item = (&NodeId, &SceneNode)> {
        self.nodes.iter().filter(move |(_, n)| n.anchor == anchor)
    }

    fn check_size(&self, mesh: &TriangleMesh) -> Result<(), SceneError> {
        match self.vertex_limit {
            Some(limit) if mesh.vertex_count() > limit => Err(SceneError::MeshTooLarge {
                vertices: mesh.vertex_count(),
                limit,
            }),
            _ => Ok(()),
        }
    }
}

impl SceneGraph for InMemoryScene {
    fn attach(
        &mut self,
        anchor: AnchorId,
        role: MeshRole,
        mesh: &TriangleMesh,
        transform: Mat4,
    ) -> Result<NodeId, SceneError> {
        self.check_size(mesh)?;
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            SceneNode {
                anchor,
                role,
                transform,
                vertex_count: mesh.vertex_count(),
                triangle_count: mesh.triangle_count(),
                material: None,
                revision: 0,
            },
        );
        Ok(id)
    }

    fn update(
        &mut self,
        node: NodeId,
        mesh: &TriangleMesh,
        transform: Mat4,
    ) -> Result<(), SceneError> {
        self.check_size(mesh)?;
        let entry = self
            .nodes
            .get_mut(&node)
            .ok_or(SceneError::UnknownNode(node))?;
        entry.transform = transform;
        entry.vertex_count = mesh.vertex_count();
        entry.triangle_count = mesh.triangle_count();
        entry.revision += 1;
        Ok(())
    }

    fn detach(&mut self, node: NodeId) {
        self.nodes.remove(&node);
    }

    fn set_material(&mut self, node: NodeId, material: &Material) -> Result<(), SceneError> {
        let entry = self
            .nodes
            .get_mut(&node)
            .ok_or(SceneError::UnknownNode(node))?;
        entry.material = Some(material.clone());
        Ok(())
    }
}
