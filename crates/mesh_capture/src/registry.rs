//! Anchor lifecycle: the single owner of per-anchor geometry and scene nodes.

use crate::export::{AnchorGeometry, GeometrySnapshot};
use crate::gate::CaptureGate;
use crate::material::{DisplaySettings, Material, MaterialConfig};
use crate::scene::{MeshRole, NodeId, SceneError, SceneGraph};
use anchor_mesh::{
    AnchorEvent, AnchorId, DecodedGeometry, GeometryError, MeshError, MeshPair, RawGeometryBuffer,
};
use glam::Mat4;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Why a single anchor update was dropped.
#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("geometry decode failed: {0}")]
    Geometry(#[from] GeometryError),
    #[error("mesh build failed: {0}")]
    Mesh(#[from] MeshError),
    #[error("scene rejected mesh: {0}")]
    Scene(#[from] SceneError),
}

/// What an event did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Added,
    /// `Added` for an id that was already tracked; old nodes were detached.
    Replaced,
    Updated,
    Removed,
    /// `Updated` or `Removed` for an id that is not tracked.
    Ignored,
    /// The capture gate was engaged.
    Dropped,
}

#[derive(Debug)]
pub struct AnchorRecord {
    pub id: AnchorId,
    pub mesh_pair: MeshPair,
    pub transform: Mat4,
    pub geometry: DecodedGeometry,
    primary_node: NodeId,
    occlusion_node: NodeId,
}

impl AnchorRecord {
    pub fn primary_node(&self) -> NodeId {
        self.primary_node
    }

    pub fn occlusion_node(&self) -> NodeId {
        self.occlusion_node
    }
}

pub struct AnchorRegistry<S> {
    records: HashMap<AnchorId, AnchorRecord>,
    scene: S,
    gate: Arc<CaptureGate>,
    materials: MaterialConfig,
    settings: Option<DisplaySettings>,
}

impl<S: SceneGraph> AnchorRegistry<S> {
    pub fn new(scene: S, gate: Arc<CaptureGate>, materials: MaterialConfig) -> Self {
        Self {
            records: HashMap::new(),
            scene,
            gate,
            materials,
            settings: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &AnchorId) -> Option<&AnchorRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &AnchorId) -> bool {
        self.records.contains_key(id)
    }

    pub fn scene(&self) -> &S {
        &self.scene
    }

    pub fn settings(&self) -> Option<&DisplaySettings> {
        self.settings.as_ref()
    }

    /// Applies one stream event. Never blocks: while the gate is engaged the
    /// event is dropped untouched and `Applied::Dropped` is returned.
    pub fn apply(&mut self, event: &AnchorEvent) -> Result<Applied, AnchorError> {
        if self.gate.is_flushing() {
            return Ok(Applied::Dropped);
        }

        match event {
            AnchorEvent::Added {
                id,
                geometry,
                transform,
            } => self.add(*id, geometry, *transform),
            AnchorEvent::Updated {
                id,
                geometry,
                transform,
            } => self.update(*id, geometry, *transform),
            AnchorEvent::Removed { id } => Ok(self.remove(*id)),
        }
    }

    fn add(
        &mut self,
        id: AnchorId,
        raw: &RawGeometryBuffer,
        transform: Mat4,
    ) -> Result<Applied, AnchorError> {
        anchor_mesh::check_transform(&transform)?;
        let geometry = anchor_mesh::decode(raw)?;
        let mesh_pair = MeshPair::build(&geometry)?;

        // New nodes first, so a failed attach leaves a previous record intact.
        let (primary_node, occlusion_node) = self.attach_pair(id, &mesh_pair, transform)?;

        let previous = self.records.insert(
            id,
            AnchorRecord {
                id,
                mesh_pair,
                transform,
                geometry,
                primary_node,
                occlusion_node,
            },
        );

        match previous {
            Some(old) => {
                tracing::debug!(anchor = %id, "Anchor re-added, replacing previous nodes");
                self.scene.detach(old.primary_node);
                self.scene.detach(old.occlusion_node);
                Ok(Applied::Replaced)
            }
            None => Ok(Applied::Added),
        }
    }

    fn attach_pair(
        &mut self,
        id: AnchorId,
        pair: &MeshPair,
        transform: Mat4,
    ) -> Result<(NodeId, NodeId), SceneError> {
        let primary = self
            .scene
            .attach(id, MeshRole::Primary, &pair.primary, transform)?;

        let occlusion = match self
            .scene
            .attach(id, MeshRole::Occlusion, &pair.occlusion, transform)
        {
            Ok(node) => node,
            Err(e) => {
                self.scene.detach(primary);
                return Err(e);
            }
        };

        let primary_material = self
            .settings
            .as_ref()
            .map(|s| self.materials.primary_material(s));

        let styled = self
            .scene
            .set_material(occlusion, &Material::Occlusion)
            .and_then(|_| match primary_material.as_ref() {
                Some(material) => self.scene.set_material(primary, material),
                None => Ok(()),
            });

        if let Err(e) = styled {
            self.scene.detach(primary);
            self.scene.detach(occlusion);
            return Err(e);
        }

        Ok((primary, occlusion))
    }

    fn update(
        &mut self,
        id: AnchorId,
        raw: &RawGeometryBuffer,
        transform: Mat4,
    ) -> Result<Applied, AnchorError> {
        let Some(record) = self.records.get(&id) else {
            tracing::debug!(anchor = %id, "Update for untracked anchor ignored");
            return Ok(Applied::Ignored);
        };

        anchor_mesh::check_transform(&transform)?;
        let geometry = anchor_mesh::decode(raw)?;
        let mesh_pair = MeshPair::build(&geometry)?;

        self.scene
            .update(record.primary_node, &mesh_pair.primary, transform)?;
        if let Err(e) = self
            .scene
            .update(record.occlusion_node, &mesh_pair.occlusion, transform)
        {
            // Put the primary node back so both nodes show the same state.
            if let Err(rollback) = self.scene.update(
                record.primary_node,
                &record.mesh_pair.primary,
                record.transform,
            ) {
                tracing::warn!(anchor = %id, error = %rollback, "Failed to restore primary node after occlusion update failed");
            }
            return Err(e.into());
        }

        if let Some(record) = self.records.get_mut(&id) {
            record.mesh_pair = mesh_pair;
            record.transform = transform;
            record.geometry = geometry;
        }

        Ok(Applied::Updated)
    }

    fn remove(&mut self, id: AnchorId) -> Applied {
        match self.records.remove(&id) {
            Some(record) => {
                self.scene.detach(record.primary_node);
                self.scene.detach(record.occlusion_node);
                Applied::Removed
            }
            None => Applied::Ignored,
        }
    }

    /// Stores `settings` and re-applies them to every primary node.
    pub fn apply_settings(&mut self, settings: DisplaySettings) {
        let material = self.materials.primary_material(&settings);
        self.settings = Some(settings);

        for record in self.records.values() {
            if let Err(e) = self.scene.set_material(record.primary_node, &material) {
                tracing::warn!(anchor = %record.id, error = %e, "Failed to apply material");
            }
        }
    }

    /// Point-in-time copy of every anchor's geometry and transform.
    pub fn snapshot(&self) -> GeometrySnapshot {
        GeometrySnapshot {
            anchors: self
                .records
                .values()
                .map(|r| {
                    (
                        r.id,
                        AnchorGeometry {
                            geometry: r.geometry.clone(),
                            transform: r.transform,
                        },
                    )
                })
                .collect(),
        }
    }
}
