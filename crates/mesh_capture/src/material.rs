//! Display settings and the materials derived from them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Options coming from the settings UI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplaySettings {
    pub wireframe: bool,
    pub ripple: bool,
    pub enable_mesh_color: bool,
    /// Linear RGBA.
    pub mesh_color: [f32; 4],
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            wireframe: false,
            ripple: false,
            enable_mesh_color: false,
            mesh_color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

#[derive(Debug, Error)]
pub enum MaterialError {
    #[error("failed to read shader graph {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shader graph {0} is empty")]
    Empty(PathBuf),
}

/// A loaded shader-graph material description.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderGraph {
    pub name: String,
    pub source: String,
}

impl ShaderGraph {
    pub fn load(path: &Path) -> Result<Self, MaterialError> {
        let source = std::fs::read_to_string(path).map_err(|source| MaterialError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if source.trim().is_empty() {
            return Err(MaterialError::Empty(path.to_path_buf()));
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("shader_graph")
            .to_owned();
        Ok(Self { name, source })
    }
}

/// Which material family the display uses; decided once when loading.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterialConfig {
    Advanced(ShaderGraph),
    /// Untextured wireframe, used when no shader graph could be loaded.
    Fallback,
}

impl MaterialConfig {
    /// Loads the shader graph at `path`; any failure degrades to [`MaterialConfig::Fallback`].
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            tracing::info!("No shader graph configured, using fallback wireframe material");
            return MaterialConfig::Fallback;
        };

        match ShaderGraph::load(path) {
            Ok(graph) => {
                tracing::info!(shader = %graph.name, "Loaded shader graph material");
                MaterialConfig::Advanced(graph)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Shader graph unavailable, using fallback wireframe material");
                MaterialConfig::Fallback
            }
        }
    }

    /// Material for a primary mesh under `settings`.
    pub fn primary_material(&self, settings: &DisplaySettings) -> Material {
        let color = settings.enable_mesh_color.then_some(settings.mesh_color);
        match self {
            MaterialConfig::Advanced(graph) => Material::ShaderGraph {
                graph: graph.name.clone(),
                wireframe: settings.wireframe,
                ripple: settings.ripple,
                color,
            },
            MaterialConfig::Fallback => Material::Unlit {
                wireframe: true,
                color: color.unwrap_or([1.0, 1.0, 1.0, 1.0]),
            },
        }
    }
}

/// Material assigned to a scene node.
#[derive(Debug, Clone, PartialEq)]
pub enum Material {
    ShaderGraph {
        graph: String,
        wireframe: bool,
        ripple: bool,
        color: Option<[f32; 4]>,
    },
    Unlit {
        wireframe: bool,
        color: [f32; 4],
    },
    /// Writes depth only.
    Occlusion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advanced_material_carries_every_setting() {
        let config = MaterialConfig::Advanced(ShaderGraph {
            name: "ripple".into(),
            source: "graph".into(),
        });
        let settings = DisplaySettings {
            wireframe: true,
            ripple: true,
            enable_mesh_color: true,
            mesh_color: [0.0, 0.5, 1.0, 1.0],
        };
        assert_eq!(
            config.primary_material(&settings),
            Material::ShaderGraph {
                graph: "ripple".into(),
                wireframe: true,
                ripple: true,
                color: Some([0.0, 0.5, 1.0, 1.0]),
            }
        );
    }

    #[test]
    fn fallback_is_always_wireframe() {
        let material = MaterialConfig::Fallback.primary_material(&DisplaySettings::default());
        assert_eq!(
            material,
            Material::Unlit {
                wireframe: true,
                color: [1.0, 1.0, 1.0, 1.0]
            }
        );
    }

    #[test]
    fn missing_or_empty_shader_graph_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.graph");
        assert_eq!(MaterialConfig::load(Some(&missing)), MaterialConfig::Fallback);

        let empty = dir.path().join("empty.graph");
        std::fs::write(&empty, "  \n").unwrap();
        assert!(matches!(
            ShaderGraph::load(&empty),
            Err(MaterialError::Empty(_))
        ));

        let good = dir.path().join("proximity.graph");
        std::fs::write(&good, "node proximity").unwrap();
        match MaterialConfig::load(Some(&good)) {
            MaterialConfig::Advanced(graph) => assert_eq!(graph.name, "proximity"),
            other => panic!("expected advanced material, got {:?}", other),
        }
    }
}
