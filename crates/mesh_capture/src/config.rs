use crate::material::DisplaySettings;
use crate::pipeline::PipelineConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// `mesh_capture` - Replays a mesh-anchor recording through the capture
/// pipeline and exports anchor geometry snapshots.
///
/// The recording stands in for the device's scene reconstruction and tracking
/// providers. Snapshots land in a per-session folder under the documents root.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Anchor recording (`.anlg`) to replay.
    #[arg(long, env = "ANCHOR_RECORDING_PATH")]
    pub recording: PathBuf,

    /// Root under which each session gets a `YYYYMMDD_HHMMSS` folder.
    #[arg(long, env = "CAPTURE_DOCUMENTS_ROOT", default_value = "captures")]
    pub documents_root: PathBuf,

    /// Export every N seconds in addition to the final export.
    #[arg(long, env = "CAPTURE_EXPORT_INTERVAL_SECS")]
    pub export_interval_secs: Option<u64>,

    /// Camera pose sampling rate. Zero records every frame.
    #[arg(long, env = "CAPTURE_TARGET_FPS", default_value_t = 5.0)]
    pub target_fps: f64,

    /// Record device and camera poses and write them with every export.
    #[arg(long, env = "CAPTURE_CAMERA")]
    pub capture_camera: bool,

    /// Oldest device pose, in seconds, a camera frame may be paired with.
    #[arg(long, env = "CAPTURE_POSE_MAX_AGE_SECS", default_value_t = 0.25)]
    pub pose_max_age_secs: f64,

    /// Shader graph for the anchor surface. Falls back to an unlit wireframe
    /// when missing or unreadable.
    #[arg(long, env = "CAPTURE_SHADER_GRAPH")]
    pub shader_graph: Option<PathBuf>,

    #[arg(long, env = "CAPTURE_WIREFRAME")]
    pub wireframe: bool,

    #[arg(long, env = "CAPTURE_RIPPLE")]
    pub ripple: bool,

    /// Tint for the anchor surface as `r,g,b,a` in 0..=1.
    #[arg(long, env = "CAPTURE_MESH_COLOR", value_parser = parse_rgba)]
    pub mesh_color: Option<Rgba>,

    /// Release recorded events at their original pace.
    #[arg(long, env = "CAPTURE_REALTIME")]
    pub realtime: bool,

    /// Listen address for the Prometheus metrics server. Disabled when unset.
    #[arg(long, env = "CAPTURE_METRICS_LISTEN_ADDR")]
    pub metrics_listen_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba(pub [f32; 4]);

fn parse_rgba(s: &str) -> Result<Rgba, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(format!("expected 4 comma-separated components, got {}", parts.len()));
    }
    let mut rgba = [0.0f32; 4];
    for (slot, part) in rgba.iter_mut().zip(parts) {
        *slot = part
            .parse()
            .map_err(|e| format!("invalid component {part:?}: {e}"))?;
    }
    Ok(Rgba(rgba))
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("target fps must be a finite, non-negative number (got {0})")]
    TargetFps(f64),
    #[error("pose max age must be a finite, non-negative number of seconds (got {0})")]
    PoseMaxAge(f64),
    #[error("export interval must be at least one second")]
    ExportInterval,
    #[error("mesh color components must lie in 0..=1 (got {0:?})")]
    MeshColor([f32; 4]),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_fps.is_finite() || self.target_fps < 0.0 {
            return Err(ConfigError::TargetFps(self.target_fps));
        }
        if !self.pose_max_age_secs.is_finite() || self.pose_max_age_secs < 0.0 {
            return Err(ConfigError::PoseMaxAge(self.pose_max_age_secs));
        }
        if self.export_interval_secs == Some(0) {
            return Err(ConfigError::ExportInterval);
        }
        if let Some(Rgba(color)) = self.mesh_color {
            if !color.iter().all(|c| (0.0..=1.0).contains(c)) {
                return Err(ConfigError::MeshColor(color));
            }
        }
        Ok(())
    }

    pub fn export_interval(&self) -> Option<Duration> {
        self.export_interval_secs.map(Duration::from_secs)
    }

    /// A configured color turns tinting on.
    pub fn display_settings(&self) -> DisplaySettings {
        let defaults = DisplaySettings::default();
        DisplaySettings {
            wireframe: self.wireframe,
            ripple: self.ripple,
            enable_mesh_color: self.mesh_color.is_some(),
            mesh_color: self.mesh_color.map_or(defaults.mesh_color, |c| c.0),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            capture_camera: self.capture_camera,
            target_fps: self.target_fps,
            pose_max_age: self.pose_max_age_secs,
        }
    }
}
