//! Live capture of reconstructed mesh anchors.
//!
//! Anchor events flow from the reconstruction provider into an
//! [`registry::AnchorRegistry`], which keeps decoded geometry plus a rendered
//! and an occlusion node per anchor. An [`export::Exporter`] snapshots the
//! registry to JSON on a blocking worker while a [`gate::CaptureGate`] holds
//! updates back. Everything runs on one consumer task, see [`pipeline::run`].

pub mod config;
pub mod export;
pub mod gate;
pub mod material;
pub mod metrics;
pub mod pipeline;
pub mod pose;
pub mod registry;
pub mod replay;
pub mod scene;
pub mod session;

pub use export::{ExportError, ExportHandle, ExportReport, ExportRequest, GeometrySnapshot};
pub use gate::CaptureGate;
pub use material::{DisplaySettings, MaterialConfig};
pub use metrics::CaptureMetrics;
pub use pipeline::{Inputs, Pipeline, PipelineConfig, PipelineHandle, TrackingInput};
pub use registry::{AnchorRegistry, Applied};
pub use scene::{InMemoryScene, SceneGraph};
pub use session::CaptureSession;
