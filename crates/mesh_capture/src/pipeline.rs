//! The consumer side: owns the registry, pose cache and exporter, and drains
//! the inbound channels on one task.

use crate::export::{ExportJob, ExportRequest, Exporter};
use crate::gate::CaptureGate;
use crate::material::{DisplaySettings, MaterialConfig};
use crate::metrics::CaptureMetrics;
use crate::pose::{PoseCache, PoseSample, PoseTimeline};
use crate::registry::{AnchorRegistry, Applied};
use crate::scene::SceneGraph;
use crate::session::CaptureSession;
use anchor_mesh::{AnchorEvent, CameraFrame};
use chrono::{DateTime, Local, Utc};
use glam::Mat4;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub capture_camera: bool,
    pub target_fps: f64,
    /// Oldest device pose, in seconds, a camera frame may be matched with.
    pub pose_max_age: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_camera: false,
            target_fps: 5.0,
            pose_max_age: 0.25,
        }
    }
}

/// Output of the tracking subsystem.
#[derive(Debug, Clone)]
pub enum TrackingInput {
    DevicePose { timestamp: f64, pose: Mat4 },
    Camera(CameraFrame),
}

pub struct Pipeline<S> {
    registry: AnchorRegistry<S>,
    exporter: Exporter,
    gate: Arc<CaptureGate>,
    session: CaptureSession,
    pose_cache: PoseCache,
    poses: PoseTimeline,
    capture_camera: bool,
    metrics: Arc<CaptureMetrics>,
}

impl<S: SceneGraph> Pipeline<S> {
    pub fn new(
        scene: S,
        materials: MaterialConfig,
        session: CaptureSession,
        config: &PipelineConfig,
        metrics: Arc<CaptureMetrics>,
    ) -> Self {
        let gate = CaptureGate::new();
        Self {
            registry: AnchorRegistry::new(scene, gate.clone(), materials),
            exporter: Exporter::new(gate.clone(), metrics.clone()),
            gate,
            session,
            pose_cache: PoseCache::new(config.target_fps),
            poses: PoseTimeline::new(config.pose_max_age),
            capture_camera: config.capture_camera,
            metrics,
        }
    }

    pub fn gate(&self) -> &Arc<CaptureGate> {
        &self.gate
    }

    pub fn registry(&self) -> &AnchorRegistry<S> {
        &self.registry
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn pose_samples(&self) -> &[PoseSample] {
        self.pose_cache.samples()
    }

    /// Applies one anchor event. Failures are logged and the event is
    /// skipped; the next event for the same anchor supersedes it.
    pub fn handle_anchor_event(&mut self, event: &AnchorEvent) -> Option<Applied> {
        match self.registry.apply(event) {
            Ok(Applied::Dropped) => {
                self.metrics.events_dropped_total.inc();
                tracing::debug!(anchor = %event.id(), kind = event.kind(), "Export in flight, event dropped");
                Some(Applied::Dropped)
            }
            Ok(applied) => {
                self.metrics.events_applied_total.inc();
                self.metrics.set_anchors_tracked(self.registry.len());
                Some(applied)
            }
            Err(e) => {
                self.metrics.anchor_failures_total.inc();
                tracing::warn!(anchor = %event.id(), kind = event.kind(), error = %e, "Anchor update dropped");
                None
            }
        }
    }

    /// Feeds the pose timeline and the throttled camera cache. Ignored when
    /// camera capture is off.
    pub fn handle_tracking(&mut self, input: TrackingInput) {
        if !self.capture_camera {
            return;
        }
        match input {
            TrackingInput::DevicePose { timestamp, pose } => self.poses.insert(timestamp, pose),
            TrackingInput::Camera(frame) => {
                if self.pose_cache.offer(&frame, &self.poses) {
                    self.metrics.pose_samples_total.inc();
                }
                self.poses.prune_before(frame.timestamp);
            }
        }
    }

    pub fn apply_settings(&mut self, settings: DisplaySettings) {
        tracing::info!(settings = ?settings, "Display settings applied");
        self.registry.apply_settings(settings);
    }

    /// Starts an export of the current state into the session folder, or
    /// rejects it if one is still being written.
    pub fn request_export(&self) -> ExportRequest {
        let unix_seconds = Utc::now().timestamp();
        self.exporter.begin(|| ExportJob {
            snapshot: self.registry.snapshot(),
            poses: self
                .capture_camera
                .then(|| self.pose_cache.samples().to_vec()),
            folder: self.session.folder(),
            unix_seconds,
        })
    }

    /// New output folder from `started_at`; the pose buffer starts empty.
    pub fn start_new_session(&mut self, started_at: DateTime<Local>) {
        self.session = self.session.restart(started_at);
        self.pose_cache.clear();
        tracing::info!(folder = %self.session.folder().display(), "New capture session");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ApplySettings(settings) => self.apply_settings(settings),
            Command::Export(reply) => {
                let _ = reply.send(self.request_export());
            }
            Command::NewSession(started_at) => self.start_new_session(started_at),
        }
    }
}

/// Requests from outside the consumer task.
#[derive(Debug)]
pub enum Command {
    ApplySettings(DisplaySettings),
    Export(oneshot::Sender<ExportRequest>),
    NewSession(DateTime<Local>),
}

#[derive(Debug, Error)]
#[error("capture pipeline has stopped")]
pub struct PipelineClosed;

/// Cloneable sender side of the command channel.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Command>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    pub async fn apply_settings(&self, settings: DisplaySettings) -> Result<(), PipelineClosed> {
        self.tx
            .send(Command::ApplySettings(settings))
            .await
            .map_err(|_| PipelineClosed)
    }

    pub async fn export(&self) -> Result<ExportRequest, PipelineClosed> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Export(tx))
            .await
            .map_err(|_| PipelineClosed)?;
        rx.await.map_err(|_| PipelineClosed)
    }

    pub async fn new_session(&self, started_at: DateTime<Local>) -> Result<(), PipelineClosed> {
        self.tx
            .send(Command::NewSession(started_at))
            .await
            .map_err(|_| PipelineClosed)
    }
}

pub struct Inputs {
    pub anchors: mpsc::Receiver<AnchorEvent>,
    pub tracking: mpsc::Receiver<TrackingInput>,
    pub commands: mpsc::Receiver<Command>,
}

/// Drains the inputs until shutdown is signalled or the anchor stream ends,
/// then hands the pipeline back for a final export.
///
/// Commands are served before stream events so an export request is never
/// starved by a busy reconstruction stream.
pub async fn run<S: SceneGraph>(
    mut pipeline: Pipeline<S>,
    mut inputs: Inputs,
    mut shutdown: watch::Receiver<bool>,
) -> Pipeline<S> {
    tracing::info!(folder = %pipeline.session.folder().display(), "Capture pipeline started");

    while !*shutdown.borrow() {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone, nobody can stop us any other way.
                    break;
                }
            }
            Some(command) = inputs.commands.recv() => pipeline.handle_command(command),
            event = inputs.anchors.recv() => match event {
                Some(event) => {
                    pipeline.handle_anchor_event(&event);
                }
                None => {
                    tracing::info!("Anchor stream ended");
                    break;
                }
            },
            Some(input) = inputs.tracking.recv() => pipeline.handle_tracking(input),
        }
    }

    tracing::info!(anchors = pipeline.registry.len(), "Capture pipeline stopped");
    pipeline
}
