use anyhow::Context;
use chrono::Local;
use clap::Parser;
use mesh_capture::config::Config;
use mesh_capture::export::ExportRequest;
use mesh_capture::pipeline::{self, Inputs, Pipeline, PipelineHandle};
use mesh_capture::replay;
use mesh_capture::{CaptureMetrics, CaptureSession, InMemoryScene, MaterialConfig, SceneGraph};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tracing_subscriber::{fmt, EnvFilter};

const ANCHOR_CHANNEL_CAPACITY: usize = 64;
const TRACKING_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 8;
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Initialization ---
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    let config = Config::parse();
    config.validate()?;
    let run_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(config = ?config, run_id, "Mesh capture starting with configuration");

    let recording = anchor_mesh::recording::read_file(&config.recording)
        .with_context(|| format!("reading recording {}", config.recording.display()))?;
    if let Err(e) = replay::check_capability(&recording) {
        tracing::error!(error = %e, "Mesh capture not started");
        return Ok(());
    }

    let metrics = Arc::new(CaptureMetrics::new());

    // --- 2. Start Metrics Server ---
    if let Some(addr) = config.metrics_listen_addr {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding metrics listener on {addr}"))?;
        let router = metrics.router();
        tokio::spawn(async move {
            tracing::info!(addr = %addr, "Metrics server started");
            if let Err(e) = axum::serve(listener, router.into_make_service()).await {
                tracing::error!(error = %e, "Metrics server exited with an error");
            }
        });
    }

    // --- 3. Build the pipeline and start the stream ---
    let materials = MaterialConfig::load(config.shader_graph.as_deref());
    let session = CaptureSession::start(&config.documents_root, Local::now());
    let mut capture = Pipeline::new(
        InMemoryScene::new(),
        materials,
        session,
        &config.pipeline_config(),
        metrics.clone(),
    );
    capture.apply_settings(config.display_settings());

    let (anchor_tx, anchor_rx) = mpsc::channel(ANCHOR_CHANNEL_CAPACITY);
    let (tracking_tx, tracking_rx) = mpsc::channel(TRACKING_CHANNEL_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = PipelineHandle::new(command_tx);

    let replay_task = tokio::spawn(replay::replay(
        recording,
        anchor_tx,
        tracking_tx,
        config.realtime,
        shutdown_rx.clone(),
    ));
    let mut consumer = tokio::spawn(pipeline::run(
        capture,
        Inputs {
            anchors: anchor_rx,
            tracking: tracking_rx,
            commands: command_rx,
        },
        shutdown_rx,
    ));

    // --- 4. Main Loop ---
    let mut ticker = config
        .export_interval()
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    let capture = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received.");
                let _ = shutdown_tx.send(true);
                break consumer.await.context("capture pipeline task panicked")?;
            }
            done = &mut consumer => {
                break done.context("capture pipeline task panicked")?;
            }
            _ = next_tick(&mut ticker) => {
                match handle.export().await {
                    Ok(ExportRequest::Started(_)) => tracing::debug!("Periodic export started"),
                    Ok(ExportRequest::Rejected) => tracing::info!("Previous export still running, periodic export skipped"),
                    Err(e) => tracing::debug!(error = %e, "Periodic export not requested"),
                }
            }
        }
    };

    let _ = shutdown_tx.send(true);
    let stats = replay_task.await.context("replay task panicked")?;
    tracing::debug!(stats = ?stats, "Replay task joined");

    // --- 5. Final Export ---
    final_export(&capture).await?;
    tracing::info!("Mesh capture shutting down.");
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Waits out any export still in flight, then writes the final snapshot.
async fn final_export<S: SceneGraph>(capture: &Pipeline<S>) -> anyhow::Result<()> {
    loop {
        match capture.request_export() {
            ExportRequest::Started(handle) => {
                let report = handle.wait().await.context("final export failed")?;
                tracing::info!(
                    path = %report.mesh_path.display(),
                    anchors = report.anchor_count,
                    "Final export written"
                );
                return Ok(());
            }
            ExportRequest::Rejected => tokio::time::sleep(GATE_POLL_INTERVAL).await,
        }
    }
}
