//! Plays a recorded anchor log into the pipeline channels, standing in for the
//! platform's reconstruction and tracking providers.

use crate::pipeline::TrackingInput;
use anchor_mesh::{AnchorEvent, Record, Recording};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("scene reconstruction is not supported by this source: it carries no anchor events")]
    Unsupported,
}

/// A recording without anchor events stands for a device without scene
/// reconstruction.
pub fn check_capability(recording: &Recording) -> Result<(), CapabilityError> {
    if recording.anchor_event_count() == 0 {
        return Err(CapabilityError::Unsupported);
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub anchor_events: usize,
    pub device_poses: usize,
    pub camera_frames: usize,
    /// Whether replay stopped before the last record.
    pub interrupted: bool,
}

/// Sends every record in order. With `realtime`, records are released at
/// their recorded offsets from the first record.
///
/// Returns when the recording is exhausted, the anchor receiver is gone or
/// shutdown is signalled. Dropping the senders afterwards ends the stream.
pub async fn replay(
    recording: Recording,
    anchors: mpsc::Sender<AnchorEvent>,
    tracking: mpsc::Sender<TrackingInput>,
    realtime: bool,
    mut shutdown: watch::Receiver<bool>,
) -> ReplayStats {
    let mut stats = ReplayStats::default();
    let origin = recording.records.first().map_or(0.0, Record::timestamp);
    let started = Instant::now();

    for record in recording.records {
        if *shutdown.borrow() {
            stats.interrupted = true;
            break;
        }

        if realtime {
            let offset = record.timestamp() - origin;
            if offset.is_finite() && offset > 0.0 {
                let deadline = started + Duration::from_secs_f64(offset);
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = shutdown.changed() => {
                        stats.interrupted = true;
                        break;
                    }
                }
            }
        }

        match record {
            Record::Anchor { event, .. } => {
                if anchors.send(event).await.is_err() {
                    tracing::warn!("Anchor consumer gone, replay stopped");
                    stats.interrupted = true;
                    break;
                }
                stats.anchor_events += 1;
            }
            Record::DevicePose { timestamp, pose } => {
                if tracking
                    .send(TrackingInput::DevicePose { timestamp, pose })
                    .await
                    .is_ok()
                {
                    stats.device_poses += 1;
                }
            }
            Record::Camera(frame) => {
                if tracking.send(TrackingInput::Camera(frame)).await.is_ok() {
                    stats.camera_frames += 1;
                }
            }
        }
    }

    tracing::info!(
        anchor_events = stats.anchor_events,
        device_poses = stats.device_poses,
        camera_frames = stats.camera_frames,
        interrupted = stats.interrupted,
        "Replay finished"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor_mesh::{AnchorId, CameraFrame};
    use glam::{Mat3, Mat4};

    fn recording() -> Recording {
        let id = AnchorId::new_v4();
        Recording {
            records: vec![
                Record::DevicePose {
                    timestamp: 0.0,
                    pose: Mat4::IDENTITY,
                },
                Record::Anchor {
                    timestamp: 0.0,
                    event: AnchorEvent::Removed { id },
                },
                Record::Camera(CameraFrame {
                    timestamp: 0.5,
                    extrinsics: Mat4::IDENTITY,
                    intrinsics: Mat3::IDENTITY,
                    image: None,
                }),
                Record::Anchor {
                    timestamp: 1.0,
                    event: AnchorEvent::Removed { id },
                },
            ],
        }
    }

    #[test]
    fn capability_requires_anchor_events() {
        assert_eq!(check_capability(&Recording::default()), Err(CapabilityError::Unsupported));
        assert!(check_capability(&recording()).is_ok());
    }

    #[tokio::test]
    async fn sends_everything_in_order() {
        let (anchor_tx, mut anchor_rx) = mpsc::channel(8);
        let (tracking_tx, mut tracking_rx) = mpsc::channel(8);
        let (_stop, shutdown) = watch::channel(false);

        let stats = replay(recording(), anchor_tx, tracking_tx, false, shutdown).await;
        assert_eq!(
            stats,
            ReplayStats {
                anchor_events: 2,
                device_poses: 1,
                camera_frames: 1,
                interrupted: false,
            }
        );

        assert!(anchor_rx.recv().await.is_some());
        assert!(anchor_rx.recv().await.is_some());
        assert!(anchor_rx.recv().await.is_none());
        assert!(matches!(
            tracking_rx.recv().await,
            Some(TrackingInput::DevicePose { .. })
        ));
        assert!(matches!(tracking_rx.recv().await, Some(TrackingInput::Camera(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_replay_stops_on_shutdown() {
        let (anchor_tx, mut anchor_rx) = mpsc::channel(8);
        let (tracking_tx, _tracking_rx) = mpsc::channel(8);
        let (stop, shutdown) = watch::channel(false);

        let task = tokio::spawn(replay(recording(), anchor_tx, tracking_tx, true, shutdown));
        assert!(anchor_rx.recv().await.is_some());
        stop.send(true).unwrap();

        let stats = task.await.unwrap();
        assert!(stats.interrupted);
        assert_eq!(stats.anchor_events, 1);
    }
}
