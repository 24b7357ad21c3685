//! Throttled device pose and camera capture.

use crate::export::ExportError;
use anchor_mesh::{CameraFrame, CameraImage};
use glam::{Mat3, Mat4};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Tracking subsystem lookup.
pub trait PoseProvider {
    /// Device pose at `timestamp`, if tracking has one.
    fn device_pose(&self, timestamp: f64) -> Option<Mat4>;
}

#[derive(Debug, Clone)]
pub struct PoseSample {
    pub timestamp: f64,
    pub device_pose: Option<Mat4>,
    pub extrinsics: Mat4,
    pub intrinsics: Mat3,
    pub image: Option<CameraImage>,
}

/// Time-ordered sample buffer for the current session.
#[derive(Debug)]
pub struct PoseCache {
    min_interval: f64,
    last_recorded: Option<f64>,
    samples: Vec<PoseSample>,
}

impl PoseCache {
    /// `target_fps <= 0` records every frame.
    pub fn new(target_fps: f64) -> Self {
        Self {
            min_interval: if target_fps > 0.0 { 1.0 / target_fps } else { 0.0 },
            last_recorded: None,
            samples: Vec::new(),
        }
    }

    /// Records `frame` if enough time passed since the last recorded sample.
    /// A missing device pose is recorded as such.
    pub fn offer(&mut self, frame: &CameraFrame, poses: &dyn PoseProvider) -> bool {
        if let Some(last) = self.last_recorded {
            if frame.timestamp - last <= self.min_interval {
                return false;
            }
        }

        self.samples.push(PoseSample {
            timestamp: frame.timestamp,
            device_pose: poses.device_pose(frame.timestamp),
            extrinsics: frame.extrinsics,
            intrinsics: frame.intrinsics,
            image: frame.image.clone(),
        });
        self.last_recorded = Some(frame.timestamp);
        true
    }

    pub fn samples(&self) -> &[PoseSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.last_recorded = None;
    }
}

/// Recorded device poses answering lookups with the latest pose at or before
/// the requested time, if it is at most `max_age` seconds old.
#[derive(Debug)]
pub struct PoseTimeline {
    poses: BTreeMap<i64, Mat4>,
    max_age: f64,
}

impl PoseTimeline {
    pub fn new(max_age: f64) -> Self {
        Self {
            poses: BTreeMap::new(),
            max_age,
        }
    }

    pub fn insert(&mut self, timestamp: f64, pose: Mat4) {
        self.poses.insert(micros(timestamp), pose);
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Drops poses older than `timestamp - max_age`; nothing can match them anymore
    /// once camera frames are past that point.
    pub fn prune_before(&mut self, timestamp: f64) {
        let cutoff = micros(timestamp - self.max_age);
        self.poses = self.poses.split_off(&cutoff);
    }
}

impl PoseProvider for PoseTimeline {
    fn device_pose(&self, timestamp: f64) -> Option<Mat4> {
        let key = micros(timestamp);
        let (&at, pose) = self.poses.range(..=key).next_back()?;
        (key.saturating_sub(at) as f64 * 1e-6 <= self.max_age).then_some(*pose)
    }
}

#[inline]
fn micros(seconds: f64) -> i64 {
    (seconds * 1e6).round() as i64
}

#[derive(Serialize)]
struct ImageRef {
    file: String,
    height: u32,
    width: u32,
}

// Field order is alphabetical so the pretty output has sorted keys.
#[derive(Serialize)]
struct CameraSampleDocument {
    #[serde(rename = "devicePose")]
    device_pose: Option<[[f32; 4]; 4]>,
    extrinsics: [[f32; 4]; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<ImageRef>,
    intrinsics: [[f32; 3]; 3],
    timestamp: f64,
}

#[derive(Serialize)]
struct CameraDocument {
    samples: Vec<CameraSampleDocument>,
}

pub fn frame_file_name(index: usize) -> String {
    format!("frame_{:06}.bin", index)
}

/// Writes the pose document and every sample's pixel buffer into `folder`,
/// replacing frames left by an earlier export.
pub fn write_camera_export(
    folder: &Path,
    file_name: &str,
    samples: &[PoseSample],
) -> Result<PathBuf, ExportError> {
    let mut document = CameraDocument {
        samples: Vec::with_capacity(samples.len()),
    };

    for (index, sample) in samples.iter().enumerate() {
        let image = match sample.image.as_ref() {
            Some(image) => {
                let file = frame_file_name(index);
                let path = folder.join(&file);
                std::fs::write(&path, &image.data)
                    .map_err(|source| ExportError::io(&path, source))?;
                Some(ImageRef {
                    file,
                    height: image.height,
                    width: image.width,
                })
            }
            None => None,
        };

        document.samples.push(CameraSampleDocument {
            device_pose: sample.device_pose.map(|m| m.to_cols_array_2d()),
            extrinsics: sample.extrinsics.to_cols_array_2d(),
            image,
            intrinsics: sample.intrinsics.to_cols_array_2d(),
            timestamp: sample.timestamp,
        });
    }

    let path = folder.join(file_name);
    crate::export::write_json(&path, &document)?;
    Ok(path)
}
