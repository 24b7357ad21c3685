//! Snapshot export: document model, file writing and the background flush.

use crate::gate::{CaptureGate, GateGuard};
use crate::metrics::CaptureMetrics;
use crate::pose::{self, PoseSample};
use crate::session;
use anchor_mesh::{AnchorId, DecodedGeometry};
use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid anchor key {0:?}")]
    InvalidAnchorKey(String),
    #[error("export task ended without reporting a result")]
    Aborted,
}

impl ExportError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ExportError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Geometry and placement of one anchor at snapshot time.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorGeometry {
    pub geometry: DecodedGeometry,
    pub transform: Mat4,
}

/// Defensive copy of the registry taken while the gate is engaged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometrySnapshot {
    pub anchors: BTreeMap<AnchorId, AnchorGeometry>,
}

impl GeometrySnapshot {
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn to_document(&self) -> SnapshotDocument {
        self.anchors
            .iter()
            .map(|(id, anchor)| (id.to_string(), AnchorGeometryDocument::from(anchor)))
            .collect()
    }

    /// Rebuilds typed geometry from a parsed document.
    pub fn from_document(document: SnapshotDocument) -> Result<Self, ExportError> {
        let anchors = document
            .into_iter()
            .map(|(key, doc)| {
                let id = key
                    .parse::<AnchorId>()
                    .map_err(|_| ExportError::InvalidAnchorKey(key.clone()))?;
                Ok((id, AnchorGeometry::from(doc)))
            })
            .collect::<Result<_, ExportError>>()?;
        Ok(Self { anchors })
    }
}

/// Anchor string → geometry; `BTreeMap` keeps the keys sorted on output.
pub type SnapshotDocument = BTreeMap<String, AnchorGeometryDocument>;

// Fields are declared alphabetically so every level of the output is sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorGeometryDocument {
    pub faces: Vec<[u32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normals: Option<Vec<[f32; 3]>>,
    /// Four columns of four floats.
    #[serde(rename = "originFromAnchorTransform")]
    pub origin_from_anchor_transform: [[f32; 4]; 4],
    pub vertices: Vec<[f32; 3]>,
}

impl From<&AnchorGeometry> for AnchorGeometryDocument {
    fn from(anchor: &AnchorGeometry) -> Self {
        let g = &anchor.geometry;
        Self {
            faces: g.faces.clone(),
            normals: g
                .normals
                .as_ref()
                .map(|ns| ns.iter().map(|n| n.to_array()).collect()),
            origin_from_anchor_transform: anchor.transform.to_cols_array_2d(),
            vertices: g.vertices.iter().map(|v| v.to_array()).collect(),
        }
    }
}

impl From<AnchorGeometryDocument> for AnchorGeometry {
    fn from(doc: AnchorGeometryDocument) -> Self {
        Self {
            geometry: DecodedGeometry {
                vertices: doc.vertices.into_iter().map(Vec3::from_array).collect(),
                normals: doc
                    .normals
                    .map(|ns| ns.into_iter().map(Vec3::from_array).collect()),
                faces: doc.faces,
            },
            transform: Mat4::from_cols_array_2d(&doc.origin_from_anchor_transform),
        }
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    let file = File::create(path).map_err(|source| ExportError::io(path, source))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|source| ExportError::io(path, source))
}

pub fn read_snapshot(path: &Path) -> Result<SnapshotDocument, ExportError> {
    let bytes = std::fs::read(path).map_err(|source| ExportError::io(path, source))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Everything one flush writes, copied out of the live state.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub snapshot: GeometrySnapshot,
    /// `Some` when camera capture is enabled.
    pub poses: Option<Vec<PoseSample>>,
    pub folder: PathBuf,
    pub unix_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub mesh_path: PathBuf,
    pub camera_path: Option<PathBuf>,
    pub anchor_count: usize,
    pub pose_count: usize,
}

/// Writes `job` synchronously. The folder is created if needed.
pub fn write_export(job: &ExportJob) -> Result<ExportReport, ExportError> {
    std::fs::create_dir_all(&job.folder).map_err(|source| ExportError::io(&job.folder, source))?;

    let mesh_path = job.folder.join(session::mesh_file_name(job.unix_seconds));
    write_json(&mesh_path, &job.snapshot.to_document())?;

    let camera_path = match job.poses.as_deref() {
        Some(samples) => Some(pose::write_camera_export(
            &job.folder,
            &session::camera_file_name(job.unix_seconds),
            samples,
        )?),
        None => None,
    };

    Ok(ExportReport {
        mesh_path,
        camera_path,
        anchor_count: job.snapshot.len(),
        pose_count: job.poses.as_ref().map_or(0, Vec::len),
    })
}

/// Outcome of asking for an export.
#[derive(Debug)]
pub enum ExportRequest {
    Started(ExportHandle),
    /// Another export is still being written.
    Rejected,
}

impl ExportRequest {
    pub fn is_rejected(&self) -> bool {
        matches!(self, ExportRequest::Rejected)
    }
}

/// Completion of one accepted export. Resolves after the gate is released.
#[derive(Debug)]
pub struct ExportHandle {
    rx: oneshot::Receiver<Result<ExportReport, ExportError>>,
}

impl ExportHandle {
    pub async fn wait(self) -> Result<ExportReport, ExportError> {
        self.rx.await.unwrap_or(Err(ExportError::Aborted))
    }
}

/// Engages the gate, copies state, and writes on a blocking worker.
pub struct Exporter {
    gate: Arc<CaptureGate>,
    metrics: Arc<CaptureMetrics>,
}

impl Exporter {
    pub fn new(gate: Arc<CaptureGate>, metrics: Arc<CaptureMetrics>) -> Self {
        Self { gate, metrics }
    }

    /// `copy` runs with the gate already engaged. The gate stays engaged until
    /// the write finished, then the handle resolves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn begin<F>(&self, copy: F) -> ExportRequest
    where
        F: FnOnce() -> ExportJob,
    {
        let Some(guard) = self.gate.try_engage() else {
            tracing::debug!("Export already in flight, request ignored");
            self.metrics.exports_rejected_total.inc();
            return ExportRequest::Rejected;
        };

        let job = copy();
        tracing::info!(
            anchors = job.snapshot.len(),
            folder = %job.folder.display(),
            "Export started"
        );

        let (tx, rx) = oneshot::channel();
        let metrics = self.metrics.clone();
        tokio::task::spawn_blocking(move || {
            let result = flush(guard, &job);
            match &result {
                Ok(report) => {
                    metrics.exports_completed_total.inc();
                    tracing::info!(
                        path = %report.mesh_path.display(),
                        anchors = report.anchor_count,
                        poses = report.pose_count,
                        "Export finished"
                    );
                }
                Err(e) => {
                    metrics.exports_failed_total.inc();
                    tracing::error!(error = %e, "Export failed");
                }
            }
            let _ = tx.send(result);
        });

        ExportRequest::Started(ExportHandle { rx })
    }
}

fn flush(guard: GateGuard, job: &ExportJob) -> Result<ExportReport, ExportError> {
    let result = write_export(job);
    drop(guard);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(triangles: u32, normals: bool) -> AnchorGeometry {
        let vertices: Vec<Vec3> = (0..triangles * 3)
            .map(|i| Vec3::new(i as f32 * 0.5, -1.25, 3.0e-3))
            .collect();
        let normals = normals.then(|| vec![Vec3::new(0.0, 1.0, 0.0); vertices.len()]);
        AnchorGeometry {
            geometry: DecodedGeometry {
                vertices,
                normals,
                faces: (0..triangles).map(|t| [t * 3, t * 3 + 1, t * 3 + 2]).collect(),
            },
            transform: Mat4::from_translation(Vec3::new(0.125, 1.5, -2.0)),
        }
    }

    fn two_anchor_snapshot() -> (GeometrySnapshot, AnchorId, AnchorId) {
        let a: AnchorId = "0A000000-0000-4000-8000-000000000001".parse().unwrap();
        let b: AnchorId = "0B000000-0000-4000-8000-000000000002".parse().unwrap();
        let mut snapshot = GeometrySnapshot::default();
        snapshot.anchors.insert(a, anchor(2, true));
        snapshot.anchors.insert(b, anchor(0, false));
        (snapshot, a, b)
    }

    #[test]
    fn document_shape_matches_the_file_format() {
        let (snapshot, a, b) = two_anchor_snapshot();
        let json = serde_json::to_value(snapshot.to_document()).unwrap();
        let map = json.as_object().unwrap();

        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec![&a.to_string(), &b.to_string()]);

        let doc_a = &map[&a.to_string()];
        assert_eq!(doc_a["faces"].as_array().unwrap().len(), 2);
        assert_eq!(doc_a["faces"][1], serde_json::json!([3, 4, 5]));
        assert_eq!(doc_a["normals"].as_array().unwrap().len(), 6);
        assert_eq!(
            doc_a["originFromAnchorTransform"][3],
            serde_json::json!([0.125, 1.5, -2.0, 1.0])
        );

        let doc_b = &map[&b.to_string()];
        assert_eq!(doc_b["faces"], serde_json::json!([]));
        assert!(doc_b.get("normals").is_none());
    }

    #[test]
    fn pretty_output_has_sorted_keys_at_every_level() {
        let (snapshot, _, _) = two_anchor_snapshot();
        let text = serde_json::to_string_pretty(&snapshot.to_document()).unwrap();
        let positions: Vec<usize> = ["\"faces\"", "\"normals\"", "\"originFromAnchorTransform\"", "\"vertices\""]
            .iter()
            .map(|k| text.find(k).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(text.contains('\n'));
    }

    #[test]
    fn written_file_reads_back_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let (snapshot, _, _) = two_anchor_snapshot();
        let job = ExportJob {
            snapshot: snapshot.clone(),
            poses: None,
            folder: dir.path().join("20240101_000000"),
            unix_seconds: 1_704_067_200,
        };

        let report = write_export(&job).unwrap();
        assert_eq!(
            report.mesh_path,
            job.folder.join("meshAnchorGeometries_1704067200.json")
        );
        assert!(report.camera_path.is_none());
        assert_eq!(report.anchor_count, 2);

        let parsed = GeometrySnapshot::from_document(read_snapshot(&report.mesh_path).unwrap()).unwrap();
        assert_eq!(parsed, snapshot);

        // Second write into an existing folder is fine.
        write_export(&job).unwrap();
    }

    #[test]
    fn bad_anchor_key_is_reported() {
        let mut document = SnapshotDocument::new();
        document.insert("not-a-uuid".into(), AnchorGeometryDocument::from(&anchor(1, false)));
        assert!(matches!(
            GeometrySnapshot::from_document(document),
            Err(ExportError::InvalidAnchorKey(_))
        ));
    }

    #[tokio::test]
    async fn second_request_is_rejected_while_first_is_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let gate = CaptureGate::new();
        let metrics = Arc::new(CaptureMetrics::new());
        let exporter = Exporter::new(gate.clone(), metrics.clone());
        let (snapshot, _, _) = two_anchor_snapshot();
        let folder = dir.path().to_path_buf();

        let mut second_copied = false;
        let mut second_rejected = false;
        let first = exporter.begin(|| {
            assert!(gate.is_flushing());
            let second = exporter.begin(|| {
                second_copied = true;
                ExportJob {
                    snapshot: GeometrySnapshot::default(),
                    poses: None,
                    folder: folder.clone(),
                    unix_seconds: 1,
                }
            });
            second_rejected = second.is_rejected();
            ExportJob {
                snapshot: snapshot.clone(),
                poses: None,
                folder: folder.clone(),
                unix_seconds: 1,
            }
        });
        assert!(second_rejected);
        assert!(!second_copied);
        assert_eq!(metrics.exports_rejected_total.get(), 1);

        let ExportRequest::Started(handle) = first else {
            panic!("first export should start");
        };
        let report = handle.wait().await.unwrap();
        assert!(!gate.is_flushing());
        assert_eq!(metrics.exports_completed_total.get(), 1);

        let parsed = GeometrySnapshot::from_document(read_snapshot(&report.mesh_path).unwrap()).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[tokio::test]
    async fn failed_write_still_releases_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the session folder should go.
        let blocker = dir.path().join("session");
        std::fs::write(&blocker, b"").unwrap();

        let gate = CaptureGate::new();
        let metrics = Arc::new(CaptureMetrics::new());
        let exporter = Exporter::new(gate.clone(), metrics.clone());
        let ExportRequest::Started(handle) = exporter.begin(|| ExportJob {
            snapshot: GeometrySnapshot::default(),
            poses: None,
            folder: blocker.clone(),
            unix_seconds: 7,
        }) else {
            panic!("export should start");
        };

        assert!(matches!(handle.wait().await, Err(ExportError::Io { .. })));
        assert!(!gate.is_flushing());
        assert_eq!(metrics.exports_failed_total.get(), 1);
    }
}
