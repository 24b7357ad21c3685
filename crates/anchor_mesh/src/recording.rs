//! ANLG: recorded stream of anchor events, device poses and camera frames.
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"ANLG"
//!   04  : u32     version = 1
//!   08  : u32     record_count
//!   0C  : records, each:
//!           u8  tag (0 added, 1 updated, 2 removed, 3 device pose, 4 camera frame)
//!           f64 timestamp_s
//!           ... tag specific body
//!
//! Bodies:
//!   added / updated : [u8;16] anchor uuid, f32[16] transform (column-major), GEOM
//!   removed         : [u8;16] anchor uuid
//!   device pose     : f32[16] pose (column-major)
//!   camera frame    : f32[16] extrinsics, f32[9] intrinsics (column-major),
//!                     u8 has_image, [u32 width, u32 height, u32 len, len bytes]?
//!
//! GEOM:
//!   u32 vertex_count, vertex_count * f32[3]
//!   u32 normal_count, normal_count * f32[3]   (0 => anchor reported no normals)
//!   u32 face_count, u8 bytes_per_index, face_count * 3 * bytes_per_index bytes
//!
//! Geometry payloads are not decoded here; they come back as zero-copy
//! [`RawGeometryBuffer`] slices of the file so the regular decoder walks them.

use crate::geometry::{FaceBuffer, GeometrySource, RawGeometryBuffer, FLOAT3_SIZE};
use crate::AnchorId;
use bytes::Bytes;
use glam::{Mat3, Mat4};
use std::fs::File;
use std::io::{self, ErrorKind, Write};
use std::path::Path;

pub const ANLG_MAGIC: [u8; 4] = *b"ANLG";
pub const ANLG_VERSION: u32 = 1;

const TAG_ADDED: u8 = 0;
const TAG_UPDATED: u8 = 1;
const TAG_REMOVED: u8 = 2;
const TAG_DEVICE_POSE: u8 = 3;
const TAG_CAMERA_FRAME: u8 = 4;

/// One update delivered by the reconstruction provider.
#[derive(Debug, Clone)]
pub enum AnchorEvent {
    Added {
        id: AnchorId,
        geometry: RawGeometryBuffer,
        transform: Mat4,
    },
    Updated {
        id: AnchorId,
        geometry: RawGeometryBuffer,
        transform: Mat4,
    },
    Removed {
        id: AnchorId,
    },
}

impl AnchorEvent {
    pub fn id(&self) -> AnchorId {
        match self {
            AnchorEvent::Added { id, .. }
            | AnchorEvent::Updated { id, .. }
            | AnchorEvent::Removed { id } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AnchorEvent::Added { .. } => "added",
            AnchorEvent::Updated { .. } => "updated",
            AnchorEvent::Removed { .. } => "removed",
        }
    }
}

/// Raw camera image, passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraImage {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    pub timestamp: f64,
    pub extrinsics: Mat4,
    pub intrinsics: Mat3,
    pub image: Option<CameraImage>,
}

#[derive(Debug, Clone)]
pub enum Record {
    Anchor { timestamp: f64, event: AnchorEvent },
    DevicePose { timestamp: f64, pose: Mat4 },
    Camera(CameraFrame),
}

impl Record {
    pub fn timestamp(&self) -> f64 {
        match self {
            Record::Anchor { timestamp, .. } | Record::DevicePose { timestamp, .. } => *timestamp,
            Record::Camera(frame) => frame.timestamp,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Recording {
    pub records: Vec<Record>,
}

impl Recording {
    pub fn anchor_event_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, Record::Anchor { .. }))
            .count()
    }
}

#[inline(always)]
fn need(buf: &Bytes, want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated ANLG"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take(buf: &mut Bytes, n: usize) -> io::Result<Bytes> {
    need(buf, n)?;
    Ok(buf.split_to(n))
}

#[inline(always)]
fn le_u8(buf: &mut Bytes) -> io::Result<u8> {
    Ok(take(buf, 1)?[0])
}

#[inline(always)]
fn le_u32(buf: &mut Bytes) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_f32(buf: &mut Bytes) -> io::Result<f32> {
    let b = take(buf, 4)?;
    Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_f64(buf: &mut Bytes) -> io::Result<f64> {
    let b = take(buf, 8)?;
    Ok(f64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

fn anchor_id(buf: &mut Bytes) -> io::Result<AnchorId> {
    let b = take(buf, 16)?;
    let mut id = [0u8; 16];
    id.copy_from_slice(&b);
    Ok(AnchorId::from_bytes(id))
}

fn mat4(buf: &mut Bytes) -> io::Result<Mat4> {
    let mut cols = [0f32; 16];
    for c in cols.iter_mut() {
        *c = le_f32(buf)?;
    }
    Ok(Mat4::from_cols_array(&cols))
}

fn mat3(buf: &mut Bytes) -> io::Result<Mat3> {
    let mut cols = [0f32; 9];
    for c in cols.iter_mut() {
        *c = le_f32(buf)?;
    }
    Ok(Mat3::from_cols_array(&cols))
}

fn float3_source(buf: &mut Bytes) -> io::Result<GeometrySource> {
    let count = le_u32(buf)? as usize;
    let len = count
        .checked_mul(FLOAT3_SIZE)
        .ok_or_else(|| bad("geometry size overflow"))?;
    Ok(GeometrySource::packed(take(buf, len)?, count))
}

fn geometry(buf: &mut Bytes) -> io::Result<RawGeometryBuffer> {
    let vertices = float3_source(buf)?;
    let normals = float3_source(buf)?;

    let count = le_u32(buf)? as usize;
    let bytes_per_index = le_u8(buf)? as usize;
    let mut faces = FaceBuffer {
        data: Bytes::new(),
        count,
        bytes_per_index,
    };
    // Width is validated here only to know how many bytes to skip; the
    // decoder checks it again for buffers that did not come from a file.
    let len = faces.byte_len().map_err(|e| bad(&e.to_string()))?;
    faces.data = take(buf, len)?;

    Ok(RawGeometryBuffer {
        vertices,
        normals,
        faces,
    })
}

/// Parse a recording from a contiguous buffer. Geometry stays borrowed from `p`.
pub fn parse_recording_bytes(mut p: Bytes) -> io::Result<Recording> {
    if take(&mut p, 4)?[..] != ANLG_MAGIC[..] {
        return Err(bad("bad ANLG magic"));
    }

    let version = le_u32(&mut p)?;
    if version != ANLG_VERSION {
        return Err(bad("unsupported ANLG version"));
    }

    let count = le_u32(&mut p)? as usize;
    let mut records = Vec::with_capacity(count.min(1 << 16));

    for _ in 0..count {
        let tag = le_u8(&mut p)?;
        let timestamp = le_f64(&mut p)?;

        let record = match tag {
            TAG_ADDED | TAG_UPDATED => {
                let id = anchor_id(&mut p)?;
                let transform = mat4(&mut p)?;
                let geometry = geometry(&mut p)?;
                let event = if tag == TAG_ADDED {
                    AnchorEvent::Added {
                        id,
                        geometry,
                        transform,
                    }
                } else {
                    AnchorEvent::Updated {
                        id,
                        geometry,
                        transform,
                    }
                };
                Record::Anchor { timestamp, event }
            }
            TAG_REMOVED => Record::Anchor {
                timestamp,
                event: AnchorEvent::Removed {
                    id: anchor_id(&mut p)?,
                },
            },
            TAG_DEVICE_POSE => Record::DevicePose {
                timestamp,
                pose: mat4(&mut p)?,
            },
            TAG_CAMERA_FRAME => {
                let extrinsics = mat4(&mut p)?;
                let intrinsics = mat3(&mut p)?;
                let image = match le_u8(&mut p)? {
                    0 => None,
                    1 => {
                        let width = le_u32(&mut p)?;
                        let height = le_u32(&mut p)?;
                        let len = le_u32(&mut p)? as usize;
                        Some(CameraImage {
                            width,
                            height,
                            data: take(&mut p, len)?,
                        })
                    }
                    x => return Err(bad(&format!("invalid image flag {}", x))),
                };
                Record::Camera(CameraFrame {
                    timestamp,
                    extrinsics,
                    intrinsics,
                    image,
                })
            }
            x => return Err(bad(&format!("unknown ANLG record tag {}", x))),
        };

        records.push(record);
    }

    if !p.is_empty() {
        return Err(bad("trailing bytes after last ANLG record"));
    }

    Ok(Recording { records })
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<Recording> {
    let file = File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    parse_recording_bytes(Bytes::from_owner(map))
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<Recording> {
    let bytes = std::fs::read(path)?;
    parse_recording_bytes(Bytes::from(bytes))
}

pub fn write_file<P: AsRef<Path>>(path: P, recording: &Recording) -> io::Result<()> {
    let mut file = io::BufWriter::new(File::create(path)?);
    write_recording(&mut file, recording)?;
    file.flush()
}

pub fn write_recording<W: Write>(w: &mut W, recording: &Recording) -> io::Result<()> {
    let count =
        u32::try_from(recording.records.len()).map_err(|_| bad("too many records"))?;

    w.write_all(&ANLG_MAGIC)?;
    write_u32(w, ANLG_VERSION)?;
    write_u32(w, count)?;

    for record in &recording.records {
        match record {
            Record::Anchor { timestamp, event } => match event {
                AnchorEvent::Added {
                    id,
                    geometry,
                    transform,
                }
                | AnchorEvent::Updated {
                    id,
                    geometry,
                    transform,
                } => {
                    let tag = if matches!(event, AnchorEvent::Added { .. }) {
                        TAG_ADDED
                    } else {
                        TAG_UPDATED
                    };
                    w.write_all(&[tag])?;
                    write_f64(w, *timestamp)?;
                    w.write_all(id.as_bytes())?;
                    write_f32s(w, &transform.to_cols_array())?;
                    write_geometry(w, geometry)?;
                }
                AnchorEvent::Removed { id } => {
                    w.write_all(&[TAG_REMOVED])?;
                    write_f64(w, *timestamp)?;
                    w.write_all(id.as_bytes())?;
                }
            },
            Record::DevicePose { timestamp, pose } => {
                w.write_all(&[TAG_DEVICE_POSE])?;
                write_f64(w, *timestamp)?;
                write_f32s(w, &pose.to_cols_array())?;
            }
            Record::Camera(frame) => {
                w.write_all(&[TAG_CAMERA_FRAME])?;
                write_f64(w, frame.timestamp)?;
                write_f32s(w, &frame.extrinsics.to_cols_array())?;
                write_f32s(w, &frame.intrinsics.to_cols_array())?;
                match frame.image.as_ref() {
                    None => w.write_all(&[0])?,
                    Some(image) => {
                        let len = u32::try_from(image.data.len())
                            .map_err(|_| bad("camera image too large"))?;
                        w.write_all(&[1])?;
                        write_u32(w, image.width)?;
                        write_u32(w, image.height)?;
                        write_u32(w, len)?;
                        w.write_all(&image.data)?;
                    }
                }
            }
        }
    }

    Ok(())
}

fn write_geometry<W: Write>(w: &mut W, geometry: &RawGeometryBuffer) -> io::Result<()> {
    write_source(w, &geometry.vertices)?;
    write_source(w, &geometry.normals)?;

    let faces = &geometry.faces;
    let len = faces.byte_len().map_err(|e| bad(&e.to_string()))?;
    if len > faces.data.len() {
        return Err(bad("face buffer shorter than its triangle count"));
    }
    write_u32(
        w,
        u32::try_from(faces.count).map_err(|_| bad("too many faces"))?,
    )?;
    w.write_all(&[faces.bytes_per_index as u8])?;
    w.write_all(&faces.data[..len])
}

/// Repacks a (possibly strided) source as tight float3 records.
fn write_source<W: Write>(w: &mut W, source: &GeometrySource) -> io::Result<()> {
    write_u32(
        w,
        u32::try_from(source.count).map_err(|_| bad("too many elements"))?,
    )?;
    for i in 0..source.count {
        let v = source.read_vec3(i).map_err(|e| bad(&e.to_string()))?;
        write_f32s(w, &v.to_array())?;
    }
    Ok(())
}

#[inline]
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_f32s<W: Write>(w: &mut W, vs: &[f32]) -> io::Result<()> {
    for v in vs {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::decode;
    use glam::Vec3;

    fn sample_recording(id: AnchorId) -> Recording {
        let vertices = [Vec3::ZERO, Vec3::X, Vec3::Z];
        let normals = [Vec3::Y; 3];
        let geometry =
            RawGeometryBuffer::from_parts(&vertices, Some(&normals), &[[0, 1, 2]], 2).unwrap();

        Recording {
            records: vec![
                Record::DevicePose {
                    timestamp: 0.5,
                    pose: Mat4::from_translation(Vec3::new(0.0, 1.6, 0.0)),
                },
                Record::Anchor {
                    timestamp: 1.0,
                    event: AnchorEvent::Added {
                        id,
                        geometry,
                        transform: Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
                    },
                },
                Record::Camera(CameraFrame {
                    timestamp: 1.25,
                    extrinsics: Mat4::IDENTITY,
                    intrinsics: Mat3::from_cols_array(&[
                        600.0, 0.0, 0.0, 0.0, 600.0, 0.0, 320.0, 240.0, 1.0,
                    ]),
                    image: Some(CameraImage {
                        width: 2,
                        height: 1,
                        data: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
                    }),
                }),
                Record::Anchor {
                    timestamp: 2.0,
                    event: AnchorEvent::Removed { id },
                },
            ],
        }
    }

    #[test]
    fn recording_reads_back_what_was_written() {
        let id = AnchorId::new_v4();
        let mut buf = Vec::new();
        write_recording(&mut buf, &sample_recording(id)).unwrap();

        let parsed = parse_recording_bytes(Bytes::from(buf)).unwrap();
        assert_eq!(parsed.records.len(), 4);
        assert_eq!(parsed.anchor_event_count(), 2);

        match &parsed.records[1] {
            Record::Anchor {
                timestamp,
                event:
                    AnchorEvent::Added {
                        id: got,
                        geometry,
                        transform,
                    },
            } => {
                assert_eq!(*timestamp, 1.0);
                assert_eq!(*got, id);
                assert_eq!(transform.w_axis.truncate(), Vec3::new(1.0, 2.0, 3.0));
                let decoded = decode(geometry).unwrap();
                assert_eq!(decoded.faces, vec![[0, 1, 2]]);
                assert_eq!(decoded.normals.unwrap(), vec![Vec3::Y; 3]);
            }
            other => panic!("unexpected record {:?}", other),
        }

        match &parsed.records[2] {
            Record::Camera(frame) => {
                assert_eq!(frame.intrinsics.z_axis, Vec3::new(320.0, 240.0, 1.0));
                assert_eq!(frame.image.as_ref().unwrap().data.len(), 8);
            }
            other => panic!("unexpected record {:?}", other),
        }

        assert!(matches!(
            parsed.records[3],
            Record::Anchor {
                event: AnchorEvent::Removed { .. },
                ..
            }
        ));
    }

    #[test]
    fn truncated_recording_is_an_eof_error() {
        let mut buf = Vec::new();
        write_recording(&mut buf, &sample_recording(AnchorId::new_v4())).unwrap();
        buf.truncate(buf.len() - 3);

        let err = parse_recording_bytes(Bytes::from(buf)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn rejects_wrong_magic_and_unknown_tags() {
        let err = parse_recording_bytes(Bytes::from_static(b"HYPC\x01\0\0\0\0\0\0\0")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let mut buf = Vec::new();
        buf.extend_from_slice(&ANLG_MAGIC);
        buf.extend_from_slice(&ANLG_VERSION.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(9);
        buf.extend_from_slice(&0f64.to_le_bytes());
        let err = parse_recording_bytes(Bytes::from(buf)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
