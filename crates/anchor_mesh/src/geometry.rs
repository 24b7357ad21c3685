//! Raw anchor geometry buffers and the decoder that walks them.
//!
//! Layout of a [`GeometrySource`] element: three little-endian `f32` at
//! `offset + index * stride`. A [`FaceBuffer`] is a flat run of
//! `count * 3` indices, each `bytes_per_index` bytes wide.

use bytes::Bytes;
use glam::{Mat4, Vec3};
use thiserror::Error;

/// Size in bytes of one packed `[f32; 3]` element.
pub const FLOAT3_SIZE: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("unsupported index width of {0} bytes")]
    UnsupportedIndexWidth(usize),

    #[error("face buffer holds {available} bytes but {needed} are required")]
    FacesOutOfBounds { needed: usize, available: usize },

    #[error("{what} element {index} ends at byte {end}, past the {len} byte buffer")]
    SourceOutOfBounds {
        what: &'static str,
        index: usize,
        end: usize,
        len: usize,
    },

    #[error("{what} stride {stride} is smaller than a float3")]
    StrideTooSmall { what: &'static str, stride: usize },

    #[error("{normals} normals supplied for {vertices} vertices")]
    NormalCountMismatch { normals: usize, vertices: usize },

    #[error("index {index} does not fit in {width} bytes")]
    IndexTooWide { index: u32, width: usize },

    #[error("vertex {index} has a non-finite coordinate")]
    NonFiniteVertex { index: usize },

    #[error("anchor transform has a non-finite component")]
    NonFiniteTransform,

    #[error("element count overflows the address space")]
    Overflow,
}

/// A strided float3 array backed by an anchor's buffer.
#[derive(Debug, Clone, Default)]
pub struct GeometrySource {
    pub data: Bytes,
    pub count: usize,
    pub offset: usize,
    pub stride: usize,
}

impl GeometrySource {
    /// Tightly packed source starting at byte 0.
    pub fn packed(data: Bytes, count: usize) -> Self {
        Self {
            data,
            count,
            offset: 0,
            stride: FLOAT3_SIZE,
        }
    }

    pub fn empty() -> Self {
        Self::packed(Bytes::new(), 0)
    }

    pub fn from_vec3s(values: &[Vec3]) -> Self {
        let mut out = Vec::with_capacity(values.len() * FLOAT3_SIZE);
        for v in values {
            for c in v.to_array() {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
        Self::packed(Bytes::from(out), values.len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bounds-checked read of element `index`.
    pub fn read_vec3(&self, index: usize) -> Result<Vec3, GeometryError> {
        self.read_vec3_as("geometry", index)
    }

    fn read_vec3_as(&self, what: &'static str, index: usize) -> Result<Vec3, GeometryError> {
        if self.stride < FLOAT3_SIZE {
            return Err(GeometryError::StrideTooSmall {
                what,
                stride: self.stride,
            });
        }

        let start = index
            .checked_mul(self.stride)
            .and_then(|o| o.checked_add(self.offset))
            .ok_or(GeometryError::Overflow)?;
        let end = start.checked_add(FLOAT3_SIZE).ok_or(GeometryError::Overflow)?;

        if index >= self.count || end > self.data.len() {
            return Err(GeometryError::SourceOutOfBounds {
                what,
                index,
                end,
                len: self.data.len(),
            });
        }

        let b = &self.data[start..end];
        Ok(Vec3::new(
            f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            f32::from_le_bytes([b[8], b[9], b[10], b[11]]),
        ))
    }

    fn read_all(&self, what: &'static str) -> Result<Vec<Vec3>, GeometryError> {
        #[cfg(target_endian = "little")]
        {
            // Packed and 4-aligned: reinterpret in place. Anything else takes the
            // element-wise path below, which also produces the bounds error.
            if self.stride == FLOAT3_SIZE {
                let end = self
                    .count
                    .checked_mul(FLOAT3_SIZE)
                    .and_then(|n| n.checked_add(self.offset))
                    .ok_or(GeometryError::Overflow)?;
                if end <= self.data.len() {
                    if let Ok(packed) =
                        bytemuck::try_cast_slice::<u8, [f32; 3]>(&self.data[self.offset..end])
                    {
                        return Ok(packed.iter().map(|&a| Vec3::from_array(a)).collect());
                    }
                }
            }
        }

        (0..self.count).map(|i| self.read_vec3_as(what, i)).collect()
    }
}

/// Flat triangle index buffer.
#[derive(Debug, Clone)]
pub struct FaceBuffer {
    pub data: Bytes,
    /// Number of triangles.
    pub count: usize,
    pub bytes_per_index: usize,
}

impl FaceBuffer {
    pub fn empty() -> Self {
        Self {
            data: Bytes::new(),
            count: 0,
            bytes_per_index: 4,
        }
    }

    /// Encodes `faces` at the given index width.
    pub fn from_triangles(faces: &[[u32; 3]], bytes_per_index: usize) -> Result<Self, GeometryError> {
        Ok(Self {
            data: encode_faces(faces, bytes_per_index)?,
            count: faces.len(),
            bytes_per_index,
        })
    }

    /// Byte length covered by `count` triangles, validating the width.
    pub fn byte_len(&self) -> Result<usize, GeometryError> {
        if !matches!(self.bytes_per_index, 1 | 2 | 4) {
            return Err(GeometryError::UnsupportedIndexWidth(self.bytes_per_index));
        }
        self.count
            .checked_mul(3)
            .and_then(|n| n.checked_mul(self.bytes_per_index))
            .ok_or(GeometryError::Overflow)
    }
}

/// Everything an anchor hands over for one geometry state.
#[derive(Debug, Clone)]
pub struct RawGeometryBuffer {
    pub vertices: GeometrySource,
    /// May be empty; an anchor is allowed to report no normals.
    pub normals: GeometrySource,
    pub faces: FaceBuffer,
}

impl RawGeometryBuffer {
    /// Packs typed arrays into a buffer, mostly for recordings and tests.
    pub fn from_parts(
        vertices: &[Vec3],
        normals: Option<&[Vec3]>,
        faces: &[[u32; 3]],
        bytes_per_index: usize,
    ) -> Result<Self, GeometryError> {
        Ok(Self {
            vertices: GeometrySource::from_vec3s(vertices),
            normals: normals.map_or_else(GeometrySource::empty, GeometrySource::from_vec3s),
            faces: FaceBuffer::from_triangles(faces, bytes_per_index)?,
        })
    }
}

/// Typed geometry of one anchor, sanitized and ready for meshing or export.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedGeometry {
    pub vertices: Vec<Vec3>,
    /// `None` when the anchor reported zero normals.
    pub normals: Option<Vec<Vec3>>,
    pub faces: Vec<[u32; 3]>,
}

impl DecodedGeometry {
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.faces.len()
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }
}

/// Decodes an anchor's raw buffers.
///
/// Fails closed: a bad index width, a short buffer, a mismatched normal count
/// or a non-finite vertex rejects the whole anchor state.
pub fn decode(raw: &RawGeometryBuffer) -> Result<DecodedGeometry, GeometryError> {
    let vertices = raw.vertices.read_all("vertex")?;
    if let Some(index) = vertices.iter().position(|v| !v.is_finite()) {
        return Err(GeometryError::NonFiniteVertex { index });
    }

    let normals = if raw.normals.is_empty() {
        None
    } else {
        if raw.normals.count != raw.vertices.count {
            return Err(GeometryError::NormalCountMismatch {
                normals: raw.normals.count,
                vertices: raw.vertices.count,
            });
        }
        let mut normals = raw.normals.read_all("normal")?;
        sanitize_normals(&mut normals);
        Some(normals)
    };

    let faces = decode_faces(&raw.faces)?;

    Ok(DecodedGeometry {
        vertices,
        normals,
        faces,
    })
}

/// Walks the face buffer, widening every index to `u32`.
pub fn decode_faces(faces: &FaceBuffer) -> Result<Vec<[u32; 3]>, GeometryError> {
    let needed = faces.byte_len()?;
    if needed > faces.data.len() {
        return Err(GeometryError::FacesOutOfBounds {
            needed,
            available: faces.data.len(),
        });
    }

    let bytes = &faces.data[..needed];
    let flat: Vec<u32> = match faces.bytes_per_index {
        1 => bytes.iter().map(|&b| b as u32).collect(),
        2 => bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
            .collect(),
        _ => bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    };

    Ok(flat.chunks_exact(3).map(|t| [t[0], t[1], t[2]]).collect())
}

/// Inverse of [`decode_faces`]: narrows every index to `bytes_per_index`.
pub fn encode_faces(faces: &[[u32; 3]], bytes_per_index: usize) -> Result<Bytes, GeometryError> {
    if !matches!(bytes_per_index, 1 | 2 | 4) {
        return Err(GeometryError::UnsupportedIndexWidth(bytes_per_index));
    }

    let mut out = Vec::with_capacity(faces.len() * 3 * bytes_per_index);
    for &index in faces.iter().flatten() {
        match bytes_per_index {
            1 => out.push(u8::try_from(index).map_err(|_| GeometryError::IndexTooWide {
                index,
                width: 1,
            })?),
            2 => out.extend_from_slice(
                &u16::try_from(index)
                    .map_err(|_| GeometryError::IndexTooWide { index, width: 2 })?
                    .to_le_bytes(),
            ),
            _ => out.extend_from_slice(&index.to_le_bytes()),
        }
    }

    Ok(Bytes::from(out))
}

/// Smallest index width able to address every index in `faces`.
pub fn narrowest_index_width(faces: &[[u32; 3]]) -> usize {
    let max = faces.iter().flatten().copied().max().unwrap_or(0);
    if max <= u8::MAX as u32 {
        1
    } else if max <= u16::MAX as u32 {
        2
    } else {
        4
    }
}

/// NaN and infinite components become 0.
#[inline]
fn sanitize_normals(normals: &mut [Vec3]) {
    for n in normals.iter_mut() {
        if !n.x.is_finite() {
            n.x = 0.0;
        }
        if !n.y.is_finite() {
            n.y = 0.0;
        }
        if !n.z.is_finite() {
            n.z = 0.0;
        }
    }
}

/// Placement check for an incoming anchor transform.
pub fn check_transform(transform: &Mat4) -> Result<(), GeometryError> {
    if transform.is_finite() {
        Ok(())
    } else {
        Err(GeometryError::NonFiniteTransform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> (Vec<Vec3>, Vec<[u32; 3]>) {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
        ];
        (vertices, vec![[0, 1, 2], [0, 2, 3]])
    }

    #[test]
    fn face_indices_survive_every_width() {
        let faces = vec![[0, 1, 2], [2, 1, 0], [7, 200, 255]];
        for width in [1, 2, 4] {
            let encoded = encode_faces(&faces, width).unwrap();
            assert_eq!(encoded.len(), faces.len() * 3 * width);

            let buffer = FaceBuffer {
                data: encoded.clone(),
                count: faces.len(),
                bytes_per_index: width,
            };
            let decoded = decode_faces(&buffer).unwrap();
            assert_eq!(decoded, faces);
            assert_eq!(encode_faces(&decoded, width).unwrap(), encoded);
        }
    }

    #[test]
    fn wide_indices_are_widened_not_truncated() {
        let faces = vec![[70_000, 1, 65_535]];
        let buffer = FaceBuffer::from_triangles(&faces, 4).unwrap();
        assert_eq!(decode_faces(&buffer).unwrap(), faces);

        assert_eq!(
            encode_faces(&faces, 2),
            Err(GeometryError::IndexTooWide {
                index: 70_000,
                width: 2
            })
        );
        assert_eq!(narrowest_index_width(&faces), 4);
        assert_eq!(narrowest_index_width(&[[1, 2, 300]]), 2);
        assert_eq!(narrowest_index_width(&[]), 1);
    }

    #[test]
    fn rejects_bad_index_width() {
        let buffer = FaceBuffer {
            data: Bytes::from(vec![0u8; 9]),
            count: 1,
            bytes_per_index: 3,
        };
        assert_eq!(
            decode_faces(&buffer),
            Err(GeometryError::UnsupportedIndexWidth(3))
        );
    }

    #[test]
    fn short_face_buffer_fails_closed() {
        let buffer = FaceBuffer {
            data: Bytes::from(vec![0u8; 10]),
            count: 1,
            bytes_per_index: 4,
        };
        assert_eq!(
            decode_faces(&buffer),
            Err(GeometryError::FacesOutOfBounds {
                needed: 12,
                available: 10
            })
        );
    }

    #[test]
    fn nan_normal_components_become_zero() {
        let (vertices, faces) = quad();
        let normals = vec![
            Vec3::new(f32::NAN, 1.0, 0.25),
            Vec3::new(0.0, f32::NAN, f32::NAN),
            Vec3::new(-0.5, 0.75, 0.125),
            Vec3::new(f32::NAN, f32::NAN, f32::NAN),
        ];
        let raw = RawGeometryBuffer::from_parts(&vertices, Some(&normals), &faces, 2).unwrap();
        let decoded = decode(&raw).unwrap();

        let got = decoded.normals.unwrap();
        assert!(got.iter().all(|n| !n.is_nan()));
        assert_eq!(got[0], Vec3::new(0.0, 1.0, 0.25));
        assert_eq!(got[1], Vec3::ZERO);
        assert_eq!(got[2], normals[2]);
        assert_eq!(got[3], Vec3::ZERO);
    }

    #[test]
    fn infinite_normal_components_become_zero() {
        let (vertices, faces) = quad();
        let mut normals = vec![Vec3::Y; 4];
        normals[2] = Vec3::new(f32::INFINITY, 1.0, f32::NEG_INFINITY);
        let raw = RawGeometryBuffer::from_parts(&vertices, Some(&normals), &faces, 2).unwrap();
        assert_eq!(decode(&raw).unwrap().normals.unwrap()[2], Vec3::Y);
    }

    #[test]
    fn non_finite_vertex_rejects_the_anchor() {
        let (mut vertices, faces) = quad();
        vertices[3] = Vec3::new(f32::NAN, 0.0, 1.0);
        let raw = RawGeometryBuffer::from_parts(&vertices, None, &faces, 2).unwrap();
        assert_eq!(decode(&raw), Err(GeometryError::NonFiniteVertex { index: 3 }));

        vertices[3] = Vec3::new(0.0, f32::INFINITY, 1.0);
        let raw = RawGeometryBuffer::from_parts(&vertices, None, &faces, 2).unwrap();
        assert_eq!(decode(&raw), Err(GeometryError::NonFiniteVertex { index: 3 }));
    }

    #[test]
    fn transform_must_be_finite() {
        assert!(check_transform(&Mat4::from_translation(Vec3::X)).is_ok());
        let mut cols = Mat4::IDENTITY.to_cols_array();
        cols[13] = f32::NAN;
        assert_eq!(
            check_transform(&Mat4::from_cols_array(&cols)),
            Err(GeometryError::NonFiniteTransform)
        );
    }

    #[test]
    fn zero_normals_decode_as_absent() {
        let (vertices, faces) = quad();
        let raw = RawGeometryBuffer::from_parts(&vertices, None, &faces, 1).unwrap();
        let decoded = decode(&raw).unwrap();
        assert!(decoded.normals.is_none());
        assert_eq!(decoded.vertices, vertices);
        assert_eq!(decoded.faces, faces);
    }

    #[test]
    fn normal_count_must_match_vertices() {
        let (vertices, faces) = quad();
        let normals = vec![Vec3::Y; 3];
        let raw = RawGeometryBuffer::from_parts(&vertices, Some(&normals), &faces, 1).unwrap();
        assert_eq!(
            decode(&raw),
            Err(GeometryError::NormalCountMismatch {
                normals: 3,
                vertices: 4
            })
        );
    }

    #[test]
    fn strided_source_with_offset() {
        // Two float3 records with 4 bytes of padding after each, behind an 8 byte header.
        let mut data = vec![0xAAu8; 8];
        for v in [[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]] {
            for c in v {
                data.extend_from_slice(&c.to_le_bytes());
            }
            data.extend_from_slice(&[0u8; 4]);
        }
        let source = GeometrySource {
            data: Bytes::from(data),
            count: 2,
            offset: 8,
            stride: 16,
        };
        assert_eq!(source.read_vec3(1).unwrap(), Vec3::new(4.0, 5.0, 6.0));
        assert_eq!(
            source.read_all("vertex").unwrap(),
            vec![Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0)]
        );
        assert!(matches!(
            source.read_vec3(2),
            Err(GeometryError::SourceOutOfBounds { index: 2, .. })
        ));
    }

    #[test]
    fn truncated_vertex_source_is_rejected() {
        let source = GeometrySource::packed(Bytes::from(vec![0u8; 20]), 2);
        let raw = RawGeometryBuffer {
            vertices: source,
            normals: GeometrySource::empty(),
            faces: FaceBuffer::empty(),
        };
        assert!(matches!(
            decode(&raw),
            Err(GeometryError::SourceOutOfBounds {
                what: "vertex",
                index: 1,
                ..
            })
        ));
    }
}
