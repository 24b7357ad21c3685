//! Mesh-anchor geometry: decoding, render mesh construction and recording.
//!
//! - [`geometry`] walks the raw vertex / normal / face buffers an anchor carries
//!   and produces [`DecodedGeometry`]. Index widths of 1, 2 and 4 bytes are
//!   supported; NaN normal components are zeroed once, at decode time.
//! - [`mesh`] turns decoded geometry into a [`MeshPair`]: the primary mesh and
//!   an occlusion mesh pushed slightly into the surface along the normals.
//! - [`recording`] is the little-endian `ANLG` log of anchor events, device
//!   poses and camera frames used to record and replay a capture.
//!
//! All multi-byte values in raw buffers are little-endian.

use std::fmt;
use std::str::FromStr;

pub mod geometry;
pub mod mesh;
pub mod recording;

pub use geometry::{
    check_transform, decode, decode_faces, encode_faces, narrowest_index_width, DecodedGeometry, FaceBuffer,
    GeometryError, GeometrySource, RawGeometryBuffer,
};
pub use mesh::{MeshError, MeshPair, TriangleMesh, OCCLUSION_OFFSET};
pub use recording::{AnchorEvent, CameraFrame, CameraImage, Record, Recording};

/// Identifier of one reconstructed surface patch.
///
/// Stable across updates for the same surface and never reused after removal.
/// The canonical string form is the upper-case hyphenated UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorId(uuid::Uuid);

impl AnchorId {
    pub fn new_v4() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    #[inline]
    pub fn uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl From<uuid::Uuid> for AnchorId {
    fn from(value: uuid::Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl FromStr for AnchorId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_id_string_form_is_upper_case_and_parses_back() {
        let id = AnchorId::from_bytes([
            0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x42, 0x33, 0x84, 0x55, 0x66, 0x77, 0x88, 0x99,
            0xaa, 0xbb,
        ]);
        let s = id.to_string();
        assert_eq!(s, "DEADBEEF-0011-4233-8455-66778899AABB");
        assert_eq!(s.parse::<AnchorId>().unwrap(), id);
    }
}
