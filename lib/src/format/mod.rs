pub mod bin_archive;
pub mod chunk;
pub mod curve;
pub mod model;
pub mod motion;
pub mod reflection;
pub mod skeleton;
pub mod vertex;

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use thiserror::Error;

/// Malformed input detected while decoding. Returned through `anyhow::Error`,
/// so callers can `downcast_ref::<DecodeError>()` to branch on the kind.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated chunk header ({remaining} bytes left)")]
    ChunkHeader { remaining: usize },
    #[error("chunk {id} declares {size} bytes but only {available} remain")]
    ChunkBounds { id: u32, size: u32, available: usize },
    #[error("missing required chunk {0}")]
    MissingChunk(u32),
    #[error("read of {needed} bytes at offset {offset} overruns section (size {available})")]
    UnexpectedEof { offset: usize, needed: usize, available: usize },
    #[error("section '{expected}' not found (got crc {found:#010X})")]
    SectionMismatch { expected: String, found: u32 },
    #[error("expected member '{expected_name}: {expected_type}', found '{found_name}: {found_type}'")]
    TypeInfoMismatch {
        expected_name: String,
        expected_type: String,
        found_name: String,
        found_type: String,
    },
    #[error("string index {index} out of range ({count} strings)")]
    StringIndex { index: u32, count: usize },
    #[error("missing field '{0}'")]
    MissingField(String),
    #[error("field '{name}' is not {expected}")]
    JsonType { name: String, expected: &'static str },
    #[error("unsupported curve type {0}")]
    CurveType(u8),
    #[error("curve point size {found} does not match attribute size {expected}")]
    CurvePointSize { expected: u32, found: u32 },
    #[error("unsupported model type {0}")]
    ModelType(u16),
    #[error("unsupported vertex type {0}")]
    VertexType(u32),
    #[error("bones CRC mismatch: expected {expected:#010X}, got {found:#010X}")]
    BonesCrcMismatch { expected: u32, found: u32 },
}

/// Engine generation a resource was authored for.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GameVersion {
    /// Metro 2033 (original release)
    Og2033,
    /// Metro: Last Light (original release)
    OgLastLight,
    /// Metro Redux
    Redux,
    /// Arktika.1
    Arktika1,
    /// Metro Exodus
    #[default]
    Exodus,
}

impl GameVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            GameVersion::Og2033 => "2033",
            GameVersion::OgLastLight => "ll",
            GameVersion::Redux => "redux",
            GameVersion::Arktika1 => "a1",
            GameVersion::Exodus => "exodus",
        }
    }
}

impl Display for GameVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for GameVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "2033" => GameVersion::Og2033,
            "ll" | "lastlight" => GameVersion::OgLastLight,
            "redux" => GameVersion::Redux,
            "a1" | "arktika1" => GameVersion::Arktika1,
            "exodus" => GameVersion::Exodus,
            _ => return Err(format!("unknown game version '{s}' (2033, ll, redux, a1, exodus)")),
        })
    }
}
