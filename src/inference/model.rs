//! Model artifact checks
//!
//! Validates the GGUF header of the model file a configuration points at,
//! so an incompatible artifact fails before the backend tries to map it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const GGUF_HEADER_LEN: u64 = 24;

const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

/// Errors raised while inspecting a model artifact
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open model file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be a GGUF model ({0} bytes)")]
    FileTooSmall(u64),
}

/// Header fields of a GGUF model file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
    /// File size in bytes
    pub size_bytes: u64,
}

/// Reads and validates the GGUF header of `path`.
pub fn inspect_model<P: AsRef<Path>>(path: P) -> Result<ModelArtifact, ModelError> {
    let mut file = File::open(path)?;

    let size_bytes = file.seek(SeekFrom::End(0))?;
    if size_bytes < GGUF_HEADER_LEN {
        return Err(ModelError::FileTooSmall(size_bytes));
    }
    file.seek(SeekFrom::Start(0))?;

    parse_header(&mut file, size_bytes)
}

fn read_u32(reader: &mut impl Read) -> Result<u32, ModelError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, ModelError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads the fixed-size header fields, in file order.
fn parse_header(reader: &mut impl Read, size_bytes: u64) -> Result<ModelArtifact, ModelError> {
    let magic = read_u32(reader)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = read_u32(reader)?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(ModelArtifact {
        version,
        tensor_count: read_u64(reader)?,
        metadata_kv_count: read_u64(reader)?,
        size_bytes,
    })
}
