//! Build manifest JSON types
//!
//! Serde definitions for the JSON rendition of a build manifest.

use crate::file_system::FileAttributes;
use crate::hash::ShaHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// GUID naming one chunk of build data
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub Uuid);

impl ChunkId {
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0.simple())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self)
    }
}

/// A byte range of one chunk destined for one output file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkPart {
    pub guid: ChunkId,
    /// Offset within the chunk's uncompressed data
    pub offset: u32,
    pub size: u32,
}

/// One file of the build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileManifest {
    pub filename: String,
    pub file_hash: ShaHash,
    /// Parts in file order; each part starts where the previous one ended
    pub chunk_parts: Vec<ChunkPart>,
    #[serde(default)]
    pub install_tags: Vec<String>,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub is_compressed: bool,
    #[serde(default)]
    pub is_unix_executable: bool,
}

impl FileManifest {
    pub fn file_size(&self) -> u64 {
        self.chunk_parts.iter().map(|p| p.size as u64).sum()
    }

    /// Parts paired with their destination offset in the file
    pub fn parts_with_offsets(&self) -> impl Iterator<Item = (u64, &ChunkPart)> {
        let mut position = 0u64;
        self.chunk_parts.iter().map(move |part| {
            let start = position;
            position += part.size as u64;
            (start, part)
        })
    }

    pub fn attributes(&self) -> FileAttributes {
        FileAttributes {
            read_only: self.is_read_only,
            executable: self.is_unix_executable,
            compressed: self.is_compressed,
        }
    }

    pub fn has_attributes(&self) -> bool {
        self.is_read_only || self.is_compressed || self.is_unix_executable
    }
}

/// Per-chunk metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkInfo {
    pub guid: ChunkId,
    /// Rolling hash used in the chunk's cloud file name
    pub hash: u64,
    /// SHA1 of the uncompressed chunk data
    pub sha_hash: ShaHash,
    /// Cloud subfolder the chunk lives in
    pub group_number: u8,
    /// Uncompressed data size
    pub window_size: u32,
    /// Size of the serialized chunk file
    pub file_size: u64,
}

/// Root manifest structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestData {
    pub app_name: String,
    pub build_version: String,
    #[serde(default)]
    pub launch_exe: String,
    #[serde(default)]
    pub prereq_name: String,
    #[serde(default)]
    pub prereq_path: String,
    #[serde(default)]
    pub prereq_args: String,
    #[serde(default)]
    pub prereq_ids: Vec<String>,
    pub files: Vec<FileManifest>,
    pub chunks: Vec<ChunkInfo>,
}
