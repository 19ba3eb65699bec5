//! Hash utilities for chunk and file verification.
//!
//! Build manifests identify file and chunk contents by SHA1. Chunk file names
//! additionally carry a 64-bit xxHash of the chunk payload.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Read buffer used when streaming files through the hasher
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// A SHA1 digest, serialized as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaHash(pub [u8; 20]);

impl ShaHash {
    /// Hash a byte slice
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Finish a running hasher
    pub fn from_hasher(hasher: Sha1) -> Self {
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim()).with_context(|| format!("Invalid SHA1 hex: {}", text))?;
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("SHA1 must be 20 bytes: {}", text))?;
        Ok(Self(array))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaHash({})", self.to_hex())
    }
}

impl Serialize for ShaHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ShaHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// 64-bit content hash used in chunk file names
pub fn rolling_hash(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, 0)
}

/// Stream a reader through SHA1.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<ShaHash> {
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut hasher = Sha1::new();

    loop {
        let bytes_read = reader.read(&mut buf)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buf[..bytes_read]);
    }

    Ok(ShaHash::from_hasher(hasher))
}

/// Compute the SHA1 of a file.
///
/// Uses streaming to handle large files without loading into memory.
pub fn compute_file_hash(path: &Path) -> Result<ShaHash> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    hash_reader(reader).with_context(|| format!("Failed to read file for hashing: {}", path.display()))
}

/// Verify a file's hash matches the expected one.
///
/// Returns Ok(true) if hash matches, Ok(false) if mismatch.
pub fn verify_file_hash(path: &Path, expected: &ShaHash) -> Result<bool> {
    Ok(compute_file_hash(path)? == *expected)
}
