//! Chunk file format
//!
//! A serialized chunk is a fixed little-endian header followed by the chunk
//! payload, optionally zlib compressed:
//!
//! ```text
//! magic u32 | version u32 | header_size u32 | data_size_compressed u32
//! guid [u8; 16] | rolling_hash u64 | stored_as u8 | sha_hash [u8; 20]
//! hash_type u8 | data_size_uncompressed u32 | payload...
//! ```

pub mod chunkdb;

use crate::hash::{rolling_hash, ShaHash};
use crate::manifest::ChunkId;
use binrw::{binrw, BinRead, BinWrite};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Cursor, Read, Write};

/// Current chunk header version
pub const CHUNK_HEADER_VERSION: u32 = 3;

/// Serialized header size in bytes, magic included
pub const CHUNK_HEADER_SIZE: u32 = 66;

/// Most buffer space reserved up front on the word of an unverified header
const MAX_PREALLOCATION: usize = 1024 * 1024;

/// `stored_as` flag: payload is zlib compressed
const STORED_COMPRESSED: u8 = 0x01;

/// `hash_type` flag: rolling hash present
const HASH_ROLLING: u8 = 0x01;

/// `hash_type` flag: SHA1 present
const HASH_SHA1: u8 = 0x02;

/// Errors reading or writing chunk data
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("Invalid chunk header: {0}")]
    Header(#[from] binrw::Error),

    #[error("Unsupported chunk header version {0}")]
    UnsupportedVersion(u32),

    #[error("Chunk data truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Failed to decompress chunk {id}: {source}")]
    Decompress {
        id: ChunkId,
        #[source]
        source: std::io::Error,
    },

    #[error("Chunk {id} size mismatch: header says {expected}, data has {actual}")]
    SizeMismatch { id: ChunkId, expected: u32, actual: usize },

    #[error("Chunk {0} failed hash verification")]
    HashMismatch(ChunkId),

    #[error("Expected chunk {expected}, got {actual}")]
    WrongChunk { expected: ChunkId, actual: ChunkId },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk chunk header
#[binrw]
#[brw(little, magic = 0xB1FE3AA2u32)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u32,
    pub header_size: u32,
    pub data_size_compressed: u32,
    pub guid: [u8; 16],
    pub rolling_hash: u64,
    pub stored_as: u8,
    pub sha_hash: [u8; 20],
    pub hash_type: u8,
    pub data_size_uncompressed: u32,
}

impl ChunkHeader {
    pub fn id(&self) -> ChunkId {
        ChunkId::from_bytes(self.guid)
    }

    pub fn is_compressed(&self) -> bool {
        self.stored_as & STORED_COMPRESSED != 0
    }
}

/// Decoded chunk data, owned by whichever store slot currently holds it
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkData {
    id: ChunkId,
    data: Vec<u8>,
    sha_hash: ShaHash,
    rolling_hash: u64,
}

impl ChunkData {
    /// Wrap raw chunk bytes, computing both hashes
    pub fn new(id: ChunkId, data: Vec<u8>) -> Self {
        let sha_hash = ShaHash::of(&data);
        let rolling_hash = rolling_hash(&data);
        Self {
            id,
            data,
            sha_hash,
            rolling_hash,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sha_hash(&self) -> ShaHash {
        self.sha_hash
    }

    pub fn rolling_hash(&self) -> u64 {
        self.rolling_hash
    }

    /// Serialize to the chunk file format
    pub fn serialize(&self, compress: bool) -> Result<Vec<u8>, ChunkError> {
        let payload = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.data)?;
            encoder.finish()?
        } else {
            self.data.clone()
        };

        let header = ChunkHeader {
            version: CHUNK_HEADER_VERSION,
            header_size: CHUNK_HEADER_SIZE,
            data_size_compressed: payload.len() as u32,
            guid: *self.id.as_bytes(),
            rolling_hash: self.rolling_hash,
            stored_as: if compress { STORED_COMPRESSED } else { 0 },
            sha_hash: self.sha_hash.0,
            hash_type: HASH_ROLLING | HASH_SHA1,
            data_size_uncompressed: self.data.len() as u32,
        };

        let mut out = Cursor::new(Vec::with_capacity(CHUNK_HEADER_SIZE as usize + payload.len()));
        header.write(&mut out)?;
        out.write_all(&payload)?;
        Ok(out.into_inner())
    }

    /// Parse and verify a serialized chunk
    pub fn deserialize(bytes: &[u8]) -> Result<Self, ChunkError> {
        let mut cursor = Cursor::new(bytes);
        let header = ChunkHeader::read(&mut cursor)?;
        if header.version == 0 || header.version > CHUNK_HEADER_VERSION {
            return Err(ChunkError::UnsupportedVersion(header.version));
        }

        let start = header.header_size as usize;
        let end = start + header.data_size_compressed as usize;
        if bytes.len() < end {
            return Err(ChunkError::Truncated {
                expected: end,
                actual: bytes.len(),
            });
        }
        let payload = &bytes[start..end];
        let id = header.id();

        let expected = header.data_size_uncompressed as usize;
        let data = if header.is_compressed() {
            let mut data = Vec::with_capacity(expected.min(MAX_PREALLOCATION));
            // One byte past the declared size is enough to detect a lie
            ZlibDecoder::new(payload)
                .take(expected as u64 + 1)
                .read_to_end(&mut data)
                .map_err(|source| ChunkError::Decompress { id, source })?;
            data
        } else {
            payload.to_vec()
        };

        if data.len() != expected {
            return Err(ChunkError::SizeMismatch {
                id,
                expected: header.data_size_uncompressed,
                actual: data.len(),
            });
        }

        let chunk = Self::new(id, data);
        if header.hash_type & HASH_SHA1 != 0 && chunk.sha_hash.0 != header.sha_hash {
            return Err(ChunkError::HashMismatch(id));
        }
        if header.hash_type & HASH_ROLLING != 0 && chunk.rolling_hash != header.rolling_hash {
            return Err(ChunkError::HashMismatch(id));
        }
        Ok(chunk)
    }

    /// Deserialize and check the chunk is the one that was asked for
    pub fn deserialize_expected(bytes: &[u8], expected: ChunkId) -> Result<Self, ChunkError> {
        let chunk = Self::deserialize(bytes)?;
        if chunk.id != expected {
            return Err(ChunkError::WrongChunk {
                expected,
                actual: chunk.id,
            });
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkData {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        ChunkData::new(ChunkId::from_u128(42), data)
    }

    #[test]
    fn test_header_size_matches_layout() -> Result<(), ChunkError> {
        let bytes = ChunkData::new(ChunkId::from_u128(1), Vec::new()).serialize(false)?;
        assert_eq!(bytes.len(), CHUNK_HEADER_SIZE as usize);
        Ok(())
    }

    #[test]
    fn test_compressed_chunk_is_smaller_and_decodes() -> Result<(), ChunkError> {
        let chunk = sample();
        let plain = chunk.serialize(false)?;
        let packed = chunk.serialize(true)?;
        assert!(packed.len() < plain.len());

        let back = ChunkData::deserialize(&packed)?;
        assert_eq!(back, chunk);
        Ok(())
    }

    #[test]
    fn test_corrupt_payload_fails_hash() -> Result<(), ChunkError> {
        let mut bytes = sample().serialize(false)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            ChunkData::deserialize(&bytes),
            Err(ChunkError::HashMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_truncated_and_bad_magic() -> Result<(), ChunkError> {
        let bytes = sample().serialize(false)?;
        assert!(matches!(
            ChunkData::deserialize(&bytes[..bytes.len() - 10]),
            Err(ChunkError::Truncated { .. })
        ));
        assert!(matches!(
            ChunkData::deserialize(&[0u8; 80]),
            Err(ChunkError::Header(_))
        ));
        Ok(())
    }

    #[test]
    fn test_lying_uncompressed_size_is_rejected() -> Result<(), ChunkError> {
        let bytes = sample().serialize(true)?;
        let with_size = |size: u32| {
            let mut patched = bytes.clone();
            patched[62..66].copy_from_slice(&size.to_le_bytes());
            patched
        };

        match ChunkData::deserialize(&with_size(u32::MAX)) {
            Err(ChunkError::SizeMismatch { actual, .. }) => assert_eq!(actual, 4096),
            other => panic!("expected size mismatch, got {:?}", other),
        }
        // Inflation stops one byte past the declared size
        match ChunkData::deserialize(&with_size(10)) {
            Err(ChunkError::SizeMismatch { actual, .. }) => assert_eq!(actual, 11),
            other => panic!("expected size mismatch, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_wrong_chunk_detected() -> Result<(), ChunkError> {
        let bytes = sample().serialize(true)?;
        assert!(matches!(
            ChunkData::deserialize_expected(&bytes, ChunkId::from_u128(7)),
            Err(ChunkError::WrongChunk { .. })
        ));
        Ok(())
    }
}
