//! Chunkdb archive format and packaging
//!
//! A chunkdb file packs serialized chunks behind a table of contents:
//!
//! ```text
//! magic u32 | version u32 | header_size u32 | data_size u64 | num_entries u32
//! entries[num_entries] { guid [u8; 16], offset u64, size u32 }
//! chunk blobs...
//! ```
//!
//! Entry offsets are absolute file positions of each serialized chunk.

use super::{ChunkData, ChunkError};
use crate::file_system::{FileSystem, ReadSeek};
use crate::manifest::{BuildManifest, ChunkId};
use crate::paths::chunk_location;
use anyhow::{bail, Context, Result};
use binrw::{binrw, BinRead, BinWrite};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Current chunkdb header version
pub const CHUNKDB_VERSION: u32 = 1;

/// Fixed part of the header, before the entry table
const HEADER_FIXED_SIZE: u64 = 24;

/// Size of one table entry
const ENTRY_SIZE: u64 = 28;

/// File extension of chunkdb files
pub const CHUNKDB_EXTENSION: &str = "chunkdb";

/// Errors reading chunkdb files
#[derive(Debug, thiserror::Error)]
pub enum ChunkDbError {
    #[error("Invalid chunkdb header: {0}")]
    Header(#[from] binrw::Error),

    #[error("Unsupported chunkdb version {0}")]
    UnsupportedVersion(u32),

    #[error("Chunkdb IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

impl ChunkDbError {
    /// Whether the error means the file handle is unusable, as opposed to bad data
    pub fn is_access_error(&self) -> bool {
        match self {
            ChunkDbError::Io(e) => !matches!(e.kind(), ErrorKind::UnexpectedEof | ErrorKind::InvalidData),
            _ => false,
        }
    }
}

/// One table of contents entry
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDbEntry {
    pub guid: [u8; 16],
    pub offset: u64,
    pub size: u32,
}

impl ChunkDbEntry {
    pub fn id(&self) -> ChunkId {
        ChunkId::from_bytes(self.guid)
    }
}

/// Chunkdb header with its table of contents
#[binrw]
#[brw(little, magic = 0xB1FE3AA3u32)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDbHeader {
    pub version: u32,
    pub header_size: u32,
    /// Bytes of chunk data following the header
    pub data_size: u64,
    #[br(temp)]
    #[bw(calc = entries.len() as u32)]
    num_entries: u32,
    #[br(count = num_entries)]
    pub entries: Vec<ChunkDbEntry>,
}

impl ChunkDbHeader {
    /// Build a header for chunks laid out back to back after the table
    pub fn for_blobs(blobs: &[(ChunkId, u32)]) -> Self {
        let header_size = HEADER_FIXED_SIZE + ENTRY_SIZE * blobs.len() as u64;
        let mut offset = header_size;
        let entries = blobs
            .iter()
            .map(|(id, size)| {
                let entry = ChunkDbEntry {
                    guid: *id.as_bytes(),
                    offset,
                    size: *size,
                };
                offset += *size as u64;
                entry
            })
            .collect();
        Self {
            version: CHUNKDB_VERSION,
            header_size: header_size as u32,
            data_size: offset - header_size,
            entries,
        }
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.entries.iter().map(|e| e.id())
    }
}

/// Read and validate the header of an open chunkdb
pub fn read_header<R: Read + Seek>(reader: &mut R) -> Result<ChunkDbHeader, ChunkDbError> {
    reader.seek(SeekFrom::Start(0))?;
    let header = ChunkDbHeader::read(reader)?;
    if header.version == 0 || header.version > CHUNKDB_VERSION {
        return Err(ChunkDbError::UnsupportedVersion(header.version));
    }
    Ok(header)
}

/// Open a chunkdb file and read its header
pub fn open(fs: &dyn FileSystem, path: &Path) -> Result<(ChunkDbHeader, Box<dyn ReadSeek>), ChunkDbError> {
    let mut reader = fs.open_read(path)?;
    let header = read_header(&mut reader)?;
    Ok((header, reader))
}

/// Read one chunk out of an open chunkdb
pub fn read_chunk<R: Read + Seek>(reader: &mut R, entry: &ChunkDbEntry) -> Result<ChunkData, ChunkDbError> {
    reader.seek(SeekFrom::Start(entry.offset))?;
    let mut blob = vec![0u8; entry.size as usize];
    reader.read_exact(&mut blob)?;
    Ok(ChunkData::deserialize_expected(&blob, entry.id())?)
}

/// Names of the files produced for `output`
fn part_paths(output: &Path, num_parts: usize) -> Vec<PathBuf> {
    if num_parts == 1 {
        return vec![output.with_extension(CHUNKDB_EXTENSION)];
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "chunks".to_string());
    let dir = output.parent().unwrap_or_else(|| Path::new(""));
    (1..=num_parts)
        .map(|n| dir.join(format!("{}.part{:02}.{}", stem, n, CHUNKDB_EXTENSION)))
        .collect()
}

/// Chunks in the order a full install would consume them
fn packaging_order(manifest: &BuildManifest) -> Vec<ChunkId> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for filename in manifest.build_file_list() {
        if let Some(file) = manifest.file_manifest(&filename) {
            for part in &file.chunk_parts {
                if seen.insert(part.guid) {
                    order.push(part.guid);
                }
            }
        }
    }
    for id in manifest.data_list() {
        if seen.insert(id) {
            order.push(id);
        }
    }
    order
}

/// Split blobs into parts of at most `max_size` bytes of chunk data each.
///
/// A part always takes at least one chunk, even an oversized one.
fn partition(blobs: &[(ChunkId, u32)], max_size: u64) -> Vec<Vec<(ChunkId, u32)>> {
    let mut parts: Vec<Vec<(ChunkId, u32)>> = Vec::new();
    let mut current: Vec<(ChunkId, u32)> = Vec::new();
    let mut current_size = 0u64;
    for &(id, size) in blobs {
        if !current.is_empty() && current_size + size as u64 > max_size {
            parts.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push((id, size));
        current_size += size as u64;
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Package every chunk of `manifest` found under `cloud_dir` into chunkdb files.
///
/// Returns the written files in part order.
pub fn package_chunk_data(
    manifest: &BuildManifest,
    cloud_dir: &Path,
    output: &Path,
    max_output_file_size: u64,
) -> Result<Vec<PathBuf>> {
    if max_output_file_size == 0 {
        bail!("Maximum output file size must be greater than zero");
    }
    let cloud_root = cloud_dir.to_string_lossy();

    let mut blobs = Vec::new();
    let mut sources = HashMap::new();
    for id in packaging_order(manifest) {
        let info = manifest
            .chunk_info(&id)
            .with_context(|| format!("Manifest has no info for chunk {}", id))?;
        let path = PathBuf::from(chunk_location(&cloud_root, info));
        let size = std::fs::metadata(&path)
            .with_context(|| format!("Missing chunk file: {}", path.display()))?
            .len();
        blobs.push((id, size as u32));
        sources.insert(id, path);
    }

    let mut parts = partition(&blobs, max_output_file_size);
    if parts.is_empty() {
        // Empty builds still get a valid, empty chunkdb
        parts.push(Vec::new());
    }
    let paths = part_paths(output, parts.len());
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    info!(
        "Packaging {} chunks into {} chunkdb file(s)",
        blobs.len(),
        parts.len()
    );

    for (part, path) in parts.iter().zip(&paths) {
        let header = ChunkDbHeader::for_blobs(part);
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        header
            .write(&mut writer)
            .with_context(|| format!("Failed to write header of {}", path.display()))?;

        for (id, _) in part {
            let source = &sources[id];
            let blob = std::fs::read(source)
                .with_context(|| format!("Failed to read chunk file: {}", source.display()))?;
            ChunkData::deserialize_expected(&blob, *id)
                .with_context(|| format!("Corrupt chunk file: {}", source.display()))?;
            writer.write_all(&blob)?;
        }
        writer.flush()?;
        debug!("Wrote {} ({} chunks)", path.display(), part.len());
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_system::DiskFileSystem;
    use crate::hash::ShaHash;
    use crate::manifest::{ChunkInfo, ChunkPart, FileManifest, ManifestData};
    use tempfile::TempDir;

    const CHUNK_LEN: usize = 1000;

    /// Write `count` chunks into a cloud dir and describe them in a manifest
    fn build_cloud(dir: &Path, count: u128) -> Result<(BuildManifest, HashMap<ChunkId, Vec<u8>>)> {
        let mut chunks = Vec::new();
        let mut parts = Vec::new();
        let mut contents = HashMap::new();
        for i in 0..count {
            let id = ChunkId::from_u128(i + 1);
            let data: Vec<u8> = (0..CHUNK_LEN).map(|b| ((b as u128 * (i + 3)) % 256) as u8).collect();
            let chunk = ChunkData::new(id, data.clone());
            let blob = chunk.serialize(false)?;
            let info = ChunkInfo {
                guid: id,
                hash: chunk.rolling_hash(),
                sha_hash: chunk.sha_hash(),
                group_number: (i % 3) as u8,
                window_size: CHUNK_LEN as u32,
                file_size: blob.len() as u64,
            };
            let path = PathBuf::from(chunk_location(&dir.to_string_lossy(), &info));
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(&path, &blob)?;
            parts.push(ChunkPart {
                guid: id,
                offset: 0,
                size: CHUNK_LEN as u32,
            });
            chunks.push(info);
            contents.insert(id, data);
        }
        let manifest = BuildManifest::new(ManifestData {
            app_name: "Game".into(),
            build_version: "1".into(),
            files: vec![FileManifest {
                filename: "data.pak".into(),
                file_hash: ShaHash::default(),
                chunk_parts: parts,
                install_tags: vec![],
                is_read_only: false,
                is_compressed: false,
                is_unix_executable: false,
            }],
            chunks,
            ..Default::default()
        })?;
        Ok((manifest, contents))
    }

    #[test]
    fn test_two_and_a_half_budgets_make_three_parts() -> Result<()> {
        let tmp = TempDir::new()?;
        let cloud = tmp.path().join("cloud");
        let (manifest, contents) = build_cloud(&cloud, 10)?;
        let blob_size = manifest.data_size(&ChunkId::from_u128(1));

        // 10 equal chunks against a budget of 4 chunks = 2.5 budgets
        let output = tmp.path().join("out/build.chunkdb");
        let files = package_chunk_data(&manifest, &cloud, &output, blob_size * 4)?;
        assert_eq!(files.len(), 3);
        assert!(files[0].to_string_lossy().ends_with("build.part01.chunkdb"));

        let fs = DiskFileSystem::new();
        let mut seen = Vec::new();
        for path in &files {
            let (header, mut reader) = open(&fs, path)?;
            assert!(header.data_size <= blob_size * 4);
            for entry in &header.entries {
                let chunk = read_chunk(&mut reader, entry)?;
                assert_eq!(chunk.data(), contents[&entry.id()].as_slice());
                assert_eq!(Some(chunk.sha_hash()), manifest.chunk_sha_hash(&entry.id()));
                seen.push(entry.id());
            }
        }
        seen.sort();
        let mut expected = manifest.data_list();
        expected.sort();
        assert_eq!(seen, expected);
        Ok(())
    }

    #[test]
    fn test_single_part_uses_plain_name() -> Result<()> {
        let tmp = TempDir::new()?;
        let cloud = tmp.path().join("cloud");
        let (manifest, _) = build_cloud(&cloud, 3)?;

        let files = package_chunk_data(&manifest, &cloud, &tmp.path().join("build"), u64::MAX)?;
        assert_eq!(files, vec![tmp.path().join("build.chunkdb")]);
        Ok(())
    }

    #[test]
    fn test_oversized_chunk_gets_its_own_part() {
        let blobs = vec![
            (ChunkId::from_u128(1), 10),
            (ChunkId::from_u128(2), 500),
            (ChunkId::from_u128(3), 10),
        ];
        let parts = partition(&blobs, 100);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1][0].0, ChunkId::from_u128(2));
    }

    #[test]
    fn test_header_offsets_are_absolute() {
        let header = ChunkDbHeader::for_blobs(&[(ChunkId::from_u128(1), 100), (ChunkId::from_u128(2), 50)]);
        assert_eq!(header.header_size as u64, HEADER_FIXED_SIZE + 2 * ENTRY_SIZE);
        assert_eq!(header.entries[0].offset, header.header_size as u64);
        assert_eq!(header.entries[1].offset, header.header_size as u64 + 100);
        assert_eq!(header.data_size, 150);
    }

    #[test]
    fn test_truncated_chunkdb_is_bad_data_not_lost_media() -> Result<()> {
        let tmp = TempDir::new()?;
        let cloud = tmp.path().join("cloud");
        let (manifest, _) = build_cloud(&cloud, 2)?;
        let files = package_chunk_data(&manifest, &cloud, &tmp.path().join("db"), u64::MAX)?;

        let bytes = std::fs::read(&files[0])?;
        std::fs::write(&files[0], &bytes[..bytes.len() - 100])?;

        let fs = DiskFileSystem::new();
        let (header, mut reader) = open(&fs, &files[0])?;
        let err = read_chunk(&mut reader, &header.entries[1]).unwrap_err();
        assert!(matches!(&err, ChunkDbError::Io(e) if e.kind() == ErrorKind::UnexpectedEof));
        assert!(!err.is_access_error());

        let offline = ChunkDbError::Io(std::io::Error::new(ErrorKind::NotFound, "media removed"));
        assert!(offline.is_access_error());
        Ok(())
    }
}
