//! Build manifest loading and queries
//!
//! This module handles:
//! - Parsing the JSON manifest of a build
//! - Indexing files and chunks for fast lookup
//! - Answering the questions the installer asks: which files are tagged,
//!   which are outdated against an installed build, what needs removing

mod types;

pub use types::*;

use crate::file_system::FileSystem;
use crate::hash::ShaHash;
use crate::paths::join_manifest_path;
use anyhow::{bail, Context, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::info;

/// Read-only, indexed description of one build
#[derive(Debug)]
pub struct BuildManifest {
    data: ManifestData,
    file_index: HashMap<String, usize>,
    chunk_index: HashMap<ChunkId, usize>,
}

impl BuildManifest {
    /// Index manifest data, rejecting parts that point outside known chunks
    pub fn new(data: ManifestData) -> Result<Self> {
        let mut chunk_index = HashMap::with_capacity(data.chunks.len());
        for (idx, chunk) in data.chunks.iter().enumerate() {
            if chunk_index.insert(chunk.guid, idx).is_some() {
                bail!("Duplicate chunk {} in manifest", chunk.guid);
            }
        }

        let mut file_index = HashMap::with_capacity(data.files.len());
        for (idx, file) in data.files.iter().enumerate() {
            if file_index.insert(file.filename.clone(), idx).is_some() {
                bail!("Duplicate file {} in manifest", file.filename);
            }
            for part in &file.chunk_parts {
                let Some(&chunk_idx) = chunk_index.get(&part.guid) else {
                    bail!("File {} references unknown chunk {}", file.filename, part.guid);
                };
                let window = data.chunks[chunk_idx].window_size as u64;
                if part.offset as u64 + part.size as u64 > window {
                    bail!(
                        "File {} reads past the end of chunk {} ({}+{} > {})",
                        file.filename,
                        part.guid,
                        part.offset,
                        part.size,
                        window
                    );
                }
            }
        }

        Ok(Self {
            data,
            file_index,
            chunk_index,
        })
    }

    /// Load a manifest from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading manifest: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Invalid manifest: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let data: ManifestData = serde_json::from_str(json).context("Failed to parse manifest JSON")?;
        Self::new(data)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.data).context("Failed to serialize manifest")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write manifest: {}", path.display()))
    }

    pub fn data(&self) -> &ManifestData {
        &self.data
    }

    pub fn app_name(&self) -> &str {
        &self.data.app_name
    }

    pub fn version_string(&self) -> &str {
        &self.data.build_version
    }

    pub fn num_files(&self) -> usize {
        self.data.files.len()
    }

    /// All build file names, in manifest order
    pub fn build_file_list(&self) -> Vec<String> {
        self.data.files.iter().map(|f| f.filename.clone()).collect()
    }

    pub fn file_manifest(&self, filename: &str) -> Option<&FileManifest> {
        self.file_index.get(filename).map(|&idx| &self.data.files[idx])
    }

    /// Size of a build file, 0 if unknown
    pub fn file_size(&self, filename: &str) -> u64 {
        self.file_manifest(filename).map(|f| f.file_size()).unwrap_or(0)
    }

    /// Combined size of a set of build files
    pub fn files_size<'a>(&self, filenames: impl IntoIterator<Item = &'a String>) -> u64 {
        filenames.into_iter().map(|f| self.file_size(f)).sum()
    }

    pub fn file_hash(&self, filename: &str) -> Option<ShaHash> {
        self.file_manifest(filename).map(|f| f.file_hash)
    }

    /// Total size of all build files
    pub fn build_size(&self) -> u64 {
        self.data.files.iter().map(|f| f.file_size()).sum()
    }

    pub fn chunk_info(&self, id: &ChunkId) -> Option<&ChunkInfo> {
        self.chunk_index.get(id).map(|&idx| &self.data.chunks[idx])
    }

    /// Size of a chunk's data file, 0 if unknown
    pub fn data_size(&self, id: &ChunkId) -> u64 {
        self.chunk_info(id).map(|c| c.file_size).unwrap_or(0)
    }

    /// Combined data file size of a set of chunks
    pub fn data_size_of<'a>(&self, ids: impl IntoIterator<Item = &'a ChunkId>) -> u64 {
        ids.into_iter().map(|id| self.data_size(id)).sum()
    }

    pub fn chunk_sha_hash(&self, id: &ChunkId) -> Option<ShaHash> {
        self.chunk_info(id).map(|c| c.sha_hash)
    }

    pub fn chunk_window_size(&self, id: &ChunkId) -> Option<u32> {
        self.chunk_info(id).map(|c| c.window_size)
    }

    /// Every chunk the manifest knows about
    pub fn data_list(&self) -> Vec<ChunkId> {
        self.data.chunks.iter().map(|c| c.guid).collect()
    }

    /// Chunks referenced by the given files
    pub fn chunks_for_files<'a>(&self, filenames: impl IntoIterator<Item = &'a String>) -> HashSet<ChunkId> {
        filenames
            .into_iter()
            .filter_map(|f| self.file_manifest(f))
            .flat_map(|f| f.chunk_parts.iter().map(|p| p.guid))
            .collect()
    }

    pub fn prereq_name(&self) -> &str {
        &self.data.prereq_name
    }

    pub fn prereq_path(&self) -> &str {
        &self.data.prereq_path
    }

    pub fn prereq_args(&self) -> &str {
        &self.data.prereq_args
    }

    pub fn prereq_ids(&self) -> &[String] {
        &self.data.prereq_ids
    }

    /// Whether any file carries attributes that need applying
    pub fn has_file_attributes(&self) -> bool {
        self.data.files.iter().any(|f| f.has_attributes())
    }

    /// Every install tag used by the build. Untagged files use the empty tag.
    pub fn file_tag_list(&self) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        for file in &self.data.files {
            if file.install_tags.is_empty() {
                tags.insert(String::new());
            }
            tags.extend(file.install_tags.iter().cloned());
        }
        tags
    }

    /// Files selected by at least one of the given tags
    pub fn tagged_file_list(&self, tags: &BTreeSet<String>) -> BTreeSet<String> {
        self.data
            .files
            .iter()
            .filter(|file| {
                if file.install_tags.is_empty() {
                    tags.contains("")
                } else {
                    file.install_tags.iter().any(|t| tags.contains(t))
                }
            })
            .map(|f| f.filename.clone())
            .collect()
    }

    /// Whether a file differs between this build and `current`
    pub fn is_file_outdated(&self, current: &BuildManifest, filename: &str) -> bool {
        match (self.file_manifest(filename), current.file_manifest(filename)) {
            (Some(new), Some(old)) => new.file_hash != old.file_hash,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Files that must be constructed to turn `install_dir` into this build.
    ///
    /// Without a current build every file is outdated. With one, files are
    /// outdated when new, changed, or when the installed copy has the wrong size.
    pub fn outdated_files(
        &self,
        current: Option<&BuildManifest>,
        install_dir: &Path,
        fs: &dyn FileSystem,
    ) -> BTreeSet<String> {
        let Some(current) = current else {
            return self.data.files.iter().map(|f| f.filename.clone()).collect();
        };

        self.data
            .files
            .iter()
            .filter(|file| {
                if self.is_file_outdated(current, &file.filename) {
                    return true;
                }
                let installed = fs.file_size(&join_manifest_path(install_dir, &file.filename));
                installed != Some(file.file_size())
            })
            .map(|f| f.filename.clone())
            .collect()
    }

    /// Files of `old` that are no longer part of this build
    pub fn removable_files(&self, old: &BuildManifest) -> Vec<String> {
        old.data
            .files
            .iter()
            .filter(|f| !self.file_index.contains_key(&f.filename))
            .map(|f| f.filename.clone())
            .collect()
    }

    /// Download size of the chunks needed for the given files
    pub fn download_size<'a>(&self, filenames: impl IntoIterator<Item = &'a String>) -> u64 {
        let chunks = self.chunks_for_files(filenames);
        self.data_size_of(chunks.iter())
    }
}
