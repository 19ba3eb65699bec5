//! Recycles chunks out of an existing installation
//!
//! A chunk is available when the files of the installed build, present on
//! disk at their manifest size, hold every byte of its window. Recycled data
//! is SHA checked against the manifest before it enters the store.

use super::{batch_size, ChunkSource, SourceContext, UnavailableChunksCallback, UnavailableNotifier, WAIT_INTERVAL};
use crate::chunk::ChunkData;
use crate::file_system::FileSystem;
use crate::hash::ShaHash;
use crate::installer::control::{ControlFlags, Controllable};
use crate::installer::memory_store::ChunkStore;
use crate::manifest::{BuildManifest, ChunkId};
use crate::paths::join_manifest_path;
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// One installed byte range holding part of a chunk
#[derive(Debug, Clone)]
struct Piece {
    filename: String,
    file_offset: u64,
    chunk_offset: u32,
    size: u32,
}

impl Piece {
    fn chunk_end(&self) -> u64 {
        self.chunk_offset as u64 + self.size as u64
    }
}

#[derive(Debug, Clone)]
pub struct InstallSourceConfig {
    pub install_directory: PathBuf,
    pub batch_fetch_minimum: usize,
    pub batch_fetch_maximum: usize,
}

pub struct InstallChunkSource {
    config: InstallSourceConfig,
    fs: Arc<dyn FileSystem>,
    install_manifest: Arc<BuildManifest>,
    context: SourceContext,
    /// Pieces covering each recyclable chunk, in chunk order
    layout: HashMap<ChunkId, Vec<Piece>>,
    failed: Mutex<HashSet<ChunkId>>,
    unavailable: UnavailableNotifier,
    control: ControlFlags,
}

impl InstallChunkSource {
    /// `installed` describes the build currently on disk. Chunks in
    /// `ignore` are left to other sources.
    pub fn new(
        config: InstallSourceConfig,
        fs: Arc<dyn FileSystem>,
        installed: &BuildManifest,
        install_manifest: Arc<BuildManifest>,
        ignore: &HashSet<ChunkId>,
        context: SourceContext,
    ) -> Self {
        let referenced = context.tracker.referenced_chunks();
        let layout = enumerate_recyclable(&config, fs.as_ref(), installed, &install_manifest, &referenced, ignore);
        info!(
            "Install source: {} chunks recyclable from {}",
            layout.len(),
            config.install_directory.display()
        );
        Self {
            config,
            fs,
            install_manifest,
            context,
            layout,
            failed: Mutex::new(HashSet::new()),
            unavailable: UnavailableNotifier::default(),
            control: ControlFlags::new(),
        }
    }

    fn can_load(&self, id: &ChunkId) -> bool {
        self.layout.contains_key(id) && !self.failed.lock().unwrap().contains(id)
    }

    fn should_stop(&self) -> bool {
        self.control.is_aborted() || self.context.error.has_error() || self.context.tracker.is_empty()
    }

    fn assemble(&self, id: &ChunkId) -> Result<ChunkData> {
        let Some(pieces) = self.layout.get(id) else {
            bail!("Chunk {} is not part of the installation", id);
        };
        let window = pieces.iter().map(Piece::chunk_end).max().unwrap_or(0) as usize;
        let mut data = vec![0u8; window];
        for piece in pieces {
            let path = join_manifest_path(&self.config.install_directory, &piece.filename);
            let mut file = self
                .fs
                .open_read(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            file.seek(SeekFrom::Start(piece.file_offset))?;
            let start = piece.chunk_offset as usize;
            file.read_exact(&mut data[start..start + piece.size as usize])
                .with_context(|| format!("Failed to read {}", path.display()))?;
        }

        if let Some(expected) = self.install_manifest.chunk_sha_hash(id).filter(|h| !h.is_zero()) {
            let actual = ShaHash::of(&data);
            if actual != expected {
                bail!("Hash mismatch: expected {}, got {}", expected.to_hex(), actual.to_hex());
            }
        }
        Ok(ChunkData::new(*id, data))
    }

    /// Recycle one chunk into the store
    fn load(&self, id: &ChunkId) -> bool {
        match self.assemble(id) {
            Ok(chunk) => {
                self.context.stats.on_chunk_recycled();
                self.context.store.put(chunk);
                true
            }
            Err(e) => {
                warn!("Failed to recycle chunk {}: {:#}", id, e);
                self.context.stats.on_recycle_failed(id);
                let filename = self
                    .layout
                    .get(id)
                    .and_then(|p| p.first())
                    .map(|p| p.filename.clone())
                    .unwrap_or_default();
                let os_error = e
                    .downcast_ref::<std::io::Error>()
                    .and_then(|io| io.raw_os_error())
                    .unwrap_or(0);
                self.context
                    .analytics
                    .record_chunk_cache_error(id, &filename, os_error, "ChunkRecycle", &format!("{:#}", e));
                self.failed.lock().unwrap().insert(*id);
                self.unavailable.notify([*id].into_iter().collect());
                false
            }
        }
    }

    /// Prefetch worker. Returns once aborted, on error, or when construction
    /// no longer needs anything.
    pub fn run(&self) {
        debug!("Install source worker started");
        while !self.should_stop() {
            self.control.wait_while_paused();
            let store = &self.context.store;
            let mut loaded = 0;
            if let Some(count) = batch_size(
                store.slack(),
                self.config.batch_fetch_minimum,
                self.config.batch_fetch_maximum,
            ) {
                let batch = self
                    .context
                    .tracker
                    .next_references(count, |id| self.can_load(id) && !store.contains(id));
                for id in batch {
                    if self.should_stop() {
                        break;
                    }
                    if self.load(&id) {
                        loaded += 1;
                    }
                }
            }
            if loaded == 0 {
                std::thread::sleep(WAIT_INTERVAL);
            }
        }
        debug!("Install source worker finished");
    }
}

/// Map each referenced chunk to installed pieces covering its whole window
fn enumerate_recyclable(
    config: &InstallSourceConfig,
    fs: &dyn FileSystem,
    installed: &BuildManifest,
    install_manifest: &BuildManifest,
    referenced: &HashSet<ChunkId>,
    ignore: &HashSet<ChunkId>,
) -> HashMap<ChunkId, Vec<Piece>> {
    let mut candidates: HashMap<ChunkId, Vec<Piece>> = HashMap::new();
    for file in &installed.data().files {
        let path = join_manifest_path(&config.install_directory, &file.filename);
        if fs.file_size(&path) != Some(file.file_size()) {
            continue;
        }
        for (file_offset, part) in file.parts_with_offsets() {
            if !referenced.contains(&part.guid) || ignore.contains(&part.guid) {
                continue;
            }
            candidates.entry(part.guid).or_default().push(Piece {
                filename: file.filename.clone(),
                file_offset,
                chunk_offset: part.offset,
                size: part.size,
            });
        }
    }

    candidates
        .into_iter()
        .filter_map(|(id, mut pieces)| {
            let window = install_manifest
                .chunk_window_size(&id)
                .or_else(|| installed.chunk_window_size(&id))? as u64;
            pieces.sort_by_key(|p| (p.chunk_offset, std::cmp::Reverse(p.size)));

            let mut covered = 0u64;
            let mut chosen = Vec::new();
            for piece in pieces {
                if covered >= window {
                    break;
                }
                if piece.chunk_offset as u64 <= covered && piece.chunk_end() > covered {
                    covered = piece.chunk_end();
                    chosen.push(piece);
                }
            }
            (covered >= window).then_some((id, chosen))
        })
        .collect()
}

impl ChunkSource for InstallChunkSource {
    fn get(&self, id: &ChunkId, visit: &mut dyn FnMut(&ChunkData)) -> bool {
        let store = &self.context.store;
        if store.get(id, visit) {
            return true;
        }
        if self.control.is_aborted() || !self.can_load(id) {
            return false;
        }
        self.load(id) && store.get(id, visit)
    }

    fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
        ids.into_iter().filter(|id| !self.can_load(id)).collect()
    }

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
        self.unavailable.set(callback);
    }

    fn available_chunks(&self) -> HashSet<ChunkId> {
        self.layout.keys().copied().collect()
    }
}

impl Controllable for InstallChunkSource {
    fn set_paused(&self, paused: bool) {
        self.control.set_paused(paused);
    }

    fn abort(&self) {
        self.control.abort();
    }
}
