//! Reads chunks out of local chunkdb archives
//!
//! Chunkdb files often live on removable media. When a read fails with an
//! IO error the source closes every handle, reports `AccessLost` through the
//! message pump, and keeps trying to reopen on an interval until the media
//! comes back or the source is aborted.

use super::{batch_size, ChunkSource, SourceContext, UnavailableChunksCallback, UnavailableNotifier, WAIT_INTERVAL};
use crate::chunk::chunkdb::{self, ChunkDbEntry, ChunkDbError};
use crate::chunk::ChunkData;
use crate::file_system::{FileSystem, ReadSeek};
use crate::installer::control::{ControlFlags, Controllable};
use crate::installer::message_pump::{ChunkSourceEvent, ChunkSourceEventType, MessagePump};
use crate::manifest::ChunkId;
use crate::installer::memory_store::ChunkStore;
use crate::platform::Platform;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ChunkDbSourceConfig {
    pub chunk_database_files: Vec<PathBuf>,
    pub prefetch_minimum: usize,
    pub prefetch_maximum: usize,
    /// Delay between attempts at reopening lost files
    pub open_retry_time: Duration,
}

struct DbFile {
    path: PathBuf,
    reader: Option<Box<dyn ReadSeek>>,
}

pub struct ChunkDbChunkSource {
    config: ChunkDbSourceConfig,
    fs: Arc<dyn FileSystem>,
    platform: Arc<dyn Platform>,
    pump: Arc<MessagePump>,
    context: SourceContext,
    /// Which file and entry holds each chunk
    toc: HashMap<ChunkId, (usize, ChunkDbEntry)>,
    files: Mutex<Vec<DbFile>>,
    failed: Mutex<HashSet<ChunkId>>,
    unavailable: UnavailableNotifier,
    control: ControlFlags,
}

impl ChunkDbChunkSource {
    pub fn new(
        config: ChunkDbSourceConfig,
        fs: Arc<dyn FileSystem>,
        platform: Arc<dyn Platform>,
        pump: Arc<MessagePump>,
        context: SourceContext,
    ) -> Self {
        let mut toc = HashMap::new();
        let mut files = Vec::with_capacity(config.chunk_database_files.len());
        for (index, path) in config.chunk_database_files.iter().enumerate() {
            let reader = match chunkdb::open(fs.as_ref(), path) {
                Ok((header, reader)) => {
                    debug!("Opened {} with {} chunks", path.display(), header.entries.len());
                    for entry in header.entries {
                        // First file listing a chunk wins
                        toc.entry(entry.id()).or_insert((index, entry));
                    }
                    Some(reader)
                }
                Err(e) => {
                    warn!("Failed to open chunkdb {}: {}", path.display(), e);
                    None
                }
            };
            files.push(DbFile {
                path: path.clone(),
                reader,
            });
        }
        info!("Chunkdb source: {} chunks in {} file(s)", toc.len(), files.len());

        Self {
            config,
            fs,
            platform,
            pump,
            context,
            toc,
            files: Mutex::new(files),
            failed: Mutex::new(HashSet::new()),
            unavailable: UnavailableNotifier::default(),
            control: ControlFlags::new(),
        }
    }

    fn can_load(&self, id: &ChunkId) -> bool {
        self.toc.contains_key(id) && !self.failed.lock().unwrap().contains(id)
    }

    fn should_stop(&self) -> bool {
        self.control.is_aborted() || self.context.error.has_error() || self.context.tracker.is_empty()
    }

    /// Sleep for `duration`, waking early on abort
    fn sleep_unless_aborted(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.control.is_aborted() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.platform.sleep((deadline - now).min(WAIT_INTERVAL));
        }
    }

    /// Close every handle and reopen until `index` is readable again.
    /// Returns false if aborted first.
    fn regain_access(&self, files: &mut [DbFile], index: usize) -> bool {
        let location = files[index].path.display().to_string();
        warn!("Lost access to chunkdb {}", location);
        self.platform.set_os_error_dialogs(false);
        self.pump.send(ChunkSourceEvent {
            event: ChunkSourceEventType::AccessLost,
            location: location.clone(),
        });
        for file in files.iter_mut() {
            file.reader = None;
        }

        let regained = loop {
            if self.control.is_aborted() {
                break false;
            }
            for file in files.iter_mut().filter(|f| f.reader.is_none()) {
                if let Ok((_, reader)) = chunkdb::open(self.fs.as_ref(), &file.path) {
                    file.reader = Some(reader);
                }
            }
            if files[index].reader.is_some() {
                break true;
            }
            self.sleep_unless_aborted(self.config.open_retry_time);
        };

        if regained {
            info!("Regained access to chunkdb {}", location);
            self.pump.send(ChunkSourceEvent {
                event: ChunkSourceEventType::AccessRegained,
                location,
            });
        }
        self.platform.set_os_error_dialogs(true);
        regained
    }

    /// `None` when aborted while waiting for the media
    fn read(&self, index: usize, entry: &ChunkDbEntry) -> Option<Result<ChunkData, ChunkDbError>> {
        let mut guard = self.files.lock().unwrap();
        let files = guard.as_mut_slice();
        let attempt = |files: &mut [DbFile]| match files[index].reader.as_mut() {
            Some(reader) => chunkdb::read_chunk(reader, entry),
            None => Err(ChunkDbError::Io(io::Error::new(io::ErrorKind::NotFound, "chunkdb is not open"))),
        };

        match attempt(&mut *files) {
            Err(e) if e.is_access_error() => {
                debug!("Chunkdb read failed: {}", e);
                if !self.regain_access(&mut *files, index) {
                    return None;
                }
                Some(attempt(&mut *files))
            }
            other => Some(other),
        }
    }

    fn load(&self, id: &ChunkId) -> bool {
        let Some((index, entry)) = self.toc.get(id) else {
            return false;
        };
        match self.read(*index, entry) {
            Some(Ok(chunk)) => {
                self.context.stats.on_chunkdb_load();
                self.context.store.put(chunk);
                true
            }
            Some(Err(e)) => {
                warn!("Failed to load chunk {} from chunkdb: {}", id, e);
                self.context.stats.on_chunkdb_failed(id);
                let filename = self.config.chunk_database_files[*index].display().to_string();
                let os_error = match &e {
                    ChunkDbError::Io(io) => io.raw_os_error().unwrap_or(0),
                    _ => 0,
                };
                self.context
                    .analytics
                    .record_chunk_cache_error(id, &filename, os_error, "ChunkDb", &e.to_string());
                self.failed.lock().unwrap().insert(*id);
                self.unavailable.notify([*id].into_iter().collect());
                false
            }
            None => false,
        }
    }

    /// Prefetch worker
    pub fn run(&self) {
        debug!("Chunkdb source worker started");
        while !self.should_stop() {
            self.control.wait_while_paused();
            let store = &self.context.store;
            let mut loaded = 0;
            if let Some(count) = batch_size(store.slack(), self.config.prefetch_minimum, self.config.prefetch_maximum) {
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
        debug!("Chunkdb source worker finished");
    }
}

impl ChunkSource for ChunkDbChunkSource {
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
        self.toc.keys().copied().collect()
    }
}

impl Controllable for ChunkDbChunkSource {
    fn set_paused(&self, paused: bool) {
        self.control.set_paused(paused);
    }

    fn abort(&self) {
        self.control.abort();
    }
}
