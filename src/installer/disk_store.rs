//! Disk overflow for chunks booted out of memory
//!
//! Chunks are written uncompressed to `PatchData/<GUID>.chunk` and read back
//! at most once. Every save and load is counted in the installer statistics.

use super::memory_store::ChunkStore;
use super::statistics::InstallerStatistics;
use crate::chunk::ChunkData;
use crate::file_system::FileSystem;
use crate::manifest::ChunkId;
use crate::paths::overflow_chunk_path;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub struct DiskChunkStore {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    stored: Mutex<HashSet<ChunkId>>,
    stats: Arc<InstallerStatistics>,
}

impl DiskChunkStore {
    pub fn new(fs: Arc<dyn FileSystem>, dir: impl Into<PathBuf>, stats: Arc<InstallerStatistics>) -> Self {
        Self {
            fs,
            dir: dir.into(),
            stored: Mutex::new(HashSet::new()),
            stats,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn save(&self, chunk: &ChunkData) -> anyhow::Result<()> {
        let bytes = chunk.serialize(false)?;
        self.fs.make_dirs(&self.dir)?;
        let mut file = self.fs.create_write(&overflow_chunk_path(&self.dir, &chunk.id()))?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    fn load(&self, id: &ChunkId) -> anyhow::Result<ChunkData> {
        let mut file = self.fs.open_read(&overflow_chunk_path(&self.dir, id))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(ChunkData::deserialize_expected(&bytes, *id)?)
    }

    /// Load a chunk and drop it from disk
    pub fn take(&self, id: &ChunkId) -> Option<ChunkData> {
        if !self.stored.lock().unwrap().remove(id) {
            return None;
        }
        let result = self.load(id);
        self.stats.on_cache_load(result.is_ok());
        if let Err(e) = self.fs.delete_file(&overflow_chunk_path(&self.dir, id)) {
            debug!("Failed to delete overflow chunk {}: {}", id, e);
        }
        match result {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                warn!("Overflow chunk {} could not be read back: {:#}", id, e);
                None
            }
        }
    }

    /// Delete everything this store wrote. Chunks whose file could not be
    /// deleted stay tracked so a later clear retries them.
    pub fn clear(&self) {
        let mut stored = self.stored.lock().unwrap();
        stored.retain(|id| match self.fs.delete_file(&overflow_chunk_path(&self.dir, id)) {
            Ok(()) => false,
            Err(e) => {
                warn!("Failed to delete overflow chunk {}: {}", id, e);
                true
            }
        });
    }
}

impl ChunkStore for DiskChunkStore {
    fn put(&self, chunk: ChunkData) {
        let result = self.save(&chunk);
        self.stats.on_cache_save(result.is_ok());
        match result {
            Ok(()) => {
                self.stored.lock().unwrap().insert(chunk.id());
            }
            Err(e) => warn!("Failed to write overflow chunk {}: {:#}", chunk.id(), e),
        }
    }

    fn get(&self, id: &ChunkId, visit: &mut dyn FnMut(&ChunkData)) -> bool {
        if !self.contains(id) {
            return false;
        }
        match self.load(id) {
            Ok(chunk) => {
                self.stats.on_cache_load(true);
                visit(&chunk);
                true
            }
            Err(e) => {
                self.stats.on_cache_load(false);
                warn!("Overflow chunk {} could not be read: {:#}", id, e);
                false
            }
        }
    }

    fn remove(&self, id: &ChunkId) -> Option<ChunkData> {
        self.take(id)
    }

    fn contains(&self, id: &ChunkId) -> bool {
        self.stored.lock().unwrap().contains(id)
    }

    /// Disk space is treated as unbounded
    fn slack(&self) -> usize {
        usize::MAX
    }

    fn size(&self) -> usize {
        self.stored.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_system::testing::TestFileSystem;
    use crate::file_system::DiskFileSystem;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    #[test]
    fn test_overflow_round_trip_deletes_file() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let stats = Arc::new(InstallerStatistics::new());
        let store = DiskChunkStore::new(Arc::new(DiskFileSystem::new()), tmp.path().join("PatchData"), stats.clone());

        let id = ChunkId::from_u128(7);
        store.put(ChunkData::new(id, vec![3u8; 4096]));
        assert!(store.contains(&id));
        assert!(overflow_chunk_path(store.dir(), &id).exists());

        let loaded = store.take(&id).expect("chunk should load");
        assert_eq!(loaded.data(), &[3u8; 4096][..]);
        assert!(!store.contains(&id));
        assert!(!overflow_chunk_path(store.dir(), &id).exists());
        assert!(store.take(&id).is_none());

        assert_eq!(stats.num_cache_saves(), 1);
        assert_eq!(stats.num_cache_loads(), 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_overflow_counts_failure() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let stats = Arc::new(InstallerStatistics::new());
        let store = DiskChunkStore::new(Arc::new(DiskFileSystem::new()), tmp.path(), stats.clone());

        let id = ChunkId::from_u128(9);
        store.put(ChunkData::new(id, vec![1u8; 64]));
        std::fs::write(overflow_chunk_path(tmp.path(), &id), b"garbage")?;

        assert!(store.take(&id).is_none());
        assert_eq!(stats.num_cache_load_failures(), 1);
        Ok(())
    }

    #[test]
    fn test_clear_keeps_chunks_it_could_not_delete() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let fs = Arc::new(TestFileSystem::new());
        let store = DiskChunkStore::new(fs.clone(), tmp.path(), Arc::new(InstallerStatistics::new()));
        let ids: Vec<ChunkId> = (1..=3).map(ChunkId::from_u128).collect();
        for id in &ids {
            store.put(ChunkData::new(*id, vec![5u8; 128]));
        }

        fs.refuse_deletes.store(true, Ordering::SeqCst);
        store.clear();
        assert_eq!(store.size(), 3);
        assert!(ids.iter().all(|id| overflow_chunk_path(tmp.path(), id).exists()));

        fs.refuse_deletes.store(false, Ordering::SeqCst);
        store.clear();
        assert_eq!(store.size(), 0);
        assert!(ids.iter().all(|id| !overflow_chunk_path(tmp.path(), id).exists()));
        Ok(())
    }
}
