//! Bounded in-memory chunk store
//!
//! Holds at most `capacity` chunks. When a put goes over, unreferenced
//! chunks are cleaned and then the chunk used furthest in the future is
//! booted to the optional disk overflow. Readers that find a booted chunk
//! pull it back into memory.
//!
//! Chunks are lent to readers with the store locked and never copied, so a
//! resident chunk is counted exactly once.

use super::disk_store::DiskChunkStore;
use super::eviction::EvictionPolicy;
use super::statistics::InstallerStatistics;
use crate::chunk::ChunkData;
use crate::manifest::ChunkId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Somewhere chunk data can be parked until the constructor needs it
pub trait ChunkStore: Send + Sync {
    fn put(&self, chunk: ChunkData);

    /// Visit a stored chunk without copying it. Returns false when absent.
    fn get(&self, id: &ChunkId, visit: &mut dyn FnMut(&ChunkData)) -> bool;

    fn remove(&self, id: &ChunkId) -> Option<ChunkData>;

    fn contains(&self, id: &ChunkId) -> bool;

    /// How many more referenced chunks fit before something must be booted
    fn slack(&self) -> usize;

    fn size(&self) -> usize;
}

pub struct MemoryChunkStore {
    chunks: Mutex<HashMap<ChunkId, ChunkData>>,
    arrived: Condvar,
    capacity: usize,
    policy: EvictionPolicy,
    overflow: Option<Arc<DiskChunkStore>>,
    stats: Arc<InstallerStatistics>,
}

impl MemoryChunkStore {
    pub fn new(
        capacity: usize,
        policy: EvictionPolicy,
        overflow: Option<Arc<DiskChunkStore>>,
        stats: Arc<InstallerStatistics>,
    ) -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
            capacity: capacity.max(1),
            policy,
            overflow,
            stats,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the chunk is resident in memory, ignoring overflow
    pub fn is_resident(&self, id: &ChunkId) -> bool {
        self.chunks.lock().unwrap().contains_key(id)
    }

    /// Block until `id` is available or `timeout` passes
    pub fn wait_for(&self, id: &ChunkId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut chunks = self.chunks.lock().unwrap();
        loop {
            if chunks.contains_key(id) || self.overflow.as_ref().is_some_and(|o| o.contains(id)) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            chunks = self.arrived.wait_timeout(chunks, deadline - now).unwrap().0;
        }
    }

    /// Drop or boot chunks until the store fits its capacity
    fn evict(&self, chunks: &mut HashMap<ChunkId, ChunkData>, protect: Option<&ChunkId>) {
        if chunks.len() <= self.capacity {
            return;
        }
        let resident: HashSet<ChunkId> = chunks.keys().copied().collect();
        let plan = self.policy.query(&resident, self.capacity, protect);

        for id in &plan.clean {
            chunks.remove(id);
            self.stats.on_chunk_cleaned();
        }
        for id in &plan.boot {
            let Some(chunk) = chunks.remove(id) else {
                continue;
            };
            self.stats.on_chunk_booted(id);
            if let Some(overflow) = &self.overflow {
                overflow.put(chunk);
            }
        }
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, chunk: ChunkData) {
        let mut chunks = self.chunks.lock().unwrap();
        chunks.insert(chunk.id(), chunk);
        self.evict(&mut chunks, None);
        drop(chunks);
        self.arrived.notify_all();
    }

    fn get(&self, id: &ChunkId, visit: &mut dyn FnMut(&ChunkData)) -> bool {
        let mut chunks = self.chunks.lock().unwrap();
        if !chunks.contains_key(id) {
            let Some(restored) = self.overflow.as_ref().and_then(|o| o.take(id)) else {
                return false;
            };
            chunks.insert(*id, restored);
            self.evict(&mut chunks, Some(id));
        }
        match chunks.get(id) {
            Some(chunk) => {
                visit(chunk);
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: &ChunkId) -> Option<ChunkData> {
        let removed = self.chunks.lock().unwrap().remove(id);
        removed.or_else(|| self.overflow.as_ref().and_then(|o| o.take(id)))
    }

    fn contains(&self, id: &ChunkId) -> bool {
        self.is_resident(id) || self.overflow.as_ref().is_some_and(|o| o.contains(id))
    }

    fn slack(&self) -> usize {
        let chunks = self.chunks.lock().unwrap();
        let used = self.policy.tracker().count_referenced(chunks.keys());
        self.capacity.saturating_sub(used)
    }

    fn size(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }
}
