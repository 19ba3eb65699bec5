//! Chunk sources
//!
//! Each source produces chunk data into a shared [`MemoryChunkStore`]:
//! - [`InstallChunkSource`] recycles chunks from a previous installation
//! - [`ChunkDbChunkSource`] reads chunkdb archives on local media
//! - [`CloudChunkSource`] downloads from cloud roots
//!
//! Sources prefetch on their own worker (`run`) in the order the constructor
//! will consume chunks, and serve `get` calls from the constructor thread.

mod chunkdb;
mod cloud;
mod install;

pub use chunkdb::{ChunkDbChunkSource, ChunkDbSourceConfig};
pub use cloud::{CloudChunkSource, CloudSourceConfig};
pub use install::{InstallChunkSource, InstallSourceConfig};

use super::analytics::InstallerAnalytics;
use super::error::InstallerError;
use super::memory_store::MemoryChunkStore;
use super::reference_tracker::ChunkReferenceTracker;
use super::statistics::InstallerStatistics;
use crate::chunk::ChunkData;
use crate::manifest::ChunkId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long blocked calls wait between checks for abort
pub const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Receives chunks a source found it could not provide after all
pub type UnavailableChunksCallback = Box<dyn Fn(HashSet<ChunkId>) + Send + Sync>;

/// Something the constructor can pull chunk data from
pub trait ChunkSource: Send + Sync {
    /// Visit the chunk, loading or waiting for it as the source requires.
    /// Returns false when the source cannot provide it or was aborted.
    fn get(&self, id: &ChunkId, visit: &mut dyn FnMut(&ChunkData)) -> bool;

    /// Ask the source to also provide `ids`. Returns those it cannot help with.
    fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId>;

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback);

    /// Chunks this source is able to provide
    fn available_chunks(&self) -> HashSet<ChunkId>;
}

/// Collaborators shared by every source of one installation pass
#[derive(Clone)]
pub struct SourceContext {
    pub tracker: Arc<ChunkReferenceTracker>,
    pub store: Arc<MemoryChunkStore>,
    pub error: Arc<InstallerError>,
    pub stats: Arc<InstallerStatistics>,
    pub analytics: Arc<InstallerAnalytics>,
}

/// Holder for a source's unavailable-chunks callback
#[derive(Default)]
pub(crate) struct UnavailableNotifier {
    callback: Mutex<Option<UnavailableChunksCallback>>,
}

impl UnavailableNotifier {
    pub(crate) fn set(&self, callback: UnavailableChunksCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    pub(crate) fn notify(&self, ids: HashSet<ChunkId>) {
        if ids.is_empty() {
            return;
        }
        if let Some(callback) = self.callback.lock().unwrap().as_ref() {
            callback(ids);
        }
    }
}

/// Prefetch batch size for the current store slack, or `None` when the
/// store has too little room to bother
pub(crate) fn batch_size(slack: usize, minimum: usize, maximum: usize) -> Option<usize> {
    if slack == 0 || slack < minimum.min(maximum) {
        return None;
    }
    Some(slack.min(maximum))
}

/// Ask each source in turn to take `ids`, returning what none of them took
fn offer(sources: &[Arc<dyn ChunkSource>], ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
    sources.iter().fold(ids, |remaining, source| {
        if remaining.is_empty() {
            remaining
        } else {
            source.add_runtime_requirements(remaining)
        }
    })
}

/// Sources tried in order until one yields the chunk.
///
/// Chunks a member gives up on are offered to the members after it. Whatever
/// none of them take is reported through the chain's own callback.
pub struct ChainedChunkSource {
    sources: Vec<Arc<dyn ChunkSource>>,
    error: Arc<InstallerError>,
    unavailable: Arc<UnavailableNotifier>,
}

impl ChainedChunkSource {
    pub fn new(sources: Vec<Arc<dyn ChunkSource>>, error: Arc<InstallerError>) -> Self {
        let unavailable = Arc::new(UnavailableNotifier::default());
        for (index, source) in sources.iter().enumerate() {
            let later = sources[index + 1..].to_vec();
            let unavailable = unavailable.clone();
            source.set_unavailable_chunks_callback(Box::new(move |ids| {
                unavailable.notify(offer(&later, ids));
            }));
        }
        Self {
            sources,
            error,
            unavailable,
        }
    }
}

impl ChunkSource for ChainedChunkSource {
    fn get(&self, id: &ChunkId, visit: &mut dyn FnMut(&ChunkData)) -> bool {
        for source in &self.sources {
            if self.error.has_error() {
                return false;
            }
            if source.get(id, visit) {
                return true;
            }
        }
        false
    }

    fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
        offer(&self.sources, ids)
    }

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
        self.unavailable.set(callback);
    }

    fn available_chunks(&self) -> HashSet<ChunkId> {
        self.sources.iter().flat_map(|s| s.available_chunks()).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::file_system::DiskFileSystem;
    use crate::installer::analytics::tests::RecordingAnalytics;
    use crate::installer::disk_store::DiskChunkStore;
    use crate::installer::eviction::{EvictionPolicy, RuntimeRequirementPriority};
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Source test fixture: tracker, store with overflow and run-wide sinks
    pub(crate) struct Fixture {
        pub tmp: TempDir,
        pub context: SourceContext,
        pub analytics: Arc<RecordingAnalytics>,
    }

    pub(crate) fn fixture(references: Vec<ChunkId>, capacity: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let stats = Arc::new(InstallerStatistics::new());
        let tracker = Arc::new(ChunkReferenceTracker::from_references(references));
        let overflow = Arc::new(DiskChunkStore::new(
            Arc::new(DiskFileSystem::new()),
            tmp.path().join("PatchData"),
            stats.clone(),
        ));
        let policy = EvictionPolicy::new(tracker.clone(), RuntimeRequirementPriority::Immune);
        let store = Arc::new(MemoryChunkStore::new(capacity, policy, Some(overflow), stats.clone()));
        let analytics = Arc::new(RecordingAnalytics::default());
        Fixture {
            tmp,
            context: SourceContext {
                tracker,
                store,
                error: Arc::new(InstallerError::new()),
                stats,
                analytics: Arc::new(InstallerAnalytics::new(analytics.clone())),
            },
            analytics,
        }
    }

    /// Source backed by a fixed map, for composition tests
    pub(crate) struct MapSource(pub HashMap<ChunkId, Vec<u8>>);

    impl ChunkSource for MapSource {
        fn get(&self, id: &ChunkId, visit: &mut dyn FnMut(&ChunkData)) -> bool {
            match self.0.get(id) {
                Some(data) => {
                    visit(&ChunkData::new(*id, data.clone()));
                    true
                }
                None => false,
            }
        }

        fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
            ids.into_iter().filter(|id| !self.0.contains_key(id)).collect()
        }

        fn set_unavailable_chunks_callback(&self, _callback: UnavailableChunksCallback) {}

        fn available_chunks(&self) -> HashSet<ChunkId> {
            self.0.keys().copied().collect()
        }
    }

    #[test]
    fn test_chain_falls_through_in_order() {
        let a = ChunkId::from_u128(1);
        let b = ChunkId::from_u128(2);
        let first = Arc::new(MapSource([(a, vec![1])].into_iter().collect()));
        let second = Arc::new(MapSource([(a, vec![9]), (b, vec![2])].into_iter().collect()));
        let chain = ChainedChunkSource::new(vec![first, second], Arc::new(InstallerError::new()));

        let mut seen = Vec::new();
        assert!(chain.get(&a, &mut |c| seen.push(c.data()[0])));
        assert!(chain.get(&b, &mut |c| seen.push(c.data()[0])));
        assert!(!chain.get(&ChunkId::from_u128(3), &mut |_| {}));
        assert_eq!(seen, vec![1, 2]);

        let missing = chain.add_runtime_requirements([a, b, ChunkId::from_u128(3)].into_iter().collect());
        assert_eq!(missing, [ChunkId::from_u128(3)].into_iter().collect());
    }

    /// Source that accepts a fixed set of runtime requirements and lets the
    /// test report chunks as lost
    #[derive(Default)]
    struct LossySource {
        accepts: HashSet<ChunkId>,
        accepted: Mutex<HashSet<ChunkId>>,
        unavailable: UnavailableNotifier,
    }

    impl ChunkSource for LossySource {
        fn get(&self, _id: &ChunkId, _visit: &mut dyn FnMut(&ChunkData)) -> bool {
            false
        }

        fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
            let (taken, rest): (HashSet<ChunkId>, HashSet<ChunkId>) =
                ids.into_iter().partition(|id| self.accepts.contains(id));
            self.accepted.lock().unwrap().extend(taken);
            rest
        }

        fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
            self.unavailable.set(callback);
        }

        fn available_chunks(&self) -> HashSet<ChunkId> {
            self.accepts.clone()
        }
    }

    #[test]
    fn test_chain_hands_lost_chunks_down_and_reports_the_rest() {
        let ids: Vec<ChunkId> = (1..=4).map(ChunkId::from_u128).collect();
        let first = Arc::new(LossySource::default());
        let second = Arc::new(LossySource {
            accepts: [ids[0], ids[1]].into_iter().collect(),
            ..Default::default()
        });
        let last = Arc::new(LossySource {
            accepts: [ids[2]].into_iter().collect(),
            ..Default::default()
        });
        let chain = ChainedChunkSource::new(
            vec![first.clone(), second.clone(), last.clone()],
            Arc::new(InstallerError::new()),
        );
        let reported = Arc::new(Mutex::new(HashSet::new()));
        chain.set_unavailable_chunks_callback(Box::new({
            let reported = reported.clone();
            move |lost| reported.lock().unwrap().extend(lost)
        }));

        first.unavailable.notify(ids.iter().copied().collect());
        assert_eq!(*second.accepted.lock().unwrap(), [ids[0], ids[1]].into_iter().collect());
        assert_eq!(*last.accepted.lock().unwrap(), [ids[2]].into_iter().collect());
        assert_eq!(*reported.lock().unwrap(), [ids[3]].into_iter().collect());

        // The last member has nobody to hand to
        last.unavailable.notify([ids[2]].into_iter().collect());
        assert_eq!(reported.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(batch_size(0, 10, 300), None);
        assert_eq!(batch_size(5, 10, 300), None);
        assert_eq!(batch_size(50, 10, 300), Some(50));
        assert_eq!(batch_size(500, 10, 300), Some(300));
    }
}
