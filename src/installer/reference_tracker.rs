//! Ordered chunk references for one construction pass
//!
//! The tracker holds every chunk reference in the order the constructor
//! will consume it. A chunk referenced by N parts appears N times and leaves
//! the referenced set only when its last occurrence is popped.

use crate::manifest::{BuildManifest, ChunkId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// References copied out per lock when scanning ahead
const SCAN_WINDOW: usize = 1024;

#[derive(Debug, Default)]
struct TrackerState {
    references: Vec<ChunkId>,
    cursor: usize,
    /// Outstanding positions of each chunk in `references`
    positions: HashMap<ChunkId, VecDeque<usize>>,
    runtime: HashSet<ChunkId>,
}

#[derive(Debug, Default)]
pub struct ChunkReferenceTracker {
    state: Mutex<TrackerState>,
}

impl ChunkReferenceTracker {
    /// Track an explicit reference sequence
    pub fn from_references(references: Vec<ChunkId>) -> Self {
        let mut positions: HashMap<ChunkId, VecDeque<usize>> = HashMap::new();
        for (position, id) in references.iter().enumerate() {
            positions.entry(*id).or_default().push_back(position);
        }
        Self {
            state: Mutex::new(TrackerState {
                references,
                cursor: 0,
                positions,
                runtime: HashSet::new(),
            }),
        }
    }

    /// Track every part of `files`, in the given file order
    pub fn new<'a>(manifest: &BuildManifest, files: impl IntoIterator<Item = &'a String>) -> Self {
        let references = files
            .into_iter()
            .filter_map(|f| manifest.file_manifest(f))
            .flat_map(|f| f.chunk_parts.iter().map(|p| p.guid))
            .collect();
        Self::from_references(references)
    }

    /// Every chunk still needed
    pub fn referenced_chunks(&self) -> HashSet<ChunkId> {
        self.state.lock().unwrap().positions.keys().copied().collect()
    }

    pub fn is_referenced(&self, id: &ChunkId) -> bool {
        self.state.lock().unwrap().positions.contains_key(id)
    }

    /// How many of `ids` are still needed
    pub fn count_referenced<'a>(&self, ids: impl IntoIterator<Item = &'a ChunkId>) -> usize {
        let state = self.state.lock().unwrap();
        ids.into_iter().filter(|id| state.positions.contains_key(id)).count()
    }

    /// Whether every reference has been consumed
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().positions.is_empty()
    }

    pub fn remaining_references(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.references.len() - state.cursor
    }

    /// Up to `count` distinct upcoming chunks accepted by `predicate`, in
    /// consumption order. The predicate runs without the tracker locked.
    pub fn next_references(&self, count: usize, predicate: impl Fn(&ChunkId) -> bool) -> Vec<ChunkId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut next = 0;
        while out.len() < count {
            let window: Vec<ChunkId> = {
                let state = self.state.lock().unwrap();
                let start = next.max(state.cursor).min(state.references.len());
                let end = (start + SCAN_WINDOW).min(state.references.len());
                next = end;
                state.references[start..end].to_vec()
            };
            if window.is_empty() {
                break;
            }
            for id in window {
                if out.len() >= count {
                    break;
                }
                if seen.insert(id) && predicate(&id) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Position of the next use of each of `ids` still referenced, nearest first
    pub fn next_uses<'a>(&self, ids: impl IntoIterator<Item = &'a ChunkId>) -> Vec<(ChunkId, usize)> {
        let state = self.state.lock().unwrap();
        let mut uses: Vec<(ChunkId, usize)> = ids
            .into_iter()
            .filter_map(|id| state.positions.get(id).and_then(|p| p.front()).map(|p| (*id, *p)))
            .collect();
        uses.sort_by_key(|(_, position)| *position);
        uses
    }

    /// Next uses of the still referenced `ids`, nearest first, along with which
    /// of them are runtime requirements. Both come from the same instant.
    pub fn eviction_view<'a>(&self, ids: impl IntoIterator<Item = &'a ChunkId>) -> (Vec<(ChunkId, usize)>, HashSet<ChunkId>) {
        let state = self.state.lock().unwrap();
        let mut uses: Vec<(ChunkId, usize)> = ids
            .into_iter()
            .filter_map(|id| state.positions.get(id).and_then(|p| p.front()).map(|p| (*id, *p)))
            .collect();
        uses.sort_by_key(|(_, position)| *position);
        let runtime = uses.iter().map(|(id, _)| *id).filter(|id| state.runtime.contains(id)).collect();
        (uses, runtime)
    }

    /// Consume the next reference. Only succeeds when `id` is the chunk at
    /// the head of the queue.
    pub fn pop_reference(&self, id: &ChunkId) -> bool {
        let mut state = self.state.lock().unwrap();
        let cursor = state.cursor;
        if state.references.get(cursor) != Some(id) {
            return false;
        }
        state.cursor += 1;
        let exhausted = match state.positions.get_mut(id) {
            Some(positions) => {
                positions.pop_front();
                positions.is_empty()
            }
            None => false,
        };
        if exhausted {
            state.positions.remove(id);
            state.runtime.remove(id);
        }
        true
    }

    /// Record chunks that were injected at runtime rather than planned
    pub fn mark_runtime_requirements(&self, ids: &HashSet<ChunkId>) {
        let mut state = self.state.lock().unwrap();
        let live: Vec<ChunkId> = ids.iter().filter(|id| state.positions.contains_key(id)).copied().collect();
        state.runtime.extend(live);
    }

    pub fn runtime_requirements(&self) -> HashSet<ChunkId> {
        self.state.lock().unwrap().runtime.clone()
    }
}
