//! Furthest-in-future eviction
//!
//! Reference order is known for the whole pass, so the store evicts the
//! resident chunk whose next use is furthest away. Chunks with no remaining
//! use are cleaned before anything is booted.

use super::reference_tracker::ChunkReferenceTracker;
use crate::manifest::ChunkId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// How chunks injected through runtime requirements compete for memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RuntimeRequirementPriority {
    /// Runtime chunks are booted only when nothing else can be
    #[default]
    Immune,
    /// Runtime chunks are ranked by next use like any other
    Equal,
}

/// Chunks a store should drop to get back under capacity
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// No longer referenced, can be dropped
    pub clean: HashSet<ChunkId>,
    /// Still referenced, should move to overflow
    pub boot: Vec<ChunkId>,
}

#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    tracker: Arc<ChunkReferenceTracker>,
    priority: RuntimeRequirementPriority,
}

impl EvictionPolicy {
    pub fn new(tracker: Arc<ChunkReferenceTracker>, priority: RuntimeRequirementPriority) -> Self {
        Self { tracker, priority }
    }

    pub fn tracker(&self) -> &Arc<ChunkReferenceTracker> {
        &self.tracker
    }

    /// Pick chunks to drop so at most `capacity` of `resident` remain.
    /// `protect` is never chosen.
    pub fn query(&self, resident: &HashSet<ChunkId>, capacity: usize, protect: Option<&ChunkId>) -> EvictionPlan {
        // One snapshot, so a reference popped mid-query can't leave a chunk
        // neither clean nor a boot candidate
        let (uses, runtime) = self.tracker.eviction_view(resident.iter());
        let referenced: HashSet<ChunkId> = uses.iter().map(|(id, _)| *id).collect();

        let clean: HashSet<ChunkId> = resident
            .iter()
            .filter(|id| !referenced.contains(id) && Some(*id) != protect)
            .copied()
            .collect();

        let remaining = resident.len() - clean.len();
        if remaining <= capacity {
            return EvictionPlan { clean, boot: Vec::new() };
        }
        let excess = remaining - capacity;

        // Nearest first; the tail is what we boot
        let mut order: Vec<ChunkId> = uses
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| Some(id) != protect)
            .collect();

        if self.priority == RuntimeRequirementPriority::Immune {
            let (immune, others): (Vec<ChunkId>, Vec<ChunkId>) =
                order.into_iter().partition(|id| runtime.contains(id));
            order = immune;
            order.extend(others);
        }

        let boot = order.into_iter().rev().take(excess).collect();
        EvictionPlan { clean, boot }
    }
}
