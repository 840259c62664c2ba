//! Hooks for watching block lifecycle events.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::BlockId;
use crate::sync::lock;

/// Receives allocation, free and copy-on-write events from a [`BlockMgr`].
///
/// All methods default to no-ops.
///
/// [`BlockMgr`]: super::BlockMgr
pub trait BlockObserver: Send + Sync {
    fn on_allocate(&self, _id: BlockId) {}

    fn on_free(&self, _id: BlockId) {}

    /// `copy` was allocated as the copy-on-write duplicate of `original`.
    fn on_duplicate(&self, _original: BlockId, _copy: BlockId) {}
}

#[derive(Debug, Default)]
struct TrackerState {
    allocated: HashSet<BlockId>,
    allocations: u64,
    frees: u64,
    duplicates: HashMap<BlockId, BlockId>,
}

/// Records which blocks were duplicated, allocated and freed.
#[derive(Debug, Default)]
pub struct DuplicateTracker {
    state: Mutex<TrackerState>,
}

impl DuplicateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of copy-on-write duplications seen.
    #[must_use]
    pub fn duplicate_count(&self) -> usize {
        lock(&self.state).duplicates.len()
    }

    /// The duplicate made of `original`, if any.
    #[must_use]
    pub fn duplicate_of(&self, original: BlockId) -> Option<BlockId> {
        lock(&self.state).duplicates.get(&original).copied()
    }

    #[must_use]
    pub fn allocation_count(&self) -> u64 {
        lock(&self.state).allocations
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        lock(&self.state).frees
    }

    /// Blocks allocated and not yet freed while observed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        lock(&self.state).allocated.len()
    }

    pub fn reset(&self) {
        *lock(&self.state) = TrackerState::default();
    }
}

impl BlockObserver for DuplicateTracker {
    fn on_allocate(&self, id: BlockId) {
        let mut state = lock(&self.state);
        state.allocated.insert(id);
        state.allocations += 1;
    }

    fn on_free(&self, id: BlockId) {
        let mut state = lock(&self.state);
        state.allocated.remove(&id);
        state.frees += 1;
    }

    fn on_duplicate(&self, original: BlockId, copy: BlockId) {
        lock(&self.state).duplicates.insert(original, copy);
    }
}
