//! Bounded read cache for file-backed block stores.
//!
//! # Design
//!
//! - Holds at most `capacity` block images keyed by id
//! - Evicts in insertion order (FIFO); re-inserting an id refreshes its data
//!   but not its position
//! - Not synchronized: the owning store keeps it behind its own lock
//!
//! # Invariants
//!
//! - `entries.len() <= capacity`
//! - Every id in `entries` appears exactly once in `order`

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::BlockId;

#[derive(Debug)]
pub struct PageCache {
    entries: HashMap<BlockId, Arc<[u8]>>,
    order: VecDeque<BlockId>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl PageCache {
    /// Create a cache holding at most `capacity` blocks.
    ///
    /// A capacity of zero disables caching.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, id: BlockId) -> Option<Arc<[u8]>> {
        let found = self.entries.get(&id).cloned();
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub fn insert(&mut self, id: BlockId, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        if let Some(slot) = self.entries.get_mut(&id) {
            *slot = Arc::from(data);
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(evicted) => {
                    self.entries.remove(&evicted);
                }
                None => break,
            }
        }
        self.entries.insert(id, Arc::from(data));
        self.order.push_back(id);
    }

    pub fn remove(&mut self, id: BlockId) {
        if self.entries.remove(&id).is_some() {
            self.order.retain(|&cached| cached != id);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since creation.
    #[must_use]
    pub const fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let mut cache = PageCache::new(4);
        assert!(cache.get(1).is_none());
        cache.insert(1, &[7, 7]);
        assert_eq!(cache.get(1).as_deref(), Some(&[7u8, 7][..]));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_evicts_oldest() {
        let mut cache = PageCache::new(2);
        cache.insert(1, &[1]);
        cache.insert(2, &[2]);
        cache.insert(1, &[10]);
        cache.insert(3, &[3]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_none());
        assert_eq!(cache.get(2).as_deref(), Some(&[2u8][..]));
        assert_eq!(cache.get(3).as_deref(), Some(&[3u8][..]));
    }

    #[test]
    fn test_remove_keeps_order_consistent() {
        let mut cache = PageCache::new(2);
        cache.insert(1, &[1]);
        cache.insert(2, &[2]);
        cache.remove(1);
        cache.insert(3, &[3]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let mut cache = PageCache::new(0);
        cache.insert(1, &[1]);
        assert!(cache.is_empty());
    }
}
