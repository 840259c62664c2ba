//! Block manager: page disciplines over a raw [`BlockStore`].
//!
//! # Design
//!
//! Outside transactions every write goes straight to the block it names.
//!
//! Inside a write transaction a [`WriteSet`] records what the transaction
//! did, and [`BlockMgr::promote`] makes a committed block writable in one of
//! two ways:
//!
//! - Duplicate: allocate a fresh block, copy the content, remember
//!   `original -> copy` and retire the original at commit
//! - In place: keep a copy of the original content so abort can restore it,
//!   then let writes land on the committed block
//!
//! Blocks allocated inside the transaction are already private and are
//! written directly.
//!
//! # Invariants
//!
//! - A block retired at generation `g` is not freed while any transaction
//!   with a generation below `g` is active
//! - Abort frees every block the transaction allocated and restores every
//!   block it wrote in place
//! - The store never sees a free of a retired block before reclamation

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{Block, BlockError, BlockId, BlockObserver, BlockStore};
use crate::sync::lock;

/// Blocks retired by one commit.
#[derive(Debug)]
struct Retired {
    /// The data version at which the retiring commit became visible.
    generation: u64,
    ids: Vec<BlockId>,
}

/// Per-transaction record of block activity.
#[derive(Debug, Default)]
pub struct WriteSet {
    /// Blocks allocated by this transaction.
    fresh: HashSet<BlockId>,
    /// Committed block -> its private duplicate.
    duplicates: HashMap<BlockId, BlockId>,
    /// Original content of committed blocks written in place.
    originals: HashMap<BlockId, Block>,
    /// Committed blocks this transaction no longer references.
    superseded: Vec<BlockId>,
}

impl WriteSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The id reads of `id` should use inside this transaction.
    #[must_use]
    pub fn resolve(&self, id: BlockId) -> BlockId {
        self.duplicates.get(&id).copied().unwrap_or(id)
    }

    #[must_use]
    pub fn is_private(&self, id: BlockId) -> bool {
        self.fresh.contains(&id)
    }

    /// True once the transaction has touched any block.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.fresh.is_empty() || !self.originals.is_empty() || !self.superseded.is_empty()
    }

    #[must_use]
    pub fn duplicate_count(&self) -> usize {
        self.duplicates.len()
    }

    /// Committed blocks that become garbage if this transaction commits.
    #[must_use]
    pub fn superseded(&self) -> &[BlockId] {
        &self.superseded
    }
}

/// Page-level access to a block store.
pub struct BlockMgr {
    store: Box<dyn BlockStore>,
    observer: Option<Arc<dyn BlockObserver>>,
    retired: Mutex<Vec<Retired>>,
}

impl BlockMgr {
    #[must_use]
    pub fn new(store: Box<dyn BlockStore>) -> Self {
        Self {
            store,
            observer: None,
            retired: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn BlockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.store.block_size()
    }

    #[must_use]
    pub fn store(&self) -> &dyn BlockStore {
        self.store.as_ref()
    }

    /// Allocate a block holding `initial`, zero-padded to the block size.
    pub fn allocate(&self, initial: &[u8]) -> Result<BlockId, BlockError> {
        let block_size = self.block_size();
        if initial.len() > block_size {
            return Err(BlockError::WrongSize {
                expected: block_size,
                actual: initial.len(),
            });
        }
        let id = self.store.allocate()?;
        let mut data = vec![0u8; block_size];
        data[..initial.len()].copy_from_slice(initial);
        if let Err(e) = self.store.write(&Block::new(id, data)) {
            let _ = self.store.free(id);
            return Err(e);
        }
        if let Some(observer) = &self.observer {
            observer.on_allocate(id);
        }
        Ok(id)
    }

    pub fn get_read(&self, id: BlockId) -> Result<Block, BlockError> {
        self.store.read(id)
    }

    /// A writable copy of `id`. Writing it back with [`write`](Self::write)
    /// updates the block in place.
    pub fn get_write(&self, id: BlockId) -> Result<Block, BlockError> {
        self.store.read(id)
    }

    pub fn write(&self, block: &Block) -> Result<(), BlockError> {
        self.store.write(block)
    }

    /// Give up a handle without writing it.
    pub fn release(&self, block: Block) {
        drop(block);
    }

    /// Free `id` for immediate reuse.
    pub fn free(&self, id: BlockId) -> Result<(), BlockError> {
        self.store.free(id)?;
        if let Some(observer) = &self.observer {
            observer.on_free(id);
        }
        Ok(())
    }

    #[must_use]
    pub fn valid(&self, id: BlockId) -> bool {
        self.store.is_valid(id)
    }

    pub fn sync(&self) -> Result<(), BlockError> {
        self.store.sync()
    }

    #[must_use]
    pub fn limit(&self) -> BlockId {
        self.store.limit()
    }

    /// Reset allocation state and drop any pending retirements.
    pub fn restore(&self, limit: BlockId, free: &[BlockId]) -> Result<(), BlockError> {
        lock(&self.retired).clear();
        self.store.restore(limit, free)
    }

    /// Ids that are free now or will be once pending retirements are
    /// reclaimed. After a restart nothing can read a retired block, so this
    /// is the free list to persist.
    #[must_use]
    pub fn free_list(&self, extra: &[BlockId]) -> Vec<BlockId> {
        let mut free = self.store.free_ids();
        free.extend(lock(&self.retired).iter().flat_map(|r| r.ids.iter().copied()));
        free.extend_from_slice(extra);
        free.sort_unstable();
        free.dedup();
        free
    }

    /// Park `ids` until no transaction older than `generation` is active.
    pub fn retire(&self, ids: Vec<BlockId>, generation: u64) {
        if ids.is_empty() {
            return;
        }
        tracing::trace!("retiring {} blocks at generation {}", ids.len(), generation);
        lock(&self.retired).push(Retired { generation, ids });
    }

    /// Free every retired block whose generation is at most
    /// `oldest_active`. Returns the number of blocks freed.
    pub fn reclaim(&self, oldest_active: u64) -> Result<usize, BlockError> {
        let ready: Vec<Retired> = {
            let mut retired = lock(&self.retired);
            let (ready, pending): (Vec<Retired>, Vec<Retired>) = std::mem::take(&mut *retired)
                .into_iter()
                .partition(|r| r.generation <= oldest_active);
            *retired = pending;
            ready
        };
        let mut freed = 0;
        for id in ready.iter().flat_map(|r| r.ids.iter().copied()) {
            self.free(id)?;
            freed += 1;
        }
        if freed > 0 {
            tracing::debug!("reclaimed {} blocks (oldest active generation {})", freed, oldest_active);
        }
        Ok(freed)
    }

    /// Number of blocks waiting for reclamation.
    #[must_use]
    pub fn pending_reclaim(&self) -> usize {
        lock(&self.retired).iter().map(|r| r.ids.len()).sum()
    }

    /// Allocate a block owned by the transaction behind `writes`.
    pub fn allocate_in(&self, writes: &mut WriteSet, initial: &[u8]) -> Result<BlockId, BlockError> {
        let id = self.allocate(initial)?;
        writes.fresh.insert(id);
        Ok(id)
    }

    /// Make `id` writable for the transaction behind `writes`, returning the
    /// id the caller must write to and reference from now on.
    pub fn promote(&self, writes: &mut WriteSet, id: BlockId, duplicate: bool) -> Result<BlockId, BlockError> {
        let id = writes.resolve(id);
        if writes.fresh.contains(&id) || writes.originals.contains_key(&id) {
            return Ok(id);
        }
        let original = self.store.read(id)?;
        if duplicate {
            let copy = self.allocate(original.bytes())?;
            writes.fresh.insert(copy);
            writes.duplicates.insert(id, copy);
            writes.superseded.push(id);
            if let Some(observer) = &self.observer {
                observer.on_duplicate(id, copy);
            }
            tracing::trace!("duplicated block {} as {}", id, copy);
            Ok(copy)
        } else {
            writes.originals.insert(id, original);
            Ok(id)
        }
    }

    /// Free `id` on behalf of a transaction. Private blocks are freed now;
    /// committed blocks are superseded and retired at commit.
    pub fn free_in(&self, writes: &mut WriteSet, id: BlockId) -> Result<(), BlockError> {
        if writes.fresh.remove(&id) {
            self.free(id)
        } else {
            writes.superseded.push(id);
            Ok(())
        }
    }

    /// Retire everything the committed transaction superseded.
    pub fn commit_writes(&self, writes: WriteSet, generation: u64) {
        tracing::trace!(
            "committing write set: {} new, {} duplicated, {} in place",
            writes.fresh.len(),
            writes.duplicates.len(),
            writes.originals.len()
        );
        self.retire(writes.superseded, generation);
    }

    /// Undo an aborted transaction's block activity.
    pub fn abort_writes(&self, writes: WriteSet) -> Result<(), BlockError> {
        for original in writes.originals.values() {
            self.store.write(original)?;
        }
        for &id in &writes.fresh {
            self.free(id)?;
        }
        tracing::trace!(
            "aborted write set: freed {}, restored {}",
            writes.fresh.len(),
            writes.originals.len()
        );
        Ok(())
    }
}

impl std::fmt::Debug for BlockMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMgr")
            .field("block_size", &self.block_size())
            .field("limit", &self.limit())
            .field("pending_reclaim", &self.pending_reclaim())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{DuplicateTracker, MemoryStore};

    fn mgr() -> (BlockMgr, Arc<DuplicateTracker>) {
        let tracker = Arc::new(DuplicateTracker::new());
        let mgr = BlockMgr::new(Box::new(MemoryStore::new(32, None))).with_observer(tracker.clone());
        (mgr, tracker)
    }

    #[test]
    fn test_allocate_pads_initial_content() {
        let (mgr, tracker) = mgr();
        let id = mgr.allocate(b"abc").expect("allocate");
        let block = mgr.get_read(id).expect("read");
        assert_eq!(&block.bytes()[..3], b"abc");
        assert!(block.bytes()[3..].iter().all(|&b| b == 0));
        assert_eq!(tracker.allocation_count(), 1);
        assert!(mgr.allocate(&[0u8; 33]).is_err());
    }

    #[test]
    fn test_in_place_write_is_visible() {
        let (mgr, _) = mgr();
        let id = mgr.allocate(b"old").expect("allocate");
        let mut block = mgr.get_write(id).expect("get_write");
        block.bytes_mut()[..3].copy_from_slice(b"new");
        mgr.write(&block).expect("write");
        assert_eq!(&mgr.get_read(id).expect("read").bytes()[..3], b"new");
    }

    #[test]
    fn test_duplicate_promotion() {
        let (mgr, tracker) = mgr();
        let id = mgr.allocate(b"committed").expect("allocate");
        let mut writes = WriteSet::new();

        let copy = mgr.promote(&mut writes, id, true).expect("promote");
        assert_ne!(copy, id);
        assert_eq!(writes.resolve(id), copy);
        assert_eq!(tracker.duplicate_of(id), Some(copy));
        assert_eq!(&mgr.get_read(copy).expect("read").bytes()[..9], b"committed");

        // Promoting again returns the same private copy.
        assert_eq!(mgr.promote(&mut writes, id, true).expect("promote"), copy);
        assert_eq!(mgr.promote(&mut writes, copy, true).expect("promote"), copy);
        assert_eq!(writes.superseded(), &[id]);
    }

    #[test]
    fn test_abort_restores_in_place_writes_and_frees_new_blocks() {
        let (mgr, _) = mgr();
        let id = mgr.allocate(b"before").expect("allocate");
        let mut writes = WriteSet::new();

        assert_eq!(mgr.promote(&mut writes, id, false).expect("promote"), id);
        let mut block = mgr.get_write(id).expect("get_write");
        block.bytes_mut()[..6].copy_from_slice(b"after!");
        mgr.write(&block).expect("write");
        let fresh = mgr.allocate_in(&mut writes, b"temp").expect("allocate_in");

        mgr.abort_writes(writes).expect("abort");
        assert_eq!(&mgr.get_read(id).expect("read").bytes()[..6], b"before");
        assert!(!mgr.valid(fresh));
    }

    #[test]
    fn test_retired_blocks_wait_for_old_readers() {
        let (mgr, _) = mgr();
        let id = mgr.allocate(b"x").expect("allocate");
        let mut writes = WriteSet::new();
        let copy = mgr.promote(&mut writes, id, true).expect("promote");
        mgr.commit_writes(writes, 5);

        assert_eq!(mgr.pending_reclaim(), 1);
        assert_eq!(mgr.free_list(&[]), vec![id]);
        assert_eq!(mgr.reclaim(4).expect("reclaim"), 0);
        assert!(mgr.valid(id));
        assert_eq!(mgr.reclaim(5).expect("reclaim"), 1);
        assert!(!mgr.valid(id));
        assert!(mgr.valid(copy));
    }

    #[test]
    fn test_free_in_distinguishes_private_blocks() {
        let (mgr, tracker) = mgr();
        let committed = mgr.allocate(b"c").expect("allocate");
        let mut writes = WriteSet::new();
        let private = mgr.allocate_in(&mut writes, b"p").expect("allocate_in");

        mgr.free_in(&mut writes, private).expect("free private");
        mgr.free_in(&mut writes, committed).expect("free committed");
        assert!(!mgr.valid(private));
        assert!(mgr.valid(committed));
        assert_eq!(writes.superseded(), &[committed]);
        assert_eq!(tracker.free_count(), 1);
    }
}
