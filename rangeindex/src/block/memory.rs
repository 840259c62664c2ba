//! Heap-backed block store.

use std::sync::Mutex;

use super::{Block, BlockAllocator, BlockError, BlockId, BlockStore, check_size, slot};
use crate::sync::lock;

struct MemoryInner {
    blocks: Vec<Option<Box<[u8]>>>,
    alloc: BlockAllocator,
}

/// Blocks held in memory; lost when the store is dropped.
pub struct MemoryStore {
    block_size: usize,
    max_blocks: Option<u64>,
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    #[must_use]
    pub const fn new(block_size: usize, max_blocks: Option<u64>) -> Self {
        Self {
            block_size,
            max_blocks,
            inner: Mutex::new(MemoryInner {
                blocks: Vec::new(),
                alloc: BlockAllocator::new(max_blocks),
            }),
        }
    }

    /// Number of blocks currently allocated.
    #[must_use]
    pub fn in_use(&self) -> u64 {
        lock(&self.inner).alloc.in_use()
    }
}

impl BlockStore for MemoryStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<BlockId, BlockError> {
        let mut inner = lock(&self.inner);
        let id = inner.alloc.allocate()?;
        let index = slot(id).ok_or(BlockError::InvalidBlock(id))?;
        if inner.blocks.len() <= index {
            inner.blocks.resize(index + 1, None);
        }
        inner.blocks[index] = Some(vec![0u8; self.block_size].into_boxed_slice());
        Ok(id)
    }

    fn read(&self, id: BlockId) -> Result<Block, BlockError> {
        let inner = lock(&self.inner);
        slot(id)
            .and_then(|index| inner.blocks.get(index))
            .and_then(Option::as_ref)
            .map(|data| Block::new(id, data.to_vec()))
            .ok_or(BlockError::InvalidBlock(id))
    }

    fn write(&self, block: &Block) -> Result<(), BlockError> {
        check_size(block, self.block_size)?;
        let mut inner = lock(&self.inner);
        let data = slot(block.id())
            .and_then(|index| inner.blocks.get_mut(index))
            .and_then(Option::as_mut)
            .ok_or(BlockError::InvalidBlock(block.id()))?;
        data.copy_from_slice(block.bytes());
        Ok(())
    }

    fn free(&self, id: BlockId) -> Result<(), BlockError> {
        let mut inner = lock(&self.inner);
        inner.alloc.free(id)?;
        if let Some(entry) = slot(id).and_then(|index| inner.blocks.get_mut(index)) {
            *entry = None;
        }
        Ok(())
    }

    fn is_valid(&self, id: BlockId) -> bool {
        lock(&self.inner).alloc.is_allocated(id)
    }

    fn sync(&self) -> Result<(), BlockError> {
        Ok(())
    }

    fn limit(&self) -> BlockId {
        lock(&self.inner).alloc.limit()
    }

    fn free_ids(&self) -> Vec<BlockId> {
        lock(&self.inner).alloc.free_ids()
    }

    fn restore(&self, limit: BlockId, free: &[BlockId]) -> Result<(), BlockError> {
        let mut inner = lock(&self.inner);
        inner.alloc = BlockAllocator::restore(limit, free, self.max_blocks);
        let limit = slot(limit).unwrap_or(0);
        inner.blocks.truncate(limit);
        for id in free {
            if let Some(entry) = slot(*id).and_then(|index| inner.blocks.get_mut(index)) {
                *entry = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_read_write() {
        let store = MemoryStore::new(16, None);
        let id = store.allocate().expect("allocate");
        let block = store.read(id).expect("read");
        assert_eq!(block.bytes(), &[0u8; 16]);

        let mut data = vec![0u8; 16];
        data[0] = 42;
        store.write(&Block::new(id, data)).expect("write");
        assert_eq!(store.read(id).expect("read").bytes()[0], 42);
    }

    #[test]
    fn test_freed_block_is_invalid() {
        let store = MemoryStore::new(8, None);
        let id = store.allocate().expect("allocate");
        store.free(id).expect("free");
        assert!(!store.is_valid(id));
        assert!(matches!(store.read(id), Err(BlockError::InvalidBlock(_))));
        assert!(matches!(
            store.write(&Block::new(id, vec![0; 8])),
            Err(BlockError::InvalidBlock(_))
        ));
        assert!(matches!(store.free(id), Err(BlockError::InvalidBlock(_))));
    }

    #[test]
    fn test_wrong_size_write() {
        let store = MemoryStore::new(8, None);
        let id = store.allocate().expect("allocate");
        let err = store.write(&Block::new(id, vec![0; 4])).expect_err("wrong size");
        assert!(err.is_consistency());
    }

    #[test]
    fn test_max_blocks() {
        let store = MemoryStore::new(8, Some(2));
        store.allocate().expect("first");
        store.allocate().expect("second");
        assert!(matches!(store.allocate(), Err(BlockError::Exhausted { .. })));
        assert_eq!(store.in_use(), 2);
    }
}
