//! Memory-mapped block store.
//!
//! The page file is mapped read-write. Reads copy out of the mapping and
//! writes copy into it, so no reference into the mapping escapes the store's
//! lock. When allocation runs past the mapped length the file is extended and
//! remapped; the old mapping is flushed and dropped first, which is safe
//! because nothing outside the lock can still point at it.
//!
//! # File Format
//!
//! Block `n` starts at offset `n * block_size`. The file length is always a
//! multiple of the block size and never shrinks.

#![allow(unsafe_code)]
// File offsets are u64; block counts fit in i64.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::MmapMut;

use super::{Block, BlockAllocator, BlockError, BlockId, BlockStore, check_size, slot};
use crate::sync::lock;

/// Blocks mapped when a new file is created.
const INITIAL_BLOCKS: u64 = 16;

struct MappedInner {
    file: File,
    map: MmapMut,
    mapped_blocks: u64,
    alloc: BlockAllocator,
}

impl MappedInner {
    fn range(&self, id: BlockId, block_size: usize) -> Result<std::ops::Range<usize>, BlockError> {
        if !self.alloc.is_allocated(id) {
            return Err(BlockError::InvalidBlock(id));
        }
        let start = slot(id).ok_or(BlockError::InvalidBlock(id))? * block_size;
        let end = start + block_size;
        if end > self.map.len() {
            return Err(BlockError::InvalidBlock(id));
        }
        Ok(start..end)
    }

    fn grow(&mut self, blocks: u64, block_size: usize) -> Result<(), BlockError> {
        self.map.flush()?;
        self.file.set_len(blocks * block_size as u64)?;
        // SAFETY: the file was opened read-write by this store and is not
        // shared with other processes. The previous mapping is replaced under
        // the store's lock and no slice of it outlives a method call.
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        self.mapped_blocks = blocks;
        Ok(())
    }
}

/// A page file accessed through a shared memory mapping.
pub struct MmapStore {
    path: PathBuf,
    block_size: usize,
    max_blocks: Option<u64>,
    inner: Mutex<MappedInner>,
}

impl MmapStore {
    /// Open or create the mapped page file at `path`.
    pub fn open(path: &Path, block_size: usize, max_blocks: Option<u64>) -> Result<Self, BlockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let existing = len / block_size as u64;
        let mapped_blocks = existing.max(INITIAL_BLOCKS);
        if len < mapped_blocks * block_size as u64 {
            file.set_len(mapped_blocks * block_size as u64)?;
        }

        // SAFETY: MmapMut::map_mut is unsafe because the file could be
        // modified externally. This store is the only writer of the file, it
        // holds the File for as long as the mapping lives, and all access is
        // bounds-checked against the mapped length under the store's lock.
        let map = unsafe { MmapMut::map_mut(&file)? };

        tracing::debug!("mapped page file {} ({} blocks)", path.display(), mapped_blocks);
        Ok(Self {
            path: path.to_path_buf(),
            block_size,
            max_blocks,
            inner: Mutex::new(MappedInner {
                file,
                map,
                mapped_blocks,
                alloc: BlockAllocator::restore(existing as BlockId, &[], max_blocks),
            }),
        })
    }
}

impl BlockStore for MmapStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<BlockId, BlockError> {
        let mut inner = lock(&self.inner);
        let id = inner.alloc.allocate()?;
        let needed = inner.alloc.limit() as u64;
        if needed > inner.mapped_blocks {
            let target = (inner.mapped_blocks * 2).max(needed);
            inner.grow(target, self.block_size)?;
        }
        let range = inner.range(id, self.block_size)?;
        inner.map[range].fill(0);
        Ok(id)
    }

    fn read(&self, id: BlockId) -> Result<Block, BlockError> {
        let inner = lock(&self.inner);
        let range = inner.range(id, self.block_size)?;
        Ok(Block::new(id, inner.map[range].to_vec()))
    }

    fn write(&self, block: &Block) -> Result<(), BlockError> {
        check_size(block, self.block_size)?;
        let mut inner = lock(&self.inner);
        let range = inner.range(block.id(), self.block_size)?;
        inner.map[range].copy_from_slice(block.bytes());
        Ok(())
    }

    fn free(&self, id: BlockId) -> Result<(), BlockError> {
        lock(&self.inner).alloc.free(id)
    }

    fn is_valid(&self, id: BlockId) -> bool {
        lock(&self.inner).alloc.is_allocated(id)
    }

    fn sync(&self) -> Result<(), BlockError> {
        lock(&self.inner).map.flush()?;
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
        let needed = inner.alloc.limit() as u64;
        if needed > inner.mapped_blocks {
            inner.grow(needed, self.block_size)?;
        }
        Ok(())
    }

    fn path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_grows_past_initial_mapping() {
        let dir = tempdir().expect("tempdir");
        let store = MmapStore::open(&dir.path().join("pages.map"), 32, None).expect("open");
        let ids: Vec<_> = (0..40).map(|_| store.allocate().expect("allocate")).collect();
        for &id in &ids {
            let mut data = vec![0u8; 32];
            data[0] = u8::try_from(id).expect("small id");
            store.write(&Block::new(id, data)).expect("write");
        }
        for &id in &ids {
            assert_eq!(i64::from(store.read(id).expect("read").bytes()[0]), id);
        }
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("pages.map");
        {
            let store = MmapStore::open(&path, 32, None).expect("open");
            let id = store.allocate().expect("allocate");
            store.write(&Block::new(id, vec![9u8; 32])).expect("write");
            store.sync().expect("sync");
        }
        let store = MmapStore::open(&path, 32, None).expect("reopen");
        store.restore(1, &[]).expect("restore");
        assert_eq!(store.read(0).expect("read").bytes(), &[9u8; 32]);
    }

    #[test]
    fn test_freed_block_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = MmapStore::open(&dir.path().join("pages.map"), 32, None).expect("open");
        let id = store.allocate().expect("allocate");
        store.free(id).expect("free");
        assert!(matches!(store.read(id), Err(BlockError::InvalidBlock(_))));
    }
}
