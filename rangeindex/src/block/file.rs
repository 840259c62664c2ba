//! File-backed block store.
//!
//! Block `n` lives at byte offset `n * block_size`. Reads go through a bounded
//! [`PageCache`]; writes go to the file and refresh the cache.
//!
//! Allocation state is not stored in the page file. On open every block the
//! file covers is treated as used until the owner restores the persisted
//! limit and free list.

// File offsets are u64; block counts fit in i64.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Block, BlockAllocator, BlockError, BlockId, BlockStore, PageCache, check_size};
use crate::sync::lock;

struct FileInner {
    file: File,
    alloc: BlockAllocator,
    cache: PageCache,
}

/// A page file accessed with positioned reads and writes.
pub struct FileStore {
    path: PathBuf,
    block_size: usize,
    max_blocks: Option<u64>,
    inner: Mutex<FileInner>,
}

impl FileStore {
    /// Open or create the page file at `path`.
    pub fn open(
        path: &Path,
        block_size: usize,
        cache_blocks: usize,
        max_blocks: Option<u64>,
    ) -> Result<Self, BlockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let existing = file.metadata()?.len() / block_size as u64;
        let alloc = BlockAllocator::restore(existing as BlockId, &[], max_blocks);
        tracing::debug!("opened page file {} with {} blocks", path.display(), existing);

        Ok(Self {
            path: path.to_path_buf(),
            block_size,
            max_blocks,
            inner: Mutex::new(FileInner {
                file,
                alloc,
                cache: PageCache::new(cache_blocks),
            }),
        })
    }

    /// (hits, misses) of the read cache.
    #[must_use]
    pub fn cache_stats(&self) -> (u64, u64) {
        lock(&self.inner).cache.stats()
    }

    fn offset(&self, id: BlockId) -> u64 {
        id as u64 * self.block_size as u64
    }
}

impl BlockStore for FileStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<BlockId, BlockError> {
        let mut inner = lock(&self.inner);
        let id = inner.alloc.allocate()?;
        // Stale bytes from a previous owner of a reused id must not leak.
        let zeros = vec![0u8; self.block_size];
        inner.file.seek(SeekFrom::Start(self.offset(id)))?;
        inner.file.write_all(&zeros)?;
        inner.cache.remove(id);
        Ok(id)
    }

    fn read(&self, id: BlockId) -> Result<Block, BlockError> {
        let mut inner = lock(&self.inner);
        if !inner.alloc.is_allocated(id) {
            return Err(BlockError::InvalidBlock(id));
        }
        if let Some(data) = inner.cache.get(id) {
            return Ok(Block::new(id, data.to_vec()));
        }
        let mut data = vec![0u8; self.block_size];
        inner.file.seek(SeekFrom::Start(self.offset(id)))?;
        inner.file.read_exact(&mut data)?;
        inner.cache.insert(id, &data);
        Ok(Block::new(id, data))
    }

    fn write(&self, block: &Block) -> Result<(), BlockError> {
        check_size(block, self.block_size)?;
        let mut inner = lock(&self.inner);
        if !inner.alloc.is_allocated(block.id()) {
            return Err(BlockError::InvalidBlock(block.id()));
        }
        inner.file.seek(SeekFrom::Start(self.offset(block.id())))?;
        inner.file.write_all(block.bytes())?;
        inner.cache.insert(block.id(), block.bytes());
        Ok(())
    }

    fn free(&self, id: BlockId) -> Result<(), BlockError> {
        let mut inner = lock(&self.inner);
        inner.alloc.free(id)?;
        inner.cache.remove(id);
        Ok(())
    }

    fn is_valid(&self, id: BlockId) -> bool {
        lock(&self.inner).alloc.is_allocated(id)
    }

    fn sync(&self) -> Result<(), BlockError> {
        lock(&self.inner).file.sync_data()?;
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
        inner.cache.clear();
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
    fn test_write_then_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("pages.dat");

        let id = {
            let store = FileStore::open(&path, 64, 8, None).expect("open");
            let id = store.allocate().expect("allocate");
            let mut data = vec![0u8; 64];
            data[..4].copy_from_slice(b"page");
            store.write(&Block::new(id, data)).expect("write");
            store.sync().expect("sync");
            id
        };

        let store = FileStore::open(&path, 64, 8, None).expect("reopen");
        assert_eq!(store.limit(), 1);
        assert_eq!(&store.read(id).expect("read").bytes()[..4], b"page");
    }

    #[test]
    fn test_cache_serves_repeat_reads() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(&dir.path().join("pages.dat"), 32, 4, None).expect("open");
        let id = store.allocate().expect("allocate");
        store.write(&Block::new(id, vec![5u8; 32])).expect("write");
        store.read(id).expect("read");
        store.read(id).expect("read");
        let (hits, _) = store.cache_stats();
        assert_eq!(hits, 2);
    }

    #[test]
    fn test_restore_marks_free_ids() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(&dir.path().join("pages.dat"), 32, 4, None).expect("open");
        for _ in 0..4 {
            store.allocate().expect("allocate");
        }
        store.restore(4, &[2]).expect("restore");
        assert!(!store.is_valid(2));
        assert!(matches!(store.read(2), Err(BlockError::InvalidBlock(2))));
        assert_eq!(store.allocate().expect("reuse"), 2);
        assert_eq!(store.path(), Some(dir.path().join("pages.dat")));
    }
}
