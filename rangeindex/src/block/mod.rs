//! Block storage.
//!
//! Pages live in fixed-size blocks addressed by integer ids. A
//! [`BlockStore`] is the raw backing (memory, positioned file I/O or a
//! memory-mapped file). [`BlockMgr`] layers the page disciplines on top:
//! write-in-place, copy-on-write inside a [`WriteSet`], and deferred
//! reclamation of blocks that older snapshots may still read.
//!
//! # Invariants
//!
//! - Every block of one store has exactly `block_size()` bytes
//! - Reading or freeing an id that is not allocated is a consistency
//!   violation ([`BlockError::InvalidBlock`]), never an I/O error
//! - `NO_BLOCK` (-1) is never a valid id

mod allocator;
mod cache;
mod file;
mod memory;
mod mgr;
mod mmap;
mod observer;

use std::path::PathBuf;

pub use allocator::BlockAllocator;
pub use cache::PageCache;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use mgr::{BlockMgr, WriteSet};
pub use mmap::MmapStore;
pub use observer::{BlockObserver, DuplicateTracker};

use crate::config::{Backing, StoreConfig};

/// Identifier of a block within one store.
pub type BlockId = i64;

/// The null block id.
pub const NO_BLOCK: BlockId = -1;

/// Error type for block operations.
#[derive(Debug)]
pub enum BlockError {
    /// The backing file failed.
    Io(std::io::Error),
    /// The id is freed, never allocated or out of range.
    InvalidBlock(BlockId),
    /// The store reached its configured block limit.
    Exhausted { max_blocks: u64 },
    /// A write supplied a buffer of the wrong length.
    WrongSize { expected: usize, actual: usize },
}

impl BlockError {
    /// True for errors that indicate corrupt or misused state rather than a
    /// failing device.
    #[must_use]
    pub const fn is_consistency(&self) -> bool {
        matches!(self, Self::InvalidBlock(_) | Self::WrongSize { .. })
    }
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "block I/O error: {e}"),
            Self::InvalidBlock(id) => write!(f, "block {id} is not allocated"),
            Self::Exhausted { max_blocks } => {
                write!(f, "block store exhausted ({max_blocks} blocks in use)")
            }
            Self::WrongSize { expected, actual } => {
                write!(f, "block size mismatch: expected {expected} bytes, got {actual}")
            }
        }
    }
}

impl std::error::Error for BlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BlockError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// An owned copy of one block's bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    id: BlockId,
    data: Vec<u8>,
}

impl Block {
    #[must_use]
    pub const fn new(id: BlockId, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("first_bytes", &&self.data[..16.min(self.data.len())])
            .finish()
    }
}

/// Raw block backing.
///
/// Implementations are internally synchronized; every method takes `&self`.
pub trait BlockStore: Send + Sync {
    fn block_size(&self) -> usize;

    /// Reserve an id, reusing a freed one when possible.
    fn allocate(&self) -> Result<BlockId, BlockError>;

    fn read(&self, id: BlockId) -> Result<Block, BlockError>;

    fn write(&self, block: &Block) -> Result<(), BlockError>;

    /// Release an id for immediate reuse.
    fn free(&self, id: BlockId) -> Result<(), BlockError>;

    fn is_valid(&self, id: BlockId) -> bool;

    /// Make every completed write durable.
    fn sync(&self) -> Result<(), BlockError>;

    /// One past the highest id ever handed out.
    fn limit(&self) -> BlockId;

    /// Ids below `limit()` that are currently free.
    fn free_ids(&self) -> Vec<BlockId>;

    /// Reset allocation state to a persisted limit and free list.
    fn restore(&self, limit: BlockId, free: &[BlockId]) -> Result<(), BlockError>;

    /// Location of the backing file, if any.
    fn path(&self) -> Option<PathBuf> {
        None
    }
}

/// Open the store described by `config`.
pub fn open_store(config: &StoreConfig, block_size: usize) -> Result<Box<dyn BlockStore>, BlockError> {
    let store: Box<dyn BlockStore> = match &config.backing {
        Backing::Memory => Box::new(MemoryStore::new(block_size, config.max_blocks)),
        Backing::File(path) => Box::new(FileStore::open(
            path,
            block_size,
            config.cache_blocks,
            config.max_blocks,
        )?),
        Backing::Mapped(path) => Box::new(MmapStore::open(path, block_size, config.max_blocks)?),
    };
    tracing::debug!("opened {:?} block store with {} byte blocks", config.backing, block_size);
    Ok(store)
}

/// Convert an id into a slot index, rejecting `NO_BLOCK` and other negatives.
#[allow(clippy::cast_possible_truncation)] // ids are bounded by the allocator's limit
pub(crate) fn slot(id: BlockId) -> Option<usize> {
    u64::try_from(id).ok().map(|id| id as usize)
}

pub(crate) fn check_size(block: &Block, block_size: usize) -> Result<(), BlockError> {
    if block.bytes().len() == block_size {
        Ok(())
    } else {
        Err(BlockError::WrongSize {
            expected: block_size,
            actual: block.bytes().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_rejects_negative_ids() {
        assert_eq!(slot(NO_BLOCK), None);
        assert_eq!(slot(0), Some(0));
        assert_eq!(slot(41), Some(41));
    }

    #[test]
    fn test_consistency_classification() {
        assert!(BlockError::InvalidBlock(3).is_consistency());
        assert!(BlockError::WrongSize { expected: 8, actual: 4 }.is_consistency());
        assert!(!BlockError::Exhausted { max_blocks: 2 }.is_consistency());
        let io = BlockError::from(std::io::Error::other("disk gone"));
        assert!(!io.is_consistency());
        assert!(std::error::Error::source(&io).is_some());
    }

    #[test]
    fn test_open_memory_store() {
        let store = open_store(&StoreConfig::memory(), 64).expect("open");
        assert_eq!(store.block_size(), 64);
        assert_eq!(store.limit(), 0);
        assert!(store.path().is_none());
    }
}
