//! Block allocator using a bitmap to track free/used ids.
//!
//! Ids are handed out from a growing range `0..limit`. Each bit represents
//! one id below the limit: 0 = free, 1 = used. Freed ids are reused before
//! the limit grows.

// Block ids are i64 but bitmap indices are usize. Ids are bounded by the
// limit, which is far below usize::MAX on supported targets.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use super::{BlockError, BlockId, slot};

/// Number of bits per byte.
const BITS_PER_BYTE: usize = 8;

/// A block allocation bitmap.
///
/// # Invariants
///
/// - `free_count` == number of clear bits below `limit`
/// - `limit <= max_blocks` when a maximum is set
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    /// The bitmap data.
    bitmap: Vec<u8>,
    /// One past the highest id ever allocated.
    limit: u64,
    /// Number of free ids below `limit`.
    free_count: u64,
    /// Hint for next free id search.
    next_search_hint: u64,
    /// Upper bound on `limit`.
    max_blocks: Option<u64>,
}

impl BlockAllocator {
    /// Create an allocator with no ids in use.
    #[must_use]
    pub const fn new(max_blocks: Option<u64>) -> Self {
        Self {
            bitmap: Vec::new(),
            limit: 0,
            free_count: 0,
            next_search_hint: 0,
            max_blocks,
        }
    }

    /// Rebuild allocation state from a persisted limit and free list.
    ///
    /// Every id below `limit` that is not in `free` is treated as used.
    #[must_use]
    pub fn restore(limit: BlockId, free: &[BlockId], max_blocks: Option<u64>) -> Self {
        let limit = u64::try_from(limit).unwrap_or(0);
        let mut bitmap = vec![0u8; (limit as usize).div_ceil(BITS_PER_BYTE)];
        for index in 0..limit as usize {
            set_bit(&mut bitmap, index);
        }
        let mut free_count = 0;
        let mut next_search_hint = limit;
        for index in free.iter().filter_map(|&id| slot(id)) {
            if (index as u64) < limit && get_bit(&bitmap, index) {
                clear_bit(&mut bitmap, index);
                free_count += 1;
                next_search_hint = next_search_hint.min(index as u64);
            }
        }
        Self {
            bitmap,
            limit,
            free_count,
            next_search_hint,
            max_blocks,
        }
    }

    /// Allocate a single id, reusing freed ids first.
    ///
    /// # Errors
    ///
    /// Returns `Exhausted` when no freed id exists and the limit has reached
    /// `max_blocks`.
    pub fn allocate(&mut self) -> Result<BlockId, BlockError> {
        if self.free_count > 0 {
            let found = (self.next_search_hint..self.limit)
                .chain(0..self.next_search_hint)
                .find(|&index| !get_bit(&self.bitmap, index as usize));
            if let Some(index) = found {
                set_bit(&mut self.bitmap, index as usize);
                self.free_count -= 1;
                self.next_search_hint = index + 1;
                return Ok(index as BlockId);
            }
        }

        if let Some(max_blocks) = self.max_blocks {
            if self.limit >= max_blocks {
                return Err(BlockError::Exhausted { max_blocks });
            }
        }

        let index = self.limit;
        self.limit += 1;
        self.bitmap.resize((self.limit as usize).div_ceil(BITS_PER_BYTE), 0);
        set_bit(&mut self.bitmap, index as usize);
        self.next_search_hint = self.limit;
        Ok(index as BlockId)
    }

    /// Free a previously allocated id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBlock` for ids that are not currently allocated,
    /// including double frees.
    pub fn free(&mut self, id: BlockId) -> Result<(), BlockError> {
        if !self.is_allocated(id) {
            return Err(BlockError::InvalidBlock(id));
        }
        let index = id as usize;
        clear_bit(&mut self.bitmap, index);
        self.free_count += 1;
        if (index as u64) < self.next_search_hint {
            self.next_search_hint = index as u64;
        }
        Ok(())
    }

    /// Check if an id is allocated.
    #[must_use]
    pub fn is_allocated(&self, id: BlockId) -> bool {
        match slot(id) {
            Some(index) if (index as u64) < self.limit => get_bit(&self.bitmap, index),
            _ => false,
        }
    }

    #[must_use]
    pub const fn limit(&self) -> BlockId {
        self.limit as BlockId
    }

    #[must_use]
    pub const fn free_count(&self) -> u64 {
        self.free_count
    }

    /// Number of ids currently in use.
    #[must_use]
    pub const fn in_use(&self) -> u64 {
        self.limit - self.free_count
    }

    /// Free ids below the limit, ascending.
    #[must_use]
    pub fn free_ids(&self) -> Vec<BlockId> {
        (0..self.limit)
            .filter(|&index| !get_bit(&self.bitmap, index as usize))
            .map(|index| index as BlockId)
            .collect()
    }
}

/// Get a bit from the bitmap.
fn get_bit(bitmap: &[u8], index: usize) -> bool {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index >= bitmap.len() {
        return false;
    }

    (bitmap[byte_index] & (1 << bit_index)) != 0
}

/// Set a bit in the bitmap (mark as used).
fn set_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] |= 1 << bit_index;
    }
}

/// Clear a bit in the bitmap (mark as free).
fn clear_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] &= !(1 << bit_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_grows_limit() {
        let mut alloc = BlockAllocator::new(None);
        assert_eq!(alloc.allocate().expect("allocate"), 0);
        assert_eq!(alloc.allocate().expect("allocate"), 1);
        assert_eq!(alloc.limit(), 2);
        assert_eq!(alloc.in_use(), 2);
        assert!(alloc.is_allocated(1));
        assert!(!alloc.is_allocated(2));
        assert!(!alloc.is_allocated(-1));
    }

    #[test]
    fn test_allocate_reuses_freed_id() {
        let mut alloc = BlockAllocator::new(None);
        let ids: Vec<_> = (0..5).map(|_| alloc.allocate().expect("allocate")).collect();
        alloc.free(ids[2]).expect("free");
        assert_eq!(alloc.free_ids(), vec![2]);
        assert_eq!(alloc.allocate().expect("allocate"), 2);
        assert_eq!(alloc.limit(), 5);
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut alloc = BlockAllocator::new(None);
        let id = alloc.allocate().expect("allocate");
        alloc.free(id).expect("first free");
        assert!(matches!(alloc.free(id), Err(BlockError::InvalidBlock(0))));
        assert!(matches!(alloc.free(17), Err(BlockError::InvalidBlock(17))));
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = BlockAllocator::new(Some(3));
        for _ in 0..3 {
            alloc.allocate().expect("allocate");
        }
        assert!(matches!(alloc.allocate(), Err(BlockError::Exhausted { max_blocks: 3 })));
        alloc.free(1).expect("free");
        assert_eq!(alloc.allocate().expect("reuse"), 1);
    }

    #[test]
    fn test_restore_from_free_list() {
        let alloc = BlockAllocator::restore(6, &[1, 4, 9, -1], None);
        assert_eq!(alloc.limit(), 6);
        assert_eq!(alloc.free_ids(), vec![1, 4]);
        assert_eq!(alloc.in_use(), 4);

        let mut alloc = alloc;
        assert_eq!(alloc.allocate().expect("allocate"), 1);
        assert_eq!(alloc.allocate().expect("allocate"), 4);
        assert_eq!(alloc.allocate().expect("allocate"), 6);
    }
}
