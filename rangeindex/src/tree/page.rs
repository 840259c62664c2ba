//! B+Tree page types and serialization.
//!
//! Every page starts with a 12-byte header:
//!
//! ```text
//! +-------+--------------------------------------------+
//! | 0     | page_type (1 = branch, 2 = leaf)           |
//! | 1     | flags (reserved, 0)                        |
//! | 2-5   | CRC32 of the block, this field zeroed      |
//! | 6-7   | reserved                                   |
//! | 8-11  | count (separator keys or records)          |
//! +-------+--------------------------------------------+
//! ```
//!
//! A branch body is `child0` followed by `count` pairs of `(key, child)`;
//! child ids are little-endian i64. A leaf body is `count` encoded records.
//!
//! # Invariants
//!
//! - Branch: `children.len() == keys.len() + 1`, keys strictly increasing,
//!   child `i` holds keys `>= keys[i-1]` and `< keys[i]`
//! - Leaf: records strictly increasing by key, no gaps

#![allow(clippy::cast_possible_truncation)]

use crate::block::{Block, BlockId};
use crate::config::{CHILD_PTR_SIZE, IndexParams, PAGE_HEADER_SIZE};
use crate::record::{Record, hex};

/// Offset of the checksum inside the header.
const CHECKSUM_OFFSET: usize = 2;

/// Offset of the count inside the header.
const COUNT_OFFSET: usize = 8;

/// Page type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Branch = 1,
    Leaf = 2,
}

impl TryFrom<u8> for PageKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Branch),
            2 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// Error type for page decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    UnknownPageType { block: BlockId, page_type: u8 },
    ChecksumMismatch { block: BlockId, expected: u32, actual: u32 },
    CountOutOfRange { block: BlockId, count: usize, max: usize },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownPageType { block, page_type } => {
                write!(f, "block {block}: unknown page type {page_type}")
            }
            Self::ChecksumMismatch {
                block,
                expected,
                actual,
            } => write!(
                f,
                "block {block}: checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            ),
            Self::CountOutOfRange { block, count, max } => {
                write!(f, "block {block}: entry count {count} exceeds {max}")
            }
        }
    }
}

impl std::error::Error for PageError {}

/// Fill-factor and rebalancing operations shared by both page kinds.
pub trait PageOps: Sized {
    fn count(&self) -> usize;

    fn capacity(params: &IndexParams) -> usize;

    /// Minimum count for a non-root page.
    fn min_count(params: &IndexParams) -> usize;

    fn is_full(&self, params: &IndexParams) -> bool {
        self.count() >= Self::capacity(params)
    }

    fn is_underfull(&self, params: &IndexParams) -> bool {
        self.count() < Self::min_count(params)
    }

    /// True when one entry can move to a sibling without underflow.
    fn can_lend(&self, params: &IndexParams) -> bool {
        self.count() > Self::min_count(params)
    }

    /// Move the upper half into a new right sibling and return the separator
    /// for the parent.
    fn split(&mut self) -> (Vec<u8>, Self);

    /// Absorb the right sibling. `separator` is the parent key between them.
    fn merge(&mut self, separator: Vec<u8>, right: Self);

    /// Move the first entry of `right` to the end of `self`, updating the
    /// parent separator between them.
    fn shift_left(&mut self, right: &mut Self, separator: &mut Vec<u8>);

    /// Move the last entry of `self` to the front of `right`, updating the
    /// parent separator between them.
    fn shift_right(&mut self, right: &mut Self, separator: &mut Vec<u8>);
}

/// A branch page: separator keys and child pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPage {
    pub keys: Vec<Vec<u8>>,
    pub children: Vec<BlockId>,
}

impl BranchPage {
    /// A new root above a split: `left < separator <= right`.
    #[must_use]
    pub fn with_children(left: BlockId, separator: Vec<u8>, right: BlockId) -> Self {
        Self {
            keys: vec![separator],
            children: vec![left, right],
        }
    }

    /// Index of the child whose range contains `key`.
    #[must_use]
    pub fn find_child_index(&self, key: &[u8]) -> usize {
        match self.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    #[must_use]
    pub fn child_for(&self, key: &[u8]) -> BlockId {
        self.children[self.find_child_index(key)]
    }

    /// Insert `separator` after child `index`, with `right` as its right child.
    pub fn insert_at(&mut self, index: usize, separator: Vec<u8>, right: BlockId) {
        self.keys.insert(index, separator);
        self.children.insert(index + 1, right);
    }
}

impl PageOps for BranchPage {
    fn count(&self) -> usize {
        self.keys.len()
    }

    fn capacity(params: &IndexParams) -> usize {
        params.branch_capacity()
    }

    fn min_count(params: &IndexParams) -> usize {
        params.min_records
    }

    fn split(&mut self) -> (Vec<u8>, Self) {
        let mid = self.keys.len() / 2;
        let right_keys = self.keys.split_off(mid + 1);
        let right_children = self.children.split_off(mid + 1);
        let median = self.keys.pop().unwrap_or_default();
        (
            median,
            Self {
                keys: right_keys,
                children: right_children,
            },
        )
    }

    fn merge(&mut self, separator: Vec<u8>, right: Self) {
        self.keys.push(separator);
        self.keys.extend(right.keys);
        self.children.extend(right.children);
    }

    fn shift_left(&mut self, right: &mut Self, separator: &mut Vec<u8>) {
        let moved_key = right.keys.remove(0);
        let moved_child = right.children.remove(0);
        self.keys.push(std::mem::replace(separator, moved_key));
        self.children.push(moved_child);
    }

    fn shift_right(&mut self, right: &mut Self, separator: &mut Vec<u8>) {
        if let (Some(moved_key), Some(moved_child)) = (self.keys.pop(), self.children.pop()) {
            right.keys.insert(0, std::mem::replace(separator, moved_key));
            right.children.insert(0, moved_child);
        }
    }
}

/// A leaf page: sorted records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafPage {
    pub records: Vec<Record>,
}

impl LeafPage {
    #[must_use]
    pub const fn new() -> Self {
        Self { records: Vec::new() }
    }

    /// Binary search by key.
    pub fn find(&self, key: &[u8]) -> Result<usize, usize> {
        self.records.binary_search_by(|r| r.cmp_key(key))
    }

    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&Record> {
        self.find(key).ok().map(|i| &self.records[i])
    }

    /// Insert or replace by key, returning the replaced record.
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        match self.find(record.key()) {
            Ok(i) => Some(std::mem::replace(&mut self.records[i], record)),
            Err(i) => {
                self.records.insert(i, record);
                None
            }
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Record> {
        self.find(key).ok().map(|i| self.records.remove(i))
    }

    /// Lowest record.
    #[must_use]
    pub fn low(&self) -> Option<&Record> {
        self.records.first()
    }

    /// Highest record.
    #[must_use]
    pub fn high(&self) -> Option<&Record> {
        self.records.last()
    }

    fn first_key(&self) -> Vec<u8> {
        self.low().map(|r| r.key().to_vec()).unwrap_or_default()
    }
}

impl PageOps for LeafPage {
    fn count(&self) -> usize {
        self.records.len()
    }

    fn capacity(params: &IndexParams) -> usize {
        params.leaf_capacity
    }

    fn min_count(params: &IndexParams) -> usize {
        params.leaf_min()
    }

    fn split(&mut self) -> (Vec<u8>, Self) {
        let mid = self.records.len() / 2;
        let right = Self {
            records: self.records.split_off(mid),
        };
        (right.first_key(), right)
    }

    fn merge(&mut self, _separator: Vec<u8>, right: Self) {
        self.records.extend(right.records);
    }

    fn shift_left(&mut self, right: &mut Self, separator: &mut Vec<u8>) {
        if right.records.is_empty() {
            return;
        }
        self.records.push(right.records.remove(0));
        *separator = right.first_key();
    }

    fn shift_right(&mut self, right: &mut Self, separator: &mut Vec<u8>) {
        if let Some(moved) = self.records.pop() {
            right.records.insert(0, moved);
            *separator = right.first_key();
        }
    }
}

/// A decoded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    Branch(BranchPage),
    Leaf(LeafPage),
}

macro_rules! dispatch {
    ($page:expr, $p:ident => $body:expr) => {
        match $page {
            Page::Branch($p) => $body,
            Page::Leaf($p) => $body,
        }
    };
}

impl Page {
    #[must_use]
    pub const fn kind(&self) -> PageKind {
        match self {
            Self::Branch(_) => PageKind::Branch,
            Self::Leaf(_) => PageKind::Leaf,
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        dispatch!(self, p => p.count())
    }

    #[must_use]
    pub fn is_full(&self, params: &IndexParams) -> bool {
        dispatch!(self, p => p.is_full(params))
    }

    #[must_use]
    pub fn is_underfull(&self, params: &IndexParams) -> bool {
        dispatch!(self, p => p.is_underfull(params))
    }

    #[must_use]
    pub fn can_lend(&self, params: &IndexParams) -> bool {
        dispatch!(self, p => p.can_lend(params))
    }

    /// Split in place, returning the separator and the new right sibling.
    pub fn split(&mut self) -> (Vec<u8>, Self) {
        match self {
            Self::Branch(p) => {
                let (separator, right) = p.split();
                (separator, Self::Branch(right))
            }
            Self::Leaf(p) => {
                let (separator, right) = p.split();
                (separator, Self::Leaf(right))
            }
        }
    }

    /// Absorb `right`. Returns `false` if the pages are of different kinds.
    pub fn merge(&mut self, separator: Vec<u8>, right: Self) -> bool {
        match (self, right) {
            (Self::Branch(l), Self::Branch(r)) => l.merge(separator, r),
            (Self::Leaf(l), Self::Leaf(r)) => l.merge(separator, r),
            _ => return false,
        }
        true
    }

    /// See [`PageOps::shift_left`]. Returns `false` on mismatched kinds.
    pub fn shift_left(&mut self, right: &mut Self, separator: &mut Vec<u8>) -> bool {
        match (self, right) {
            (Self::Branch(l), Self::Branch(r)) => l.shift_left(r, separator),
            (Self::Leaf(l), Self::Leaf(r)) => l.shift_left(r, separator),
            _ => return false,
        }
        true
    }

    /// See [`PageOps::shift_right`]. Returns `false` on mismatched kinds.
    pub fn shift_right(&mut self, right: &mut Self, separator: &mut Vec<u8>) -> bool {
        match (self, right) {
            (Self::Branch(l), Self::Branch(r)) => l.shift_right(r, separator),
            (Self::Leaf(l), Self::Leaf(r)) => l.shift_right(r, separator),
            _ => return false,
        }
        true
    }

    /// Serialize into a buffer of `params.block_size` bytes.
    #[must_use]
    pub fn encode(&self, params: &IndexParams) -> Vec<u8> {
        let mut buf = vec![0u8; params.block_size];
        buf[0] = self.kind() as u8;
        buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&(self.count() as u32).to_le_bytes());
        let mut offset = PAGE_HEADER_SIZE;
        match self {
            Self::Branch(branch) => {
                let mut children = branch.children.iter();
                if let Some(first) = children.next() {
                    buf[offset..offset + CHILD_PTR_SIZE].copy_from_slice(&first.to_le_bytes());
                    offset += CHILD_PTR_SIZE;
                }
                for (key, child) in branch.keys.iter().zip(children) {
                    buf[offset..offset + params.key_len].copy_from_slice(key);
                    offset += params.key_len;
                    buf[offset..offset + CHILD_PTR_SIZE].copy_from_slice(&child.to_le_bytes());
                    offset += CHILD_PTR_SIZE;
                }
            }
            Self::Leaf(leaf) => {
                let factory = params.record_factory();
                let len = factory.record_len();
                for record in &leaf.records {
                    factory.encode_into(record, &mut buf[offset..offset + len]);
                    offset += len;
                }
            }
        }
        let checksum = compute_checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Deserialize a block written by [`encode`](Self::encode).
    pub fn decode(block: &Block, params: &IndexParams) -> Result<Self, PageError> {
        let buf = block.bytes();
        let id = block.id();
        let stored = read_u32(buf, CHECKSUM_OFFSET);
        let actual = compute_checksum(buf);
        if stored != actual {
            return Err(PageError::ChecksumMismatch {
                block: id,
                expected: stored,
                actual,
            });
        }
        let kind = PageKind::try_from(buf[0]).map_err(|page_type| PageError::UnknownPageType { block: id, page_type })?;
        let count = read_u32(buf, COUNT_OFFSET) as usize;
        let mut offset = PAGE_HEADER_SIZE;

        match kind {
            PageKind::Branch => {
                let max = params.branch_capacity();
                if count > max {
                    return Err(PageError::CountOutOfRange { block: id, count, max });
                }
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(read_i64(buf, offset));
                offset += CHILD_PTR_SIZE;
                for _ in 0..count {
                    keys.push(buf[offset..offset + params.key_len].to_vec());
                    offset += params.key_len;
                    children.push(read_i64(buf, offset));
                    offset += CHILD_PTR_SIZE;
                }
                Ok(Self::Branch(BranchPage { keys, children }))
            }
            PageKind::Leaf => {
                let max = params.leaf_capacity;
                if count > max {
                    return Err(PageError::CountOutOfRange { block: id, count, max });
                }
                let factory = params.record_factory();
                let len = factory.record_len();
                let records = (0..count)
                    .map(|i| factory.decode(&buf[offset + i * len..offset + (i + 1) * len]))
                    .collect();
                Ok(Self::Leaf(LeafPage { records }))
            }
        }
    }

    /// One-line description for tree dumps.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Branch(b) => {
                let keys: Vec<String> = b.keys.iter().map(|k| hex(k)).collect();
                format!("branch keys=[{}] children={:?}", keys.join(" "), b.children)
            }
            Self::Leaf(l) => {
                let keys: Vec<String> = l.records.iter().map(|r| hex(r.key())).collect();
                format!("leaf n={} [{}]", l.records.len(), keys.join(" "))
            }
        }
    }
}

/// CRC32 over the whole block with the checksum field zeroed.
fn compute_checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordFactory;

    fn params() -> IndexParams {
        IndexParams::with_block_size(256, 4, 2, 3)
            .and_then(|p| p.with_leaf_capacity(6))
            .expect("valid params")
    }

    fn rec(factory: &RecordFactory, k: u32) -> Record {
        factory.create(&k.to_be_bytes(), &[0, 1]).expect("record")
    }

    fn leaf_of(keys: &[u32]) -> LeafPage {
        let factory = params().record_factory();
        LeafPage {
            records: keys.iter().map(|&k| rec(&factory, k)).collect(),
        }
    }

    #[test]
    fn test_find_child_index() {
        let node = BranchPage {
            keys: vec![vec![10], vec![20], vec![30]],
            children: vec![100, 101, 102, 103],
        };
        assert_eq!(node.find_child_index(&[5]), 0);
        assert_eq!(node.find_child_index(&[10]), 1);
        assert_eq!(node.find_child_index(&[15]), 1);
        assert_eq!(node.find_child_index(&[30]), 3);
        assert_eq!(node.find_child_index(&[35]), 3);
    }

    #[test]
    fn test_leaf_insert_replace_remove() {
        let factory = params().record_factory();
        let mut leaf = leaf_of(&[1, 3]);
        assert_eq!(leaf.insert(rec(&factory, 2)), None);
        let replacement = factory.create(&2u32.to_be_bytes(), &[9, 9]).expect("record");
        assert_eq!(leaf.insert(replacement.clone()), Some(rec(&factory, 2)));
        assert_eq!(leaf.get(&2u32.to_be_bytes()), Some(&replacement));
        assert_eq!(leaf.remove(&1u32.to_be_bytes()), Some(rec(&factory, 1)));
        assert_eq!(leaf.remove(&7u32.to_be_bytes()), None);
        assert_eq!(leaf.low().map(Record::key), Some(&2u32.to_be_bytes()[..]));
        assert_eq!(leaf.high().map(Record::key), Some(&3u32.to_be_bytes()[..]));
    }

    #[test]
    fn test_leaf_split_separator_is_right_low() {
        let mut leaf = leaf_of(&[1, 2, 3, 4, 5, 6]);
        let (separator, right) = leaf.split();
        assert_eq!(leaf.count(), 3);
        assert_eq!(right.count(), 3);
        assert_eq!(separator, 4u32.to_be_bytes().to_vec());
    }

    #[test]
    fn test_branch_split_moves_median_up() {
        let mut node = BranchPage {
            keys: (1..=6u8).map(|k| vec![k]).collect(),
            children: (0..7).collect(),
        };
        let (median, right) = node.split();
        assert_eq!(median, vec![4]);
        assert_eq!(node.keys, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(node.children, vec![0, 1, 2, 3]);
        assert_eq!(right.keys, vec![vec![5], vec![6]]);
        assert_eq!(right.children, vec![4, 5, 6]);
    }

    #[test]
    fn test_branch_shifts_rotate_through_separator() {
        let mut left = BranchPage {
            keys: vec![vec![1], vec![2]],
            children: vec![10, 11, 12],
        };
        let mut right = BranchPage {
            keys: vec![vec![8]],
            children: vec![20, 21],
        };
        let mut separator = vec![5];

        left.shift_right(&mut right, &mut separator);
        assert_eq!(separator, vec![2]);
        assert_eq!(left.keys, vec![vec![1]]);
        assert_eq!(right.keys, vec![vec![5], vec![8]]);
        assert_eq!(right.children, vec![12, 20, 21]);

        left.shift_left(&mut right, &mut separator);
        assert_eq!(separator, vec![5]);
        assert_eq!(left.keys, vec![vec![1], vec![2]]);
        assert_eq!(left.children, vec![10, 11, 12]);
        assert_eq!(right.children, vec![20, 21]);
    }

    #[test]
    fn test_leaf_shifts_update_separator() {
        let mut left = leaf_of(&[1, 2, 3]);
        let mut right = leaf_of(&[7]);
        let mut separator = 7u32.to_be_bytes().to_vec();
        left.shift_right(&mut right, &mut separator);
        assert_eq!(separator, 3u32.to_be_bytes().to_vec());
        left.shift_left(&mut right, &mut separator);
        assert_eq!(separator, 7u32.to_be_bytes().to_vec());
        assert_eq!(left.count(), 3);
    }

    #[test]
    fn test_branch_merge() {
        let mut left = BranchPage::with_children(1, vec![3], 2);
        let right = BranchPage::with_children(4, vec![9], 5);
        left.merge(vec![6], right);
        assert_eq!(left.keys, vec![vec![3], vec![6], vec![9]]);
        assert_eq!(left.children, vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_encode_decode_branch_and_leaf() {
        let params = params();
        let branch = Page::Branch(BranchPage {
            keys: vec![vec![0, 0, 0, 5], vec![0, 0, 1, 0]],
            children: vec![3, 9, -1],
        });
        let block = Block::new(7, branch.encode(&params));
        assert_eq!(Page::decode(&block, &params), Ok(branch));

        let leaf = Page::Leaf(leaf_of(&[4, 8, 15]));
        let block = Block::new(8, leaf.encode(&params));
        assert_eq!(block.bytes().len(), 256);
        assert_eq!(Page::decode(&block, &params), Ok(leaf));
    }

    #[test]
    fn test_decode_detects_corruption() {
        let params = params();
        let mut bytes = Page::Leaf(leaf_of(&[1])).encode(&params);
        bytes[PAGE_HEADER_SIZE] ^= 0xFF;
        let err = Page::decode(&Block::new(3, bytes), &params).expect_err("corrupt");
        assert!(matches!(err, PageError::ChecksumMismatch { block: 3, .. }));

        let zeroed = Block::new(4, vec![0u8; 256]);
        assert!(Page::decode(&zeroed, &params).is_err());
    }

    #[test]
    fn test_fill_predicates() {
        let params = params();
        assert!(leaf_of(&[1, 2, 3, 4, 5, 6]).is_full(&params));
        assert!(leaf_of(&[1, 2]).is_underfull(&params));
        assert!(!leaf_of(&[1, 2, 3]).is_underfull(&params));
        assert!(!leaf_of(&[1, 2, 3]).can_lend(&params));
        assert!(leaf_of(&[1, 2, 3, 4]).can_lend(&params));
    }
}
