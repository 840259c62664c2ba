//! Lazy ordered iteration.
//!
//! Iterators hold a root id and a cloned page source. They never follow
//! sibling pointers: the path from the root is kept on an explicit stack of
//! decoded branch pages, and the next leaf is found by popping to the first
//! ancestor with an unvisited child and descending its leftmost path.
//!
//! The lifetime parameter ties an iterator to the borrow that produced it
//! (an index or a transaction handle), so it cannot outlive the snapshot
//! whose pages it reads.

use std::marker::PhantomData;

use super::IndexError;
use super::ops::{PageReader, PageSource};
use super::page::{BranchPage, Page};
use crate::block::BlockId;
use crate::record::Record;

/// Deeper trees than this indicate a pointer cycle.
const MAX_DEPTH: usize = 64;

/// Ascending records in `[lower, upper)`.
pub struct RangeIter<'a> {
    pages: PageSource,
    /// Ancestors of the current leaf with the index of the next child to visit.
    stack: Vec<(BranchPage, usize)>,
    leaf: std::vec::IntoIter<Record>,
    upper: Option<Vec<u8>>,
    done: bool,
    _snapshot: PhantomData<&'a ()>,
}

impl RangeIter<'_> {
    pub(crate) fn new(
        pages: PageSource,
        root: BlockId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<Self, IndexError> {
        let done = matches!((lower, upper), (Some(l), Some(u)) if l >= u);
        let mut iter = Self {
            pages,
            stack: Vec::new(),
            leaf: Vec::new().into_iter(),
            upper: upper.map(<[u8]>::to_vec),
            done,
            _snapshot: PhantomData,
        };
        if !done {
            iter.seek(root, lower)?;
        }
        Ok(iter)
    }

    /// Descend to the leaf that would hold `lower`.
    fn seek(&mut self, root: BlockId, lower: Option<&[u8]>) -> Result<(), IndexError> {
        let mut id = root;
        for _ in 0..MAX_DEPTH {
            match self.pages.read_page(id)? {
                Page::Branch(node) => {
                    let index = lower.map_or(0, |key| node.find_child_index(key));
                    id = node.children[index];
                    self.stack.push((node, index + 1));
                }
                Page::Leaf(leaf) => {
                    let start = lower.map_or(0, |key| leaf.find(key).unwrap_or_else(|i| i));
                    let mut records = leaf.records;
                    records.drain(..start);
                    self.leaf = records.into_iter();
                    return Ok(());
                }
            }
        }
        Err(IndexError::Consistency(format!("tree under root {root} is too deep")))
    }

    /// Load the next leaf in key order. Returns `false` at the end.
    fn next_leaf(&mut self) -> Result<bool, IndexError> {
        loop {
            let Some((node, next)) = self.stack.last_mut() else {
                return Ok(false);
            };
            if *next >= node.children.len() {
                self.stack.pop();
                continue;
            }
            let mut id = node.children[*next];
            *next += 1;

            loop {
                if self.stack.len() > MAX_DEPTH {
                    return Err(IndexError::Consistency(format!("page {id} is too deep")));
                }
                match self.pages.read_page(id)? {
                    Page::Branch(child) => {
                        id = child.children[0];
                        self.stack.push((child, 1));
                    }
                    Page::Leaf(leaf) => {
                        self.leaf = leaf.records.into_iter();
                        return Ok(true);
                    }
                }
            }
        }
    }
}

impl Iterator for RangeIter<'_> {
    type Item = Result<Record, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(record) = self.leaf.next() {
                if self.upper.as_deref().is_some_and(|upper| record.key() >= upper) {
                    self.done = true;
                    return None;
                }
                return Some(Ok(record));
            }
            match self.next_leaf() {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// The first record of every run of records sharing a key prefix.
///
/// Each step re-seeks from the root to the smallest key after the current
/// prefix, so runs are skipped without reading their leaves.
pub struct DistinctIter<'a> {
    pages: PageSource,
    root: BlockId,
    prefix_len: usize,
    /// Where the next seek starts; `None` means the beginning.
    lower: Option<Vec<u8>>,
    done: bool,
    _snapshot: PhantomData<&'a ()>,
}

impl DistinctIter<'_> {
    pub(crate) const fn new(pages: PageSource, root: BlockId, prefix_len: usize) -> Self {
        Self {
            pages,
            root,
            prefix_len,
            lower: None,
            done: false,
            _snapshot: PhantomData,
        }
    }
}

impl Iterator for DistinctIter<'_> {
    type Item = Result<Record, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let found = RangeIter::new(self.pages.clone(), self.root, self.lower.as_deref(), None)
            .and_then(|mut range| range.next().transpose());
        match found {
            Ok(Some(record)) => {
                match prefix_successor(&record.key()[..self.prefix_len]) {
                    Some(next) => self.lower = Some(next),
                    None => self.done = true,
                }
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Smallest byte string greater than every key starting with `prefix`, or
/// `None` when the prefix is all `0xFF`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.last_mut() {
        if *last == u8::MAX {
            next.pop();
        } else {
            *last += 1;
            return Some(next);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::block::{BlockMgr, MemoryStore};
    use crate::testing::{int_key, int_record, small_params};
    use crate::tree::ops::{InPlace, format, insert};

    fn source_with(keys: impl IntoIterator<Item = u32>) -> (PageSource, BlockId) {
        let params = small_params();
        let blocks = Arc::new(BlockMgr::new(Box::new(MemoryStore::new(params.block_size, None))));
        let mut io = InPlace {
            blocks: &blocks,
            params: &params,
        };
        let mut root = format(&mut io).expect("format");
        for k in keys {
            root = insert(&mut io, root, int_record(&params, k, 0)).expect("insert").0;
        }
        (PageSource::new(blocks, params), root)
    }

    fn keys_of(iter: impl Iterator<Item = Result<Record, IndexError>>) -> Vec<u32> {
        iter.map(|r| {
            let record = r.expect("record");
            u32::from_be_bytes(record.key().try_into().expect("4-byte key"))
        })
        .collect()
    }

    #[test]
    fn test_full_scan_is_ordered() {
        let (pages, root) = source_with((0..100).rev());
        let iter = RangeIter::new(pages, root, None, None).expect("iter");
        assert_eq!(keys_of(iter), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded_scan() {
        let (pages, root) = source_with((0..100).map(|i| i * 2));
        let iter = RangeIter::new(pages.clone(), root, Some(&int_key(31)), Some(&int_key(41))).expect("iter");
        assert_eq!(keys_of(iter), vec![32, 34, 36, 38, 40]);

        let iter = RangeIter::new(pages.clone(), root, Some(&int_key(190)), None).expect("iter");
        assert_eq!(keys_of(iter), vec![190, 192, 194, 196, 198]);

        let iter = RangeIter::new(pages, root, None, Some(&int_key(4))).expect("iter");
        assert_eq!(keys_of(iter), vec![0, 2]);
    }

    #[test]
    fn test_empty_ranges() {
        let (pages, root) = source_with(0..10);
        let inverted = RangeIter::new(pages.clone(), root, Some(&int_key(5)), Some(&int_key(5))).expect("iter");
        assert_eq!(inverted.count(), 0);
        let beyond = RangeIter::new(pages, root, Some(&int_key(50)), None).expect("iter");
        assert_eq!(beyond.count(), 0);

        let (pages, root) = source_with([]);
        assert_eq!(RangeIter::new(pages, root, None, None).expect("iter").count(), 0);
    }

    #[test]
    fn test_distinct_skips_runs() {
        let (pages, root) = source_with([0x0100, 0x0101, 0x0102, 0x0300, 0x0301, 0xFFFF_FF00]);
        let iter = DistinctIter::new(pages, root, 3);
        assert_eq!(keys_of(iter), vec![0x0100, 0x0300, 0xFFFF_FF00]);
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(&[0, 1]), Some(vec![0, 2]));
        assert_eq!(prefix_successor(&[0, 0xFF]), Some(vec![1]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }
}
