//! B+Tree algorithms over an abstract page source.
//!
//! # Design
//!
//! - Insert splits proactively on the way down: a full root is split first,
//!   then any full child is split before descending into it, so the page
//!   that finally receives the record always has room
//! - Delete repairs on the way up: an underfull page borrows one entry from
//!   its left sibling, else its right sibling, else merges with a sibling;
//!   a branch root left with one child is replaced by that child
//! - Every page a mutation touches is promoted first. Under copy-on-write
//!   promotion returns a new id, and the parent is rewritten to point at it,
//!   so the root id changes exactly when some page on the path changed
//!
//! Operations that would not change any page (inserting an identical
//! record, deleting an absent key) return before promoting anything.

use std::fmt::Write;
use std::sync::Arc;

use super::IndexError;
use super::page::{BranchPage, LeafPage, Page, PageKind};
use crate::block::{BlockId, BlockMgr, WriteSet};
use crate::config::{IndexParams, TreeConfig};
use crate::record::{Record, hex};

/// Deeper trees than this indicate a pointer cycle.
const MAX_DEPTH: usize = 64;

/// Read access to decoded pages.
pub trait PageReader {
    fn params(&self) -> &IndexParams;

    fn read_page(&self, id: BlockId) -> Result<Page, IndexError>;
}

/// Write access to decoded pages.
pub trait PageWriter: PageReader {
    /// Make `id` writable, returning the id to write to.
    fn promote(&mut self, id: BlockId, kind: PageKind) -> Result<BlockId, IndexError>;

    fn write_page(&mut self, id: BlockId, page: &Page) -> Result<(), IndexError>;

    fn create_page(&mut self, page: &Page) -> Result<BlockId, IndexError>;

    fn free_page(&mut self, id: BlockId) -> Result<(), IndexError>;
}

/// Shared read-only page access, cheap to clone into iterators.
#[derive(Clone)]
pub struct PageSource {
    blocks: Arc<BlockMgr>,
    params: IndexParams,
}

impl PageSource {
    pub const fn new(blocks: Arc<BlockMgr>, params: IndexParams) -> Self {
        Self { blocks, params }
    }
}

impl PageReader for PageSource {
    fn params(&self) -> &IndexParams {
        &self.params
    }

    fn read_page(&self, id: BlockId) -> Result<Page, IndexError> {
        let block = self.blocks.get_read(id)?;
        Ok(Page::decode(&block, &self.params)?)
    }
}

/// Direct page access: every write lands on the block it names.
pub struct InPlace<'a> {
    pub blocks: &'a BlockMgr,
    pub params: &'a IndexParams,
}

impl PageReader for InPlace<'_> {
    fn params(&self) -> &IndexParams {
        self.params
    }

    fn read_page(&self, id: BlockId) -> Result<Page, IndexError> {
        let block = self.blocks.get_read(id)?;
        Ok(Page::decode(&block, self.params)?)
    }
}

impl PageWriter for InPlace<'_> {
    fn promote(&mut self, id: BlockId, _kind: PageKind) -> Result<BlockId, IndexError> {
        Ok(id)
    }

    fn write_page(&mut self, id: BlockId, page: &Page) -> Result<(), IndexError> {
        let mut block = self.blocks.get_write(id)?;
        block.bytes_mut().copy_from_slice(&page.encode(self.params));
        Ok(self.blocks.write(&block)?)
    }

    fn create_page(&mut self, page: &Page) -> Result<BlockId, IndexError> {
        Ok(self.blocks.allocate(&page.encode(self.params))?)
    }

    fn free_page(&mut self, id: BlockId) -> Result<(), IndexError> {
        Ok(self.blocks.free(id)?)
    }
}

/// Page access for one write transaction.
pub struct TxnPages<'a> {
    pub blocks: &'a BlockMgr,
    pub params: &'a IndexParams,
    pub config: &'a TreeConfig,
    pub writes: &'a mut WriteSet,
}

impl PageReader for TxnPages<'_> {
    fn params(&self) -> &IndexParams {
        self.params
    }

    fn read_page(&self, id: BlockId) -> Result<Page, IndexError> {
        let block = self.blocks.get_read(self.writes.resolve(id))?;
        Ok(Page::decode(&block, self.params)?)
    }
}

impl PageWriter for TxnPages<'_> {
    fn promote(&mut self, id: BlockId, kind: PageKind) -> Result<BlockId, IndexError> {
        let duplicate = match kind {
            PageKind::Branch => self.config.duplicate_branches,
            PageKind::Leaf => self.config.duplicate_leaves,
        };
        Ok(self.blocks.promote(self.writes, id, duplicate)?)
    }

    fn write_page(&mut self, id: BlockId, page: &Page) -> Result<(), IndexError> {
        let mut block = self.blocks.get_write(id)?;
        block.bytes_mut().copy_from_slice(&page.encode(self.params));
        Ok(self.blocks.write(&block)?)
    }

    fn create_page(&mut self, page: &Page) -> Result<BlockId, IndexError> {
        Ok(self.blocks.allocate_in(self.writes, &page.encode(self.params))?)
    }

    fn free_page(&mut self, id: BlockId) -> Result<(), IndexError> {
        Ok(self.blocks.free_in(self.writes, id)?)
    }
}

/// Summary produced by [`check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    pub records: usize,
    pub leaves: usize,
    pub branches: usize,
    /// Number of page levels; 1 for a lone leaf root.
    pub height: usize,
}

/// Create an empty tree and return its root.
pub fn format<W: PageWriter + ?Sized>(io: &mut W) -> Result<BlockId, IndexError> {
    io.create_page(&Page::Leaf(LeafPage::new()))
}

/// Exact-match lookup.
pub fn search<R: PageReader + ?Sized>(io: &R, root: BlockId, key: &[u8]) -> Result<Option<Record>, IndexError> {
    let mut id = root;
    for _ in 0..MAX_DEPTH {
        match io.read_page(id)? {
            Page::Branch(node) => id = node.child_for(key),
            Page::Leaf(leaf) => return Ok(leaf.get(key).cloned()),
        }
    }
    Err(too_deep(root))
}

/// Insert or replace `record`. Returns the new root and the replaced record.
pub fn insert<W: PageWriter + ?Sized>(
    io: &mut W,
    root: BlockId,
    record: Record,
) -> Result<(BlockId, Option<Record>), IndexError> {
    if let Some(existing) = search(io, root, record.key())? {
        if existing == record {
            return Ok((root, Some(existing)));
        }
    }

    let params = *io.params();
    let key = record.key().to_vec();

    let mut page = io.read_page(root)?;
    let mut id = io.promote(root, page.kind())?;
    if page.is_full(&params) {
        // Allocate both new pages before shrinking the old root.
        let (separator, right) = page.split();
        let right_id = io.create_page(&right)?;
        let new_root = Page::Branch(BranchPage::with_children(id, separator, right_id));
        let new_root_id = io.create_page(&new_root)?;
        io.write_page(id, &page)?;
        tracing::debug!("split root {}: right sibling {}, new root {}", id, right_id, new_root_id);
        id = new_root_id;
        page = new_root;
    }
    let new_root = id;

    for _ in 0..MAX_DEPTH {
        match page {
            Page::Leaf(mut leaf) => {
                let previous = leaf.insert(record);
                io.write_page(id, &Page::Leaf(leaf))?;
                return Ok((new_root, previous));
            }
            Page::Branch(mut node) => {
                let index = node.find_child_index(&key);
                let mut child = io.read_page(node.children[index])?;
                let mut child_id = io.promote(node.children[index], child.kind())?;
                node.children[index] = child_id;

                if child.is_full(&params) {
                    let (separator, right) = child.split();
                    let right_id = io.create_page(&right)?;
                    io.write_page(child_id, &child)?;
                    tracing::trace!("split page {} at {}, right sibling {}", child_id, hex(&separator), right_id);
                    let go_right = key.as_slice() >= separator.as_slice();
                    node.insert_at(index, separator, right_id);
                    if go_right {
                        child_id = right_id;
                        child = right;
                    }
                }

                io.write_page(id, &Page::Branch(node))?;
                id = child_id;
                page = child;
            }
        }
    }
    Err(too_deep(root))
}

/// Remove the record with `key`. Returns the new root and the removed record.
pub fn delete<W: PageWriter + ?Sized>(
    io: &mut W,
    root: BlockId,
    key: &[u8],
) -> Result<(BlockId, Option<Record>), IndexError> {
    if search(io, root, key)?.is_none() {
        return Ok((root, None));
    }

    let params = *io.params();
    let mut path: Vec<(BlockId, BranchPage, usize)> = Vec::new();
    let mut page = io.read_page(root)?;
    let mut id = io.promote(root, page.kind())?;

    let mut leaf = loop {
        match page {
            Page::Leaf(leaf) => break leaf,
            Page::Branch(mut node) => {
                if path.len() >= MAX_DEPTH {
                    return Err(too_deep(root));
                }
                let index = node.find_child_index(key);
                let child = io.read_page(node.children[index])?;
                let child_id = io.promote(node.children[index], child.kind())?;
                node.children[index] = child_id;
                path.push((id, node, index));
                id = child_id;
                page = child;
            }
        }
    };

    let removed = leaf.remove(key);
    let mut node_id = id;
    let mut node = Page::Leaf(leaf);
    while let Some((parent_id, mut parent, index)) = path.pop() {
        if node.is_underfull(&params) {
            rebalance(io, &mut parent, index, node_id, node)?;
        } else {
            io.write_page(node_id, &node)?;
        }
        node_id = parent_id;
        node = Page::Branch(parent);
    }

    // node is now the (promoted) root.
    if let Page::Branch(root_page) = &node {
        if root_page.keys.is_empty() {
            let child = root_page.children[0];
            io.free_page(node_id)?;
            tracing::debug!("root {} collapsed into child {}", node_id, child);
            return Ok((child, removed));
        }
    }
    io.write_page(node_id, &node)?;
    Ok((node_id, removed))
}

/// Repair the underfull child at `index` of `parent`.
///
/// Writes every page it changes except `parent`, which the caller writes.
fn rebalance<W: PageWriter + ?Sized>(
    io: &mut W,
    parent: &mut BranchPage,
    index: usize,
    node_id: BlockId,
    mut node: Page,
) -> Result<(), IndexError> {
    let params = *io.params();

    let mut left = None;
    if index > 0 {
        let left_id = parent.children[index - 1];
        let mut sibling = io.read_page(left_id)?;
        if sibling.can_lend(&params) {
            let left_id = io.promote(left_id, sibling.kind())?;
            parent.children[index - 1] = left_id;
            if !sibling.shift_right(&mut node, &mut parent.keys[index - 1]) {
                return Err(kind_mismatch(left_id, node_id));
            }
            io.write_page(left_id, &sibling)?;
            io.write_page(node_id, &node)?;
            tracing::trace!("page {} borrowed from left sibling {}", node_id, left_id);
            return Ok(());
        }
        left = Some((left_id, sibling));
    }

    if index + 1 < parent.children.len() {
        let right_id = parent.children[index + 1];
        let mut sibling = io.read_page(right_id)?;
        if sibling.can_lend(&params) {
            let right_id = io.promote(right_id, sibling.kind())?;
            parent.children[index + 1] = right_id;
            if !node.shift_left(&mut sibling, &mut parent.keys[index]) {
                return Err(kind_mismatch(node_id, right_id));
            }
            io.write_page(right_id, &sibling)?;
            io.write_page(node_id, &node)?;
            tracing::trace!("page {} borrowed from right sibling {}", node_id, right_id);
            return Ok(());
        }
        if left.is_none() {
            let separator = parent.keys.remove(index);
            parent.children.remove(index + 1);
            if !node.merge(separator, sibling) {
                return Err(kind_mismatch(node_id, right_id));
            }
            io.write_page(node_id, &node)?;
            io.free_page(right_id)?;
            tracing::debug!("merged page {} into {}", right_id, node_id);
            return Ok(());
        }
    }

    let Some((left_id, mut sibling)) = left else {
        return Err(IndexError::Consistency(format!("page {node_id} has no sibling")));
    };
    let left_id = io.promote(left_id, sibling.kind())?;
    let separator = parent.keys.remove(index - 1);
    parent.children.remove(index);
    parent.children[index - 1] = left_id;
    if !sibling.merge(separator, node) {
        return Err(kind_mismatch(left_id, node_id));
    }
    io.write_page(left_id, &sibling)?;
    io.free_page(node_id)?;
    tracing::debug!("merged page {} into {}", node_id, left_id);
    Ok(())
}

/// Lowest record, if any.
pub fn first_record<R: PageReader + ?Sized>(io: &R, root: BlockId) -> Result<Option<Record>, IndexError> {
    edge_record(io, root, false)
}

/// Highest record, if any.
pub fn last_record<R: PageReader + ?Sized>(io: &R, root: BlockId) -> Result<Option<Record>, IndexError> {
    edge_record(io, root, true)
}

fn edge_record<R: PageReader + ?Sized>(io: &R, root: BlockId, high: bool) -> Result<Option<Record>, IndexError> {
    let mut id = root;
    for _ in 0..MAX_DEPTH {
        match io.read_page(id)? {
            Page::Branch(node) => {
                id = if high {
                    node.children[node.children.len() - 1]
                } else {
                    node.children[0]
                };
            }
            Page::Leaf(leaf) => {
                let edge = if high { leaf.high() } else { leaf.low() };
                return Ok(edge.cloned());
            }
        }
    }
    Err(too_deep(root))
}

/// Verify every structural invariant of the tree rooted at `root`.
pub fn check<R: PageReader + ?Sized>(io: &R, root: BlockId) -> Result<TreeStats, IndexError> {
    let mut stats = TreeStats::default();
    stats.height = check_page(io, root, None, None, true, 0, &mut stats)?;
    Ok(stats)
}

fn check_page<R: PageReader + ?Sized>(
    io: &R,
    id: BlockId,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    is_root: bool,
    depth: usize,
    stats: &mut TreeStats,
) -> Result<usize, IndexError> {
    if depth >= MAX_DEPTH {
        return Err(too_deep(id));
    }
    let params = *io.params();
    let page = io.read_page(id)?;
    let in_range = |key: &[u8]| lower.is_none_or(|l| key >= l) && upper.is_none_or(|u| key < u);
    let fail = |message: String| Err(IndexError::Consistency(format!("page {id}: {message}")));

    if !is_root && page.is_underfull(&params) {
        return fail(format!("underfull with {} entries", page.count()));
    }

    match page {
        Page::Leaf(leaf) => {
            if leaf.records.windows(2).any(|w| w[0].key() >= w[1].key()) {
                return fail("records out of order".to_string());
            }
            if let Some(bad) = leaf.records.iter().find(|r| !in_range(r.key())) {
                return fail(format!("key {} outside parent bounds", hex(bad.key())));
            }
            stats.records += leaf.records.len();
            stats.leaves += 1;
            Ok(1)
        }
        Page::Branch(node) => {
            if node.keys.is_empty() {
                return fail("branch with no keys".to_string());
            }
            if node.children.len() != node.keys.len() + 1 {
                return fail(format!(
                    "{} keys but {} children",
                    node.keys.len(),
                    node.children.len()
                ));
            }
            if node.keys.windows(2).any(|w| w[0] >= w[1]) {
                return fail("separators out of order".to_string());
            }
            if let Some(bad) = node.keys.iter().find(|k| !in_range(k.as_slice())) {
                return fail(format!("separator {} outside parent bounds", hex(bad)));
            }
            stats.branches += 1;

            let mut leaf_depth = None;
            for (i, &child) in node.children.iter().enumerate() {
                let child_lower = if i == 0 { lower } else { Some(node.keys[i - 1].as_slice()) };
                let child_upper = node.keys.get(i).map(Vec::as_slice).or(upper);
                let d = check_page(io, child, child_lower, child_upper, false, depth + 1, stats)?;
                match leaf_depth {
                    None => leaf_depth = Some(d),
                    Some(expected) if expected != d => {
                        return fail(format!("leaves at uneven depths ({expected} and {d})"));
                    }
                    Some(_) => {}
                }
            }
            Ok(leaf_depth.unwrap_or(0) + 1)
        }
    }
}

/// Count every record.
pub fn count<R: PageReader + ?Sized>(io: &R, root: BlockId) -> Result<usize, IndexError> {
    let mut total = 0;
    let mut stack = vec![(root, 0usize)];
    while let Some((id, depth)) = stack.pop() {
        if depth >= MAX_DEPTH {
            return Err(too_deep(root));
        }
        match io.read_page(id)? {
            Page::Branch(node) => stack.extend(node.children.iter().map(|&c| (c, depth + 1))),
            Page::Leaf(leaf) => total += leaf.records.len(),
        }
    }
    Ok(total)
}

/// Human-readable structure of the tree.
pub fn dump<R: PageReader + ?Sized>(io: &R, root: BlockId) -> Result<String, IndexError> {
    let mut out = String::new();
    let mut stack = vec![(root, 0usize)];
    while let Some((id, depth)) = stack.pop() {
        if depth >= MAX_DEPTH {
            return Err(too_deep(root));
        }
        let page = io.read_page(id)?;
        let _ = writeln!(out, "{:indent$}[{}] {}", "", id, page.describe(), indent = depth * 2);
        if let Page::Branch(node) = page {
            stack.extend(node.children.iter().rev().map(|&c| (c, depth + 1)));
        }
    }
    Ok(out)
}

fn too_deep(root: BlockId) -> IndexError {
    IndexError::Consistency(format!("tree under root {root} exceeds depth {MAX_DEPTH}"))
}

fn kind_mismatch(a: BlockId, b: BlockId) -> IndexError {
    IndexError::Consistency(format!("sibling pages {a} and {b} differ in kind"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{DuplicateTracker, MemoryStore};
    use crate::testing::{int_key, int_record, small_params};

    fn blocks() -> BlockMgr {
        BlockMgr::new(Box::new(MemoryStore::new(small_params().block_size, None)))
    }

    fn build(blocks: &BlockMgr, params: &IndexParams, keys: impl IntoIterator<Item = u32>) -> BlockId {
        let mut io = InPlace { blocks, params };
        let mut root = format(&mut io).expect("format");
        for k in keys {
            root = insert(&mut io, root, int_record(params, k, k)).expect("insert").0;
        }
        root
    }

    #[test]
    fn test_search_after_inserts() {
        let params = small_params();
        let blocks = blocks();
        let root = build(&blocks, &params, (0..50).map(|i| i * 2));
        let io = InPlace { blocks: &blocks, params: &params };
        for i in 0..50 {
            let found = search(&io, root, &int_key(i * 2)).expect("search");
            assert_eq!(found, Some(int_record(&params, i * 2, i * 2)));
            assert_eq!(search(&io, root, &int_key(i * 2 + 1)).expect("search"), None);
        }
        let stats = check(&io, root).expect("check");
        assert_eq!(stats.records, 50);
        assert!(stats.height >= 3);
    }

    #[test]
    fn test_replace_returns_previous() {
        let params = small_params();
        let blocks = blocks();
        let root = build(&blocks, &params, 0..10);
        let mut io = InPlace { blocks: &blocks, params: &params };
        let (root, previous) = insert(&mut io, root, int_record(&params, 3, 99)).expect("insert");
        assert_eq!(previous, Some(int_record(&params, 3, 3)));
        assert_eq!(
            search(&io, root, &int_key(3)).expect("search"),
            Some(int_record(&params, 3, 99))
        );
        assert_eq!(count(&io, root).expect("count"), 10);
    }

    #[test]
    fn test_delete_rebalances_to_single_leaf() {
        let params = small_params();
        let blocks = blocks();
        let mut root = build(&blocks, &params, 0..40);
        let mut io = InPlace { blocks: &blocks, params: &params };
        for k in (0..40).rev().step_by(3) {
            root = delete(&mut io, root, &int_key(k)).expect("delete").0;
            check(&io, root).expect("check after delete");
        }
        for k in 0..40 {
            root = delete(&mut io, root, &int_key(k)).expect("delete").0;
            check(&io, root).expect("check after delete");
        }
        assert_eq!(io.read_page(root).expect("root"), Page::Leaf(LeafPage::new()));
    }

    #[test]
    fn test_first_and_last_record() {
        let params = small_params();
        let blocks = blocks();
        let io = InPlace { blocks: &blocks, params: &params };
        let empty = build(&blocks, &params, []);
        assert_eq!(first_record(&io, empty).expect("first"), None);

        let root = build(&blocks, &params, [17, 3, 42, 8, 25, 1, 30, 12]);
        assert_eq!(first_record(&io, root).expect("first"), Some(int_record(&params, 1, 1)));
        assert_eq!(last_record(&io, root).expect("last"), Some(int_record(&params, 42, 42)));
    }

    #[test]
    fn test_check_detects_misordered_leaf() {
        let params = small_params();
        let blocks = blocks();
        let mut io = InPlace { blocks: &blocks, params: &params };
        let bad = LeafPage {
            records: vec![int_record(&params, 5, 0), int_record(&params, 2, 0)],
        };
        let root = io.create_page(&Page::Leaf(bad)).expect("create");
        let err = check(&io, root).expect_err("out of order");
        assert!(err.is_consistency());
    }

    #[test]
    fn test_copy_on_write_keeps_old_root_readable() {
        let params = small_params();
        let tracker = Arc::new(DuplicateTracker::new());
        let blocks = BlockMgr::new(Box::new(MemoryStore::new(params.block_size, None))).with_observer(tracker.clone());
        let old_root = build(&blocks, &params, 0..20);

        let config = TreeConfig::default();
        let mut writes = WriteSet::new();
        let mut io = TxnPages {
            blocks: &blocks,
            params: &params,
            config: &config,
            writes: &mut writes,
        };
        let (new_root, _) = insert(&mut io, old_root, int_record(&params, 100, 1)).expect("insert");
        assert_ne!(new_root, old_root);
        assert!(tracker.duplicate_count() > 0);

        let snapshot = InPlace { blocks: &blocks, params: &params };
        assert_eq!(search(&snapshot, old_root, &int_key(100)).expect("search"), None);
        assert_eq!(count(&snapshot, old_root).expect("count"), 20);
        assert_eq!(count(&snapshot, new_root).expect("count"), 21);
        check(&snapshot, new_root).expect("check");
    }

    #[test]
    fn test_dump_lists_every_page() {
        let params = small_params();
        let blocks = blocks();
        let root = build(&blocks, &params, 0..12);
        let io = InPlace { blocks: &blocks, params: &params };
        let text = dump(&io, root).expect("dump");
        let stats = check(&io, root).expect("check");
        assert_eq!(text.lines().count(), stats.leaves + stats.branches);
        assert!(text.starts_with(&format!("[{root}] branch")));
    }
}
