//! Non-transactional range index.
//!
//! Every mutation writes its pages in place and republishes the root at once.
//! There is no coordinator and no snapshot isolation; the borrow checker keeps
//! iterators and mutations apart.
//!
//! A file-backed index keeps its root pointer and allocator state in a root
//! file beside the page file. [`RangeIndex::sync`] makes both durable.

use std::sync::Arc;

use super::IndexError;
use super::iter::{DistinctIter, RangeIter};
use super::ops::{self, InPlace, PageReader, PageSource, TreeStats};
use super::state::{RootFile, TreeState};
use crate::block::{BlockId, BlockMgr, open_store};
use crate::config::{IndexParams, StoreConfig, TreeConfig};
use crate::record::{Record, hex};

/// A B+Tree whose writes land directly on its blocks.
pub struct RangeIndex {
    params: IndexParams,
    config: TreeConfig,
    blocks: Arc<BlockMgr>,
    root: BlockId,
    root_file: Option<RootFile>,
}

impl RangeIndex {
    /// Open the index described by `store`, creating an empty tree if the
    /// backing holds none.
    pub fn open(params: IndexParams, config: TreeConfig, store: &StoreConfig) -> Result<Self, IndexError> {
        let blocks = Arc::new(BlockMgr::new(open_store(store, params.block_size)?));
        let (root, root_file) = load_or_format(&blocks, &params)?;
        Ok(Self {
            params,
            config,
            blocks,
            root,
            root_file,
        })
    }

    /// A fresh tree in a caller-supplied block manager. Nothing is persisted.
    pub fn with_block_mgr(params: IndexParams, config: TreeConfig, blocks: Arc<BlockMgr>) -> Result<Self, IndexError> {
        params.validate()?;
        let root = ops::format(&mut InPlace {
            blocks: &blocks,
            params: &params,
        })?;
        Ok(Self {
            params,
            config,
            blocks,
            root,
            root_file: None,
        })
    }

    #[must_use]
    pub const fn params(&self) -> &IndexParams {
        &self.params
    }

    #[must_use]
    pub const fn root_id(&self) -> BlockId {
        self.root
    }

    #[must_use]
    pub fn blocks(&self) -> &Arc<BlockMgr> {
        &self.blocks
    }

    /// Insert or replace a record. Returns the record it replaced.
    pub fn insert(&mut self, record: Record) -> Result<Option<Record>, IndexError> {
        self.params.record_factory().check(&record)?;
        if self.config.log_operations {
            tracing::trace!("insert {:?}", record);
        }
        let (root, previous) = ops::insert(&mut self.writer(), self.root, record)?;
        self.set_root(root);
        self.after_mutation()?;
        Ok(previous)
    }

    /// Remove the record with `key`. Returns the removed record.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Record>, IndexError> {
        self.params.record_factory().check_key(key)?;
        if self.config.log_operations {
            tracing::trace!("delete {}", hex(key));
        }
        let (root, removed) = ops::delete(&mut self.writer(), self.root, key)?;
        self.set_root(root);
        self.after_mutation()?;
        Ok(removed)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Record>, IndexError> {
        self.params.record_factory().check_key(key)?;
        ops::search(&self.source(), self.root, key)
    }

    pub fn iter(&self) -> Result<RangeIter<'_>, IndexError> {
        RangeIter::new(self.source(), self.root, None, None)
    }

    /// Records with `min <= key < max`; a missing bound is open.
    pub fn iter_range(&self, min: Option<&[u8]>, max: Option<&[u8]>) -> Result<RangeIter<'_>, IndexError> {
        RangeIter::new(self.source(), self.root, min, max)
    }

    /// The first record of each run sharing the first `prefix_len` key bytes.
    pub fn distinct_by_key_prefix(&self, prefix_len: usize) -> Result<DistinctIter<'_>, IndexError> {
        check_prefix_len(prefix_len, &self.params)?;
        Ok(DistinctIter::new(self.source(), self.root, prefix_len))
    }

    pub fn min_record(&self) -> Result<Option<Record>, IndexError> {
        ops::first_record(&self.source(), self.root)
    }

    pub fn max_record(&self) -> Result<Option<Record>, IndexError> {
        ops::last_record(&self.source(), self.root)
    }

    pub fn len(&self) -> Result<usize, IndexError> {
        ops::count(&self.source(), self.root)
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.min_record()?.is_none())
    }

    pub fn check(&self) -> Result<TreeStats, IndexError> {
        ops::check(&self.source(), self.root)
    }

    pub fn dump(&self) -> Result<String, IndexError> {
        ops::dump(&self.source(), self.root)
    }

    /// Flush pages, then publish the root and allocator state.
    pub fn sync(&self) -> Result<(), IndexError> {
        self.blocks.sync()?;
        if let Some(root_file) = &self.root_file {
            root_file.write(&TreeState {
                root: self.root,
                limit: self.blocks.limit(),
                free: self.blocks.free_list(&[]),
            })?;
        }
        Ok(())
    }

    fn source(&self) -> PageSource {
        PageSource::new(Arc::clone(&self.blocks), self.params)
    }

    fn writer(&self) -> InPlace<'_> {
        InPlace {
            blocks: &self.blocks,
            params: &self.params,
        }
    }

    fn set_root(&mut self, root: BlockId) {
        if root != self.root {
            tracing::debug!("root moved from {} to {}", self.root, root);
            self.root = root;
        }
    }

    fn after_mutation(&self) -> Result<(), IndexError> {
        if self.config.checking {
            self.check()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RangeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeIndex")
            .field("params", &self.params)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Recover the persisted root of a backing, or format a new tree in it.
pub(crate) fn load_or_format(
    blocks: &BlockMgr,
    params: &IndexParams,
) -> Result<(BlockId, Option<RootFile>), IndexError> {
    let root_file = blocks.store().path().map(|p| RootFile::beside(&p));

    if let Some(state) = root_file.as_ref().map(RootFile::read).transpose()?.flatten() {
        blocks.restore(state.limit, &state.free)?;
        // Fails on a root that does not decode.
        InPlace { blocks, params }.read_page(state.root)?;
        tracing::info!("opened index at root {} ({} blocks)", state.root, state.limit);
        return Ok((state.root, root_file));
    }

    blocks.restore(0, &[])?;
    let root = ops::format(&mut InPlace { blocks, params })?;
    if let Some(root_file) = &root_file {
        blocks.sync()?;
        root_file.write(&TreeState {
            root,
            limit: blocks.limit(),
            free: blocks.free_list(&[]),
        })?;
    }
    tracing::info!("formatted new index with root {}", root);
    Ok((root, root_file))
}

pub(crate) fn check_prefix_len(prefix_len: usize, params: &IndexParams) -> Result<(), IndexError> {
    if prefix_len == 0 || prefix_len > params.key_len {
        return Err(IndexError::InvalidArgument(format!(
            "prefix length {prefix_len} outside 1..={}",
            params.key_len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryStore;
    use crate::testing::{int_key, int_record, small_params};

    fn memory_index() -> RangeIndex {
        RangeIndex::open(small_params(), TreeConfig::default().with_checking(true), &StoreConfig::memory())
            .expect("open")
    }

    #[test]
    fn test_insert_get_delete() {
        let params = small_params();
        let mut index = memory_index();
        assert!(index.is_empty().expect("is_empty"));

        for k in 0..25 {
            assert_eq!(index.insert(int_record(&params, k, k)).expect("insert"), None);
        }
        assert_eq!(index.len().expect("len"), 25);
        assert_eq!(index.get(&int_key(7)).expect("get"), Some(int_record(&params, 7, 7)));

        let removed = index.delete(&int_key(7)).expect("delete");
        assert_eq!(removed, Some(int_record(&params, 7, 7)));
        assert_eq!(index.get(&int_key(7)).expect("get"), None);
        assert_eq!(index.delete(&int_key(7)).expect("delete absent"), None);
        assert_eq!(index.len().expect("len"), 24);
    }

    #[test]
    fn test_wrong_widths_are_rejected() {
        let mut index = memory_index();
        let factory = crate::record::RecordFactory::new(4, 2);
        let narrow = factory.create(&[1, 2, 3, 4], &[0, 0]).expect("create");
        assert!(matches!(index.insert(narrow), Err(IndexError::Record(_))));
        assert!(matches!(index.get(&[1, 2]), Err(IndexError::Record(_))));
    }

    #[test]
    fn test_min_max_and_dump() {
        let params = small_params();
        let mut index = memory_index();
        for k in [40, 10, 30, 20] {
            index.insert(int_record(&params, k, 0)).expect("insert");
        }
        assert_eq!(index.min_record().expect("min"), Some(int_record(&params, 10, 0)));
        assert_eq!(index.max_record().expect("max"), Some(int_record(&params, 40, 0)));
        assert!(index.dump().expect("dump").contains("leaf"));
    }

    #[test]
    fn test_prefix_length_bounds() {
        let index = memory_index();
        assert!(matches!(index.distinct_by_key_prefix(0), Err(IndexError::InvalidArgument(_))));
        assert!(matches!(index.distinct_by_key_prefix(5), Err(IndexError::InvalidArgument(_))));
        assert!(index.distinct_by_key_prefix(4).is_ok());
    }

    #[test]
    fn test_file_index_reopens_after_sync() {
        let params = small_params();
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StoreConfig::file(dir.path().join("index.dat"));

        let (root, free) = {
            let mut index = RangeIndex::open(params, TreeConfig::default(), &store).expect("create");
            for k in 0..40 {
                index.insert(int_record(&params, k, k + 1)).expect("insert");
            }
            for k in 0..10 {
                index.delete(&int_key(k)).expect("delete");
            }
            index.sync().expect("sync");
            (index.root_id(), index.blocks().free_list(&[]))
        };

        let mut index = RangeIndex::open(params, TreeConfig::default(), &store).expect("reopen");
        assert_eq!(index.root_id(), root);
        assert_eq!(index.blocks().free_list(&[]), free);
        assert_eq!(index.len().expect("len"), 30);
        assert_eq!(index.check().expect("check").records, 30);

        index.insert(int_record(&params, 100, 0)).expect("insert after reopen");
        assert_eq!(index.get(&int_key(100)).expect("get"), Some(int_record(&params, 100, 0)));
    }

    #[test]
    fn test_mapped_index_reopens() {
        let params = small_params();
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StoreConfig::mapped(dir.path().join("index.map"));
        {
            let mut index = RangeIndex::open(params, TreeConfig::default(), &store).expect("create");
            for k in (0..60).rev() {
                index.insert(int_record(&params, k, 0)).expect("insert");
            }
            index.sync().expect("sync");
        }
        let index = RangeIndex::open(params, TreeConfig::default(), &store).expect("reopen");
        let keys: Vec<Record> = index.iter().expect("iter").collect::<Result<_, _>>().expect("scan");
        assert_eq!(keys.len(), 60);
        assert_eq!(keys[0], int_record(&params, 0, 0));
    }

    #[test]
    fn test_with_block_mgr() {
        let params = small_params();
        let blocks = Arc::new(BlockMgr::new(Box::new(MemoryStore::new(params.block_size, None))));
        let mut index = RangeIndex::with_block_mgr(params, TreeConfig::default(), Arc::clone(&blocks)).expect("new");
        index.insert(int_record(&params, 1, 1)).expect("insert");
        assert!(blocks.valid(index.root_id()));
    }
}
