//! Range index as a transactional component.
//!
//! # Design
//!
//! The committed root lives behind a lock and is only replaced by
//! [`TransactionalComponent::commit`], which the coordinator calls under its
//! gate. Each transaction carries a view: the root it reads and, once it is a
//! writer, a [`WriteSet`] of the blocks it has made private.
//!
//! With copy-on-write enabled for a page kind, a writer never changes a
//! committed page of that kind, so readers keep a stable snapshot. A page
//! kind written in place is visible to every reader immediately; abort puts
//! the original content back.
//!
//! The redo payload of a commit is the encoded [`TreeState`] of the new
//! root, so replaying it is republishing that root.
//!
//! A mutation that fails part way (for instance on an exhausted store) can
//! leave the write set half applied. The view is then marked failed: later
//! writes and `prepare` refuse, so the transaction can only be aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::IndexError;
use super::index::{check_prefix_len, load_or_format};
use super::iter::{DistinctIter, RangeIter};
use super::ops::{self, PageSource, TreeStats, TxnPages};
use super::state::{RootFile, TreeState};
use crate::block::{BlockId, BlockMgr, WriteSet, open_store};
use crate::config::{IndexParams, StoreConfig, TreeConfig};
use crate::record::{Record, hex};
use crate::sync::{lock, read, write};
use crate::txn::{ComponentId, Promote, TransactionalComponent, Txn, TxnError, TxnId};

#[derive(Debug)]
struct TxnView {
    root: BlockId,
    writes: Option<WriteSet>,
    prepared: Option<TreeState>,
    failed: bool,
    /// Snapshot root before the last promotion, restored if it is undone.
    promoted_from: Option<BlockId>,
}

impl TxnView {
    fn is_modified(&self) -> bool {
        self.writes.as_ref().is_some_and(WriteSet::is_dirty)
    }
}

/// A B+Tree whose changes commit with a transaction.
pub struct TxnIndex {
    component_id: ComponentId,
    params: IndexParams,
    config: TreeConfig,
    blocks: Arc<BlockMgr>,
    committed: RwLock<BlockId>,
    root_file: Option<RootFile>,
    txns: Mutex<HashMap<TxnId, TxnView>>,
}

impl TxnIndex {
    /// Open the index described by `store`, creating an empty tree if the
    /// backing holds none.
    pub fn open(
        component_id: ComponentId,
        params: IndexParams,
        config: TreeConfig,
        store: &StoreConfig,
    ) -> Result<Self, IndexError> {
        let blocks = Arc::new(BlockMgr::new(open_store(store, params.block_size)?));
        Self::with_block_mgr(component_id, params, config, blocks)
    }

    /// Open over a caller-supplied block manager, for instance one carrying
    /// a [`BlockObserver`](crate::block::BlockObserver).
    pub fn with_block_mgr(
        component_id: ComponentId,
        params: IndexParams,
        config: TreeConfig,
        blocks: Arc<BlockMgr>,
    ) -> Result<Self, IndexError> {
        params.validate()?;
        let (root, root_file) = load_or_format(&blocks, &params)?;
        Ok(Self {
            component_id,
            params,
            config,
            blocks,
            committed: RwLock::new(root),
            root_file,
            txns: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub const fn params(&self) -> &IndexParams {
        &self.params
    }

    #[must_use]
    pub fn blocks(&self) -> &Arc<BlockMgr> {
        &self.blocks
    }

    /// The root every new transaction starts from.
    #[must_use]
    pub fn committed_root(&self) -> BlockId {
        *read(&self.committed)
    }

    /// The root `txn` currently reads.
    pub fn root_in(&self, txn: &Txn) -> Result<BlockId, IndexError> {
        lock(&self.txns)
            .get(&txn.id())
            .map(|view| view.root)
            .ok_or(IndexError::UnknownTransaction(txn.id()))
    }

    /// Insert or replace a record. Returns the record it replaced.
    pub fn insert(&self, txn: &mut Txn, record: Record) -> Result<Option<Record>, IndexError> {
        self.params.record_factory().check(&record)?;
        if self.config.log_operations {
            tracing::trace!("txn {} insert {:?}", txn.id(), record);
        }
        self.mutate(txn, |io, root| ops::insert(io, root, record))
    }

    /// Remove the record with `key`. Returns the removed record.
    pub fn delete(&self, txn: &mut Txn, key: &[u8]) -> Result<Option<Record>, IndexError> {
        self.params.record_factory().check_key(key)?;
        if self.config.log_operations {
            tracing::trace!("txn {} delete {}", txn.id(), hex(key));
        }
        self.mutate(txn, |io, root| ops::delete(io, root, key))
    }

    pub fn get(&self, txn: &Txn, key: &[u8]) -> Result<Option<Record>, IndexError> {
        self.params.record_factory().check_key(key)?;
        ops::search(&self.source(), self.root_in(txn)?, key)
    }

    pub fn iter<'t>(&self, txn: &'t Txn) -> Result<RangeIter<'t>, IndexError> {
        RangeIter::new(self.source(), self.root_in(txn)?, None, None)
    }

    /// Records with `min <= key < max`; a missing bound is open.
    pub fn iter_range<'t>(
        &self,
        txn: &'t Txn,
        min: Option<&[u8]>,
        max: Option<&[u8]>,
    ) -> Result<RangeIter<'t>, IndexError> {
        RangeIter::new(self.source(), self.root_in(txn)?, min, max)
    }

    /// The first record of each run sharing the first `prefix_len` key bytes.
    pub fn distinct_by_key_prefix<'t>(&self, txn: &'t Txn, prefix_len: usize) -> Result<DistinctIter<'t>, IndexError> {
        check_prefix_len(prefix_len, &self.params)?;
        Ok(DistinctIter::new(self.source(), self.root_in(txn)?, prefix_len))
    }

    pub fn min_record(&self, txn: &Txn) -> Result<Option<Record>, IndexError> {
        ops::first_record(&self.source(), self.root_in(txn)?)
    }

    pub fn max_record(&self, txn: &Txn) -> Result<Option<Record>, IndexError> {
        ops::last_record(&self.source(), self.root_in(txn)?)
    }

    pub fn len(&self, txn: &Txn) -> Result<usize, IndexError> {
        ops::count(&self.source(), self.root_in(txn)?)
    }

    pub fn is_empty(&self, txn: &Txn) -> Result<bool, IndexError> {
        Ok(self.min_record(txn)?.is_none())
    }

    pub fn check(&self, txn: &Txn) -> Result<TreeStats, IndexError> {
        ops::check(&self.source(), self.root_in(txn)?)
    }

    pub fn dump(&self, txn: &Txn) -> Result<String, IndexError> {
        ops::dump(&self.source(), self.root_in(txn)?)
    }

    fn source(&self) -> PageSource {
        PageSource::new(Arc::clone(&self.blocks), self.params)
    }

    /// Run a tree mutation against the writer view of `txn`.
    ///
    /// The view is taken out of the map for the duration so other
    /// transactions are not blocked; `&mut Txn` guarantees nobody else uses it.
    fn mutate<F>(&self, txn: &mut Txn, op: F) -> Result<Option<Record>, IndexError>
    where
        F: FnOnce(&mut TxnPages<'_>, BlockId) -> Result<(BlockId, Option<Record>), IndexError>,
    {
        if !txn.is_write() {
            return Err(IndexError::ReadOnly(txn.id()));
        }
        let mut view = {
            let mut txns = lock(&self.txns);
            match txns.get(&txn.id()) {
                None => return Err(IndexError::UnknownTransaction(txn.id())),
                Some(view) if view.failed => return Err(IndexError::TransactionFailed(txn.id())),
                Some(_) => {}
            }
            txns.remove(&txn.id()).ok_or(IndexError::UnknownTransaction(txn.id()))?
        };

        let result = match view.writes.as_mut() {
            Some(writes) => {
                let mut io = TxnPages {
                    blocks: &self.blocks,
                    params: &self.params,
                    config: &self.config,
                    writes,
                };
                op(&mut io, view.root).and_then(|(root, record)| {
                    if self.config.checking {
                        ops::check(&io, root)?;
                    }
                    Ok((root, record))
                })
            }
            None => Err(IndexError::ReadOnly(txn.id())),
        };
        match &result {
            Ok((root, _)) => view.root = *root,
            Err(IndexError::ReadOnly(_)) => {}
            Err(e) => {
                tracing::warn!("transaction {} failed on index {}: {}", txn.id(), self.component_id, e);
                view.failed = true;
            }
        }
        lock(&self.txns).insert(txn.id(), view);
        result.map(|(_, record)| record)
    }

    fn with_view<T>(&self, txn: &Txn, f: impl FnOnce(&mut TxnView) -> T) -> Result<T, IndexError> {
        lock(&self.txns)
            .get_mut(&txn.id())
            .map(f)
            .ok_or(IndexError::UnknownTransaction(txn.id()))
    }

    fn take_writes(&self, txn: &Txn) -> Result<(Option<WriteSet>, Option<TreeState>, BlockId), IndexError> {
        self.with_view(txn, |view| (view.writes.take(), view.prepared.take(), view.root))
    }
}

impl TransactionalComponent for TxnIndex {
    fn component_id(&self) -> ComponentId {
        self.component_id
    }

    fn recover(&self, payload: &[u8]) -> Result<(), TxnError> {
        let state = TreeState::from_bytes(payload)?;
        if let Some(root_file) = &self.root_file {
            root_file.write(&state)?;
        }
        self.blocks.restore(state.limit, &state.free).map_err(IndexError::from)?;
        *write(&self.committed) = state.root;
        tracing::info!("index {} recovered root {}", self.component_id, state.root);
        Ok(())
    }

    fn begin(&self, txn: &Txn) -> Result<(), TxnError> {
        let root = self.committed_root();
        lock(&self.txns).insert(
            txn.id(),
            TxnView {
                root,
                writes: None,
                prepared: None,
                failed: false,
                promoted_from: None,
            },
        );
        Ok(())
    }

    fn promote(&self, txn: &Txn, how: Promote) -> Result<(), TxnError> {
        let committed = self.committed_root();
        self.with_view(txn, |view| {
            if view.writes.is_none() {
                view.promoted_from = Some(view.root);
                if how == Promote::ReadCommitted {
                    view.root = committed;
                }
                view.writes = Some(WriteSet::new());
            }
        })?;
        Ok(())
    }

    fn prepare(&self, txn: &Txn) -> Result<Option<Vec<u8>>, TxnError> {
        let state = {
            let txns = lock(&self.txns);
            let view = txns.get(&txn.id()).ok_or(IndexError::UnknownTransaction(txn.id()))?;
            if view.failed {
                return Err(IndexError::TransactionFailed(txn.id()).into());
            }
            if !view.is_modified() {
                return Ok(None);
            }
            let superseded = view.writes.as_ref().map_or(&[][..], WriteSet::superseded);
            TreeState {
                root: view.root,
                limit: self.blocks.limit(),
                free: self.blocks.free_list(superseded),
            }
        };
        self.blocks.sync().map_err(IndexError::from)?;
        let payload = state.to_bytes();
        self.with_view(txn, |view| view.prepared = Some(state))?;
        Ok(Some(payload))
    }

    fn commit(&self, txn: &Txn) -> Result<(), TxnError> {
        let (writes, prepared, root) = self.take_writes(txn)?;
        let Some(writes) = writes else {
            return Ok(());
        };
        if !writes.is_dirty() {
            return Ok(());
        }
        let previous = std::mem::replace(&mut *write(&self.committed), root);
        self.blocks.commit_writes(writes, txn.generation() + 1);
        tracing::debug!("index {} committed root {} (was {})", self.component_id, root, previous);

        if let (Some(root_file), Some(state)) = (&self.root_file, prepared) {
            root_file.write(&state)?;
        }
        Ok(())
    }

    /// Undo the transaction's writes. A writer falls back to the committed
    /// root; a reader whose promotion is being undone keeps its snapshot.
    fn abort(&self, txn: &Txn) -> Result<(), TxnError> {
        let (writes, _, _) = self.take_writes(txn)?;
        let committed = self.committed_root();
        self.with_view(txn, |view| {
            view.failed = false;
            let snapshot = view.promoted_from.take();
            view.root = match snapshot {
                Some(root) if !txn.is_write() => root,
                _ => committed,
            };
        })?;
        if let Some(writes) = writes {
            self.blocks.abort_writes(writes).map_err(IndexError::from)?;
            tracing::debug!("index {} aborted transaction {}", self.component_id, txn.id());
        }
        Ok(())
    }

    fn end(&self, txn: &Txn) {
        lock(&self.txns).remove(&txn.id());
    }

    fn reclaim(&self, oldest_active: u64) -> Result<(), TxnError> {
        self.blocks.reclaim(oldest_active).map_err(IndexError::from)?;
        Ok(())
    }

    fn shutdown(&self) -> Result<(), TxnError> {
        self.blocks.sync().map_err(IndexError::from)?;
        Ok(())
    }
}

impl std::fmt::Debug for TxnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnIndex")
            .field("component_id", &self.component_id)
            .field("params", &self.params)
            .field("committed", &self.committed_root())
            .finish_non_exhaustive()
    }
}
