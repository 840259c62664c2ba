//! The persisted root only moves when a write transaction commits a change.

use std::sync::Arc;

use super::helpers::tree_config;
use crate::block::BlockId;
use crate::config::{CoordinatorConfig, StoreConfig};
use crate::testing::{init_tracing, int_key, int_record, small_params};
use crate::tree::{RootFile, TxnIndex};
use crate::txn::{ComponentId, Journal, TransactionCoordinator, TxnMode};

struct FileFixture {
    _dir: tempfile::TempDir,
    root_file: RootFile,
    coordinator: TransactionCoordinator,
    index: Arc<TxnIndex>,
}

impl FileFixture {
    fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("index.dat");
        let index = Arc::new(
            TxnIndex::open(ComponentId(1), small_params(), tree_config(true, true), &StoreConfig::file(&data))
                .expect("open"),
        );
        let journal = Journal::open(&dir.path().join("journal")).expect("journal");
        let coordinator = TransactionCoordinator::new(journal, CoordinatorConfig::default());
        coordinator.add(index.clone()).expect("add");
        coordinator.start().expect("start");
        Self {
            root_file: RootFile::beside(&data),
            _dir: dir,
            coordinator,
            index,
        }
    }

    fn persisted_root(&self) -> BlockId {
        self.root_file.read().expect("read root file").expect("root file exists").root
    }

    fn fill(&self, keys: impl IntoIterator<Item = u32>) {
        let params = small_params();
        self.coordinator
            .execute_write(|txn| {
                for k in keys {
                    self.index.insert(txn, int_record(&params, k, k))?;
                }
                Ok::<_, crate::TxnError>(())
            })
            .expect("fill");
    }
}

#[test]
fn test_root_moves_only_on_commit() {
    let params = small_params();
    let fx = FileFixture::new();
    let r0 = fx.persisted_root();
    assert_eq!(fx.index.committed_root(), r0);

    let mut txn = fx.coordinator.begin(TxnMode::Write).expect("begin");
    for k in 0..10 {
        fx.index.insert(&mut txn, int_record(&params, k, k)).expect("insert");
    }
    assert_ne!(fx.index.root_in(&txn).expect("root"), r0);
    assert_eq!(fx.persisted_root(), r0);
    assert_eq!(fx.index.committed_root(), r0);

    fx.coordinator.commit(&mut txn).expect("commit");
    let r1 = fx.persisted_root();
    assert_ne!(r1, r0);
    assert_eq!(fx.index.committed_root(), r1);
    fx.coordinator.end(txn).expect("end");
}

#[test]
fn test_abort_leaves_root_untouched() {
    let params = small_params();
    let fx = FileFixture::new();
    fx.fill(0..10);
    let r0 = fx.persisted_root();

    let mut txn = fx.coordinator.begin(TxnMode::Write).expect("begin");
    for k in 10..40 {
        fx.index.insert(&mut txn, int_record(&params, k, k)).expect("insert");
    }
    fx.index.delete(&mut txn, &int_key(3)).expect("delete");
    fx.coordinator.abort(&mut txn).expect("abort");
    fx.coordinator.end(txn).expect("end");

    assert_eq!(fx.persisted_root(), r0);
    assert_eq!(fx.index.committed_root(), r0);
    let txn = fx.coordinator.begin(TxnMode::Read).expect("begin");
    assert_eq!(fx.index.len(&txn).expect("len"), 10);
    assert!(fx.index.get(&txn, &int_key(3)).expect("get").is_some());
    fx.index.check(&txn).expect("check");
    fx.coordinator.end(txn).expect("end");
}

#[test]
fn test_no_op_transactions_keep_root() {
    let params = small_params();
    let fx = FileFixture::new();
    fx.fill(0..20);
    let r0 = fx.persisted_root();

    // Same records again: nothing to write.
    fx.fill(0..20);
    assert_eq!(fx.persisted_root(), r0);

    fx.coordinator
        .execute_write(|txn| {
            for k in 100..110 {
                assert_eq!(fx.index.delete(txn, &int_key(k))?, None);
            }
            Ok::<_, crate::TxnError>(())
        })
        .expect("delete absent");
    assert_eq!(fx.persisted_root(), r0);
    assert_eq!(fx.index.committed_root(), r0);

    let txn = fx.coordinator.begin(TxnMode::Read).expect("begin");
    assert_eq!(fx.index.get(&txn, &int_key(5)).expect("get"), Some(int_record(&params, 5, 5)));
    fx.coordinator.end(txn).expect("end");
}

#[test]
fn test_dropped_writer_is_aborted_by_end() {
    let params = small_params();
    let fx = FileFixture::new();
    let r0 = fx.persisted_root();

    let mut txn = fx.coordinator.begin(TxnMode::Write).expect("begin");
    fx.index.insert(&mut txn, int_record(&params, 1, 1)).expect("insert");
    let err = fx.coordinator.end(txn).expect_err("unfinished writer");
    assert!(matches!(err, crate::TxnError::NotFinished(_)));
    assert_eq!(fx.persisted_root(), r0);

    // The writer slot was released.
    let txn = fx.coordinator.begin(TxnMode::Write).expect("begin after abort");
    fx.coordinator.end(txn).expect_err("still unfinished");
    assert_eq!(fx.coordinator.counters().aborted, 2);
}
