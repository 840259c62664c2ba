//! Promoting read transactions to writers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::helpers::{single_index, single_index_with_policy, tree_config};
use crate::config::{CoordinatorConfig, StoreConfig, WriterPolicy};
use crate::testing::{init_tracing, int_key, int_record, small_params};
use crate::tree::{IndexError, TxnIndex};
use crate::txn::{
    ComponentId, Journal, Promote, TransactionCoordinator, TransactionalComponent, Txn, TxnError, TxnMode,
};

/// A component that refuses to promote while `refusing` is set.
#[derive(Default)]
struct Refusing {
    refusing: AtomicBool,
}

impl TransactionalComponent for Refusing {
    fn component_id(&self) -> ComponentId {
        ComponentId(2)
    }

    fn recover(&self, _payload: &[u8]) -> Result<(), TxnError> {
        Ok(())
    }

    fn begin(&self, _txn: &Txn) -> Result<(), TxnError> {
        Ok(())
    }

    fn promote(&self, txn: &Txn, _how: Promote) -> Result<(), TxnError> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(IndexError::InvalidArgument(format!("transaction {} may not write", txn.id())).into());
        }
        Ok(())
    }

    fn prepare(&self, _txn: &Txn) -> Result<Option<Vec<u8>>, TxnError> {
        Ok(None)
    }

    fn commit(&self, _txn: &Txn) -> Result<(), TxnError> {
        Ok(())
    }

    fn abort(&self, _txn: &Txn) -> Result<(), TxnError> {
        Ok(())
    }

    fn end(&self, _txn: &Txn) {}
}

#[test]
fn test_promote_without_intervening_commit() {
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    let mut txn = coordinator.begin(TxnMode::Read).expect("begin");

    let err = index.insert(&mut txn, int_record(&params, 1, 1)).expect_err("read-only");
    assert!(matches!(err, IndexError::ReadOnly(_)));

    assert!(coordinator.promote(&mut txn).expect("promote"));
    assert!(txn.is_write());
    index.insert(&mut txn, int_record(&params, 1, 1)).expect("insert");
    coordinator.commit(&mut txn).expect("commit");
    coordinator.end(txn).expect("end");
    assert_eq!(coordinator.data_version(), 1);
}

#[test]
fn test_isolated_promote_fails_after_commit() {
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    let mut reader = coordinator.begin(TxnMode::Read).expect("begin reader");

    coordinator
        .execute_write(|txn| index.insert(txn, int_record(&params, 9, 9)).map_err(crate::TxnError::from))
        .expect("write");

    assert!(!coordinator.promote(&mut reader).expect("promote"));
    assert!(!reader.is_write());
    // The reader still sees its snapshot.
    assert_eq!(index.get(&reader, &int_key(9)).expect("get"), None);

    assert!(coordinator.promote_with(&mut reader, Promote::ReadCommitted).expect("promote"));
    assert_eq!(index.get(&reader, &int_key(9)).expect("get"), Some(int_record(&params, 9, 9)));
    index.delete(&mut reader, &int_key(9)).expect("delete");
    coordinator.commit(&mut reader).expect("commit");
    coordinator.end(reader).expect("end");

    let txn = coordinator.begin(TxnMode::Read).expect("begin");
    assert!(index.is_empty(&txn).expect("is_empty"));
    coordinator.end(txn).expect("end");
}

#[test]
fn test_promote_refused_while_writer_active_under_fail_policy() {
    let (coordinator, _index) = single_index_with_policy(tree_config(true, true), WriterPolicy::Fail);
    let writer = coordinator.begin(TxnMode::Write).expect("writer");
    let mut reader = coordinator.begin(TxnMode::Read).expect("reader");

    assert!(!coordinator.promote(&mut reader).expect("promote"));
    assert!(matches!(coordinator.begin(TxnMode::Write), Err(crate::TxnError::WriterBusy)));

    let mut writer = writer;
    coordinator.abort(&mut writer).expect("abort");
    coordinator.end(writer).expect("end");
    assert!(coordinator.promote(&mut reader).expect("promote after writer left"));
    coordinator.abort(&mut reader).expect("abort");
    coordinator.end(reader).expect("end");
}

#[test]
fn test_promoting_a_writer_is_a_no_op() {
    let (coordinator, _index) = single_index(tree_config(false, false));
    let mut txn = coordinator.begin(TxnMode::Write).expect("begin");
    assert!(coordinator.promote(&mut txn).expect("promote"));
    coordinator.commit(&mut txn).expect("commit");
    assert!(coordinator.promote(&mut txn).is_err());
    coordinator.end(txn).expect("end");
}

#[test]
fn test_failed_promote_keeps_reader_snapshot() {
    init_tracing();
    let params = small_params();
    let index = Arc::new(
        TxnIndex::open(ComponentId(1), params, tree_config(true, true), &StoreConfig::memory()).expect("open index"),
    );
    let refusing = Arc::new(Refusing::default());
    let coordinator = TransactionCoordinator::new(Journal::in_memory(), CoordinatorConfig::default());
    coordinator.add(index.clone()).expect("add index");
    coordinator.add(refusing.clone()).expect("add component");
    coordinator.start().expect("start");

    let mut reader = coordinator.begin(TxnMode::Read).expect("begin reader");
    let snapshot = index.root_in(&reader).expect("root");
    coordinator
        .execute_write(|txn| index.insert(txn, int_record(&params, 1, 1)).map_err(TxnError::from))
        .expect("write");
    assert_ne!(index.committed_root(), snapshot);

    refusing.refusing.store(true, Ordering::SeqCst);
    assert!(coordinator.promote_with(&mut reader, Promote::ReadCommitted).is_err());
    assert!(!reader.is_write());
    assert_eq!(reader.generation(), 0);
    assert_eq!(index.root_in(&reader).expect("root"), snapshot);
    assert_eq!(index.get(&reader, &int_key(1)).expect("get"), None);
    let err = index.insert(&mut reader, int_record(&params, 2, 2)).expect_err("still a reader");
    assert!(matches!(err, IndexError::ReadOnly(_)));

    // The writer slot was not taken, and a later promotion still works.
    refusing.refusing.store(false, Ordering::SeqCst);
    assert!(coordinator.promote_with(&mut reader, Promote::ReadCommitted).expect("promote"));
    assert_eq!(reader.generation(), 1);
    assert_eq!(index.get(&reader, &int_key(1)).expect("get"), Some(int_record(&params, 1, 1)));
    coordinator.abort(&mut reader).expect("abort");
    coordinator.end(reader).expect("end");
}
