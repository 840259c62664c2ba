//! A write that runs out of blocks dooms its transaction.

use std::sync::Arc;

use super::helpers::{DUPLICATE_MODES, tree_config};
use crate::block::BlockError;
use crate::config::{CoordinatorConfig, StoreConfig, TreeConfig};
use crate::testing::{init_tracing, int_key, int_record, small_params};
use crate::tree::{IndexError, TxnIndex};
use crate::txn::{ComponentId, Journal, TransactionCoordinator, TxnMode, TxnState};
use crate::TxnError;

fn bounded_index(config: TreeConfig, max_blocks: u64) -> (TransactionCoordinator, Arc<TxnIndex>) {
    init_tracing();
    let store = StoreConfig::memory().with_max_blocks(max_blocks);
    let index = Arc::new(TxnIndex::open(ComponentId(1), small_params(), config, &store).expect("open index"));
    let coordinator = TransactionCoordinator::new(Journal::in_memory(), CoordinatorConfig::default());
    coordinator.add(index.clone()).expect("add");
    coordinator.start().expect("start");
    (coordinator, index)
}

/// Insert `keys` in one transaction and try to commit whatever happens.
/// Returns the number of records the transaction added to the index.
fn insert_then_commit(
    coordinator: &TransactionCoordinator,
    index: &TxnIndex,
    keys: impl IntoIterator<Item = u32>,
) -> usize {
    let params = small_params();
    let mut txn = coordinator.begin(TxnMode::Write).expect("begin");
    let mut inserted = 0;
    let mut failure = None;
    for k in keys {
        match index.insert(&mut txn, int_record(&params, k, k)) {
            Ok(_) => inserted += 1,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let added = match failure {
        None => {
            coordinator.commit(&mut txn).expect("commit");
            inserted
        }
        Some(e) => {
            assert!(matches!(e, IndexError::Block(BlockError::Exhausted { .. })), "unexpected error: {e}");
            let refused = index.insert(&mut txn, int_record(&params, 999, 0)).expect_err("doomed");
            assert!(matches!(refused, IndexError::TransactionFailed(_)));
            assert!(matches!(index.delete(&mut txn, &int_key(0)), Err(IndexError::TransactionFailed(_))));

            let err = coordinator.commit(&mut txn).expect_err("commit of a failed transaction");
            assert!(matches!(err, TxnError::Index(IndexError::TransactionFailed(_))), "unexpected error: {err}");
            assert_eq!(txn.state(), TxnState::Aborted);
            0
        }
    };
    coordinator.end(txn).expect("end");
    added
}

fn assert_intact(coordinator: &TransactionCoordinator, index: &TxnIndex, keys: &[u32], context: &str) {
    let params = small_params();
    assert!(index.blocks().valid(index.committed_root()), "{context}");
    let txn = coordinator.begin(TxnMode::Read).expect("begin");
    assert_eq!(index.len(&txn).expect("len"), keys.len(), "{context}");
    index.check(&txn).expect("check");
    for &k in keys {
        assert_eq!(index.get(&txn, &int_key(k)).expect("get"), Some(int_record(&params, k, k)), "{context}");
    }
    coordinator.end(txn).expect("end");
}

#[test]
fn test_exhaustion_rolls_back_the_whole_transaction() {
    for (branches, leaves) in DUPLICATE_MODES {
        for max_blocks in (8..60).step_by(2) {
            let context = format!("mode ({branches}, {leaves}), max_blocks {max_blocks}");
            let (coordinator, index) = bounded_index(tree_config(branches, leaves), max_blocks);

            let first: Vec<u32> = (0..12).collect();
            let added = insert_then_commit(&coordinator, &index, first.iter().copied());
            let committed = if added == 0 { Vec::new() } else { first };
            assert_intact(&coordinator, &index, &committed, &context);

            // Far more records than the store can hold: this one always fails.
            assert_eq!(insert_then_commit(&coordinator, &index, 100..600), 0, "{context}");
            assert_intact(&coordinator, &index, &committed, &context);
        }
    }
}

#[test]
fn test_swallowed_error_still_fails_commit() {
    let params = small_params();
    let (coordinator, index) = bounded_index(tree_config(true, true), 24);
    let root = index.committed_root();

    let result = coordinator.execute_write(|txn| {
        for k in 0..500 {
            if index.insert(txn, int_record(&params, k, k)).is_err() {
                break;
            }
        }
        Ok::<_, TxnError>(())
    });
    assert!(matches!(result, Err(TxnError::Index(IndexError::TransactionFailed(_)))));
    assert_eq!(index.committed_root(), root);
    assert_eq!(coordinator.data_version(), 0);
    assert_eq!(coordinator.counters().active, 0);
    assert_intact(&coordinator, &index, &[], "after swallowed error");

    // The blocks the failed writer took were given back.
    coordinator
        .execute_write(|txn| index.insert(txn, int_record(&params, 1, 1)).map_err(TxnError::from))
        .expect("small write fits");
    assert_intact(&coordinator, &index, &[1], "after retry");
}
