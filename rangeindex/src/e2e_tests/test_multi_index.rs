//! Two indexes under one coordinator commit and abort together.

use std::sync::Arc;

use super::helpers::tree_config;
use crate::config::{CoordinatorConfig, IndexParams, StoreConfig};
use crate::record::RecordFactory;
use crate::testing::{init_tracing, int_key, int_record, small_params};
use crate::tree::TxnIndex;
use crate::txn::{ComponentId, Journal, TransactionCoordinator, TxnMode};

/// A primary index keyed by id and a secondary keyed by (value, id).
struct Pair {
    coordinator: TransactionCoordinator,
    primary: Arc<TxnIndex>,
    secondary: Arc<TxnIndex>,
}

fn secondary_params() -> IndexParams {
    IndexParams::with_block_size(256, 8, 0, 2)
        .and_then(|p| p.with_leaf_capacity(6))
        .expect("params")
}

fn pair() -> Pair {
    init_tracing();
    let primary = Arc::new(
        TxnIndex::open(ComponentId(1), small_params(), tree_config(true, true), &StoreConfig::memory())
            .expect("primary"),
    );
    let secondary = Arc::new(
        TxnIndex::open(ComponentId(2), secondary_params(), tree_config(true, false), &StoreConfig::memory())
            .expect("secondary"),
    );
    let coordinator = TransactionCoordinator::new(Journal::in_memory(), CoordinatorConfig::default());
    coordinator.add(primary.clone()).expect("add primary");
    coordinator.add(secondary.clone()).expect("add secondary");
    coordinator.start().expect("start");
    Pair {
        coordinator,
        primary,
        secondary,
    }
}

fn secondary_key(value: u32, id: u32) -> Vec<u8> {
    let mut key = value.to_be_bytes().to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

#[test]
fn test_commit_reaches_both_indexes() {
    let params = small_params();
    let factory = RecordFactory::new(8, 0);
    let p = pair();

    p.coordinator
        .execute_write(|txn| {
            for id in 0..25 {
                let value = id % 5;
                p.primary.insert(txn, int_record(&params, id, value))?;
                p.secondary.insert(txn, factory.key_only(&secondary_key(value, id))?)?;
            }
            Ok::<_, crate::TxnError>(())
        })
        .expect("write");

    let txn = p.coordinator.begin(TxnMode::Read).expect("begin");
    assert_eq!(p.primary.len(&txn).expect("len"), 25);
    assert_eq!(p.secondary.len(&txn).expect("len"), 25);
    // Ids with value 3, via the secondary index.
    let lower = secondary_key(3, 0);
    let upper = secondary_key(4, 0);
    let ids: Vec<u32> = p
        .secondary
        .iter_range(&txn, Some(&lower), Some(&upper))
        .expect("range")
        .map(|r| {
            let record = r.expect("record");
            u32::from_be_bytes(record.key()[4..].try_into().expect("id bytes"))
        })
        .collect();
    assert_eq!(ids, vec![3, 8, 13, 18, 23]);
    assert_eq!(p.secondary.distinct_by_key_prefix(&txn, 4).expect("distinct").count(), 5);
    p.coordinator.end(txn).expect("end");
}

#[test]
fn test_abort_reaches_both_indexes() {
    let params = small_params();
    let factory = RecordFactory::new(8, 0);
    let p = pair();
    let roots = (p.primary.committed_root(), p.secondary.committed_root());

    let mut txn = p.coordinator.begin(TxnMode::Write).expect("begin");
    for id in 0..25 {
        p.primary.insert(&mut txn, int_record(&params, id, 0)).expect("primary");
        p.secondary
            .insert(&mut txn, factory.key_only(&secondary_key(0, id)).expect("record"))
            .expect("secondary");
    }
    p.coordinator.abort(&mut txn).expect("abort");
    p.coordinator.end(txn).expect("end");

    assert_eq!((p.primary.committed_root(), p.secondary.committed_root()), roots);
    let txn = p.coordinator.begin(TxnMode::Read).expect("begin");
    assert!(p.primary.is_empty(&txn).expect("primary empty"));
    assert!(p.secondary.is_empty(&txn).expect("secondary empty"));
    assert_eq!(p.primary.get(&txn, &int_key(1)).expect("get"), None);
    p.coordinator.end(txn).expect("end");
}

#[test]
fn test_components_are_locked_after_start() {
    let p = pair();
    let late = Arc::new(
        TxnIndex::open(ComponentId(3), small_params(), tree_config(true, true), &StoreConfig::memory()).expect("open"),
    );
    assert!(matches!(p.coordinator.add(late), Err(crate::TxnError::ConfigurationLocked)));
}

#[test]
fn test_duplicate_component_ids_are_rejected() {
    let coordinator = TransactionCoordinator::new(Journal::in_memory(), CoordinatorConfig::default());
    let open = || {
        Arc::new(
            TxnIndex::open(ComponentId(1), small_params(), tree_config(true, true), &StoreConfig::memory())
                .expect("open"),
        )
    };
    coordinator.add(open()).expect("first");
    assert!(matches!(coordinator.add(open()), Err(crate::TxnError::DuplicateComponent(ComponentId(1)))));
}
