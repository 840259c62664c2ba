//! Superseded blocks are freed only once no snapshot can reach them.

use super::helpers::{single_index, tree_config};
use crate::testing::{int_key, int_record, small_params};
use crate::tree::TxnIndex;
use crate::txn::{TransactionCoordinator, TxnMode};
use crate::TxnError;

fn write_all(coordinator: &TransactionCoordinator, index: &TxnIndex, value: u32) {
    let params = small_params();
    coordinator
        .execute_write(|txn| {
            for k in 0..20 {
                index.insert(txn, int_record(&params, k, value))?;
            }
            Ok::<_, TxnError>(())
        })
        .expect("write");
}

#[test]
fn test_reader_pins_superseded_blocks() {
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    write_all(&coordinator, &index, 0);
    assert_eq!(index.blocks().pending_reclaim(), 0);

    let reader = coordinator.begin(TxnMode::Read).expect("reader");
    let old_root = index.root_in(&reader).expect("root");
    write_all(&coordinator, &index, 1);

    assert_ne!(index.committed_root(), old_root);
    assert!(index.blocks().pending_reclaim() > 0);
    assert!(index.blocks().valid(old_root));
    assert_eq!(index.get(&reader, &int_key(7)).expect("get"), Some(int_record(&params, 7, 0)));
    index.check(&reader).expect("old snapshot intact");

    // A newer reader does not release the older snapshot's blocks.
    let newer = coordinator.begin(TxnMode::Read).expect("newer");
    coordinator.end(newer).expect("end newer");
    assert!(index.blocks().pending_reclaim() > 0);

    coordinator.end(reader).expect("end reader");
    assert_eq!(index.blocks().pending_reclaim(), 0);
    assert!(!index.blocks().valid(old_root));

    let txn = coordinator.begin(TxnMode::Read).expect("begin");
    assert_eq!(index.get(&txn, &int_key(7)).expect("get"), Some(int_record(&params, 7, 1)));
    index.check(&txn).expect("check");
    coordinator.end(txn).expect("end");
}

#[test]
fn test_without_readers_blocks_are_reclaimed_at_end() {
    let (coordinator, index) = single_index(tree_config(true, true));
    let mut limits = Vec::new();
    for round in 0..10 {
        write_all(&coordinator, &index, round);
        assert_eq!(index.blocks().pending_reclaim(), 0, "round {round}");
        limits.push(index.blocks().limit());
    }
    // Once the shape settles every round reuses what the previous one freed.
    assert!(limits[5..].iter().all(|&limit| limit == limits[5]), "{limits:?}");
}

#[test]
fn test_in_place_pages_are_not_retired() {
    let (coordinator, index) = single_index(tree_config(false, false));
    write_all(&coordinator, &index, 0);

    let reader = coordinator.begin(TxnMode::Read).expect("reader");
    write_all(&coordinator, &index, 1);
    assert_eq!(index.blocks().pending_reclaim(), 0);
    coordinator.end(reader).expect("end");
}
