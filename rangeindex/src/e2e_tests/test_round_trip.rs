//! Insertion orders and duplicate modes all yield the same ordered contents.

use super::helpers::{DUPLICATE_MODES, keys_of, shuffled, single_index, tree_config};
use crate::config::{StoreConfig, TreeConfig};
use crate::testing::{int_key, int_record, small_params};
use crate::tree::RangeIndex;
use crate::txn::TxnMode;

const N: u32 = 200;

fn orders() -> Vec<(&'static str, Vec<u32>)> {
    vec![
        ("ascending", (0..N).collect()),
        ("descending", (0..N).rev().collect()),
        ("shuffled", shuffled(N, 42)),
    ]
}

#[test]
fn test_plain_index_round_trip() {
    let params = small_params();
    for (name, keys) in orders() {
        let mut index = RangeIndex::open(params, TreeConfig::default().with_checking(true), &StoreConfig::memory())
            .expect("open");
        for &k in &keys {
            index.insert(int_record(&params, k, k * 3)).expect("insert");
        }
        assert_eq!(keys_of(index.iter().expect("iter")), (0..N).collect::<Vec<_>>(), "{name}");
        for k in 0..N {
            assert_eq!(index.get(&int_key(k)).expect("get"), Some(int_record(&params, k, k * 3)), "{name}");
        }
        assert!(index.check().expect("check").height > 2, "{name}");
    }
}

#[test]
fn test_transactional_round_trip_in_every_mode() {
    let params = small_params();
    for (branches, leaves) in DUPLICATE_MODES {
        for (name, keys) in orders() {
            let (coordinator, index) = single_index(tree_config(branches, leaves));
            coordinator
                .execute_write(|txn| {
                    for &k in &keys {
                        index.insert(txn, int_record(&params, k, k))?;
                    }
                    Ok::<_, crate::TxnError>(())
                })
                .expect("write");

            let found = coordinator
                .execute_read(|txn| {
                    index.check(txn)?;
                    Ok::<_, crate::TxnError>(keys_of(index.iter(txn)?))
                })
                .expect("read");
            assert_eq!(found, (0..N).collect::<Vec<_>>(), "{name} branches={branches} leaves={leaves}");
        }
    }
}

#[test]
fn test_replace_is_idempotent() {
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    for round in 0..3 {
        let mut txn = coordinator.begin(TxnMode::Write).expect("begin");
        for k in 0..20 {
            index.insert(&mut txn, int_record(&params, k, 7)).expect("insert");
        }
        coordinator.commit(&mut txn).expect("commit");
        assert_eq!(index.len(&txn).expect("len"), 20, "round {round}");
        coordinator.end(txn).expect("end");
    }

    let mut txn = coordinator.begin(TxnMode::Write).expect("begin");
    let previous = index.insert(&mut txn, int_record(&params, 5, 8)).expect("replace");
    assert_eq!(previous, Some(int_record(&params, 5, 7)));
    assert_eq!(index.get(&txn, &int_key(5)).expect("get"), Some(int_record(&params, 5, 8)));
    coordinator.commit(&mut txn).expect("commit");
    coordinator.end(txn).expect("end");
}

#[test]
fn test_range_bounds() {
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    coordinator
        .execute_write(|txn| {
            for k in shuffled(100, 7) {
                index.insert(txn, int_record(&params, k * 10, 0))?;
            }
            Ok::<_, crate::TxnError>(())
        })
        .expect("write");

    let txn = coordinator.begin(TxnMode::Read).expect("begin");
    let scan = |min: Option<u32>, max: Option<u32>| {
        let min = min.map(int_key);
        let max = max.map(int_key);
        keys_of(
            index
                .iter_range(&txn, min.as_ref().map(|k| &k[..]), max.as_ref().map(|k| &k[..]))
                .expect("iter_range"),
        )
    };
    assert_eq!(scan(Some(100), Some(150)), vec![100, 110, 120, 130, 140]);
    assert_eq!(scan(Some(95), Some(101)), vec![100]);
    assert_eq!(scan(None, Some(30)), vec![0, 10, 20]);
    assert_eq!(scan(Some(970), None), vec![970, 980, 990]);
    assert!(scan(Some(500), Some(500)).is_empty());
    assert!(scan(Some(2000), None).is_empty());
    assert_eq!(index.min_record(&txn).expect("min"), Some(int_record(&params, 0, 0)));
    assert_eq!(index.max_record(&txn).expect("max"), Some(int_record(&params, 990, 0)));
    coordinator.end(txn).expect("end");
}
