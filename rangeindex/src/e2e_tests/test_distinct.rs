//! Prefix-distinct iteration.

use super::helpers::{keys_of, single_index, tree_config};
use crate::config::{StoreConfig, TreeConfig};
use crate::testing::int_record;
use crate::testing::small_params;
use crate::tree::{IndexError, RangeIndex};
use crate::txn::TxnMode;

/// Five keys with leading byte 0x00, then runs under 0x20, 0x40 and 0xFF.
fn keys() -> Vec<u32> {
    vec![
        0,
        1,
        2,
        3,
        4,
        0x2000_0000,
        0x2000_0001,
        0x2000_0100,
        0x4000_0000,
        0xFF00_0000,
        0xFFFF_FFFF,
    ]
}

fn index_with_keys() -> RangeIndex {
    let params = small_params();
    let mut index = RangeIndex::open(params, TreeConfig::default(), &StoreConfig::memory()).expect("open");
    for k in keys().into_iter().rev() {
        index.insert(int_record(&params, k, k)).expect("insert");
    }
    index
}

#[test]
fn test_one_record_per_leading_byte() {
    let index = index_with_keys();
    let distinct = keys_of(index.distinct_by_key_prefix(1).expect("distinct"));
    assert_eq!(distinct, vec![0, 0x2000_0000, 0x4000_0000, 0xFF00_0000]);
}

#[test]
fn test_longer_prefixes() {
    let index = index_with_keys();
    let distinct = keys_of(index.distinct_by_key_prefix(3).expect("distinct"));
    assert_eq!(distinct, vec![0, 0x2000_0000, 0x2000_0100, 0x4000_0000, 0xFF00_0000, 0xFFFF_FFFF]);
}

#[test]
fn test_full_key_prefix_returns_everything() {
    let index = index_with_keys();
    assert_eq!(keys_of(index.distinct_by_key_prefix(4).expect("distinct")), keys());
}

#[test]
fn test_invalid_prefix_lengths() {
    let index = index_with_keys();
    assert!(matches!(index.distinct_by_key_prefix(0), Err(IndexError::InvalidArgument(_))));
    assert!(matches!(index.distinct_by_key_prefix(5), Err(IndexError::InvalidArgument(_))));
}

#[test]
fn test_constant_prefix_yields_one_record() {
    let params = small_params();
    let mut index = RangeIndex::open(params, TreeConfig::default(), &StoreConfig::memory()).expect("open");
    for k in 0..50 {
        index.insert(int_record(&params, 0x0700_0000 | k, 0)).expect("insert");
    }
    assert_eq!(keys_of(index.distinct_by_key_prefix(2).expect("distinct")), vec![0x0700_0000]);
}

#[test]
fn test_distinct_inside_transaction() {
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    let mut txn = coordinator.begin(TxnMode::Write).expect("begin");
    for k in keys() {
        index.insert(&mut txn, int_record(&params, k, 0)).expect("insert");
    }
    // Uncommitted writes are visible to their own transaction.
    let distinct = keys_of(index.distinct_by_key_prefix(&txn, 1).expect("distinct"));
    assert_eq!(distinct, vec![0, 0x2000_0000, 0x4000_0000, 0xFF00_0000]);
    assert!(index.distinct_by_key_prefix(&txn, 0).is_err());
    coordinator.abort(&mut txn).expect("abort");
    coordinator.end(txn).expect("end");
}
