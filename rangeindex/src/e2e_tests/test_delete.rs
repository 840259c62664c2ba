//! Deleting rebalances the tree back down to a single empty leaf.

use super::helpers::{DUPLICATE_MODES, keys_of, shuffled, single_index, tree_config};
use crate::config::{StoreConfig, TreeConfig};
use crate::testing::{int_key, int_record, small_params};
use crate::tree::{Page, RangeIndex, TreeStats};
use crate::txn::TxnMode;

const EMPTY_TREE: TreeStats = TreeStats {
    records: 0,
    leaves: 1,
    branches: 0,
    height: 1,
};

#[test]
fn test_delete_all_leaves_empty_leaf_root() {
    let params = small_params();
    let mut index =
        RangeIndex::open(params, TreeConfig::default().with_checking(true), &StoreConfig::memory()).expect("open");
    for k in 0..30 {
        index.insert(int_record(&params, k, k)).expect("insert");
    }
    assert!(index.check().expect("check").height > 1);

    for k in 0..30 {
        assert!(index.delete(&int_key(k)).expect("delete").is_some());
    }
    assert!(index.is_empty().expect("is_empty"));
    assert_eq!(index.check().expect("check"), EMPTY_TREE);
    let root = index.blocks().get_read(index.root_id()).expect("root block");
    assert!(matches!(Page::decode(&root, &params).expect("decode"), Page::Leaf(leaf) if leaf.records.is_empty()));
}

#[test]
fn test_delete_in_shuffled_order_keeps_invariants() {
    let params = small_params();
    let mut index =
        RangeIndex::open(params, TreeConfig::default().with_checking(true), &StoreConfig::memory()).expect("open");
    for k in shuffled(120, 1) {
        index.insert(int_record(&params, k, 0)).expect("insert");
    }
    let victims = shuffled(120, 2);
    for (i, k) in victims.iter().enumerate() {
        index.delete(&int_key(*k)).expect("delete");
        if i % 20 == 0 {
            let mut expected: Vec<u32> = victims[i + 1..].to_vec();
            expected.sort_unstable();
            assert_eq!(keys_of(index.iter().expect("iter")), expected);
        }
    }
    assert_eq!(index.check().expect("check"), EMPTY_TREE);
}

#[test]
fn test_transactional_delete_all_in_every_mode() {
    let params = small_params();
    for (branches, leaves) in DUPLICATE_MODES {
        let (coordinator, index) = single_index(tree_config(branches, leaves));
        coordinator
            .execute_write(|txn| {
                for k in 0..30 {
                    index.insert(txn, int_record(&params, k, 0))?;
                }
                Ok::<_, crate::TxnError>(())
            })
            .expect("fill");
        coordinator
            .execute_write(|txn| {
                for k in (0..30).rev() {
                    index.delete(txn, &int_key(k))?;
                }
                Ok::<_, crate::TxnError>(())
            })
            .expect("drain");

        let txn = coordinator.begin(TxnMode::Read).expect("begin");
        assert!(index.is_empty(&txn).expect("is_empty"));
        assert_eq!(index.check(&txn).expect("check"), EMPTY_TREE, "branches={branches} leaves={leaves}");
        coordinator.end(txn).expect("end");
    }
}

#[test]
fn test_delete_absent_key_keeps_root() {
    let params = small_params();
    let mut index = RangeIndex::open(params, TreeConfig::default(), &StoreConfig::memory()).expect("open");
    for k in 0..30 {
        index.insert(int_record(&params, k * 2, 0)).expect("insert");
    }
    let root = index.root_id();
    let before = index.dump().expect("dump");
    assert_eq!(index.delete(&int_key(7)).expect("delete"), None);
    assert_eq!(index.root_id(), root);
    assert_eq!(index.dump().expect("dump"), before);
}
