//! Copy-on-write versus write-in-place, per page kind.

use std::sync::Arc;

use super::helpers::tree_config;
use crate::block::{BlockMgr, DuplicateTracker, MemoryStore};
use crate::config::{CoordinatorConfig, TreeConfig};
use crate::testing::{init_tracing, int_key, int_record, small_params};
use crate::tree::TxnIndex;
use crate::txn::{ComponentId, Journal, TransactionCoordinator, TxnMode};
use crate::TxnError;

struct Tracked {
    coordinator: TransactionCoordinator,
    index: Arc<TxnIndex>,
    tracker: Arc<DuplicateTracker>,
}

/// A started coordinator over one index with 20 committed records and a
/// tracker that has seen nothing yet.
fn tracked(config: TreeConfig) -> Tracked {
    init_tracing();
    let params = small_params();
    let tracker = Arc::new(DuplicateTracker::new());
    let blocks =
        Arc::new(BlockMgr::new(Box::new(MemoryStore::new(params.block_size, None))).with_observer(tracker.clone()));
    let index = Arc::new(TxnIndex::with_block_mgr(ComponentId(1), params, config, blocks).expect("open"));
    let coordinator = TransactionCoordinator::new(Journal::in_memory(), CoordinatorConfig::default());
    coordinator.add(index.clone()).expect("add");
    coordinator.start().expect("start");

    coordinator
        .execute_write(|txn| {
            for k in 0..20 {
                index.insert(txn, int_record(&params, k, 0))?;
            }
            Ok::<_, TxnError>(())
        })
        .expect("fill");
    tracker.reset();
    Tracked {
        coordinator,
        index,
        tracker,
    }
}

/// The value of key 5 as seen by a reader that began before a writer
/// replaced it, while that writer is still open.
fn value_seen_by_older_reader(config: TreeConfig) -> (Tracked, u32) {
    let params = small_params();
    let t = tracked(config);
    let reader = t.coordinator.begin(TxnMode::Read).expect("reader");
    assert!(t.index.check(&reader).expect("check").height >= 2);

    let mut writer = t.coordinator.begin(TxnMode::Write).expect("writer");
    t.index.insert(&mut writer, int_record(&params, 5, 1)).expect("replace");
    let seen = t.index.get(&reader, &int_key(5)).expect("get").expect("present");
    let value = u32::from_be_bytes(seen.value().expect("value").try_into().expect("4 bytes"));

    t.coordinator.commit(&mut writer).expect("commit");
    t.coordinator.end(writer).expect("end writer");
    t.coordinator.end(reader).expect("end reader");
    (t, value)
}

#[test]
fn test_full_copy_on_write_isolates_readers() {
    let (t, value) = value_seen_by_older_reader(tree_config(true, true));
    assert_eq!(value, 0);
    // At least the root and the leaf on the path to key 5.
    assert!(t.tracker.duplicate_count() >= 2);
}

#[test]
fn test_in_place_leaves_are_shared() {
    let (t, value) = value_seen_by_older_reader(tree_config(true, false));
    assert_eq!(value, 1);
    assert!(t.tracker.duplicate_count() >= 1);
}

#[test]
fn test_in_place_branches_are_shared() {
    let (t, value) = value_seen_by_older_reader(tree_config(false, true));
    assert_eq!(value, 1);
    assert!(t.tracker.duplicate_count() >= 1);
}

#[test]
fn test_write_in_place_never_duplicates() {
    let (t, value) = value_seen_by_older_reader(TreeConfig::in_place().with_checking(true));
    assert_eq!(value, 1);
    assert_eq!(t.tracker.duplicate_count(), 0);
    assert_eq!(t.index.blocks().pending_reclaim(), 0);
}

#[test]
fn test_abort_restores_in_place_pages() {
    let params = small_params();
    let t = tracked(TreeConfig::in_place().with_checking(true));
    let before = t
        .coordinator
        .execute_read(|txn| t.index.dump(txn).map_err(TxnError::from))
        .expect("dump");

    let mut writer = t.coordinator.begin(TxnMode::Write).expect("writer");
    for k in 0..20 {
        t.index.insert(&mut writer, int_record(&params, k, 9)).expect("replace");
    }
    for k in 20..40 {
        t.index.insert(&mut writer, int_record(&params, k, 9)).expect("insert");
    }
    t.index.delete(&mut writer, &int_key(0)).expect("delete");
    t.coordinator.abort(&mut writer).expect("abort");
    t.coordinator.end(writer).expect("end");

    assert_eq!(t.tracker.duplicate_count(), 0);
    // Every page the writer allocated was freed again.
    assert_eq!(t.tracker.live_count(), 0);
    assert_eq!(t.tracker.allocation_count(), t.tracker.free_count());
    let after = t
        .coordinator
        .execute_read(|txn| t.index.dump(txn).map_err(TxnError::from))
        .expect("dump");
    assert_eq!(after, before);
}

#[test]
fn test_copies_are_freed_on_abort() {
    let params = small_params();
    let t = tracked(tree_config(true, true));
    let root = t.index.committed_root();

    let mut writer = t.coordinator.begin(TxnMode::Write).expect("writer");
    t.index.insert(&mut writer, int_record(&params, 5, 1)).expect("replace");
    let copy = t.tracker.duplicate_of(root).expect("root was duplicated");
    t.coordinator.abort(&mut writer).expect("abort");
    t.coordinator.end(writer).expect("end");

    assert!(!t.index.blocks().valid(copy));
    assert!(t.index.blocks().valid(root));
    assert_eq!(t.tracker.live_count(), 0);
}
