//! Readers alongside a writer, writer admission and exclusive mode.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use super::helpers::{keys_of, single_index, single_index_with_policy, tree_config};
use crate::config::WriterPolicy;
use crate::testing::{int_record, small_params};
use crate::tree::IndexError;
use crate::txn::{TxnCounters, TxnMode};
use crate::TxnError;

const SETTLE: Duration = Duration::from_millis(50);

#[test]
fn test_reader_keeps_snapshot_across_commits() {
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    coordinator
        .execute_write(|txn| {
            for k in 0..10 {
                index.insert(txn, int_record(&params, k, 0))?;
            }
            Ok::<_, TxnError>(())
        })
        .expect("fill");

    let reader = coordinator.begin(TxnMode::Read).expect("reader");
    thread::scope(|s| {
        s.spawn(|| {
            coordinator
                .execute_write(|txn| {
                    for k in 0..10 {
                        index.insert(txn, int_record(&params, k, 1))?;
                    }
                    for k in 10..30 {
                        index.insert(txn, int_record(&params, k, 1))?;
                    }
                    Ok::<_, TxnError>(())
                })
                .expect("writer");
        });
    });

    assert_eq!(keys_of(index.iter(&reader).expect("iter")), (0..10).collect::<Vec<_>>());
    for record in index.iter(&reader).expect("iter") {
        assert_eq!(record.expect("record").value(), Some(&[0u8, 0, 0, 0][..]));
    }
    coordinator.end(reader).expect("end reader");

    let fresh = coordinator.begin(TxnMode::Read).expect("fresh");
    assert_eq!(index.len(&fresh).expect("len"), 30);
    assert_eq!(fresh.generation(), 2);
    coordinator.end(fresh).expect("end");
}

#[test]
fn test_readers_see_whole_commits() {
    const BATCH: u32 = 6;
    const BATCHES: u32 = 15;
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    coordinator
                        .execute_read(|txn| {
                            let len = index.len(txn)?;
                            assert_eq!(len % BATCH as usize, 0, "saw a partial commit");
                            index.check(txn)?;
                            Ok::<_, TxnError>(())
                        })
                        .expect("reader");
                }
            });
        }
        for batch in 0..BATCHES {
            coordinator
                .execute_write(|txn| {
                    for k in batch * BATCH..(batch + 1) * BATCH {
                        index.insert(txn, int_record(&params, k, k))?;
                    }
                    Ok::<_, TxnError>(())
                })
                .expect("writer");
        }
        done.store(true, Ordering::Release);
    });

    let txn = coordinator.begin(TxnMode::Read).expect("begin");
    assert_eq!(index.len(&txn).expect("len"), (BATCH * BATCHES) as usize);
    coordinator.end(txn).expect("end");
}

#[test]
fn test_second_writer_waits_for_first() {
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    let mut first = coordinator.begin(TxnMode::Write).expect("first");
    index.insert(&mut first, int_record(&params, 1, 1)).expect("insert");

    let (began_tx, began_rx) = mpsc::channel();
    thread::scope(|s| {
        s.spawn(|| {
            let mut second = coordinator.begin(TxnMode::Write).expect("second");
            began_tx.send(second.generation()).expect("send");
            // The first writer's record is part of this writer's snapshot.
            assert!(index.get(&second, &crate::testing::int_key(1)).expect("get").is_some());
            index.insert(&mut second, int_record(&params, 2, 2)).expect("insert");
            coordinator.commit(&mut second).expect("commit second");
            coordinator.end(second).expect("end second");
        });

        thread::sleep(SETTLE);
        assert!(began_rx.try_recv().is_err(), "second writer was admitted early");
        coordinator.commit(&mut first).expect("commit first");
        coordinator.end(first).expect("end first");
        assert_eq!(began_rx.recv().expect("second began"), 1);
    });

    assert_eq!(coordinator.data_version(), 2);
    let txn = coordinator.begin(TxnMode::Read).expect("begin");
    assert_eq!(keys_of(index.iter(&txn).expect("iter")), vec![1, 2]);
    coordinator.end(txn).expect("end");
}

#[test]
fn test_exclusive_mode_waits_for_active_transactions() {
    let (coordinator, _index) = single_index(tree_config(true, true));
    let reader = coordinator.begin(TxnMode::Read).expect("reader");
    assert!(!coordinator.try_exclusive_mode());

    let entered = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            coordinator.exec_exclusive(|| {
                entered.store(true, Ordering::Release);
                assert_eq!(coordinator.counters().active, 0);
            });
        });
        thread::sleep(SETTLE);
        assert!(!entered.load(Ordering::Acquire));
        coordinator.end(reader).expect("end reader");
    });
    assert!(entered.load(Ordering::Acquire));

    assert!(coordinator.try_exclusive_mode());
    coordinator.finish_exclusive_mode();
    let txn = coordinator.begin(TxnMode::Read).expect("begin after exclusive");
    coordinator.end(txn).expect("end");
}

#[test]
fn test_blocked_writers_leave_readers_alone() {
    let params = small_params();
    let (coordinator, index) = single_index_with_policy(tree_config(true, true), WriterPolicy::Fail);
    assert!(coordinator.try_block_writers());
    assert!(matches!(coordinator.begin(TxnMode::Write), Err(TxnError::WriterBusy)));

    let reader = coordinator.begin(TxnMode::Read).expect("reader");
    assert!(index.is_empty(&reader).expect("empty"));
    coordinator.end(reader).expect("end");

    coordinator.enable_writers();
    coordinator
        .execute_write(|txn| index.insert(txn, int_record(&params, 1, 1)).map_err(TxnError::from))
        .expect("write after enable");

    let version = coordinator.exec_as_writer(|| coordinator.data_version());
    assert_eq!(version, 1);
    assert!(coordinator.try_block_writers());
    coordinator.enable_writers();
}

#[test]
fn test_counters_track_lifecycle() {
    let params = small_params();
    let (coordinator, index) = single_index(tree_config(true, true));
    assert_eq!(coordinator.counters(), TxnCounters::default());

    let reader = coordinator.begin(TxnMode::Read).expect("reader");
    let mut writer = coordinator.begin(TxnMode::Write).expect("writer");
    let counters = coordinator.counters();
    assert_eq!((counters.begun, counters.begun_read, counters.begun_write), (2, 1, 1));
    assert_eq!((counters.active, counters.active_readers, counters.active_writers), (2, 1, 1));

    index.insert(&mut writer, int_record(&params, 1, 1)).expect("insert");
    coordinator.commit(&mut writer).expect("commit");
    coordinator.end(writer).expect("end writer");
    coordinator.end(reader).expect("end reader");

    let failed: Result<(), TxnError> =
        coordinator.execute_write(|_| Err(IndexError::InvalidArgument("rolled back".to_string()).into()));
    assert!(failed.is_err());

    let counters = coordinator.counters();
    assert_eq!(counters.begun, 3);
    assert_eq!(counters.finished, 3);
    assert_eq!(counters.committed, 1);
    assert_eq!(counters.aborted, 1);
    assert_eq!(counters.active, 0);
}

#[test]
fn test_shutdown_refuses_new_transactions() {
    let (coordinator, _index) = single_index(tree_config(true, true));
    let reader = coordinator.begin(TxnMode::Read).expect("reader");
    coordinator.shutdown().expect("shutdown");
    assert!(matches!(coordinator.begin(TxnMode::Read), Err(TxnError::Shutdown)));
    assert!(matches!(coordinator.begin(TxnMode::Write), Err(TxnError::Shutdown)));
    // Already-running transactions can still finish.
    coordinator.end(reader).expect("end");
    coordinator.shutdown().expect("second shutdown is a no-op");
}

#[test]
fn test_panicking_writer_releases_the_slot() {
    let params = small_params();
    let (coordinator, index) = single_index_with_policy(tree_config(false, false), WriterPolicy::Fail);
    coordinator
        .execute_write(|txn| index.insert(txn, int_record(&params, 1, 1)).map_err(TxnError::from))
        .expect("fill");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        coordinator.execute_write::<(), TxnError>(|txn| {
            index.insert(txn, int_record(&params, 2, 2)).expect("insert");
            index.delete(txn, &1u32.to_be_bytes()).expect("delete");
            panic!("writer gave up");
        })
    }));
    assert!(outcome.is_err());

    let counters = coordinator.counters();
    assert_eq!((counters.active, counters.active_writers), (0, 0));
    assert_eq!(counters.aborted, 1);
    assert_eq!(coordinator.data_version(), 1);

    let reader = coordinator.begin(TxnMode::Read).expect("reader");
    assert_eq!(keys_of(index.iter(&reader).expect("iter")), vec![1]);
    index.check(&reader).expect("check");
    coordinator.end(reader).expect("end");

    let mut writer = coordinator.begin(TxnMode::Write).expect("slot was released");
    coordinator.abort(&mut writer).expect("abort");
    coordinator.end(writer).expect("end");
}
