//! Restart after a crash between the journal sync and the root publish.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::helpers::tree_config;
use crate::config::{CoordinatorConfig, StoreConfig};
use crate::testing::{init_tracing, int_key, int_record, small_params};
use crate::tree::{RootFile, TreeState, TxnIndex};
use crate::txn::{
    ComponentId, Journal, JournalEntry, RecoveryReport, TransactionCoordinator, TransactionalComponent, TxnMode,
};

struct Paths {
    _dir: tempfile::TempDir,
    data: PathBuf,
    journal: PathBuf,
}

impl Paths {
    fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        Self {
            data: dir.path().join("index.dat"),
            journal: dir.path().join("journal"),
            _dir: dir,
        }
    }
}

fn open(paths: &Paths) -> (TransactionCoordinator, Arc<TxnIndex>, RecoveryReport) {
    let index = Arc::new(
        TxnIndex::open(ComponentId(1), small_params(), tree_config(true, true), &StoreConfig::file(&paths.data))
            .expect("open index"),
    );
    let journal = Journal::open(&paths.journal).expect("journal");
    let coordinator = TransactionCoordinator::new(journal, CoordinatorConfig::default());
    coordinator.add(index.clone()).expect("add");
    let report = coordinator.start().expect("start");
    (coordinator, index, report)
}

/// Commit keys `0..10`, then prepare keys `10..20` without publishing and
/// return the redo payload. Everything is dropped on return.
fn crash_after_prepare(paths: &Paths) -> Vec<u8> {
    let params = small_params();
    let (coordinator, index, report) = open(paths);
    assert_eq!(report, RecoveryReport::default());
    coordinator
        .execute_write(|txn| {
            for k in 0..10 {
                index.insert(txn, int_record(&params, k, k))?;
            }
            Ok::<_, crate::TxnError>(())
        })
        .expect("baseline");

    let mut txn = coordinator.begin(TxnMode::Write).expect("begin");
    for k in 10..20 {
        index.insert(&mut txn, int_record(&params, k, k)).expect("insert");
    }
    index.prepare(&txn).expect("prepare").expect("modified")
}

fn append_to_journal(path: &Path, entries: &[JournalEntry]) {
    let mut journal = Journal::open(path).expect("journal");
    for entry in entries {
        journal.append(entry).expect("append");
    }
    journal.sync().expect("sync");
}

fn assert_keys(coordinator: &TransactionCoordinator, index: &TxnIndex, n: u32) {
    let params = small_params();
    let txn = coordinator.begin(TxnMode::Read).expect("begin");
    assert_eq!(index.len(&txn).expect("len"), n as usize);
    index.check(&txn).expect("check");
    for k in 0..n {
        assert_eq!(index.get(&txn, &int_key(k)).expect("get"), Some(int_record(&params, k, k)));
    }
    assert_eq!(index.get(&txn, &int_key(n)).expect("get"), None);
    coordinator.end(txn).expect("end");
}

#[test]
fn test_committed_group_is_replayed() {
    let paths = Paths::new();
    let payload = crash_after_prepare(&paths);
    let expected_root = TreeState::from_bytes(&payload).expect("payload").root;
    append_to_journal(&paths.journal, &[JournalEntry::redo(ComponentId(1), payload), JournalEntry::commit()]);

    let (coordinator, index, report) = open(&paths);
    assert_eq!(report.entries_scanned, 2);
    assert_eq!(report.transactions_replayed, 1);
    assert_eq!(report.entries_discarded, 0);
    assert_eq!(index.committed_root(), expected_root);
    assert_eq!(
        RootFile::beside(&paths.data).read().expect("root file").map(|s| s.root),
        Some(expected_root)
    );
    assert_keys(&coordinator, &index, 20);

    // The journal was emptied and the index keeps working.
    assert_eq!(std::fs::metadata(&paths.journal).expect("journal").len(), 0);
    let params = small_params();
    coordinator
        .execute_write(|txn| index.insert(txn, int_record(&params, 20, 20)).map_err(crate::TxnError::from))
        .expect("write after recovery");
    assert_keys(&coordinator, &index, 21);
}

#[test]
fn test_group_without_commit_marker_is_discarded() {
    let paths = Paths::new();
    let payload = crash_after_prepare(&paths);
    append_to_journal(&paths.journal, &[JournalEntry::redo(ComponentId(1), payload)]);

    let (coordinator, index, report) = open(&paths);
    assert_eq!(report.transactions_replayed, 0);
    assert_eq!(report.entries_discarded, 1);
    assert_keys(&coordinator, &index, 10);
}

#[test]
fn test_torn_tail_is_ignored() {
    let paths = Paths::new();
    let payload = crash_after_prepare(&paths);
    append_to_journal(
        &paths.journal,
        &[JournalEntry::redo(ComponentId(1), payload.clone()), JournalEntry::commit()],
    );
    // A second group cut off mid-entry.
    let torn = JournalEntry::redo(ComponentId(1), payload).to_bytes();
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&paths.journal)
        .expect("open journal");
    file.write_all(&torn[..torn.len() / 2]).expect("write torn entry");
    drop(file);

    let (coordinator, index, report) = open(&paths);
    assert_eq!(report.entries_scanned, 2);
    assert_eq!(report.transactions_replayed, 1);
    assert_keys(&coordinator, &index, 20);
}

#[test]
fn test_unknown_component_fails_start() {
    let paths = Paths::new();
    let payload = crash_after_prepare(&paths);
    append_to_journal(&paths.journal, &[JournalEntry::redo(ComponentId(9), payload), JournalEntry::commit()]);

    let index = Arc::new(
        TxnIndex::open(ComponentId(1), small_params(), tree_config(true, true), &StoreConfig::file(&paths.data))
            .expect("open index"),
    );
    let journal = Journal::open(&paths.journal).expect("journal");
    let coordinator = TransactionCoordinator::new(journal, CoordinatorConfig::default());
    coordinator.add(index).expect("add");
    assert!(matches!(
        coordinator.start(),
        Err(crate::TxnError::UnknownComponent(ComponentId(9)))
    ));
    assert!(matches!(coordinator.begin(TxnMode::Read), Err(crate::TxnError::NotStarted)));
}

#[test]
fn test_second_start_is_rejected() {
    let paths = Paths::new();
    let (coordinator, _index, _) = open(&paths);
    assert!(matches!(coordinator.start(), Err(crate::TxnError::AlreadyStarted)));
}
