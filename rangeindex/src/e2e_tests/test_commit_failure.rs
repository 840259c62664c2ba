//! A journal that cannot sync fails the commit and rolls everything back.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::helpers::{DUPLICATE_MODES, keys_of, tree_config};
use crate::config::{CoordinatorConfig, StoreConfig, TreeConfig};
use crate::testing::{init_tracing, int_key, int_record, small_params};
use crate::tree::TxnIndex;
use crate::txn::{ComponentId, Journal, JournalFile, TransactionCoordinator, TxnMode, TxnState};
use crate::TxnError;

/// In-memory journal storage whose `sync` fails while `failing` is set.
#[derive(Clone)]
struct FlakyFile {
    bytes: Arc<Mutex<Cursor<Vec<u8>>>>,
    failing: Arc<AtomicBool>,
}

impl FlakyFile {
    fn new() -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Cursor::new(Vec::new()))),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn len(&self) -> usize {
        self.bytes.lock().expect("lock").get_ref().len()
    }

    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Read for FlakyFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.bytes.lock().expect("lock").read(buf)
    }
}

impl Write for FlakyFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().expect("lock").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for FlakyFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.bytes.lock().expect("lock").seek(pos)
    }
}

impl JournalFile for FlakyFile {
    fn sync(&mut self) -> std::io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("injected sync failure"));
        }
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        let mut bytes = self.bytes.lock().expect("lock");
        bytes.get_mut().truncate(len as usize);
        Ok(())
    }
}

fn flaky_index(config: TreeConfig) -> (TransactionCoordinator, Arc<TxnIndex>, FlakyFile) {
    init_tracing();
    let file = FlakyFile::new();
    let index = Arc::new(
        TxnIndex::open(ComponentId(1), small_params(), config, &StoreConfig::memory()).expect("open index"),
    );
    let journal = Journal::from_file(Box::new(file.clone())).expect("journal");
    let coordinator = TransactionCoordinator::new(journal, CoordinatorConfig::default());
    coordinator.add(index.clone()).expect("add");
    coordinator.start().expect("start");
    (coordinator, index, file)
}

#[test]
fn test_failed_sync_rolls_back() {
    let params = small_params();
    for (branches, leaves) in DUPLICATE_MODES {
        let (coordinator, index, file) = flaky_index(tree_config(branches, leaves));
        coordinator
            .execute_write(|txn| {
                for k in 0..10 {
                    index.insert(txn, int_record(&params, k, k))?;
                }
                Ok::<_, TxnError>(())
            })
            .expect("fill");
        let root = index.committed_root();
        let before = {
            let txn = coordinator.begin(TxnMode::Read).expect("begin");
            let dump = index.dump(&txn).expect("dump");
            coordinator.end(txn).expect("end");
            dump
        };

        file.fail(true);
        let mut txn = coordinator.begin(TxnMode::Write).expect("begin");
        for k in 10..40 {
            index.insert(&mut txn, int_record(&params, k, k)).expect("insert");
        }
        index.delete(&mut txn, &int_key(0)).expect("delete");
        let err = coordinator.commit(&mut txn).expect_err("sync fails");
        assert!(matches!(err, TxnError::Journal(_)), "unexpected error: {err}");
        assert_eq!(txn.state(), TxnState::Aborted);
        coordinator.end(txn).expect("end");

        // Nothing was published and the journal group was cut off again.
        assert_eq!(index.committed_root(), root, "mode ({branches}, {leaves})");
        assert_eq!(coordinator.data_version(), 1);
        assert_eq!(file.len(), 0);
        let txn = coordinator.begin(TxnMode::Read).expect("begin");
        assert_eq!(index.dump(&txn).expect("dump"), before);
        assert_eq!(keys_of(index.iter(&txn).expect("iter")), (0..10).collect::<Vec<_>>());
        index.check(&txn).expect("check");
        coordinator.end(txn).expect("end");

        // The writer slot was released; the next commit goes through.
        file.fail(false);
        coordinator
            .execute_write(|txn| index.insert(txn, int_record(&params, 50, 50)).map_err(TxnError::from))
            .expect("commit after failure");
        let txn = coordinator.begin(TxnMode::Read).expect("begin");
        assert_eq!(index.len(&txn).expect("len"), 11);
        coordinator.end(txn).expect("end");
        assert_eq!(coordinator.counters().aborted, 1);
    }
}

#[test]
fn test_execute_write_reports_commit_failure() {
    let params = small_params();
    let (coordinator, index, file) = flaky_index(tree_config(true, true));
    file.fail(true);
    let result = coordinator.execute_write(|txn| index.insert(txn, int_record(&params, 1, 1)).map_err(TxnError::from));
    assert!(matches!(result, Err(TxnError::Journal(_))));
    assert_eq!(coordinator.counters().active, 0);

    let txn = coordinator.begin(TxnMode::Read).expect("begin");
    assert!(index.is_empty(&txn).expect("empty"));
    coordinator.end(txn).expect("end");
}
