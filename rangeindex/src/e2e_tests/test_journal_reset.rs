//! The journal is emptied before the next writer can append to it.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::helpers::tree_config;
use crate::config::{CoordinatorConfig, StoreConfig};
use crate::testing::{init_tracing, int_record, small_params};
use crate::tree::TxnIndex;
use crate::txn::{ComponentId, Journal, JournalFile, TransactionCoordinator, TxnMode};
use crate::TxnError;

const SETTLE: Duration = Duration::from_millis(100);

/// In-memory journal storage that stops inside the next truncation to zero
/// until it is released.
struct PausingFile {
    bytes: Cursor<Vec<u8>>,
    pause: Arc<Mutex<Option<(Sender<()>, Receiver<()>)>>>,
}

impl Read for PausingFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.bytes.read(buf)
    }
}

impl Write for PausingFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for PausingFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.bytes.seek(pos)
    }
}

impl JournalFile for PausingFile {
    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        let pause = self.pause.lock().expect("lock").take();
        if let (0, Some((entered, release))) = (len, pause) {
            entered.send(()).expect("signal truncation");
            release.recv().expect("wait for release");
        }
        self.bytes.get_mut().truncate(len as usize);
        Ok(())
    }
}

#[test]
fn test_next_writer_waits_for_journal_reset() {
    init_tracing();
    let params = small_params();
    let pause = Arc::new(Mutex::new(None));
    let file = PausingFile {
        bytes: Cursor::new(Vec::new()),
        pause: Arc::clone(&pause),
    };
    let index = Arc::new(
        TxnIndex::open(ComponentId(1), params, tree_config(true, true), &StoreConfig::memory()).expect("open index"),
    );
    let journal = Journal::from_file(Box::new(file)).expect("journal");
    let coordinator = Arc::new(TransactionCoordinator::new(journal, CoordinatorConfig::default()));
    coordinator.add(index.clone()).expect("add");
    coordinator.start().expect("start");

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *pause.lock().expect("lock") = Some((entered_tx, release_rx));

    let first = {
        let coordinator = Arc::clone(&coordinator);
        let index = Arc::clone(&index);
        thread::spawn(move || {
            coordinator.execute_write(|txn| index.insert(txn, int_record(&params, 1, 1)).map_err(TxnError::from))
        })
    };
    entered_rx.recv().expect("first writer reached the reset");

    let (admitted_tx, admitted_rx) = mpsc::channel();
    let second = {
        let coordinator = Arc::clone(&coordinator);
        let index = Arc::clone(&index);
        thread::spawn(move || {
            let mut txn = coordinator.begin(TxnMode::Write).expect("begin");
            admitted_tx.send(txn.generation()).expect("send");
            index.insert(&mut txn, int_record(&params, 2, 2)).expect("insert");
            coordinator.commit(&mut txn).expect("commit");
            coordinator.end(txn).expect("end");
        })
    };

    thread::sleep(SETTLE);
    assert!(admitted_rx.try_recv().is_err(), "second writer admitted during the reset");

    release_tx.send(()).expect("release");
    first.join().expect("first writer").expect("first commit");
    assert_eq!(admitted_rx.recv().expect("admitted"), 1);
    second.join().expect("second writer");

    // Both commits landed in order.
    assert_eq!(coordinator.data_version(), 2);
    let txn = coordinator.begin(TxnMode::Read).expect("begin");
    assert_eq!(index.len(&txn).expect("len"), 2);
    coordinator.end(txn).expect("end");
}
