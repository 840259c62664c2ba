//! Transaction coordinator: admission, two-phase commit and recovery.
//!
//! # Design
//!
//! All admission state sits in one mutex-protected gate with a condition
//! variable. Write begins, promotions, exclusive mode and writer blocking
//! wait on it; readers only wait while exclusive mode is requested.
//!
//! Commit runs in two phases:
//!
//! 1. Every component prepares: its pages are synced and it returns a redo
//!    payload. The payloads and a commit marker are appended to the journal,
//!    which is then synced. A failure here rolls everything back.
//! 2. Under the gate, every component publishes, the data version advances
//!    and the writer slot is released. The journal is then truncated.
//!
//! A crash between the journal sync and the publish is repaired by `start`,
//! which replays committed journal groups.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use super::component::{ComponentId, TransactionalComponent};
use super::journal::{Journal, JournalEntry, JournalEntryType};
use super::{Promote, Txn, TxnError, TxnId, TxnMode, TxnState};
use crate::config::{CoordinatorConfig, WriterPolicy};
use crate::sync::{lock, read, wait, write};

#[derive(Debug, Default)]
struct Gate {
    writer: Option<TxnId>,
    writers_blocked: bool,
    exclusive: bool,
    /// Active transactions with their generation and mode.
    active: BTreeMap<TxnId, (u64, TxnMode)>,
    data_version: u64,
}

impl Gate {
    fn oldest_active(&self) -> u64 {
        self.active
            .values()
            .map(|&(generation, _)| generation)
            .min()
            .unwrap_or(self.data_version)
    }

    fn writer_slot_free(&self) -> bool {
        self.writer.is_none() && !self.writers_blocked
    }
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    begun_read: AtomicU64,
    begun_write: AtomicU64,
    finished: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

/// Snapshot of the coordinator's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnCounters {
    pub begun: u64,
    pub begun_read: u64,
    pub begun_write: u64,
    pub finished: u64,
    pub committed: u64,
    pub aborted: u64,
    pub active: u64,
    pub active_readers: u64,
    pub active_writers: u64,
}

/// What `start` found in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    pub entries_scanned: usize,
    /// Committed groups whose payloads were reapplied.
    pub transactions_replayed: usize,
    /// Redo entries belonging to aborted or unfinished groups.
    pub entries_discarded: usize,
}

/// Coordinates transactions across a set of components.
pub struct TransactionCoordinator {
    config: CoordinatorConfig,
    journal: Mutex<Journal>,
    components: RwLock<Vec<Arc<dyn TransactionalComponent>>>,
    gate: Mutex<Gate>,
    cv: Condvar,
    next_id: AtomicU64,
    counters: Counters,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl TransactionCoordinator {
    #[must_use]
    pub fn new(journal: Journal, config: CoordinatorConfig) -> Self {
        Self {
            config,
            journal: Mutex::new(journal),
            components: RwLock::new(Vec::new()),
            gate: Mutex::new(Gate::default()),
            cv: Condvar::new(),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a component. Only allowed before [`start`](Self::start).
    pub fn add(&self, component: Arc<dyn TransactionalComponent>) -> Result<(), TxnError> {
        if self.started.load(Ordering::Acquire) {
            return Err(TxnError::ConfigurationLocked);
        }
        let mut components = write(&self.components);
        let id = component.component_id();
        if components.iter().any(|c| c.component_id() == id) {
            return Err(TxnError::DuplicateComponent(id));
        }
        components.push(component);
        Ok(())
    }

    /// Replay the journal, then open for transactions.
    pub fn start(&self) -> Result<RecoveryReport, TxnError> {
        if self.started.load(Ordering::Acquire) {
            return Err(TxnError::AlreadyStarted);
        }
        let components = read(&self.components).clone();
        let mut journal = lock(&self.journal);
        let entries = journal.entries()?;

        let mut report = RecoveryReport {
            entries_scanned: entries.len(),
            ..RecoveryReport::default()
        };

        if entries.is_empty() {
            for component in &components {
                component.clean_start()?;
            }
        } else {
            tracing::info!("recovering from journal with {} entries", entries.len());
            for component in &components {
                component.start_recovery()?;
            }

            let mut group: Vec<JournalEntry> = Vec::new();
            for entry in entries {
                match entry.kind {
                    JournalEntryType::Redo => group.push(entry),
                    JournalEntryType::Commit => {
                        for redo in group.drain(..) {
                            let component = find(&components, redo.component)?;
                            component.recover(&redo.payload).map_err(|e| {
                                TxnError::Recovery(format!("component {}: {e}", redo.component))
                            })?;
                        }
                        report.transactions_replayed += 1;
                    }
                    JournalEntryType::Abort => {
                        report.entries_discarded += group.len();
                        group.clear();
                    }
                    JournalEntryType::Undo => {
                        tracing::warn!("ignoring undo entry for component {}", entry.component);
                    }
                }
            }
            if !group.is_empty() {
                tracing::warn!("discarding {} journal entries without a commit marker", group.len());
                report.entries_discarded += group.len();
            }

            for component in &components {
                component.finish_recovery()?;
            }
        }
        if !journal.is_empty() {
            journal.reset()?;
        }
        drop(journal);

        self.started.store(true, Ordering::Release);
        tracing::info!(
            "coordinator started with {} components ({} transactions replayed)",
            components.len(),
            report.transactions_replayed
        );
        Ok(report)
    }

    /// Start a transaction. A write begin waits for, or fails on, an active
    /// writer according to the configured [`WriterPolicy`].
    pub fn begin(&self, mode: TxnMode) -> Result<Txn, TxnError> {
        self.check_open()?;
        let mut gate = lock(&self.gate);
        loop {
            if self.shut_down.load(Ordering::Acquire) {
                return Err(TxnError::Shutdown);
            }
            let admitted = !gate.exclusive && (mode == TxnMode::Read || gate.writer_slot_free());
            if admitted {
                break;
            }
            if mode == TxnMode::Write && !gate.exclusive && self.config.writer_policy == WriterPolicy::Fail {
                return Err(TxnError::WriterBusy);
            }
            gate = wait(&self.cv, gate);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut txn = Txn::new(id, mode, gate.data_version);
        let components = read(&self.components).clone();
        for component in &components {
            let joined = component.begin(&txn).and_then(|()| match mode {
                TxnMode::Write => component.promote(&txn, Promote::Isolated),
                TxnMode::Read => Ok(()),
            });
            if let Err(e) = joined {
                for c in &components {
                    // Components that never saw the transaction report it as unknown.
                    let _ = c.abort(&txn);
                    c.end(&txn);
                }
                txn.ended = true;
                return Err(e);
            }
        }
        if mode == TxnMode::Write {
            gate.writer = Some(id);
        }
        gate.active.insert(id, (txn.generation, mode));
        drop(gate);

        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        match mode {
            TxnMode::Read => self.counters.begun_read.fetch_add(1, Ordering::Relaxed),
            TxnMode::Write => self.counters.begun_write.fetch_add(1, Ordering::Relaxed),
        };
        tracing::trace!("began {:?} transaction {} at version {}", mode, id, txn.generation);
        Ok(txn)
    }

    /// Promote a read transaction to a writer, failing if anything committed
    /// since it began. Returns `false` if promotion was refused.
    pub fn promote(&self, txn: &mut Txn) -> Result<bool, TxnError> {
        self.promote_with(txn, Promote::Isolated)
    }

    pub fn promote_with(&self, txn: &mut Txn, how: Promote) -> Result<bool, TxnError> {
        if !txn.is_active() {
            return Err(TxnError::NotActive(txn.id));
        }
        if txn.is_write() {
            return Ok(true);
        }
        let mut gate = lock(&self.gate);
        while !gate.writer_slot_free() {
            if self.config.writer_policy == WriterPolicy::Fail {
                return Ok(false);
            }
            gate = wait(&self.cv, gate);
        }
        if how == Promote::Isolated && gate.data_version != txn.generation {
            tracing::debug!(
                "transaction {} cannot promote: version {} is newer than its snapshot {}",
                txn.id,
                gate.data_version,
                txn.generation
            );
            return Ok(false);
        }

        let components = read(&self.components).clone();
        for component in &components {
            if let Err(e) = component.promote(txn, how) {
                // Still a reader: components drop the write set and keep the snapshot.
                for c in &components {
                    let _ = c.abort(txn);
                }
                return Err(e);
            }
        }
        gate.writer = Some(txn.id);
        txn.generation = gate.data_version;
        txn.mode = TxnMode::Write;
        gate.active.insert(txn.id, (txn.generation, TxnMode::Write));
        tracing::debug!("promoted transaction {} ({:?})", txn.id, how);
        Ok(true)
    }

    /// Make the transaction's changes durable and visible.
    pub fn commit(&self, txn: &mut Txn) -> Result<(), TxnError> {
        if !txn.is_active() {
            return Err(TxnError::NotActive(txn.id));
        }
        if !txn.is_write() {
            txn.state = TxnState::Committed;
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let components = read(&self.components).clone();

        if let Err(e) = self.journal_commit(txn, &components) {
            tracing::warn!("commit of transaction {} failed before publish: {}", txn.id, e);
            self.rollback(txn, &components);
            return Err(e);
        }

        let mut publish_error = None;
        let (oldest_active, journal_reset) = {
            let mut gate = lock(&self.gate);
            for component in &components {
                if let Err(e) = component.commit(txn) {
                    tracing::error!(
                        "component {} failed to publish transaction {}: {}",
                        component.component_id(),
                        txn.id,
                        e
                    );
                    publish_error.get_or_insert(e);
                }
            }
            // Truncate before the slot is released so the next writer's group
            // cannot be cut off. After a publish error the journal is kept.
            let journal_reset = match publish_error {
                None => lock(&self.journal).reset(),
                Some(_) => Ok(()),
            };
            gate.data_version += 1;
            gate.writer = None;
            self.cv.notify_all();
            (gate.oldest_active(), journal_reset)
        };
        txn.state = TxnState::Committed;
        self.counters.committed.fetch_add(1, Ordering::Relaxed);

        if let Some(e) = publish_error {
            // The journal still holds the commit; the next start replays it.
            return Err(e);
        }
        journal_reset?;
        tracing::debug!("committed transaction {}", txn.id);
        self.reclaim(&components, oldest_active);
        Ok(())
    }

    /// Phase one: prepare every component and write the journal group.
    fn journal_commit(&self, txn: &Txn, components: &[Arc<dyn TransactionalComponent>]) -> Result<(), TxnError> {
        let mut redo = Vec::new();
        for component in components {
            if let Some(payload) = component.prepare(txn)? {
                redo.push(JournalEntry::redo(component.component_id(), payload));
            }
        }
        if redo.is_empty() {
            return Ok(());
        }

        let mut journal = lock(&self.journal);
        let start = journal.position();
        let written = redo
            .iter()
            .try_for_each(|entry| journal.append(entry))
            .and_then(|()| journal.write_commit())
            .and_then(|()| journal.sync());
        if let Err(e) = written {
            if let Err(truncate_error) = journal.truncate(start) {
                tracing::error!("could not truncate journal after failed commit: {}", truncate_error);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Discard the transaction's changes.
    pub fn abort(&self, txn: &mut Txn) -> Result<(), TxnError> {
        if !txn.is_active() {
            return Err(TxnError::NotActive(txn.id));
        }
        if txn.is_write() {
            let components = read(&self.components).clone();
            self.rollback(txn, &components);
            tracing::debug!("aborted transaction {}", txn.id);
        } else {
            txn.state = TxnState::Aborted;
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn rollback(&self, txn: &mut Txn, components: &[Arc<dyn TransactionalComponent>]) {
        for component in components {
            if let Err(e) = component.abort(txn) {
                tracing::error!("component {} failed to abort transaction {}: {}", component.component_id(), txn.id, e);
            }
        }
        let mut gate = lock(&self.gate);
        if gate.writer == Some(txn.id) {
            gate.writer = None;
            self.cv.notify_all();
        }
        drop(gate);
        txn.state = TxnState::Aborted;
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Finish with a transaction. Ending a writer that neither committed nor
    /// aborted aborts it and reports [`TxnError::NotFinished`].
    pub fn end(&self, mut txn: Txn) -> Result<(), TxnError> {
        self.finish(&mut txn)
    }

    fn finish(&self, txn: &mut Txn) -> Result<(), TxnError> {
        let components = read(&self.components).clone();
        let mut result = Ok(());
        if txn.is_active() && txn.is_write() {
            tracing::warn!("write transaction {} ended while active; aborting", txn.id);
            self.rollback(txn, &components);
            result = Err(TxnError::NotFinished(txn.id));
        }
        for component in &components {
            component.end(txn);
        }
        let oldest_active = {
            let mut gate = lock(&self.gate);
            gate.active.remove(&txn.id);
            self.cv.notify_all();
            gate.oldest_active()
        };
        txn.ended = true;
        self.counters.finished.fetch_add(1, Ordering::Relaxed);
        self.reclaim(&components, oldest_active);
        result
    }

    fn reclaim(&self, components: &[Arc<dyn TransactionalComponent>], oldest_active: u64) {
        for component in components {
            if let Err(e) = component.reclaim(oldest_active) {
                tracing::warn!("component {} failed to reclaim: {}", component.component_id(), e);
            }
        }
    }

    /// Run `f` in a read transaction that is always ended, also when `f`
    /// panics.
    pub fn execute_read<T, E>(&self, f: impl FnOnce(&Txn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<TxnError>,
    {
        let mut txn = self.begin(TxnMode::Read)?;
        let result = self.guarded(&mut txn, |txn| f(txn));
        self.end(txn)?;
        result
    }

    /// Run `f` in a write transaction: commit on `Ok`, abort on `Err` or
    /// panic, and always end.
    pub fn execute_write<T, E>(&self, f: impl FnOnce(&mut Txn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<TxnError>,
    {
        let mut txn = self.begin(TxnMode::Write)?;
        let result = self.guarded(&mut txn, f);
        let finished = match &result {
            Ok(_) => self.commit(&mut txn),
            Err(_) => self.abort(&mut txn),
        };
        let ended = self.end(txn);
        finished?;
        ended?;
        result
    }

    /// Call `f`; if it panics, abort and end `txn` before resuming the panic
    /// so the writer slot and the reclamation horizon are released.
    fn guarded<R>(&self, txn: &mut Txn, f: impl FnOnce(&mut Txn) -> R) -> R {
        match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *txn))) {
            Ok(result) => result,
            Err(payload) => {
                tracing::warn!("transaction {} panicked; aborting", txn.id);
                if txn.is_active() {
                    if let Err(e) = self.abort(txn) {
                        tracing::error!("abort of panicked transaction {} failed: {}", txn.id, e);
                    }
                }
                let _ = self.finish(txn);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Stop new writers and wait for the current one to finish.
    pub fn block_writers(&self) {
        let mut gate = lock(&self.gate);
        while gate.writers_blocked {
            gate = wait(&self.cv, gate);
        }
        gate.writers_blocked = true;
        while gate.writer.is_some() {
            gate = wait(&self.cv, gate);
        }
    }

    /// Block writers only if no writer is active. Returns whether it did.
    pub fn try_block_writers(&self) -> bool {
        let mut gate = lock(&self.gate);
        if !gate.writer_slot_free() {
            return false;
        }
        gate.writers_blocked = true;
        true
    }

    pub fn enable_writers(&self) {
        lock(&self.gate).writers_blocked = false;
        self.cv.notify_all();
    }

    /// Run `f` while writers are blocked.
    pub fn exec_as_writer<T>(&self, f: impl FnOnce() -> T) -> T {
        self.block_writers();
        let result = f();
        self.enable_writers();
        result
    }

    /// Stop new transactions and wait until none are active.
    pub fn start_exclusive_mode(&self) {
        let mut gate = lock(&self.gate);
        while gate.exclusive {
            gate = wait(&self.cv, gate);
        }
        gate.exclusive = true;
        while !gate.active.is_empty() {
            gate = wait(&self.cv, gate);
        }
        tracing::debug!("entered exclusive mode");
    }

    /// Enter exclusive mode only if no transaction is active.
    pub fn try_exclusive_mode(&self) -> bool {
        let mut gate = lock(&self.gate);
        if gate.exclusive || !gate.active.is_empty() {
            return false;
        }
        gate.exclusive = true;
        true
    }

    pub fn finish_exclusive_mode(&self) {
        lock(&self.gate).exclusive = false;
        self.cv.notify_all();
        tracing::debug!("left exclusive mode");
    }

    /// Run `f` with no transaction active.
    pub fn exec_exclusive<T>(&self, f: impl FnOnce() -> T) -> T {
        self.start_exclusive_mode();
        let result = f();
        self.finish_exclusive_mode();
        result
    }

    #[must_use]
    pub fn counters(&self) -> TxnCounters {
        let gate = lock(&self.gate);
        let active = gate.active.len() as u64;
        let active_writers = gate.active.values().filter(|(_, mode)| *mode == TxnMode::Write).count() as u64;
        drop(gate);
        TxnCounters {
            begun: self.counters.begun.load(Ordering::Relaxed),
            begun_read: self.counters.begun_read.load(Ordering::Relaxed),
            begun_write: self.counters.begun_write.load(Ordering::Relaxed),
            finished: self.counters.finished.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            active,
            active_readers: active - active_writers,
            active_writers,
        }
    }

    /// Number of commits published since start.
    #[must_use]
    pub fn data_version(&self) -> u64 {
        lock(&self.gate).data_version
    }

    /// Refuse further transactions and shut every component down.
    pub fn shutdown(&self) -> Result<(), TxnError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let active = lock(&self.gate).active.len();
        if active > 0 {
            tracing::warn!("shutting down with {} active transactions", active);
        }
        self.cv.notify_all();
        for component in read(&self.components).iter() {
            component.shutdown()?;
        }
        tracing::info!("coordinator shut down");
        Ok(())
    }

    fn check_open(&self) -> Result<(), TxnError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TxnError::Shutdown);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(TxnError::NotStarted);
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("config", &self.config)
            .field("data_version", &self.data_version())
            .finish_non_exhaustive()
    }
}

fn find(
    components: &[Arc<dyn TransactionalComponent>],
    id: ComponentId,
) -> Result<&Arc<dyn TransactionalComponent>, TxnError> {
    components
        .iter()
        .find(|c| c.component_id() == id)
        .ok_or(TxnError::UnknownComponent(id))
}
