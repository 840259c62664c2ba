//! Transactions over one or more range indexes.
//!
//! # Design
//!
//! A [`TransactionCoordinator`] admits many readers and at most one writer.
//! Every participant implements [`TransactionalComponent`]; the coordinator
//! drives begin, promotion, a two-phase commit through the [`Journal`], abort
//! and end across all of them.
//!
//! A transaction sees the data version that was current when it began. Write
//! transactions publish a new version at commit; readers that began earlier
//! keep their snapshot until they end.
//!
//! # Invariants
//!
//! - At most one transaction holds the writer slot
//! - A commit is reported only after its redo entries and commit marker are
//!   synced to the journal
//! - Every `begin` is matched by exactly one `end`, which consumes the handle

mod component;
mod coordinator;
mod journal;

pub use component::{ComponentId, TransactionalComponent};
pub use coordinator::{RecoveryReport, TransactionCoordinator, TxnCounters};
pub use journal::{Journal, JournalEntry, JournalEntryType, JournalError, JournalFile};

use crate::record::RecordError;
use crate::tree::IndexError;

/// Transaction identifier, unique within one coordinator.
pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    Read,
    Write,
}

/// How a read transaction becomes a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Promote {
    /// Succeed only if nothing committed since the transaction began.
    #[default]
    Isolated,
    /// Move the snapshot forward to the latest commit.
    ReadCommitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A transaction handle. Consumed by [`TransactionCoordinator::end`].
///
/// Dropping a handle without `end` only logs a warning: a writer keeps the
/// writer slot and any transaction keeps pinning block reclamation. The
/// `execute_*` wrappers end the transaction even if their closure panics.
#[derive(Debug)]
pub struct Txn {
    id: TxnId,
    mode: TxnMode,
    generation: u64,
    state: TxnState,
    ended: bool,
}

impl Txn {
    const fn new(id: TxnId, mode: TxnMode, generation: u64) -> Self {
        Self {
            id,
            mode,
            generation,
            state: TxnState::Active,
            ended: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub const fn mode(&self) -> TxnMode {
        self.mode
    }

    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self.mode, TxnMode::Write)
    }

    /// The data version this transaction reads.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn state(&self) -> TxnState {
        self.state
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, TxnState::Active)
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.ended {
            tracing::warn!("transaction {} dropped without end ({:?})", self.id, self.state);
        }
    }
}

/// Error type for transaction operations.
#[derive(Debug)]
pub enum TxnError {
    Journal(JournalError),
    Index(IndexError),
    /// Another transaction holds the writer slot and the policy is to fail.
    WriterBusy,
    /// The transaction has already committed or aborted.
    NotActive(TxnId),
    /// A write transaction was ended without commit or abort; it was aborted.
    NotFinished(TxnId),
    NotStarted,
    AlreadyStarted,
    /// Components can only be added before `start`.
    ConfigurationLocked,
    DuplicateComponent(ComponentId),
    UnknownComponent(ComponentId),
    /// Journal replay failed.
    Recovery(String),
    Shutdown,
}

impl std::fmt::Display for TxnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Journal(e) => write!(f, "{e}"),
            Self::Index(e) => write!(f, "{e}"),
            Self::WriterBusy => write!(f, "another write transaction is active"),
            Self::NotActive(id) => write!(f, "transaction {id} is no longer active"),
            Self::NotFinished(id) => {
                write!(f, "write transaction {id} ended without commit or abort and was aborted")
            }
            Self::NotStarted => write!(f, "coordinator has not been started"),
            Self::AlreadyStarted => write!(f, "coordinator already started"),
            Self::ConfigurationLocked => write!(f, "components cannot be added after start"),
            Self::DuplicateComponent(id) => write!(f, "component {id} is already registered"),
            Self::UnknownComponent(id) => write!(f, "no component with id {id}"),
            Self::Recovery(message) => write!(f, "recovery failed: {message}"),
            Self::Shutdown => write!(f, "coordinator is shut down"),
        }
    }
}

impl std::error::Error for TxnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Journal(e) => Some(e),
            Self::Index(e) => Some(e),
            _ => None,
        }
    }
}

impl From<JournalError> for TxnError {
    fn from(e: JournalError) -> Self {
        Self::Journal(e)
    }
}

impl From<IndexError> for TxnError {
    fn from(e: IndexError) -> Self {
        Self::Index(e)
    }
}

impl From<RecordError> for TxnError {
    fn from(e: RecordError) -> Self {
        Self::Index(IndexError::Record(e))
    }
}
