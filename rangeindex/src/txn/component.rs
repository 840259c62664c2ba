//! The participant side of a transaction.

use super::{Promote, Txn, TxnError};

/// Identifies a component in journal entries. Stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something whose state changes atomically with a transaction.
///
/// The coordinator calls `begin` and `commit` while holding its gate, so a
/// snapshot taken in `begin` is consistent with the data version, and a
/// publish in `commit` is seen by every transaction that begins afterwards.
pub trait TransactionalComponent: Send + Sync {
    fn component_id(&self) -> ComponentId;

    /// Called at `start` when the journal holds nothing to replay.
    fn clean_start(&self) -> Result<(), TxnError> {
        Ok(())
    }

    fn start_recovery(&self) -> Result<(), TxnError> {
        Ok(())
    }

    /// Apply a redo payload from a committed journal group.
    fn recover(&self, payload: &[u8]) -> Result<(), TxnError>;

    fn finish_recovery(&self) -> Result<(), TxnError> {
        Ok(())
    }

    fn begin(&self, txn: &Txn) -> Result<(), TxnError>;

    /// `txn` became a writer.
    fn promote(&self, txn: &Txn, how: Promote) -> Result<(), TxnError>;

    /// Make the transaction's changes durable apart from the root publish,
    /// returning the redo payload, or `None` if nothing changed.
    fn prepare(&self, txn: &Txn) -> Result<Option<Vec<u8>>, TxnError>;

    /// Publish the prepared changes.
    fn commit(&self, txn: &Txn) -> Result<(), TxnError>;

    /// Discard the transaction's changes.
    fn abort(&self, txn: &Txn) -> Result<(), TxnError>;

    /// Forget the transaction.
    fn end(&self, txn: &Txn);

    /// Free storage no transaction older than `oldest_active` can reach.
    fn reclaim(&self, _oldest_active: u64) -> Result<(), TxnError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), TxnError> {
        Ok(())
    }
}
