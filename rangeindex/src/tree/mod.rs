//! Paged B+Tree range index.
//!
//! Records live in leaf pages; branch pages hold separator keys and child
//! block ids. There are no sibling links: scans walk down from the root with
//! an explicit stack, which keeps copy-on-write to the root-to-leaf path.
//!
//! Two front ends share the algorithms in [`ops`]:
//!
//! - [`RangeIndex`]: no transactions, every write lands in place and the
//!   root is republished immediately
//! - [`TxnIndex`]: a [`TransactionalComponent`] whose writes are private to
//!   a write transaction until the coordinator commits them
//!
//! [`TransactionalComponent`]: crate::txn::TransactionalComponent

mod index;
mod iter;
pub(crate) mod ops;
mod page;
mod state;
mod txn_index;

pub use index::RangeIndex;
pub use iter::{DistinctIter, RangeIter};
pub use ops::TreeStats;
pub use page::{BranchPage, LeafPage, Page, PageError, PageKind, PageOps};
pub use state::{RootFile, TreeState};
pub use txn_index::TxnIndex;

use crate::block::BlockError;
use crate::config::ConfigError;
use crate::record::RecordError;
use crate::txn::TxnId;

/// Error type for index operations.
#[derive(Debug)]
pub enum IndexError {
    Block(BlockError),
    Page(PageError),
    Record(RecordError),
    Config(ConfigError),
    /// Root file I/O.
    Io(std::io::Error),
    /// A caller-supplied argument is out of range.
    InvalidArgument(String),
    /// A structural invariant does not hold.
    Consistency(String),
    /// A write was attempted in a read transaction.
    ReadOnly(TxnId),
    /// The transaction is not known to this index.
    UnknownTransaction(TxnId),
    /// An earlier write in the transaction failed; it can only be aborted.
    TransactionFailed(TxnId),
}

impl IndexError {
    /// True for corrupt or misused state, as opposed to argument or I/O
    /// failures.
    #[must_use]
    pub const fn is_consistency(&self) -> bool {
        match self {
            Self::Block(e) => e.is_consistency(),
            Self::Page(_) | Self::Consistency(_) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(e) => write!(f, "{e}"),
            Self::Page(e) => write!(f, "page error: {e}"),
            Self::Record(e) => write!(f, "invalid record: {e}"),
            Self::Config(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "root file I/O error: {e}"),
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::Consistency(message) => write!(f, "consistency violation: {message}"),
            Self::ReadOnly(txn) => write!(f, "transaction {txn} is read-only"),
            Self::UnknownTransaction(txn) => write!(f, "transaction {txn} is not active on this index"),
            Self::TransactionFailed(txn) => write!(f, "transaction {txn} failed an earlier write and must abort"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Block(e) => Some(e),
            Self::Page(e) => Some(e),
            Self::Record(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BlockError> for IndexError {
    fn from(e: BlockError) -> Self {
        Self::Block(e)
    }
}

impl From<PageError> for IndexError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}

impl From<RecordError> for IndexError {
    fn from(e: RecordError) -> Self {
        Self::Record(e)
    }
}

impl From<ConfigError> for IndexError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
