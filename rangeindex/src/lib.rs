#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! Persistent, transactional B+Tree range index.
//!
//! Layers, bottom up:
//!
//! - [`block`]: fixed-size blocks in memory, a page file or a mapped file,
//!   plus write-in-place and copy-on-write disciplines
//! - [`tree`]: the B+Tree itself, as a plain [`RangeIndex`] or as a
//!   [`TxnIndex`] that takes part in transactions
//! - [`txn`]: a coordinator admitting many readers and one writer, with a
//!   redo journal for atomic multi-index commits

pub mod block;
pub mod config;
pub mod record;
mod sync;
pub mod tree;
pub mod txn;

#[cfg(test)]
mod testing;

mod e2e_tests;

pub use block::{BlockError, BlockId, NO_BLOCK};
pub use config::{Backing, ConfigError, CoordinatorConfig, IndexParams, StoreConfig, TreeConfig, WriterPolicy};
pub use record::{Record, RecordError, RecordFactory};
pub use tree::{IndexError, RangeIndex, TxnIndex};
pub use txn::{ComponentId, Journal, Promote, TransactionCoordinator, Txn, TxnError, TxnId, TxnMode};
