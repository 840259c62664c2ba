//! Common helpers for end-to-end tests.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::{CoordinatorConfig, StoreConfig, TreeConfig, WriterPolicy};
use crate::record::Record;
use crate::testing::{init_tracing, small_params};
use crate::tree::{IndexError, TxnIndex};
use crate::txn::{ComponentId, Journal, TransactionCoordinator};

/// Every combination of (duplicate branches, duplicate leaves).
pub const DUPLICATE_MODES: [(bool, bool); 4] = [(true, true), (true, false), (false, true), (false, false)];

pub fn tree_config(branches: bool, leaves: bool) -> TreeConfig {
    TreeConfig::default().with_duplicates(branches, leaves).with_checking(true)
}

/// A started coordinator over one memory-backed index.
pub fn single_index(config: TreeConfig) -> (TransactionCoordinator, Arc<TxnIndex>) {
    single_index_with_policy(config, WriterPolicy::Wait)
}

pub fn single_index_with_policy(config: TreeConfig, policy: WriterPolicy) -> (TransactionCoordinator, Arc<TxnIndex>) {
    init_tracing();
    let index = Arc::new(
        TxnIndex::open(ComponentId(1), small_params(), config, &StoreConfig::memory()).expect("open index"),
    );
    let coordinator = TransactionCoordinator::new(Journal::in_memory(), CoordinatorConfig::with_writer_policy(policy));
    coordinator.add(index.clone()).expect("add index");
    coordinator.start().expect("start");
    (coordinator, index)
}

pub fn shuffled(n: u32, seed: u64) -> Vec<u32> {
    let mut keys: Vec<u32> = (0..n).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(seed));
    keys
}

/// Decode the 4-byte big-endian keys of a scan.
pub fn keys_of(iter: impl Iterator<Item = Result<Record, IndexError>>) -> Vec<u32> {
    iter.map(|r| {
        let record = r.expect("scan");
        u32::from_be_bytes(record.key().try_into().expect("4-byte key"))
    })
    .collect()
}
