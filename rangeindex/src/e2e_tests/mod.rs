//! End-to-end scenarios across the block, tree and transaction layers.
//!
//! Each file covers one behaviour, driving the public API the way an
//! embedding application would.

#![cfg(test)]

mod helpers;

mod test_atomicity;
mod test_commit_failure;
mod test_concurrency;
mod test_delete;
mod test_distinct;
mod test_dup_modes;
mod test_exhaustion;
mod test_journal_reset;
mod test_multi_index;
mod test_promotion;
mod test_reclaim;
mod test_recovery;
mod test_round_trip;
