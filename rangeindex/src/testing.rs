//! Shared test fixtures.

use crate::config::IndexParams;
use crate::record::Record;

/// Install a log subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 4-byte keys and values, branch order 2, four records per leaf.
///
/// Small enough that a few dozen records build a tree several levels deep.
pub fn small_params() -> IndexParams {
    IndexParams::with_block_size(256, 4, 4, 2)
        .and_then(|p| p.with_leaf_capacity(4))
        .expect("valid test params")
}

/// Big-endian so that byte order matches numeric order.
pub const fn int_key(k: u32) -> [u8; 4] {
    k.to_be_bytes()
}

pub fn int_record(params: &IndexParams, k: u32, v: u32) -> Record {
    let value = v.to_be_bytes();
    params
        .record_factory()
        .create(&int_key(k), &value[..params.value_len])
        .expect("record matches params")
}
