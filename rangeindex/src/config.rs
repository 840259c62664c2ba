//! Index, storage and coordinator configuration.
//!
//! Tree shape parameters are fixed when an index is created. Storage and
//! coordinator settings can also be loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `RANGEINDEX_BACKING`: `memory`, `file:<path>` or `mmap:<path>` (default: `memory`)
//! - `RANGEINDEX_CACHE_BLOCKS`: page cache capacity for file backings (default: `1024`)
//! - `RANGEINDEX_MAX_BLOCKS`: optional cap on allocated blocks
//! - `RANGEINDEX_WRITER_POLICY`: `wait` or `fail` (default: `wait`)
//!
//! # Invariants
//!
//! - `order >= 2` and `1 <= min_records <= order - 1`
//! - `leaf_capacity >= 2`
//! - A full branch page and a full leaf page both fit in `block_size`

use std::path::PathBuf;
use std::str::FromStr;

use crate::record::RecordFactory;

/// Bytes of page header in front of every encoded page.
pub const PAGE_HEADER_SIZE: usize = 12;

/// Bytes used to store a child block id inside a branch page.
pub const CHILD_PTR_SIZE: usize = 8;

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
    /// Tree parameters are inconsistent with each other or the block size.
    InvalidParams(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
            Self::InvalidParams(message) => write!(f, "invalid index parameters: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Shape of a B+Tree: record widths, branch order and fill limits.
///
/// Branch pages hold at most `2 * order` separator keys; non-root branch pages
/// hold at least `min_records`. Leaf pages hold at most `leaf_capacity`
/// records and, when not the root, at least `leaf_capacity / 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    pub key_len: usize,
    pub value_len: usize,
    pub order: usize,
    pub min_records: usize,
    pub leaf_capacity: usize,
    pub block_size: usize,
}

impl IndexParams {
    /// Default block size in bytes.
    pub const DEFAULT_BLOCK_SIZE: usize = 8192;

    /// Create parameters with the default block size.
    ///
    /// `min_records` defaults to `order - 1` and the leaf capacity to as many
    /// records as fit in a block.
    pub fn new(key_len: usize, value_len: usize, order: usize) -> Result<Self, ConfigError> {
        Self::with_block_size(Self::DEFAULT_BLOCK_SIZE, key_len, value_len, order)
    }

    /// Create parameters for an explicit block size.
    pub fn with_block_size(
        block_size: usize,
        key_len: usize,
        value_len: usize,
        order: usize,
    ) -> Result<Self, ConfigError> {
        let record_len = key_len + value_len;
        if record_len == 0 {
            return Err(ConfigError::InvalidParams("key length must be positive".to_string()));
        }
        let params = Self {
            key_len,
            value_len,
            order,
            min_records: order.saturating_sub(1),
            leaf_capacity: block_size.saturating_sub(PAGE_HEADER_SIZE) / record_len,
            block_size,
        };
        params.validate()?;
        Ok(params)
    }

    /// Largest order whose full branch page fits in `block_size`.
    pub fn for_block_size(block_size: usize, key_len: usize, value_len: usize) -> Result<Self, ConfigError> {
        // 2*order keys and 2*order+1 children must fit after the header.
        let usable = block_size.saturating_sub(PAGE_HEADER_SIZE + CHILD_PTR_SIZE);
        let order = usable / (2 * (key_len + CHILD_PTR_SIZE));
        Self::with_block_size(block_size, key_len, value_len, order)
    }

    /// Override the minimum occupancy of non-root branch pages.
    pub fn with_min_records(mut self, min_records: usize) -> Result<Self, ConfigError> {
        self.min_records = min_records;
        self.validate()?;
        Ok(self)
    }

    /// Override the leaf capacity.
    pub fn with_leaf_capacity(mut self, leaf_capacity: usize) -> Result<Self, ConfigError> {
        self.leaf_capacity = leaf_capacity;
        self.validate()?;
        Ok(self)
    }

    /// Check every invariant listed in the module docs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_len == 0 {
            return Err(ConfigError::InvalidParams("key length must be positive".to_string()));
        }
        if self.order < 2 {
            return Err(ConfigError::InvalidParams(format!(
                "order must be at least 2, got {}",
                self.order
            )));
        }
        if self.min_records == 0 || self.min_records >= self.order {
            return Err(ConfigError::InvalidParams(format!(
                "min_records must be in 1..={}, got {}",
                self.order - 1,
                self.min_records
            )));
        }
        if self.leaf_capacity < 2 {
            return Err(ConfigError::InvalidParams(format!(
                "leaf capacity must be at least 2, got {}",
                self.leaf_capacity
            )));
        }
        if self.max_branch_bytes() > self.block_size {
            return Err(ConfigError::InvalidParams(format!(
                "branch page of order {} needs {} bytes, block size is {}",
                self.order,
                self.max_branch_bytes(),
                self.block_size
            )));
        }
        if self.max_leaf_bytes() > self.block_size {
            return Err(ConfigError::InvalidParams(format!(
                "leaf page of {} records needs {} bytes, block size is {}",
                self.leaf_capacity,
                self.max_leaf_bytes(),
                self.block_size
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn record_len(&self) -> usize {
        self.key_len + self.value_len
    }

    /// Maximum separator keys in a branch page.
    #[must_use]
    pub const fn branch_capacity(&self) -> usize {
        2 * self.order
    }

    /// Minimum records in a non-root leaf page.
    #[must_use]
    pub const fn leaf_min(&self) -> usize {
        self.leaf_capacity / 2
    }

    #[must_use]
    pub const fn record_factory(&self) -> RecordFactory {
        RecordFactory::new(self.key_len, self.value_len)
    }

    const fn max_branch_bytes(&self) -> usize {
        let keys = self.branch_capacity();
        PAGE_HEADER_SIZE + CHILD_PTR_SIZE + keys * (self.key_len + CHILD_PTR_SIZE)
    }

    const fn max_leaf_bytes(&self) -> usize {
        PAGE_HEADER_SIZE + self.leaf_capacity * self.record_len()
    }
}

/// Per-index behavioural switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Copy-on-write for branch pages inside write transactions.
    pub duplicate_branches: bool,
    /// Copy-on-write for leaf pages inside write transactions.
    pub duplicate_leaves: bool,
    /// Run a full consistency check after every mutation.
    pub checking: bool,
    /// Emit a trace event for every operation.
    pub log_operations: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            duplicate_branches: true,
            duplicate_leaves: true,
            checking: false,
            log_operations: false,
        }
    }
}

impl TreeConfig {
    /// Both page kinds written in place.
    #[must_use]
    pub const fn in_place() -> Self {
        Self {
            duplicate_branches: false,
            duplicate_leaves: false,
            checking: false,
            log_operations: false,
        }
    }

    #[must_use]
    pub const fn with_duplicates(mut self, branches: bool, leaves: bool) -> Self {
        self.duplicate_branches = branches;
        self.duplicate_leaves = leaves;
        self
    }

    #[must_use]
    pub const fn with_checking(mut self, checking: bool) -> Self {
        self.checking = checking;
        self
    }
}

/// Where an index keeps its pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Heap memory; nothing survives the process.
    Memory,
    /// A page file accessed with positioned reads and writes.
    File(PathBuf),
    /// A memory-mapped page file.
    Mapped(PathBuf),
}

impl FromStr for Backing {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ConfigError::InvalidValue {
            name: StoreConfig::BACKING_VAR.to_string(),
            message: message.to_string(),
        };
        if s == "memory" {
            return Ok(Self::Memory);
        }
        let (scheme, path) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected memory, file:<path> or mmap:<path>"))?;
        if path.is_empty() {
            return Err(invalid("path must not be empty"));
        }
        match scheme {
            "file" => Ok(Self::File(PathBuf::from(path))),
            "mmap" => Ok(Self::Mapped(PathBuf::from(path))),
            _ => Err(invalid(&format!("unknown backing scheme: {scheme}"))),
        }
    }
}

/// Block storage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backing: Backing,
    /// Pages kept in the read cache of a file backing.
    pub cache_blocks: usize,
    /// Allocation fails once this many blocks are in use.
    pub max_blocks: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::memory()
    }
}

impl StoreConfig {
    pub const BACKING_VAR: &'static str = "RANGEINDEX_BACKING";
    pub const CACHE_BLOCKS_VAR: &'static str = "RANGEINDEX_CACHE_BLOCKS";
    pub const MAX_BLOCKS_VAR: &'static str = "RANGEINDEX_MAX_BLOCKS";
    /// Default page cache capacity.
    pub const DEFAULT_CACHE_BLOCKS: usize = 1024;

    #[must_use]
    pub const fn memory() -> Self {
        Self {
            backing: Backing::Memory,
            cache_blocks: Self::DEFAULT_CACHE_BLOCKS,
            max_blocks: None,
        }
    }

    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backing: Backing::File(path.into()),
            ..Self::memory()
        }
    }

    #[must_use]
    pub fn mapped(path: impl Into<PathBuf>) -> Self {
        Self {
            backing: Backing::Mapped(path.into()),
            ..Self::memory()
        }
    }

    #[must_use]
    pub const fn with_max_blocks(mut self, max_blocks: u64) -> Self {
        self.max_blocks = Some(max_blocks);
        self
    }

    /// Load storage settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backing = match std::env::var(Self::BACKING_VAR) {
            Ok(value) => value.parse()?,
            Err(_) => Backing::Memory,
        };
        let cache_blocks = parse_var(Self::CACHE_BLOCKS_VAR)?.unwrap_or(Self::DEFAULT_CACHE_BLOCKS);
        if cache_blocks == 0 {
            return Err(ConfigError::InvalidValue {
                name: Self::CACHE_BLOCKS_VAR.to_string(),
                message: "must be positive".to_string(),
            });
        }
        let max_blocks = parse_var(Self::MAX_BLOCKS_VAR)?;
        Ok(Self {
            backing,
            cache_blocks,
            max_blocks,
        })
    }
}

/// What `begin(Write)` does while another writer holds the writer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterPolicy {
    /// Block until the slot is free.
    #[default]
    Wait,
    /// Return immediately with an error.
    Fail,
}

impl FromStr for WriterPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(Self::Wait),
            "fail" => Ok(Self::Fail),
            other => Err(ConfigError::InvalidValue {
                name: CoordinatorConfig::WRITER_POLICY_VAR.to_string(),
                message: format!("expected wait or fail, got {other}"),
            }),
        }
    }
}

/// Transaction coordinator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinatorConfig {
    pub writer_policy: WriterPolicy,
}

impl CoordinatorConfig {
    pub const WRITER_POLICY_VAR: &'static str = "RANGEINDEX_WRITER_POLICY";

    #[must_use]
    pub const fn with_writer_policy(writer_policy: WriterPolicy) -> Self {
        Self { writer_policy }
    }

    /// Load coordinator settings from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let writer_policy = match std::env::var(Self::WRITER_POLICY_VAR) {
            Ok(value) => value.parse()?,
            Err(_) => WriterPolicy::default(),
        };
        Ok(Self { writer_policy })
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                name: name.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_fill_block() {
        let params = IndexParams::new(8, 8, 4).expect("valid params");
        assert_eq!(params.min_records, 3);
        assert_eq!(params.leaf_capacity, (8192 - PAGE_HEADER_SIZE) / 16);
        assert_eq!(params.branch_capacity(), 8);
    }

    #[test]
    fn test_order_must_be_at_least_two() {
        let err = IndexParams::new(4, 0, 1).expect_err("order 1 rejected");
        assert!(matches!(err, ConfigError::InvalidParams(_)));
    }

    #[test]
    fn test_min_records_bounds() {
        let params = IndexParams::new(4, 0, 3).expect("valid params");
        assert!(params.with_min_records(0).is_err());
        assert!(params.with_min_records(3).is_err());
        assert_eq!(params.with_min_records(1).expect("min 1").min_records, 1);
    }

    #[test]
    fn test_order_too_large_for_block() {
        let err = IndexParams::with_block_size(128, 8, 0, 8).expect_err("does not fit");
        assert!(err.to_string().contains("branch page"));
    }

    #[test]
    fn test_for_block_size_fits() {
        let params = IndexParams::for_block_size(4096, 12, 0).expect("fits");
        assert!(params.order >= 2);
        assert!(IndexParams::with_block_size(4096, 12, 0, params.order + 1).is_err());
    }

    #[test]
    fn test_leaf_capacity_override() {
        let params = IndexParams::new(4, 4, 2)
            .and_then(|p| p.with_leaf_capacity(4))
            .expect("valid params");
        assert_eq!(params.leaf_capacity, 4);
        assert_eq!(params.leaf_min(), 2);
        assert!(params.with_leaf_capacity(1).is_err());
    }

    #[test]
    fn test_backing_parse() {
        assert_eq!("memory".parse::<Backing>(), Ok(Backing::Memory));
        assert_eq!(
            "file:/tmp/a.dat".parse::<Backing>(),
            Ok(Backing::File(PathBuf::from("/tmp/a.dat")))
        );
        assert_eq!(
            "mmap:idx.dat".parse::<Backing>(),
            Ok(Backing::Mapped(PathBuf::from("idx.dat")))
        );
        assert!("disk:/x".parse::<Backing>().is_err());
        assert!("file:".parse::<Backing>().is_err());
        assert!("nonsense".parse::<Backing>().is_err());
    }

    #[test]
    fn test_writer_policy_parse() {
        assert_eq!("wait".parse::<WriterPolicy>(), Ok(WriterPolicy::Wait));
        assert_eq!("fail".parse::<WriterPolicy>(), Ok(WriterPolicy::Fail));
        let err = "later".parse::<WriterPolicy>().expect_err("invalid");
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "RANGEINDEX_WRITER_POLICY".to_string(),
                message: "expected wait or fail, got later".to_string(),
            }
        );
    }

    #[test]
    fn test_tree_config_defaults_to_copy_on_write() {
        let config = TreeConfig::default();
        assert!(config.duplicate_branches);
        assert!(config.duplicate_leaves);
        assert!(!config.checking);
        let config = TreeConfig::in_place().with_duplicates(true, false);
        assert!(config.duplicate_branches);
        assert!(!config.duplicate_leaves);
    }

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::file("/tmp/index.dat").with_max_blocks(64);
        assert_eq!(config.cache_blocks, StoreConfig::DEFAULT_CACHE_BLOCKS);
        assert_eq!(config.max_blocks, Some(64));
        assert_eq!(StoreConfig::memory().cache_blocks, StoreConfig::DEFAULT_CACHE_BLOCKS);
    }
}
