//! Persisted index state: the root pointer plus allocator state.
//!
//! # Format
//!
//! ```text
//! +---------+-----------------------------------------+
//! | 0-7     | magic "RIDXROOT"                        |
//! | 8-11    | format version (u32 LE)                 |
//! | 12-19   | root block id (i64 LE)                  |
//! | 20-27   | block limit (i64 LE)                    |
//! | 28-31   | free id count (u32 LE)                  |
//! | 32-N    | free ids (i64 LE each)                  |
//! | N-N+3   | CRC32 of everything before it           |
//! +---------+-----------------------------------------+
//! ```
//!
//! The same bytes are the redo payload a transactional index hands to the
//! journal, so replaying a commit is writing its payload here.

// free list length fits in u32
#![allow(clippy::cast_possible_truncation)]

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::IndexError;
use crate::block::BlockId;

/// Magic number identifying a root file: "RIDXROOT"
pub const MAGIC: [u8; 8] = *b"RIDXROOT";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 32;
const CHECKSUM_SIZE: usize = 4;

/// A committed root with the allocator state that goes with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeState {
    pub root: BlockId,
    pub limit: BlockId,
    pub free: Vec<BlockId>,
}

impl TreeState {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.free.len() * 8 + CHECKSUM_SIZE);
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.root.to_le_bytes());
        bytes.extend_from_slice(&self.limit.to_le_bytes());
        bytes.extend_from_slice(&(self.free.len() as u32).to_le_bytes());
        for id in &self.free {
            bytes.extend_from_slice(&id.to_le_bytes());
        }
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        let corrupt = |message: &str| Err(IndexError::Consistency(format!("root state: {message}")));

        if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return corrupt("truncated");
        }
        let (body, tail) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if stored != crc32fast::hash(body) {
            return corrupt("checksum mismatch");
        }
        if body[0..8] != MAGIC {
            return corrupt("bad magic");
        }
        let version = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
        if version != FORMAT_VERSION {
            return corrupt(&format!("unsupported version {version}"));
        }
        let root = read_i64(&body[12..20]);
        let limit = read_i64(&body[20..28]);
        let count = u32::from_le_bytes([body[28], body[29], body[30], body[31]]) as usize;
        let ids = &body[HEADER_SIZE..];
        if ids.len() != count * 8 {
            return corrupt(&format!("free list holds {} bytes for {count} ids", ids.len()));
        }
        let free = ids.chunks_exact(8).map(read_i64).collect();
        Ok(Self { root, limit, free })
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    i64::from_le_bytes(buf)
}

/// The file beside a page file that names its committed root.
#[derive(Debug, Clone)]
pub struct RootFile {
    path: PathBuf,
}

impl RootFile {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<data path>.root`
    #[must_use]
    pub fn beside(data_path: &Path) -> Self {
        let mut name = data_path.as_os_str().to_owned();
        name.push(".root");
        Self::new(PathBuf::from(name))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored state, or `None` if the file does not exist.
    pub fn read(&self) -> Result<Option<TreeState>, IndexError> {
        match fs::read(&self.path) {
            Ok(bytes) => TreeState::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the stored state atomically.
    pub fn write(&self, state: &TreeState) -> Result<(), IndexError> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(&state.to_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;

        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // Directory fsync is not supported everywhere; the rename already happened.
            if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
                tracing::debug!("could not sync directory {}: {}", dir.display(), e);
            }
        }
        tracing::trace!("published root {} to {}", state.root, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TreeState {
        TreeState {
            root: 7,
            limit: 12,
            free: vec![2, 5, 9],
        }
    }

    #[test]
    fn test_state_bytes_round_trip() {
        let bytes = state().to_bytes();
        assert_eq!(&bytes[..8], b"RIDXROOT");
        assert_eq!(TreeState::from_bytes(&bytes).expect("decode"), state());
    }

    #[test]
    fn test_corrupt_state_is_rejected() {
        let mut bytes = state().to_bytes();
        bytes[14] ^= 0xFF;
        assert!(TreeState::from_bytes(&bytes).expect_err("checksum").is_consistency());
        assert!(TreeState::from_bytes(&bytes[..20]).is_err());
    }

    #[test]
    fn test_root_file_write_and_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root_file = RootFile::beside(&dir.path().join("index.dat"));
        assert_eq!(root_file.path(), dir.path().join("index.dat.root"));
        assert_eq!(root_file.read().expect("read missing"), None);

        root_file.write(&state()).expect("write");
        assert_eq!(root_file.read().expect("read"), Some(state()));

        let next = TreeState {
            root: 3,
            limit: 12,
            free: Vec::new(),
        };
        root_file.write(&next).expect("overwrite");
        assert_eq!(root_file.read().expect("read"), Some(next));
        assert!(!dir.path().join("index.dat.root.tmp").exists());
    }
}
