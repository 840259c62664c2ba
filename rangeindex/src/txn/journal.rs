//! Append-only redo journal.
//!
//! # Entry Format
//!
//! ```text
//! +----------+------------------------------------------------+
//! | 0-3      | entry_length (4 bytes, includes header+crc)    |
//! | 4        | entry_type (1 byte)                            |
//! | 5-8      | component_id (4 bytes)                         |
//! | 9-N      | payload (variable)                             |
//! | N-N+3    | CRC32 checksum (4 bytes)                       |
//! +----------+------------------------------------------------+
//! ```
//!
//! A commit appends one REDO entry per changed component followed by a
//! COMMIT entry, then syncs. After the commit is published the journal is
//! truncated, so at most one unfinished group sits behind the last commit.
//! An entry that fails to parse can only be the torn tail of a commit that
//! never completed, and reading stops there.

// entry_length fits in u32
#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::component::ComponentId;

/// `entry_length` (4) + `entry_type` (1) + `component_id` (4)
const ENTRY_HEADER_SIZE: usize = 9;

const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalEntryType {
    Redo = 0x01,
    Undo = 0x02,
    Commit = 0x03,
    Abort = 0x04,
}

impl TryFrom<u8> for JournalEntryType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Redo),
            0x02 => Ok(Self::Undo),
            0x03 => Ok(Self::Commit),
            0x04 => Ok(Self::Abort),
            _ => Err(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub kind: JournalEntryType,
    pub component: ComponentId,
    pub payload: Vec<u8>,
}

impl JournalEntry {
    #[must_use]
    pub const fn redo(component: ComponentId, payload: Vec<u8>) -> Self {
        Self {
            kind: JournalEntryType::Redo,
            component,
            payload,
        }
    }

    #[must_use]
    pub const fn commit() -> Self {
        Self {
            kind: JournalEntryType::Commit,
            component: ComponentId(0),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let total_len = ENTRY_HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE;
        let mut bytes = Vec::with_capacity(total_len);
        bytes.extend_from_slice(&(total_len as u32).to_le_bytes());
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&self.component.0.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Parse the entry at the start of `bytes`, returning it and its length.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), JournalError> {
        if bytes.len() < ENTRY_HEADER_SIZE + CHECKSUM_SIZE {
            return Err(JournalError::CorruptEntry);
        }
        let entry_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if entry_len < ENTRY_HEADER_SIZE + CHECKSUM_SIZE || entry_len > bytes.len() {
            return Err(JournalError::CorruptEntry);
        }

        let stored = u32::from_le_bytes([
            bytes[entry_len - 4],
            bytes[entry_len - 3],
            bytes[entry_len - 2],
            bytes[entry_len - 1],
        ]);
        let computed = crc32fast::hash(&bytes[..entry_len - CHECKSUM_SIZE]);
        if stored != computed {
            return Err(JournalError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let kind = JournalEntryType::try_from(bytes[4]).map_err(JournalError::InvalidEntryType)?;
        let component = ComponentId(u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]));
        let payload = bytes[ENTRY_HEADER_SIZE..entry_len - CHECKSUM_SIZE].to_vec();
        Ok((
            Self {
                kind,
                component,
                payload,
            },
            entry_len,
        ))
    }
}

/// Storage under a journal.
pub trait JournalFile: Read + Write + Seek + Send {
    /// Make completed writes durable.
    fn sync(&mut self) -> std::io::Result<()>;

    fn set_len(&mut self, len: u64) -> std::io::Result<()>;
}

impl JournalFile for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        File::set_len(self, len)
    }
}

impl JournalFile for Cursor<Vec<u8>> {
    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }
}

pub struct Journal {
    file: Box<dyn JournalFile>,
    /// Offset of the next append.
    end: u64,
}

impl Journal {
    /// Open or create a journal file.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        tracing::debug!("opened journal {}", path.display());
        Self::from_file(Box::new(file))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            file: Box::new(Cursor::new(Vec::new())),
            end: 0,
        }
    }

    pub fn from_file(mut file: Box<dyn JournalFile>) -> Result<Self, JournalError> {
        let end = file.seek(SeekFrom::End(0))?;
        Ok(Self { file, end })
    }

    #[must_use]
    pub const fn position(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == 0
    }

    pub fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        let bytes = entry.to_bytes();
        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&bytes)?;
        self.end += bytes.len() as u64;
        Ok(())
    }

    pub fn write_commit(&mut self) -> Result<(), JournalError> {
        self.append(&JournalEntry::commit())
    }

    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.file.flush()?;
        self.file.sync()?;
        Ok(())
    }

    /// Drop everything from `position` on.
    pub fn truncate(&mut self, position: u64) -> Result<(), JournalError> {
        self.file.set_len(position)?;
        self.end = position;
        Ok(())
    }

    /// Empty the journal durably.
    pub fn reset(&mut self) -> Result<(), JournalError> {
        self.truncate(0)?;
        self.sync()
    }

    /// Every intact entry from the start, stopping at the first bad one.
    pub fn entries(&mut self) -> Result<Vec<JournalEntry>, JournalError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            match JournalEntry::from_bytes(&bytes[offset..]) {
                Ok((entry, len)) => {
                    entries.push(entry);
                    offset += len;
                }
                Err(e) => {
                    tracing::warn!(
                        "journal tail at offset {} is unreadable ({}), ignoring {} bytes",
                        offset,
                        e,
                        bytes.len() - offset
                    );
                    break;
                }
            }
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("end", &self.end).finish_non_exhaustive()
    }
}

/// Errors that can occur during journal operations.
#[derive(Debug)]
pub enum JournalError {
    Io(std::io::Error),
    CorruptEntry,
    InvalidEntryType(u8),
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "journal I/O error: {e}"),
            Self::CorruptEntry => write!(f, "corrupt journal entry"),
            Self::InvalidEntryType(t) => write!(f, "invalid journal entry type: 0x{t:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "journal checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")
            }
        }
    }
}

impl std::error::Error for JournalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_round_trip() {
        let entry = JournalEntry::redo(ComponentId(7), vec![1, 2, 3]);
        let bytes = entry.to_bytes();
        assert_eq!(bytes.len(), ENTRY_HEADER_SIZE + 3 + CHECKSUM_SIZE);
        let (decoded, len) = JournalEntry::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, entry);
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn test_checksum_validation() {
        let mut bytes = JournalEntry::redo(ComponentId(1), vec![9; 8]).to_bytes();
        bytes[10] ^= 0x01;
        assert!(matches!(
            JournalEntry::from_bytes(&bytes),
            Err(JournalError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_entry_type_conversion() {
        assert_eq!(JournalEntryType::try_from(0x03), Ok(JournalEntryType::Commit));
        assert_eq!(JournalEntryType::try_from(0x09), Err(0x09));
    }

    #[test]
    fn test_append_and_read_back() {
        let mut journal = Journal::in_memory();
        assert!(journal.is_empty());
        journal.append(&JournalEntry::redo(ComponentId(1), b"one".to_vec())).expect("append");
        journal.append(&JournalEntry::redo(ComponentId(2), b"two".to_vec())).expect("append");
        journal.write_commit().expect("commit");
        journal.sync().expect("sync");

        let entries = journal.entries().expect("entries");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].component, ComponentId(2));
        assert_eq!(entries[2].kind, JournalEntryType::Commit);

        journal.reset().expect("reset");
        assert!(journal.is_empty());
        assert!(journal.entries().expect("entries").is_empty());
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let mut journal = Journal::in_memory();
        journal.append(&JournalEntry::redo(ComponentId(1), b"whole".to_vec())).expect("append");
        let intact = journal.position();
        journal.append(&JournalEntry::redo(ComponentId(1), b"partial".to_vec())).expect("append");
        journal.truncate(intact + 6).expect("tear");

        let entries = journal.entries().expect("entries");
        assert_eq!(entries, vec![JournalEntry::redo(ComponentId(1), b"whole".to_vec())]);
    }

    #[test]
    fn test_file_journal_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal");
        {
            let mut journal = Journal::open(&path).expect("open");
            journal.append(&JournalEntry::redo(ComponentId(4), vec![0xAB])).expect("append");
            journal.write_commit().expect("commit");
            journal.sync().expect("sync");
        }
        let mut journal = Journal::open(&path).expect("reopen");
        assert!(!journal.is_empty());
        let entries = journal.entries().expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, vec![0xAB]);
    }
}
