//! Fixed-width records.
//!
//! A record is a key of `key_len` bytes followed by a value of `value_len`
//! bytes. Every record in one index has the same widths; the
//! [`RecordFactory`] enforces them.
//!
//! # Invariants
//!
//! - Ordering considers key bytes only, compared as unsigned bytes
//!   lexicographically
//! - Two records are equal (`==`) only when both key and value bytes match

use std::cmp::Ordering;

/// Error returned when a record does not match the index's widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    KeyLength { expected: usize, actual: usize },
    ValueLength { expected: usize, actual: usize },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyLength { expected, actual } => {
                write!(f, "key length mismatch: expected {expected} bytes, got {actual}")
            }
            Self::ValueLength { expected, actual } => {
                write!(f, "value length mismatch: expected {expected} bytes, got {actual}")
            }
        }
    }
}

impl std::error::Error for RecordError {}

/// A key plus an optional value, stored in leaf pages.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Record {
    key: Box<[u8]>,
    value: Box<[u8]>,
}

impl Record {
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value bytes, or `None` for key-only records.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        if self.value.is_empty() { None } else { Some(&self.value) }
    }

    /// Compare by key only.
    #[must_use]
    pub fn key_cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }

    /// Compare this record's key with a bare key.
    #[must_use]
    pub fn cmp_key(&self, key: &[u8]) -> Ordering {
        self.key.as_ref().cmp(key)
    }

    #[must_use]
    pub fn key_eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Record[{}", hex(&self.key))?;
        if !self.value.is_empty() {
            write!(f, " = {}", hex(&self.value))?;
        }
        write!(f, "]")
    }
}

/// Render bytes as lowercase hex.
#[must_use]
pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Builds and encodes records of one fixed shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFactory {
    key_len: usize,
    value_len: usize,
}

impl RecordFactory {
    #[must_use]
    pub const fn new(key_len: usize, value_len: usize) -> Self {
        Self { key_len, value_len }
    }

    #[must_use]
    pub const fn key_len(&self) -> usize {
        self.key_len
    }

    #[must_use]
    pub const fn value_len(&self) -> usize {
        self.value_len
    }

    /// Encoded size of one record.
    #[must_use]
    pub const fn record_len(&self) -> usize {
        self.key_len + self.value_len
    }

    #[must_use]
    pub const fn has_value(&self) -> bool {
        self.value_len > 0
    }

    /// Create a record, checking both widths.
    pub fn create(&self, key: &[u8], value: &[u8]) -> Result<Record, RecordError> {
        self.check_key(key)?;
        if value.len() != self.value_len {
            return Err(RecordError::ValueLength {
                expected: self.value_len,
                actual: value.len(),
            });
        }
        Ok(Record {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Create a key-only record. Only valid when `value_len` is zero.
    pub fn key_only(&self, key: &[u8]) -> Result<Record, RecordError> {
        self.create(key, &[])
    }

    pub fn check_key(&self, key: &[u8]) -> Result<(), RecordError> {
        if key.len() == self.key_len {
            Ok(())
        } else {
            Err(RecordError::KeyLength {
                expected: self.key_len,
                actual: key.len(),
            })
        }
    }

    /// Check a record built elsewhere against this shape.
    pub fn check(&self, record: &Record) -> Result<(), RecordError> {
        self.check_key(&record.key)?;
        if record.value.len() == self.value_len {
            Ok(())
        } else {
            Err(RecordError::ValueLength {
                expected: self.value_len,
                actual: record.value.len(),
            })
        }
    }

    /// Write `record` into `buf`, which must be exactly `record_len()` bytes.
    pub fn encode_into(&self, record: &Record, buf: &mut [u8]) {
        buf[..self.key_len].copy_from_slice(&record.key);
        buf[self.key_len..self.record_len()].copy_from_slice(&record.value);
    }

    /// Read a record from the first `record_len()` bytes of `bytes`.
    #[must_use]
    pub fn decode(&self, bytes: &[u8]) -> Record {
        Record {
            key: bytes[..self.key_len].into(),
            value: bytes[self.key_len..self.record_len()].into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_checks_widths() {
        let factory = RecordFactory::new(4, 2);
        assert!(factory.create(&[1, 2, 3, 4], &[9, 9]).is_ok());
        assert_eq!(
            factory.create(&[1, 2, 3], &[9, 9]),
            Err(RecordError::KeyLength { expected: 4, actual: 3 })
        );
        assert_eq!(
            factory.create(&[1, 2, 3, 4], &[9]),
            Err(RecordError::ValueLength { expected: 2, actual: 1 })
        );
        assert!(factory.key_only(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_ordering_is_unsigned_and_key_only() {
        let factory = RecordFactory::new(2, 1);
        let low = factory.create(&[0x01, 0xFF], &[7]).expect("record");
        let high = factory.create(&[0x80, 0x00], &[1]).expect("record");
        assert_eq!(low.key_cmp(&high), Ordering::Less);

        let same_key = factory.create(&[0x01, 0xFF], &[8]).expect("record");
        assert_eq!(low.key_cmp(&same_key), Ordering::Equal);
        assert!(low.key_eq(&same_key));
        assert_ne!(low, same_key);
    }

    #[test]
    fn test_encode_decode() {
        let factory = RecordFactory::new(3, 2);
        let record = factory.create(&[1, 2, 3], &[4, 5]).expect("record");
        let mut buf = [0u8; 5];
        factory.encode_into(&record, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5]);
        assert_eq!(factory.decode(&buf), record);
    }

    #[test]
    fn test_key_only_value_is_none() {
        let factory = RecordFactory::new(2, 0);
        let record = factory.key_only(&[0, 1]).expect("record");
        assert_eq!(record.value(), None);
        assert_eq!(format!("{record:?}"), "Record[0001]");
    }
}
