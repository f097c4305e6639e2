//! Fixed-length records
//!
//! A record is `key ++ value`, with both lengths fixed per index. Records
//! order by unsigned lexicographic comparison of the key only, so two records
//! with the same key and different values are equal as far as an index is
//! concerned. That is what makes `insert` an overwrite for an existing key.

use crate::error::{Result, VaultError};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Immutable fixed-length record. Cloning shares the underlying bytes.
#[derive(Clone)]
pub struct Record {
    bytes: Arc<[u8]>,
    key_len: usize,
}

impl Record {
    /// Key portion
    pub fn key(&self) -> &[u8] {
        &self.bytes[..self.key_len]
    }

    /// Value portion (empty for key-only records)
    pub fn value(&self) -> &[u8] {
        &self.bytes[self.key_len..]
    }

    /// Whole record, key then value
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn has_value(&self) -> bool {
        self.bytes.len() > self.key_len
    }

    /// Key-only copy of this record (what internal nodes store).
    pub fn key_record(&self) -> Record {
        if !self.has_value() {
            return self.clone();
        }
        Record {
            bytes: Arc::from(self.key()),
            key_len: self.key_len,
        }
    }

    /// Compare keys only.
    pub fn compare(a: &Record, b: &Record) -> Ordering {
        a.key().cmp(b.key())
    }

    /// Compare keys and values. Used by tests that check values round-trip.
    pub fn same_bytes(&self, other: &Record) -> bool {
        self.bytes == other.bytes
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Record {}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        Record::compare(self, other)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for b in self.key() {
            write!(f, "{:02x}", b)?;
        }
        if self.has_value() {
            write!(f, ":")?;
            for b in self.value() {
                write!(f, "{:02x}", b)?;
            }
        }
        write!(f, "]")
    }
}

/// Builds records of one fixed shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFactory {
    key_len: usize,
    value_len: usize,
}

impl RecordFactory {
    pub fn new(key_len: usize, value_len: usize) -> Self {
        RecordFactory { key_len, value_len }
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    pub fn value_len(&self) -> usize {
        self.value_len
    }

    /// Full record length, key plus value.
    pub fn record_len(&self) -> usize {
        self.key_len + self.value_len
    }

    pub fn has_value(&self) -> bool {
        self.value_len > 0
    }

    /// Build a record from its full serialized bytes.
    pub fn create(&self, bytes: &[u8]) -> Result<Record> {
        if bytes.len() != self.record_len() {
            return Err(VaultError::InvalidRecordLength {
                expected: self.record_len(),
                actual: bytes.len(),
            });
        }
        Ok(Record {
            bytes: Arc::from(bytes),
            key_len: self.key_len,
        })
    }

    /// Build a record from a key and a value.
    pub fn create_kv(&self, key: &[u8], value: &[u8]) -> Result<Record> {
        if key.len() != self.key_len {
            return Err(VaultError::InvalidRecordLength {
                expected: self.key_len,
                actual: key.len(),
            });
        }
        if value.len() != self.value_len {
            return Err(VaultError::InvalidRecordLength {
                expected: self.value_len,
                actual: value.len(),
            });
        }
        let mut bytes = Vec::with_capacity(self.record_len());
        bytes.extend_from_slice(key);
        bytes.extend_from_slice(value);
        Ok(Record {
            bytes: Arc::from(bytes),
            key_len: self.key_len,
        })
    }

    /// Key-only record, used for lookups, range bounds and node separators.
    pub fn create_key(&self, key: &[u8]) -> Result<Record> {
        if key.len() != self.key_len {
            return Err(VaultError::InvalidRecordLength {
                expected: self.key_len,
                actual: key.len(),
            });
        }
        Ok(Record {
            bytes: Arc::from(key),
            key_len: self.key_len,
        })
    }

    /// Check that a record has this factory's shape. Key-only records pass.
    pub fn accepts(&self, record: &Record) -> Result<()> {
        if record.key_len != self.key_len
            || (record.len() != self.key_len && record.len() != self.record_len())
        {
            return Err(VaultError::InvalidRecordLength {
                expected: self.record_len(),
                actual: record.len(),
            });
        }
        Ok(())
    }
}
