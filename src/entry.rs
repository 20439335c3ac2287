//! The unit of stored mutation.
//!
//! An [`Entry`] is the single record type threaded through every layer of
//! the engine: it is what the WAL persists, what the memtable holds per
//! key, and what an SSTable data block stores. Keeping one type end to end
//! (rather than a WAL record, a memtable record, and an SSTable cell that
//! all say the same thing differently) means flush and compaction never
//! need a translation step.

use crate::encoding::{Decode, Encode, EncodingError};

/// Maximum permitted key length, in bytes.
pub const MAX_KEY_SIZE: usize = 1024;

/// Maximum permitted value length, in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// A single versioned mutation: a put or a tombstone for one key.
///
/// `timestamp` is not a wall-clock reading — it is the strictly
/// monotonic sequence number the store assigns to every successful
/// mutation, used both for WAL ordering and for resolving which version
/// of a key is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Non-empty key, at most [`MAX_KEY_SIZE`] bytes.
    pub key: Vec<u8>,
    /// Stored value. `None` iff `deleted` is `true`.
    pub value: Option<Vec<u8>>,
    /// Strictly monotonic sequence number assigned by the store.
    pub timestamp: u64,
    /// Tombstone flag.
    pub deleted: bool,
}

impl Entry {
    /// Builds a live (non-tombstone) entry.
    pub fn put(key: Vec<u8>, value: Vec<u8>, timestamp: u64) -> Self {
        Self {
            key,
            value: Some(value),
            timestamp,
            deleted: false,
        }
    }

    /// Builds a tombstone entry.
    pub fn tombstone(key: Vec<u8>, timestamp: u64) -> Self {
        Self {
            key,
            value: None,
            timestamp,
            deleted: true,
        }
    }

    /// Approximate heap footprint, used for memtable size accounting.
    pub fn approximate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }
}

impl Encode for Entry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        self.deleted.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Entry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = Option::<Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (timestamp, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (deleted, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Entry {
                key,
                value,
                timestamp,
                deleted,
            },
            offset,
        ))
    }
}
