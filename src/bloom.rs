//! Bloom filter sidecar.
//!
//! Every SSTable is paired with a `bloom` file: a serialized
//! probabilistic membership filter over its keys, used to skip a data
//! file scan when a key is definitely absent.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::Path,
};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use thiserror::Error;

/// Target false-positive rate for SSTable bloom filters.
pub const FALSE_POSITIVE_RATE: f64 = 0.01;

/// Errors from building, writing, or reading a bloom filter sidecar.
#[derive(Debug, Error)]
pub enum BloomError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Sidecar checksum did not match its contents.
    #[error("bloom sidecar checksum mismatch")]
    ChecksumMismatch,

    /// The `bloomfilter` crate rejected the requested parameters or bytes.
    #[error("bloom filter error: {0}")]
    Internal(String),
}

/// Builds a bloom filter over a known key count, then serializes it to a
/// sidecar file.
pub struct BloomBuilder {
    filter: Bloom<Vec<u8>>,
}

impl BloomBuilder {
    /// Creates a filter sized for `expected_keys` at [`FALSE_POSITIVE_RATE`].
    pub fn new(expected_keys: usize) -> Result<Self, BloomError> {
        let filter = Bloom::new_for_fp_rate(expected_keys.max(1), FALSE_POSITIVE_RATE)
            .map_err(|e| BloomError::Internal(e.to_string()))?;
        Ok(Self { filter })
    }

    /// Inserts a key.
    pub fn set(&mut self, key: &[u8]) {
        self.filter.set(&key.to_vec());
    }

    /// Writes the filter to `path` as `[len_le][bytes][crc32_le]`.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), BloomError> {
        let bytes = self.filter.as_slice().to_vec();
        let tmp_path = path.as_ref().with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            write_framed(&mut file, &bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path.as_ref())?;
        Ok(())
    }
}

fn write_framed(writer: &mut impl Write, data: &[u8]) -> Result<(), BloomError> {
    let len = u32::try_from(data.len())
        .map_err(|_| BloomError::Internal("bloom filter too large to encode".into()))?;
    let mut hasher = Crc32::new();
    hasher.update(data);
    let checksum = hasher.finalize();
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&checksum.to_le_bytes())?;
    Ok(())
}

/// A loaded, read-only bloom filter sidecar.
pub struct BloomSidecar {
    filter: Bloom<Vec<u8>>,
}

impl BloomSidecar {
    /// Reads and verifies a sidecar file written by [`BloomBuilder::write_to`].
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, BloomError> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.len() < 8 {
            return Err(BloomError::Internal("bloom sidecar truncated".into()));
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len + 4 {
            return Err(BloomError::Internal("bloom sidecar truncated".into()));
        }
        let data = &buf[4..4 + len];
        let stored_checksum =
            u32::from_le_bytes([buf[4 + len], buf[4 + len + 1], buf[4 + len + 2], buf[4 + len + 3]]);
        let mut hasher = Crc32::new();
        hasher.update(data);
        if hasher.finalize() != stored_checksum {
            return Err(BloomError::ChecksumMismatch);
        }

        let filter = Bloom::from_slice(data).map_err(|e| BloomError::Internal(e.to_string()))?;
        Ok(Self { filter })
    }

    /// Returns `true` if `key` might be present, `false` if it definitely is
    /// not.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.filter.check(&key.to_vec())
    }
}
