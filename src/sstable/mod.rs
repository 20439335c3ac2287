//! Sorted String Table (SSTable) module.
//!
//! An SSTable is an immutable, sorted-by-key sequence of entries living
//! in its own directory:
//!
//! ```text
//! sstable_<id>/
//!   data      framed sorted entries, mmap-read
//!   bloom     bloom filter sidecar over the keys
//!   index     sparse index: every Bth key -> its data-file offset
//! ```
//!
//! Once all three files are written and fsynced, the directory is
//! handed to the manifest for atomic installation; until then it does
//! not exist from the store's point of view.
//!
//! # Data file layout
//!
//! ```text
//! [HEADER][HEADER_CRC32_LE]
//! [ENTRY_LEN_LE][ENTRY_BYTES][ENTRY_CRC32_LE]
//! [ENTRY_LEN_LE][ENTRY_BYTES][ENTRY_CRC32_LE]
//! ...
//! ```
//!
//! Entries are written in strictly increasing key order, so a point
//! lookup that lands on the right block via the sparse index only needs
//! to scan forward until the key is found or exceeded.

pub mod builder;

#[cfg(test)]
mod tests;

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{trace, warn};

use crate::bloom::{BloomError, BloomSidecar};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::entry::Entry;

pub use builder::SstWriter;

const U32_SIZE: usize = std::mem::size_of::<u32>();
const DATA_MAGIC: [u8; 4] = *b"SKVD";
const DATA_VERSION: u32 = 1;

/// Errors from building or reading an SSTable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SstableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Bloom sidecar error.
    #[error("bloom sidecar error: {0}")]
    Bloom(#[from] BloomError),

    /// Checksum mismatch in the data or index file.
    #[error("checksum mismatch in SSTable at {0}")]
    ChecksumMismatch(PathBuf),

    /// The data or index header failed validation.
    #[error("invalid SSTable header: {0}")]
    InvalidHeader(String),

    /// Internal invariant violation.
    #[error("internal SSTable error: {0}")]
    Internal(String),
}

/// Durable metadata describing one SSTable, as recorded in its level's
/// manifest.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SstableMeta {
    /// Monotonically assigned identifier; also the `sstable_<id>` dirname suffix.
    pub id: u64,
    /// Directory name under `sstables/`.
    pub dirname: String,
    /// Smallest key in the table.
    pub min_key: Vec<u8>,
    /// Largest key in the table.
    pub max_key: Vec<u8>,
    /// Number of entries (including tombstones).
    pub num_entries: u64,
    /// Size in bytes of the data file.
    pub size_bytes: u64,
    /// Largest timestamp among this table's entries. Lets a store
    /// recover its next timestamp from SSTables alone after a clean
    /// close empties the WAL.
    pub max_timestamp: u64,
}

impl Encode for SstableMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.dirname.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.num_entries.encode_to(buf)?;
        self.size_bytes.encode_to(buf)?;
        self.max_timestamp.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SstableMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (dirname, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (num_entries, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (size_bytes, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (max_timestamp, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                dirname,
                min_key,
                max_key,
                num_entries,
                size_bytes,
                max_timestamp,
            },
            offset,
        ))
    }
}

impl SstableMeta {
    /// Canonical directory name for SSTable `id`.
    pub fn dirname_for(id: u64) -> String {
        format!("sstable_{id}")
    }
}

/// A single entry in the sparse index: a key and the byte offset in the
/// data file at which its frame begins.
struct IndexEntry {
    key: Vec<u8>,
    offset: u64,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (data_offset, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                key,
                offset: data_offset,
            },
            offset,
        ))
    }
}

fn data_header_size() -> usize {
    4 + 4 + U32_SIZE // magic + version + crc
}

/// An immutable, mmap-backed SSTable reader.
pub struct SSTable {
    meta: SstableMeta,
    mmap: Mmap,
    index: Vec<IndexEntry>,
    bloom: BloomSidecar,
    dir: PathBuf,
}

impl SSTable {
    /// Paths to the three sidecar files for a given SSTable directory.
    pub fn file_paths(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
        (dir.join("data"), dir.join("bloom"), dir.join("index"))
    }

    /// Returns `true` if `dir` contains all three sidecar files.
    pub fn exists(dir: &Path) -> bool {
        let (data, bloom, index) = Self::file_paths(dir);
        data.exists() && bloom.exists() && index.exists()
    }

    /// Opens an SSTable directory, mmaps the data file, and loads the
    /// bloom and sparse index sidecars into memory.
    pub fn open(dir: PathBuf, meta: SstableMeta) -> Result<Self, SstableError> {
        let (data_path, bloom_path, index_path) = Self::file_paths(&dir);

        let data_file = fs::File::open(&data_path)?;
        // SAFETY: the data file is never mutated after its writer fsyncs and
        // renames it into place; this handle only ever observes that
        // immutable content.
        let mmap = unsafe { Mmap::map(&data_file)? };
        validate_header(&mmap, &data_path)?;

        let index_bytes = fs::read(&index_path)?;
        let index = read_index(&index_bytes, &index_path)?;

        let bloom = BloomSidecar::read_from(&bloom_path)?;

        Ok(Self {
            meta,
            mmap,
            index,
            bloom,
            dir,
        })
    }

    /// Metadata recorded for this table.
    pub fn meta(&self) -> &SstableMeta {
        &self.meta
    }

    /// Removes the SSTable's directory and all three files within it.
    pub fn delete(dir: &Path) -> Result<(), SstableError> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Looks up `key`. Returns `None` if this table has no information
    /// about the key; `Some(entry)` otherwise (the entry may be a
    /// tombstone).
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>, SstableError> {
        if key < self.meta.min_key.as_slice() || key > self.meta.max_key.as_slice() {
            return Ok(None);
        }
        if !self.bloom.may_contain(key) {
            trace!(dirname = %self.meta.dirname, "bloom negative");
            return Ok(None);
        }
        let Some(start_offset) = self.floor_offset(key) else {
            return Ok(None);
        };

        let mut cursor = start_offset as usize;
        while cursor < self.mmap.len() {
            let (entry, next_cursor) = self.read_entry_at(cursor)?;
            match entry.key.as_slice().cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Less => cursor = next_cursor,
            }
        }
        Ok(None)
    }

    /// Streams every entry in key order.
    pub fn read_all(&self) -> Result<Vec<Entry>, SstableError> {
        let mut entries = Vec::with_capacity(self.meta.num_entries as usize);
        let mut cursor = data_header_size();
        while cursor < self.mmap.len() {
            let (entry, next_cursor) = self.read_entry_at(cursor)?;
            entries.push(entry);
            cursor = next_cursor;
        }
        Ok(entries)
    }

    /// Directory this table lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Finds the largest indexed key `<= key`, returning its data offset.
    fn floor_offset(&self, key: &[u8]) -> Option<u64> {
        if self.index.is_empty() {
            return Some(data_header_size() as u64);
        }
        match self
            .index
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
        {
            Ok(i) => Some(self.index[i].offset),
            Err(0) => Some(data_header_size() as u64),
            Err(i) => Some(self.index[i - 1].offset),
        }
    }

    fn read_entry_at(&self, offset: usize) -> Result<(Entry, usize), SstableError> {
        let buf = &self.mmap[..];
        if offset + U32_SIZE > buf.len() {
            return Err(SstableError::Internal("entry frame out of range".into()));
        }
        let len = u32::from_le_bytes(
            buf[offset..offset + U32_SIZE]
                .try_into()
                .map_err(|_| SstableError::Internal("short entry length prefix".into()))?,
        ) as usize;
        let body_start = offset + U32_SIZE;
        let body_end = body_start + len;
        let crc_end = body_end + U32_SIZE;
        if crc_end > buf.len() {
            return Err(SstableError::Internal("entry frame out of range".into()));
        }
        let body = &buf[body_start..body_end];
        let stored_crc = u32::from_le_bytes(
            buf[body_end..crc_end]
                .try_into()
                .map_err(|_| SstableError::Internal("short entry checksum".into()))?,
        );
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[offset..body_start]);
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(SstableError::ChecksumMismatch(self.dir.clone()));
        }
        let (entry, _) = encoding::decode_from_slice::<Entry>(body)?;
        Ok((entry, crc_end))
    }
}

fn validate_header(mmap: &Mmap, path: &Path) -> Result<(), SstableError> {
    let header_size = data_header_size();
    if mmap.len() < header_size {
        return Err(SstableError::InvalidHeader(format!(
            "{} too small for a header",
            path.display()
        )));
    }
    let header_bytes = &mmap[..header_size - U32_SIZE];
    let stored_crc = u32::from_le_bytes(
        mmap[header_size - U32_SIZE..header_size]
            .try_into()
            .map_err(|_| SstableError::InvalidHeader("short header checksum".into()))?,
    );
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_bytes);
    if hasher.finalize() != stored_crc {
        return Err(SstableError::ChecksumMismatch(path.to_path_buf()));
    }
    let (magic, _) = <[u8; 4]>::decode_from(header_bytes)?;
    let (version, _) = u32::decode_from(&header_bytes[4..])?;
    if magic != DATA_MAGIC {
        return Err(SstableError::InvalidHeader("bad magic".into()));
    }
    if version != DATA_VERSION {
        return Err(SstableError::InvalidHeader(format!(
            "unsupported data file version {version}"
        )));
    }
    Ok(())
}

fn read_index(bytes: &[u8], path: &Path) -> Result<Vec<IndexEntry>, SstableError> {
    let header_size = data_header_size();
    if bytes.len() < header_size {
        return Err(SstableError::InvalidHeader(format!(
            "{} too small for a header",
            path.display()
        )));
    }
    let header_bytes = &bytes[..header_size - U32_SIZE];
    let stored_crc = u32::from_le_bytes(
        bytes[header_size - U32_SIZE..header_size]
            .try_into()
            .map_err(|_| SstableError::InvalidHeader("short header checksum".into()))?,
    );
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_bytes);
    if hasher.finalize() != stored_crc {
        return Err(SstableError::ChecksumMismatch(path.to_path_buf()));
    }

    let body = &bytes[header_size..];
    if body.len() < U32_SIZE {
        warn!(path = %path.display(), "index file missing entry block");
        return Ok(Vec::new());
    }
    let block_len = u32::from_le_bytes(body[..U32_SIZE].try_into().unwrap()) as usize;
    let block_start = U32_SIZE;
    let block_end = block_start + block_len;
    let crc_end = block_end + U32_SIZE;
    if crc_end > body.len() {
        return Err(SstableError::Internal("index block out of range".into()));
    }
    let block_data = &body[block_start..block_end];
    let stored_block_crc = u32::from_le_bytes(body[block_end..crc_end].try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(block_data);
    if hasher.finalize() != stored_block_crc {
        return Err(SstableError::ChecksumMismatch(path.to_path_buf()));
    }

    let (count, mut offset) = u32::decode_from(block_data)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (entry, n) = IndexEntry::decode_from(&block_data[offset..])?;
        offset += n;
        entries.push(entry);
    }
    Ok(entries)
}
