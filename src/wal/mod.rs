//! Write-ahead log.
//!
//! A durable, append-only record of mutations. Every successful
//! [`Store::put`](crate::store::Store::put) /
//! [`Store::delete`](crate::store::Store::delete) appends an [`Entry`]
//! here before it is visible in the memtable, and `append` does not
//! return until the record is fsynced.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! The record checksum covers `len || record_bytes`. A truncated tail
//! (the length prefix, payload, or checksum partially written) is
//! detected and replay stops there without error. A checksum mismatch
//! on a record that is not the last thing in the file means corruption
//! of already-durable data, and is fatal.


use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::entry::Entry;

const U32_SIZE: usize = std::mem::size_of::<u32>();
const WAL_MAGIC: [u8; 4] = *b"SKVW";
const WAL_VERSION: u32 = 1;
const DEFAULT_MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Checksum mismatch on a record that is not the truncated tail.
    #[error("checksum mismatch in WAL record at offset {offset}")]
    ChecksumMismatch {
        /// Byte offset of the corrupted record.
        offset: u64,
    },

    /// A record exceeds the configured maximum size.
    #[error("record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// The WAL header failed validation.
    #[error("invalid WAL header: {0}")]
    InvalidHeader(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal WAL error: {0}")]
    Internal(String),
}

struct WalHeader {
    magic: [u8; 4],
    version: u32,
    max_record_size: u32,
}

impl WalHeader {
    const ENCODED_SIZE: usize = 4 + 4 + 4;
    const DISK_SIZE: usize = Self::ENCODED_SIZE + U32_SIZE;
}

impl Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.max_record_size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for WalHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (max_record_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                max_record_size,
            },
            offset,
        ))
    }
}

fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

fn write_header(writer: &mut impl Write, header: &WalHeader) -> Result<(), WalError> {
    let bytes = encoding::encode_to_vec(header)?;
    let checksum = compute_crc(&[&bytes]);
    writer.write_all(&bytes)?;
    writer.write_all(&checksum.to_le_bytes())?;
    Ok(())
}

fn read_and_validate_header(reader: &mut impl Read) -> Result<WalHeader, WalError> {
    let mut header_bytes = vec![0u8; WalHeader::ENCODED_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let mut checksum_bytes = [0u8; U32_SIZE];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    if compute_crc(&[&header_bytes]) != stored {
        return Err(WalError::InvalidHeader("header checksum mismatch".into()));
    }
    let (header, _) = encoding::decode_from_slice::<WalHeader>(&header_bytes)?;
    if header.magic != WAL_MAGIC {
        return Err(WalError::InvalidHeader("bad magic".into()));
    }
    if header.version != WAL_VERSION {
        return Err(WalError::InvalidHeader(format!(
            "unsupported version {}",
            header.version
        )));
    }
    Ok(header)
}

/// A single, non-rotating, durable log of [`Entry`] mutations.
pub struct Wal {
    file: Mutex<File>,
    path: PathBuf,
    max_record_size: u32,
}

impl Wal {
    /// Opens (creating if necessary) the WAL file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, max_record_size: Option<u32>) -> Result<Self, WalError> {
        let path_ref = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        let max_record_size = if file.metadata()?.len() == 0 {
            let max_record_size = max_record_size.unwrap_or(DEFAULT_MAX_RECORD_SIZE);
            let header = WalHeader {
                magic: WAL_MAGIC,
                version: WAL_VERSION,
                max_record_size,
            };
            write_header(&mut file, &header)?;
            file.sync_all()?;
            info!(path = %path_ref.display(), "WAL created");
            max_record_size
        } else {
            file.seek(SeekFrom::Start(0))?;
            let header = read_and_validate_header(&mut file)?;
            debug!(path = %path_ref.display(), "WAL header validated");
            header.max_record_size
        };

        Ok(Self {
            file: Mutex::new(file),
            path: path_ref.to_path_buf(),
            max_record_size,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, File>, WalError> {
        self.file
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))
    }

    /// Appends a single entry, fsyncing before returning.
    pub fn append(&self, record: &Entry) -> Result<(), WalError> {
        let record_bytes = encoding::encode_to_vec(record)?;
        let mut guard = self.lock()?;
        self.append_raw(&mut guard, &record_bytes)?;
        guard.sync_all()?;
        Ok(())
    }

    /// Appends a batch of entries with a single trailing fsync.
    pub fn append_batch(&self, records: &[Entry]) -> Result<(), WalError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock()?;
        for record in records {
            let bytes = encoding::encode_to_vec(record)?;
            self.append_raw(&mut guard, &bytes)?;
        }
        guard.sync_all()?;
        Ok(())
    }

    fn append_raw(&self, file: &mut File, record_bytes: &[u8]) -> Result<(), WalError> {
        let record_len = u32::try_from(record_bytes.len())
            .map_err(|_| WalError::RecordTooLarge(record_bytes.len()))?;
        if record_len > self.max_record_size {
            return Err(WalError::RecordTooLarge(record_bytes.len()));
        }
        let len_bytes = record_len.to_le_bytes();
        let checksum = compute_crc(&[&len_bytes, record_bytes]);
        file.write_all(&len_bytes)?;
        file.write_all(record_bytes)?;
        file.write_all(&checksum.to_le_bytes())?;
        trace!(len = record_len, "WAL record appended");
        Ok(())
    }

    /// Replays the WAL, returning every valid record in order.
    ///
    /// Stops cleanly at a truncated tail. A checksum mismatch on a
    /// record that is not the last readable bytes in the file is
    /// reported as [`WalError::ChecksumMismatch`].
    pub fn read_all(&self) -> Result<Vec<Entry>, WalError> {
        let mut guard = self.lock()?;
        guard.seek(SeekFrom::Start(WalHeader::DISK_SIZE as u64))?;
        let file_len = guard.metadata()?.len();

        let mut records = Vec::new();
        loop {
            let record_offset = guard.stream_position()?;
            let mut len_bytes = [0u8; U32_SIZE];
            match guard.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(WalError::Io(e)),
            }
            let record_len = u32::from_le_bytes(len_bytes);
            if u64::from(record_len) > u64::from(self.max_record_size) {
                warn!(offset = record_offset, "oversized WAL record length, treating as torn write");
                break;
            }
            let record_len = record_len as usize;

            let mut record_bytes = vec![0u8; record_len];
            if let Err(e) = guard.read_exact(&mut record_bytes) {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    warn!(offset = record_offset, "WAL truncated mid-payload");
                    break;
                }
                return Err(WalError::Io(e));
            }

            let mut checksum_bytes = [0u8; U32_SIZE];
            if let Err(e) = guard.read_exact(&mut checksum_bytes) {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    warn!(offset = record_offset, "WAL truncated mid-checksum");
                    break;
                }
                return Err(WalError::Io(e));
            }
            let stored_checksum = u32::from_le_bytes(checksum_bytes);
            let end_offset = guard.stream_position()?;

            if compute_crc(&[&len_bytes, &record_bytes]) != stored_checksum {
                if end_offset >= file_len {
                    warn!(offset = record_offset, "WAL tail checksum mismatch, treated as torn write");
                    break;
                }
                return Err(WalError::ChecksumMismatch {
                    offset: record_offset,
                });
            }

            let (record, _) = encoding::decode_from_slice::<Entry>(&record_bytes)?;
            records.push(record);
        }

        debug!(path = %self.path.display(), count = records.len(), "WAL replay complete");
        Ok(records)
    }

    /// Atomically rewrites the WAL to contain only records satisfying
    /// `keep`. Writes a sibling `.tmp` file, fsyncs it, then renames it
    /// over the WAL in place.
    pub fn replace_with_filtered(&self, keep: impl Fn(&Entry) -> bool) -> Result<(), WalError> {
        let mut guard = self.lock()?;
        guard.seek(SeekFrom::Start(WalHeader::DISK_SIZE as u64))?;
        let file_len = guard.metadata()?.len();

        let mut surviving: Vec<Entry> = Vec::new();
        loop {
            let record_offset = guard.stream_position()?;
            let mut len_bytes = [0u8; U32_SIZE];
            match guard.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(WalError::Io(e)),
            }
            let record_len = u32::from_le_bytes(len_bytes) as usize;
            let mut record_bytes = vec![0u8; record_len];
            if guard.read_exact(&mut record_bytes).is_err() {
                break;
            }
            let mut checksum_bytes = [0u8; U32_SIZE];
            if guard.read_exact(&mut checksum_bytes).is_err() {
                break;
            }
            let stored_checksum = u32::from_le_bytes(checksum_bytes);
            let end_offset = guard.stream_position()?;
            if compute_crc(&[&len_bytes, &record_bytes]) != stored_checksum {
                if end_offset >= file_len {
                    break;
                }
                return Err(WalError::ChecksumMismatch {
                    offset: record_offset,
                });
            }
            let (record, _) = encoding::decode_from_slice::<Entry>(&record_bytes)?;
            if keep(&record) {
                surviving.push(record);
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let header = WalHeader {
                magic: WAL_MAGIC,
                version: WAL_VERSION,
                max_record_size: self.max_record_size,
            };
            write_header(&mut tmp, &header)?;
            for record in &surviving {
                let bytes = encoding::encode_to_vec(record)?;
                self.append_raw(&mut tmp, &bytes)?;
            }
            tmp.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            if let Ok(dir_file) = File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }

        // `append` relies on O_APPEND semantics from the current offset;
        // re-open against the freshly renamed inode rather than trust
        // the stale handle's position.
        let mut new_file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        new_file.seek(SeekFrom::End(0))?;
        *guard = new_file;

        info!(path = %self.path.display(), kept = surviving.len(), "WAL rewritten");
        Ok(())
    }

    /// Truncates the WAL down to just the header.
    pub fn clear(&self) -> Result<(), WalError> {
        let mut guard = self.lock()?;
        guard.set_len(0)?;
        guard.seek(SeekFrom::Start(0))?;
        let header = WalHeader {
            magic: WAL_MAGIC,
            version: WAL_VERSION,
            max_record_size: self.max_record_size,
        };
        write_header(&mut *guard, &header)?;
        guard.sync_all()?;
        info!(path = %self.path.display(), "WAL cleared");
        Ok(())
    }

    /// Path of the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk file size in bytes.
    pub fn file_size(&self) -> Result<u64, WalError> {
        Ok(self.lock()?.metadata()?.len())
    }
}
