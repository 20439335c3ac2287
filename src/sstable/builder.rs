//! SSTable writer.
//!
//! Consumes a sorted iterator of entries and writes a complete SSTable
//! directory — `data`, `bloom`, `index` — atomically: everything is
//! built under a `.tmpdir` path and fsynced, then the directory itself
//! is renamed into place last, so a crash never leaves a partially
//! written table visible to the manifest.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crc32fast::Hasher as Crc32;

use crate::bloom::BloomBuilder;
use crate::config::StoreConfig;
use crate::encoding::{self, Encode};
use crate::entry::Entry;

use super::{data_header_size, DATA_MAGIC, DATA_VERSION, IndexEntry, SstableError, SstableMeta};

fn write_header(writer: &mut impl Write) -> Result<(), SstableError> {
    let mut header_bytes = Vec::new();
    DATA_MAGIC.encode_to(&mut header_bytes)?;
    DATA_VERSION.encode_to(&mut header_bytes)?;
    let mut hasher = Crc32::new();
    hasher.update(&header_bytes);
    let crc = hasher.finalize();
    writer.write_all(&header_bytes)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

fn write_entry(writer: &mut impl Write, entry: &Entry) -> Result<usize, SstableError> {
    let body = encoding::encode_to_vec(entry)?;
    let len = u32::try_from(body.len())
        .map_err(|_| SstableError::Internal("entry too large to encode".into()))?;
    let len_bytes = len.to_le_bytes();
    let mut hasher = Crc32::new();
    hasher.update(&len_bytes);
    hasher.update(&body);
    let crc = hasher.finalize();
    writer.write_all(&len_bytes)?;
    writer.write_all(&body)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(len_bytes.len() + body.len() + 4)
}

fn write_index_file(path: &Path, index_entries: &[IndexEntry]) -> Result<(), SstableError> {
    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;

        let mut block = Vec::new();
        let count = u32::try_from(index_entries.len())
            .map_err(|_| SstableError::Internal("too many index entries".into()))?;
        count.encode_to(&mut block)?;
        for entry in index_entries {
            entry.encode_to(&mut block)?;
        }
        let block_len = u32::try_from(block.len())
            .map_err(|_| SstableError::Internal("index block too large".into()))?;
        let mut hasher = Crc32::new();
        hasher.update(&block);
        let block_crc = hasher.finalize();
        writer.write_all(&block_len.to_le_bytes())?;
        writer.write_all(&block)?;
        writer.write_all(&block_crc.to_le_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Builds a complete SSTable directory from a sorted entry iterator.
pub struct SstWriter {
    dir: PathBuf,
    id: u64,
}

impl SstWriter {
    /// Targets `sstables_dir/sstable_<id>/`.
    pub fn new(sstables_dir: &Path, id: u64) -> Self {
        Self {
            dir: sstables_dir.join(SstableMeta::dirname_for(id)),
            id,
        }
    }

    /// Writes `entries` (must already be sorted and deduplicated by key,
    /// and `expected_count` must be its exact length) to disk, returning
    /// the resulting metadata.
    ///
    /// # Errors
    ///
    /// Returns [`SstableError::Internal`] if `entries` is empty — an
    /// empty SSTable has no `min_key`/`max_key` and is never useful.
    pub fn build(
        self,
        entries: impl Iterator<Item = Entry>,
        expected_count: usize,
        config: &StoreConfig,
    ) -> Result<SstableMeta, SstableError> {
        let tmp_dir = self.dir.with_extension("tmpdir");
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let (data_path, bloom_path, index_path) = super::SSTable::file_paths(&tmp_dir);

        let mut min_key: Option<Vec<u8>> = None;
        let mut max_key: Option<Vec<u8>> = None;
        let mut num_entries: u64 = 0;
        let mut max_timestamp: u64 = 0;
        let mut index_entries = Vec::new();
        let mut bloom = BloomBuilder::new(expected_count)?;

        {
            let file = File::create(&data_path)?;
            let mut writer = BufWriter::new(file);
            write_header(&mut writer)?;
            let mut offset = data_header_size() as u64;

            for entry in entries {
                if min_key.is_none() {
                    min_key = Some(entry.key.clone());
                }
                max_key = Some(entry.key.clone());
                max_timestamp = max_timestamp.max(entry.timestamp);
                bloom.set(&entry.key);

                if num_entries % config.sparse_index_interval as u64 == 0 {
                    index_entries.push(IndexEntry {
                        key: entry.key.clone(),
                        offset,
                    });
                }

                let frame_len = write_entry(&mut writer, &entry)?;
                offset += frame_len as u64;
                num_entries += 1;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        let (Some(min_key), Some(max_key)) = (min_key, max_key) else {
            fs::remove_dir_all(&tmp_dir)?;
            return Err(SstableError::Internal(
                "cannot build an SSTable from zero entries".into(),
            ));
        };

        bloom.write_to(&bloom_path)?;
        write_index_file(&index_path, &index_entries)?;

        let size_bytes = fs::metadata(&data_path)?.len();

        fs::rename(&tmp_dir, &self.dir)?;
        if let Some(parent) = self.dir.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }

        Ok(SstableMeta {
            id: self.id,
            dirname: SstableMeta::dirname_for(self.id),
            min_key,
            max_key,
            num_entries,
            size_bytes,
            max_timestamp,
        })
    }
}

/// Ensures the `sstables/` directory exists under the store's data
/// directory, returning its path.
pub fn ensure_sstables_dir(data_dir: &Path) -> Result<PathBuf, SstableError> {
    let dir = data_dir.join("sstables");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
