//! The public entry point: a single persistent, ordered key-value store
//! coordinating the WAL, the memtable pipeline, and the leveled SSTable
//! manager behind one facade.
//!
//! `put`/`delete` go through a single write mutex so that WAL order and
//! memtable insertion order always agree; reads consult the memtable
//! manager first (including tombstones) and fall through to the SSTable
//! manager on a miss. Flushing a memtable (manually or via rotation) is
//! wired through a callback so the memtable manager never has to know
//! about SSTables or the WAL directly.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

use crate::compaction::{CompactionError, CompactionStats, LevelStats, SstableManager};
use crate::config::StoreConfig;
use crate::entry::Entry;
use crate::memtable::{
    FlushCallback, ImmutableMemtable, Memtable, MemtableError, MemtableGetResult, MemtableManager,
};
use crate::wal::{Wal, WalError};

/// Errors surfaced by the store facade.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bad key/value: empty key, or a key/value exceeding its configured
    /// size bound.
    #[error("validation error: {0}")]
    Validation(String),

    /// The store has been closed; no further mutations or reads are
    /// accepted.
    #[error("store is closed")]
    Closed,

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A manifest or SSTable pointed to data that does not exist, with
    /// no orphan-sweep explanation. Fatal on open.
    #[error("data corruption: {0}")]
    Corruption(String),

    /// A manual flush was requested but the active memtable is empty.
    #[error("cannot flush an empty memtable")]
    EmptyMemtable,

    /// Error from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error from the memtable pipeline.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error from the SSTable / compaction subsystem.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Internal invariant violation or poisoned lock.
    #[error("internal store error: {0}")]
    Internal(String),
}

/// Result of a successful manual [`Store::flush`].
#[derive(Debug, Clone)]
pub struct FlushMetadata {
    /// Number of distinct keys written to the new SSTable.
    pub entries_flushed: usize,
}

/// Snapshot of store-wide statistics returned by [`Store::stats`].
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub active_memtable_entries: usize,
    pub active_memtable_size_bytes: usize,
    pub immutable_memtables: usize,
    pub rotations: u64,
    pub async_flushes: u64,
    pub backpressure_flushes: u64,
    pub num_sstables: usize,
    pub per_level: Vec<LevelStats>,
    pub compactions_run: u64,
}

/// A persistent, ordered key-value store.
///
/// Thread-safe: `put`, `delete`, and `get` may be called concurrently
/// from multiple threads. Internally, mutations are serialized by a
/// single write mutex; reads and background workers never block on it.
pub struct Store {
    config: StoreConfig,
    wal: Arc<Wal>,
    memtable_manager: MemtableManager,
    sstable_manager: Arc<SstableManager>,
    write_mutex: Mutex<()>,
    next_timestamp: AtomicU64,
    closed: AtomicBool,
}

impl Store {
    /// Opens (or creates) a store rooted at `data_dir`.
    ///
    /// Loads every level manifest, sweeps orphaned SSTable directories,
    /// then replays the WAL into a fresh active memtable (without
    /// re-appending or fsyncing). The WAL itself is left intact until
    /// the next flush retires the replayed records.
    pub fn open(data_dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let wal = Arc::new(Wal::open(data_dir.join("wal.log"), None)?);
        let sstable_manager = Arc::new(SstableManager::open(&data_dir, config.clone())?);

        let mut recovered = Memtable::new();
        let mut max_ts: Option<u64> = sstable_manager.max_timestamp();
        for entry in wal.read_all()? {
            max_ts = Some(max_ts.map_or(entry.timestamp, |m| m.max(entry.timestamp)));
            recovered.insert(entry);
        }
        let next_ts = max_ts.map_or(0, |m| m + 1);

        let flush_callback = make_flush_callback(Arc::clone(&wal), Arc::clone(&sstable_manager));
        let memtable_manager = MemtableManager::new(
            recovered,
            config.memtable_size,
            config.max_immutable_memtables,
            config.flush_workers,
            flush_callback,
        );

        info!(data_dir = %data_dir.display(), next_ts, "store opened");

        Ok(Self {
            config,
            wal,
            memtable_manager,
            sstable_manager,
            write_mutex: Mutex::new(()),
            next_timestamp: AtomicU64::new(next_ts),
            closed: AtomicBool::new(false),
        })
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.ensure_open()?;
        validate_key(&key, &self.config)?;
        validate_value(&value, &self.config)?;

        let _guard = self.write_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let ts = self.next_timestamp.fetch_add(1, Ordering::SeqCst);
        let entry = Entry::put(key, value, ts);
        self.wal.append(&entry)?;
        self.memtable_manager.apply(entry)?;
        Ok(())
    }

    /// Deletes `key` (inserts a tombstone).
    pub fn delete(&self, key: Vec<u8>) -> Result<(), StoreError> {
        self.ensure_open()?;
        validate_key(&key, &self.config)?;

        let _guard = self.write_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let ts = self.next_timestamp.fetch_add(1, Ordering::SeqCst);
        let entry = Entry::tombstone(key, ts);
        self.wal.append(&entry)?;
        self.memtable_manager.apply(entry)?;
        Ok(())
    }

    /// Looks up `key`: the active and immutable memtables (newest
    /// first, including tombstones), then the SSTable levels.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;

        match self.memtable_manager.get(key)? {
            MemtableGetResult::Live(value) => return Ok(Some(value)),
            MemtableGetResult::Deleted => return Ok(None),
            MemtableGetResult::Missing => {}
        }

        match self.sstable_manager.get(key)? {
            Some(entry) if entry.deleted => Ok(None),
            Some(entry) => Ok(entry.value),
            None => Ok(None),
        }
    }

    /// Rotates the active memtable (if non-empty) and flushes it
    /// synchronously, writing a new SSTable and trimming the WAL.
    pub fn flush(&self) -> Result<FlushMetadata, StoreError> {
        self.ensure_open()?;
        let handle = self
            .memtable_manager
            .flush_active_sync()?
            .ok_or(StoreError::EmptyMemtable)?;
        let entries_flushed = handle.memtable.len();
        self.memtable_manager.flush_one_sync(handle)?;
        Ok(FlushMetadata { entries_flushed })
    }

    /// Forces a full compaction, merging every level into the
    /// bottommost populated one.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.sstable_manager.compact()?;
        Ok(())
    }

    /// Current store-wide statistics.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let mem = self.memtable_manager.stats()?;
        let comp: CompactionStats = self.sstable_manager.stats();
        Ok(StoreStats {
            active_memtable_entries: mem.active_entries,
            active_memtable_size_bytes: mem.active_size_bytes,
            immutable_memtables: mem.immutable_memtables,
            rotations: mem.rotations,
            async_flushes: mem.async_flushes,
            backpressure_flushes: mem.backpressure_flushes,
            num_sstables: comp.per_level.iter().map(|l| l.num_sstables).sum(),
            per_level: comp.per_level,
            compactions_run: comp.compactions_run,
        })
    }

    /// Gracefully shuts down the store.
    ///
    /// Marks the store closed, flushes every pending memtable, waits
    /// for the flush pool and any in-flight compaction to finish, then
    /// clears the WAL last — never before every flush has committed.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.memtable_manager.force_flush_all()?;
        self.memtable_manager.close();
        self.sstable_manager.close();
        self.wal.clear()?;
        info!("store closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

fn validate_key(key: &[u8], config: &StoreConfig) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::Validation("key must not be empty".into()));
    }
    if key.len() > config.max_key_size {
        return Err(StoreError::Validation(format!(
            "key of {} bytes exceeds max_key_size of {} bytes",
            key.len(),
            config.max_key_size
        )));
    }
    Ok(())
}

fn validate_value(value: &[u8], config: &StoreConfig) -> Result<(), StoreError> {
    if value.len() > config.max_value_size {
        return Err(StoreError::Validation(format!(
            "value of {} bytes exceeds max_value_size of {} bytes",
            value.len(),
            config.max_value_size
        )));
    }
    Ok(())
}

/// Builds the callback wired into the memtable manager: persists an
/// immutable memtable as a new L0 SSTable, then trims the WAL down to
/// records not yet covered by that SSTable (`_clear_wal_for_flushed_data`).
fn make_flush_callback(wal: Arc<Wal>, sstable_manager: Arc<SstableManager>) -> FlushCallback {
    Arc::new(move |immutable: Arc<ImmutableMemtable>| -> Result<(), MemtableError> {
        let entries: Vec<Entry> = immutable.memtable.iter_sorted().collect();
        if entries.is_empty() {
            return Ok(());
        }

        let mut persisted: HashMap<Vec<u8>, u64> = HashMap::with_capacity(entries.len());
        for entry in &entries {
            persisted.insert(entry.key.clone(), entry.timestamp);
        }

        sstable_manager
            .add_sstable(entries)
            .map_err(|e| MemtableError::Internal(format!("flush to sstable failed: {e}")))?;

        wal.replace_with_filtered(|entry| match persisted.get(&entry.key) {
            Some(&ts) => entry.timestamp > ts,
            None => true,
        })
        .map_err(|e| MemtableError::Internal(format!("WAL trim after flush failed: {e}")))?;

        Ok(())
    })
}
