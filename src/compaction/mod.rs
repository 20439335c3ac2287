//! Leveled compaction engine.
//!
//! Owns the level map (`level_index -> SSTables`), installs newly
//! flushed memtables as fresh L0 tables, and runs a single background
//! worker that merges overflowing levels downward: L0 is an overlapping
//! set of flushed memtable snapshots; every level below it holds at
//! most one SSTable covering a disjoint key range.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::entry::Entry;
use crate::manifest::{Manifest, ManifestError};
use crate::sstable::builder::SstWriter;
use crate::sstable::{SSTable, SstableError, SstableMeta};

/// Errors from SSTable installation and compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSTable read/write error.
    #[error("SSTable error: {0}")]
    Sstable(#[from] SstableError),

    /// Manifest read/write error.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Caller tried to install an SSTable from zero entries.
    #[error("cannot install an SSTable built from zero entries")]
    EmptyInput,

    /// Internal invariant violation or poisoned lock.
    #[error("internal compaction error: {0}")]
    Internal(String),
}

/// Per-level snapshot surfaced via `Store::stats`.
#[derive(Debug, Clone)]
pub struct LevelStats {
    pub level: u32,
    pub num_sstables: usize,
    pub num_entries: u64,
    pub size_bytes: u64,
}

/// Aggregate counters surfaced via `Store::stats`.
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    pub per_level: Vec<LevelStats>,
    pub compactions_run: u64,
}

type LevelMap = BTreeMap<u32, Vec<Arc<SSTable>>>;

struct Shared {
    sstables_dir: PathBuf,
    manifest: Manifest,
    config: StoreConfig,
    levels: RwLock<LevelMap>,
    compacting: AtomicBool,
    compactions_run: AtomicU64,
    closed: AtomicBool,
    trigger_tx: Sender<()>,
}

/// Owns the level map and drives compaction.
pub struct SstableManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SstableManager {
    /// Opens every level referenced by the manifest, builds the
    /// in-memory level map, sweeps orphaned SSTable directories, and
    /// starts the background compaction worker.
    pub fn open(data_dir: &std::path::Path, config: StoreConfig) -> Result<Self, CompactionError> {
        let sstables_dir = crate::sstable::builder::ensure_sstables_dir(data_dir)?;
        let manifest = Manifest::open(data_dir.join("manifests"))?;

        let mut levels: LevelMap = BTreeMap::new();
        for level in manifest.levels()? {
            let metas = manifest.get_level(level)?;
            let mut tables = Vec::with_capacity(metas.len());
            for meta in metas {
                let dir = sstables_dir.join(&meta.dirname);
                tables.push(Arc::new(SSTable::open(dir, meta)?));
            }
            if level == 0 {
                tables.sort_by(|a, b| b.meta().id.cmp(&a.meta().id));
            }
            levels.insert(level, tables);
        }

        sweep_orphans(&sstables_dir, &manifest)?;

        let (trigger_tx, trigger_rx) = channel::bounded(1);
        let shared = Arc::new(Shared {
            sstables_dir,
            manifest,
            config,
            levels: RwLock::new(levels),
            compacting: AtomicBool::new(false),
            compactions_run: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            trigger_tx,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("compaction-worker".into())
            .spawn(move || compaction_worker_loop(worker_shared, trigger_rx))
            .expect("failed to spawn compaction worker");

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Writes `entries` as a fresh L0 SSTable, installs it under the
    /// manifest, and (outside any lock held here) signals the
    /// compaction worker if a level is now compactable.
    pub fn add_sstable(&self, entries: Vec<Entry>) -> Result<SstableMeta, CompactionError> {
        let count = entries.len();
        if count == 0 {
            return Err(CompactionError::EmptyInput);
        }

        let id = self.shared.manifest.get_next_id()?;
        let meta = SstWriter::new(&self.shared.sstables_dir, id).build(
            entries.into_iter(),
            count,
            &self.shared.config,
        )?;
        let table = Arc::new(SSTable::open(
            self.shared.sstables_dir.join(&meta.dirname),
            meta.clone(),
        )?);

        {
            let mut levels = self.shared.levels.write().unwrap_or_else(|e| e.into_inner());
            let l0 = levels.entry(0).or_default();
            l0.insert(0, table);
            self.shared.manifest.add(0, meta.clone())?;
        }

        debug!(id, "installed new L0 sstable");
        self.shared.maybe_trigger_compaction();
        Ok(meta)
    }

    /// Looks up `key`: L0 newest-first, then L1, L2, ... each holding at
    /// most one SSTable. Returns the first hit, including tombstones.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>, CompactionError> {
        let snapshot: Vec<(u32, Vec<Arc<SSTable>>)> = {
            let levels = self.shared.levels.read().unwrap_or_else(|e| e.into_inner());
            levels.iter().map(|(&l, tables)| (l, tables.clone())).collect()
        };

        for (_level, tables) in snapshot {
            for table in tables {
                if let Some(entry) = table.get(key)? {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    /// Merges every level into the deepest non-empty level, dropping
    /// tombstones unconditionally since the result is bottommost.
    pub fn compact(&self) -> Result<(), CompactionError> {
        while self.shared.compacting.swap(true, Ordering::SeqCst) {
            std::thread::yield_now();
        }
        let result = run_full_compaction(&self.shared);
        self.shared.compacting.store(false, Ordering::SeqCst);
        result
    }

    /// Largest timestamp recorded across every live SSTable, or `None`
    /// if the store holds no SSTables yet. Used on `Store::open` to
    /// recover the next timestamp to hand out after a clean close,
    /// since a closed store's WAL is empty and carries no timestamp.
    pub fn max_timestamp(&self) -> Option<u64> {
        let levels = self.shared.levels.read().unwrap_or_else(|e| e.into_inner());
        levels
            .values()
            .flatten()
            .map(|t| t.meta().max_timestamp)
            .max()
    }

    /// Current per-level stats.
    pub fn stats(&self) -> CompactionStats {
        let levels = self.shared.levels.read().unwrap_or_else(|e| e.into_inner());
        let per_level = levels
            .iter()
            .map(|(&level, tables)| LevelStats {
                level,
                num_sstables: tables.len(),
                num_entries: tables.iter().map(|t| t.meta().num_entries).sum(),
                size_bytes: tables.iter().map(|t| t.meta().size_bytes).sum(),
            })
            .collect();
        CompactionStats {
            per_level,
            compactions_run: self.shared.compactions_run.load(Ordering::Relaxed),
        }
    }

    /// Signals the worker to stop accepting new triggers and joins it.
    /// Any compaction already running is allowed to finish first.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.trigger_tx.send(());
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

impl Shared {
    fn soft_l0_limit(&self) -> usize {
        ((self.config.max_l0_sstables as f64) * self.config.soft_limit_ratio) as usize
    }

    fn compactable_level(&self) -> Option<u32> {
        let levels = self.levels.read().unwrap_or_else(|e| e.into_inner());
        let l0_len = levels.get(&0).map_or(0, Vec::len);
        if l0_len >= self.soft_l0_limit().max(1) {
            return Some(0);
        }
        for (&level, tables) in levels.iter() {
            let entries: u64 = tables.iter().map(|t| t.meta().num_entries).sum();
            let size: u64 = tables.iter().map(|t| t.meta().size_bytes).sum();
            if entries >= self.config.soft_limit(self.config.max_entries(level))
                || size >= self.config.soft_limit(self.config.max_size_bytes(level))
            {
                return Some(level);
            }
        }
        None
    }

    fn maybe_trigger_compaction(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.compactable_level().is_some() {
            let _ = self.trigger_tx.try_send(());
        }
    }

    fn bottommost_populated_level(&self) -> u32 {
        let levels = self.levels.read().unwrap_or_else(|e| e.into_inner());
        levels
            .iter()
            .filter(|(_, tables)| !tables.is_empty())
            .map(|(&level, _)| level)
            .max()
            .unwrap_or(0)
    }
}

fn compaction_worker_loop(shared: Arc<Shared>, trigger_rx: Receiver<()>) {
    for () in trigger_rx.iter() {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        loop {
            if shared.compacting.swap(true, Ordering::SeqCst) {
                break;
            }
            let Some(level) = shared.compactable_level() else {
                shared.compacting.store(false, Ordering::SeqCst);
                break;
            };
            let outcome = run_one_compaction(&shared, level);
            shared.compacting.store(false, Ordering::SeqCst);
            match outcome {
                Ok(()) => {
                    shared.compactions_run.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    error!(level, %err, "compaction failed, will retry on next trigger");
                    break;
                }
            }
            // Re-evaluate immediately: the install at level+1 may itself
            // have crossed a threshold.
            if shared.compactable_level().is_none() {
                break;
            }
        }
    }
}

/// Merges level `k` with level `k+1` into a new level `k+1` SSTable.
fn run_one_compaction(shared: &Arc<Shared>, k: u32) -> Result<(), CompactionError> {
    let (inputs, next_level_old) = {
        let levels = shared.levels.read().unwrap_or_else(|e| e.into_inner());
        let lk = levels.get(&k).cloned().unwrap_or_default();
        let lk1 = levels.get(&(k + 1)).cloned().unwrap_or_default();
        (lk, lk1)
    };
    if inputs.is_empty() {
        return Ok(());
    }

    let bottommost = shared.bottommost_populated_level();
    let drop_tombstones = k + 1 >= bottommost;

    let mut all_inputs = inputs.clone();
    all_inputs.extend(next_level_old.iter().cloned());
    let merged = merge_tables(&all_inputs, drop_tombstones)?;

    let old_input_ids: Vec<u64> = inputs.iter().map(|t| t.meta().id).collect();

    let new_table = if merged.is_empty() {
        None
    } else {
        let id = shared.manifest.get_next_id()?;
        let count = merged.len();
        let meta = SstWriter::new(&shared.sstables_dir, id).build(merged.into_iter(), count, &shared.config)?;
        Some(Arc::new(SSTable::open(
            shared.sstables_dir.join(&meta.dirname),
            meta,
        )?))
    };

    let old_tables_to_delete = {
        let mut levels = shared.levels.write().unwrap_or_else(|e| e.into_inner());

        let new_list: Vec<Arc<SSTable>> = new_table.into_iter().collect();
        let new_metas: Vec<SstableMeta> = new_list.iter().map(|t| t.meta().clone()).collect();
        shared.manifest.replace_level(k + 1, new_metas)?;
        shared.manifest.remove(k, &old_input_ids)?;

        levels.insert(k + 1, new_list);
        levels.insert(k, Vec::new());

        let mut to_delete = inputs;
        to_delete.extend(next_level_old);
        to_delete
    };

    for table in old_tables_to_delete {
        let dir = table.dir().to_path_buf();
        drop(table);
        if let Err(err) = SSTable::delete(&dir) {
            warn!(?dir, %err, "failed to delete compacted sstable, will be reaped as an orphan on next open");
        }
    }

    info!(level = k, "compaction committed");
    Ok(())
}

fn run_full_compaction(shared: &Arc<Shared>) -> Result<(), CompactionError> {
    let bottommost = shared.bottommost_populated_level();
    let all_tables: Vec<Arc<SSTable>> = {
        let levels = shared.levels.read().unwrap_or_else(|e| e.into_inner());
        levels.values().flatten().cloned().collect()
    };
    if all_tables.is_empty() {
        return Ok(());
    }

    let merged = merge_tables(&all_tables, true)?;

    let new_table = if merged.is_empty() {
        None
    } else {
        let id = shared.manifest.get_next_id()?;
        let count = merged.len();
        let meta = SstWriter::new(&shared.sstables_dir, id).build(merged.into_iter(), count, &shared.config)?;
        Some(Arc::new(SSTable::open(
            shared.sstables_dir.join(&meta.dirname),
            meta,
        )?))
    };

    let old_tables_to_delete = {
        let mut levels = shared.levels.write().unwrap_or_else(|e| e.into_inner());
        let new_list: Vec<Arc<SSTable>> = new_table.into_iter().collect();

        for level in levels.keys().copied().collect::<Vec<_>>() {
            if level == bottommost {
                continue;
            }
            shared.manifest.replace_level(level, Vec::new())?;
            levels.insert(level, Vec::new());
        }
        let new_metas: Vec<SstableMeta> = new_list.iter().map(|t| t.meta().clone()).collect();
        shared.manifest.replace_level(bottommost, new_metas)?;
        levels.insert(bottommost, new_list);

        all_tables
    };

    for table in old_tables_to_delete {
        let dir = table.dir().to_path_buf();
        drop(table);
        if let Err(err) = SSTable::delete(&dir) {
            warn!(?dir, %err, "failed to delete compacted sstable, will be reaped as an orphan on next open");
        }
    }

    info!("full compaction committed");
    Ok(())
}

/// Reads every entry from `tables`, keeps the highest-timestamp version
/// per key, optionally drops tombstones, and returns the survivors
/// sorted by key.
fn merge_tables(tables: &[Arc<SSTable>], drop_tombstones: bool) -> Result<Vec<Entry>, CompactionError> {
    let mut merged: BTreeMap<Vec<u8>, Entry> = BTreeMap::new();
    for table in tables {
        for entry in table.read_all()? {
            match merged.get(&entry.key) {
                Some(existing) if existing.timestamp >= entry.timestamp => {}
                _ => {
                    merged.insert(entry.key.clone(), entry);
                }
            }
        }
    }
    if drop_tombstones {
        merged.retain(|_, entry| !entry.deleted);
    }
    Ok(merged.into_values().collect())
}

fn sweep_orphans(sstables_dir: &std::path::Path, manifest: &Manifest) -> Result<(), CompactionError> {
    let live: std::collections::HashSet<String> = manifest.all_live_dirnames()?.into_iter().collect();
    if !sstables_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(sstables_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tmpdir") || !live.contains(&name) {
            warn!(dirname = %name, "removing orphaned sstable directory");
            std::fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}
