//! Per-level manifest: the durable source of truth for which SSTables
//! are live.
//!
//! Each level's SSTable list lives in its own JSON file
//! (`manifests/level_<k>.json`); a small global file
//! (`manifests/global.json`) records the next SSTable id and the set of
//! levels currently in use. Every mutation is written via a temp file
//! plus rename so a crash never observes a half-written manifest.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::sstable::SstableMeta;

const GLOBAL_FILENAME: &str = "global.json";

/// Errors from manifest reads and writes.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk manifest could not be parsed as valid JSON.
    #[error("malformed manifest at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Internal invariant violation or poisoned lock.
    #[error("internal manifest error: {0}")]
    Internal(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GlobalManifest {
    next_sstable_id: u64,
    levels: Vec<u32>,
}

/// Durable per-level SSTable metadata plus the global next-id counter,
/// with a single mutex serializing every durability-affecting operation.
pub struct Manifest {
    dir: PathBuf,
    state: Mutex<ManifestState>,
}

struct ManifestState {
    global: GlobalManifest,
    levels: BTreeMap<u32, Vec<SstableMeta>>,
}

impl Manifest {
    /// Opens (or initializes) the manifest directory under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let global_path = dir.join(GLOBAL_FILENAME);
        let global: GlobalManifest = if global_path.exists() {
            read_json(&global_path)?
        } else {
            GlobalManifest::default()
        };

        let mut levels = BTreeMap::new();
        for &level in &global.levels {
            let path = level_path(&dir, level);
            let entries: Vec<SstableMeta> = if path.exists() {
                read_json(&path)?
            } else {
                Vec::new()
            };
            levels.insert(level, entries);
        }

        info!(levels = levels.len(), next_id = global.next_sstable_id, "manifest opened");

        Ok(Self {
            dir,
            state: Mutex::new(ManifestState { global, levels }),
        })
    }

    /// Reserves and returns the next SSTable id, durably persisting the
    /// advanced counter before returning it.
    pub fn get_next_id(&self) -> Result<u64, ManifestError> {
        let mut guard = self.lock()?;
        let id = guard.global.next_sstable_id;
        guard.global.next_sstable_id += 1;
        let global = clone_global(&guard.global);
        write_json(&self.dir.join(GLOBAL_FILENAME), &global)?;
        Ok(id)
    }

    /// Appends `meta` to `level`'s in-memory and durable list.
    pub fn add(&self, level: u32, meta: SstableMeta) -> Result<(), ManifestError> {
        let mut guard = self.lock()?;
        let entries = guard.levels.entry(level).or_default();
        entries.push(meta);
        self.persist_level(&mut guard, level)
    }

    /// Removes every entry at `level` whose id is in `ids`.
    pub fn remove(&self, level: u32, ids: &[u64]) -> Result<(), ManifestError> {
        let mut guard = self.lock()?;
        if let Some(entries) = guard.levels.get_mut(&level) {
            entries.retain(|e| !ids.contains(&e.id));
        }
        self.persist_level(&mut guard, level)
    }

    /// Atomically replaces `level`'s entire list.
    pub fn replace_level(&self, level: u32, new_entries: Vec<SstableMeta>) -> Result<(), ManifestError> {
        let mut guard = self.lock()?;
        guard.levels.insert(level, new_entries);
        self.persist_level(&mut guard, level)
    }

    /// Returns a copy of `level`'s current SSTable list.
    pub fn get_level(&self, level: u32) -> Result<Vec<SstableMeta>, ManifestError> {
        let guard = self.lock()?;
        Ok(guard.levels.get(&level).cloned().unwrap_or_default())
    }

    /// Returns every level index currently tracked, in ascending order.
    pub fn levels(&self) -> Result<Vec<u32>, ManifestError> {
        let guard = self.lock()?;
        Ok(guard.levels.keys().copied().collect())
    }

    /// Every SSTable directory name referenced by any level's manifest,
    /// used by the startup orphan sweep.
    pub fn all_live_dirnames(&self) -> Result<Vec<String>, ManifestError> {
        let guard = self.lock()?;
        Ok(guard
            .levels
            .values()
            .flatten()
            .map(|e| e.dirname.clone())
            .collect())
    }

    fn persist_level(&self, guard: &mut ManifestState, level: u32) -> Result<(), ManifestError> {
        if !guard.global.levels.contains(&level) {
            guard.global.levels.push(level);
            guard.global.levels.sort_unstable();
            let global = clone_global(&guard.global);
            write_json(&self.dir.join(GLOBAL_FILENAME), &global)?;
        }
        let entries = guard.levels.get(&level).cloned().unwrap_or_default();
        write_json(&level_path(&self.dir, level), &entries)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ManifestState>, ManifestError> {
        self.state
            .lock()
            .map_err(|_| ManifestError::Internal("manifest mutex poisoned".into()))
    }
}

fn clone_global(global: &GlobalManifest) -> GlobalManifest {
    GlobalManifest {
        next_sstable_id: global.next_sstable_id,
        levels: global.levels.clone(),
    }
}

fn level_path(dir: &Path, level: u32) -> PathBuf {
    dir.join(format!("level_{level}.json"))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ManifestError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| ManifestError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ManifestError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| ManifestError::Internal(format!("failed to serialize manifest: {e}")))?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir_file) = File::open(parent) {
            let _ = dir_file.sync_all();
        }
    }
    Ok(())
}
