//! Engine configuration.

use crate::entry::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Tuning knobs for a [`Store`](crate::store::Store) instance.
///
/// Every field here is enumerated in the spec's external-interfaces
/// configuration table; defaults are chosen to be reasonable for a
/// small embedded workload, not for any particular benchmark.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Max entries in the active memtable before it is rotated out.
    pub memtable_size: usize,

    /// Bound on the immutable memtable queue length. Exceeding it forces
    /// the caller that triggered the overflow to flush synchronously.
    pub max_immutable_memtables: usize,

    /// Number of background threads servicing the memtable flush queue.
    pub flush_workers: usize,

    /// Size/entry-count multiplier between adjacent levels.
    pub level_ratio: u64,

    /// L0 entry-count cap (used as the base for `max_entries(k)`).
    pub base_level_entries: u64,

    /// L0 byte-size cap in MiB (used as the base for `max_size(k)`).
    pub base_level_size_mb: u64,

    /// L0 file-count cap.
    pub max_l0_sstables: usize,

    /// Fraction of a hard limit that triggers proactive compaction.
    pub soft_limit_ratio: f64,

    /// Maximum accepted key length, in bytes.
    pub max_key_size: usize,

    /// Maximum accepted value length, in bytes.
    pub max_value_size: usize,

    /// Every Bth key in an SSTable is recorded in its sparse index.
    pub sparse_index_interval: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memtable_size: 1024,
            max_immutable_memtables: 4,
            flush_workers: 2,
            level_ratio: 10,
            base_level_entries: 4096,
            base_level_size_mb: 16,
            max_l0_sstables: 4,
            soft_limit_ratio: 0.85,
            max_key_size: MAX_KEY_SIZE,
            max_value_size: MAX_VALUE_SIZE,
            sparse_index_interval: 8,
        }
    }
}

impl StoreConfig {
    /// `base_level_size_mb` converted to bytes.
    pub fn base_level_size_bytes(&self) -> u64 {
        self.base_level_size_mb * 1024 * 1024
    }

    /// Hard entry-count cap for `level` (0-indexed; L0 uses
    /// `max_l0_sstables` for file count instead, not this cap).
    pub fn max_entries(&self, level: u32) -> u64 {
        self.base_level_entries
            .saturating_mul(self.level_ratio.saturating_pow(level))
    }

    /// Hard byte-size cap for `level`.
    pub fn max_size_bytes(&self, level: u32) -> u64 {
        self.base_level_size_bytes()
            .saturating_mul(self.level_ratio.saturating_pow(level))
    }

    /// Soft trigger threshold derived from a hard limit.
    pub fn soft_limit(&self, hard_limit: u64) -> u64 {
        ((hard_limit as f64) * self.soft_limit_ratio) as u64
    }
}
