//! In-memory write buffer and its rotation/flush manager.
//!
//! A [`Memtable`] holds the single latest [`Entry`] per key, sorted by
//! key. The [`MemtableManager`] owns one active memtable plus a bounded
//! FIFO queue of immutable memtables awaiting flush, and runs a pool of
//! background workers that drain that queue.

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::JoinHandle,
};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::entry::Entry;

/// Errors from memtable and manager operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// An internal invariant was violated (never expected in normal
    /// operation, e.g. a poisoned lock after a worker panic).
    #[error("internal memtable error: {0}")]
    Internal(String),
}

/// Result of looking up a key across the active and immutable memtables.
///
/// Replaces a bare `Option<Entry>` so callers never have to re-derive
/// "deleted" from a tombstone field at every call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableGetResult {
    /// The key's latest value.
    Live(Vec<u8>),
    /// The key was deleted by a tombstone at or below this layer.
    Deleted,
    /// No memtable layer has any record of this key.
    Missing,
}

/// The in-memory write buffer: one latest [`Entry`] per key, kept
/// sorted for in-order iteration.
#[derive(Default)]
pub struct Memtable {
    map: BTreeMap<Vec<u8>, Entry>,
    approximate_size: usize,
}

impl Memtable {
    /// Builds an empty memtable, e.g. to hold WAL-replayed entries
    /// before handing it to a fresh [`MemtableManager`].
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites an entry. Used directly (outside a
    /// manager) only during WAL replay at recovery.
    pub(crate) fn insert(&mut self, entry: Entry) {
        let size = entry.approximate_size();
        if let Some(old) = self.map.insert(entry.key.clone(), entry) {
            self.approximate_size -= old.approximate_size();
        }
        self.approximate_size += size;
    }

    fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.map.get(key)
    }

    /// Number of distinct keys (including tombstones).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// `true` when the memtable holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Approximate heap footprint in bytes.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    /// Entries in key order, ready for an SSTable writer.
    pub fn iter_sorted(&self) -> impl Iterator<Item = Entry> + '_ {
        self.map.values().cloned()
    }
}

/// An immutable memtable awaiting flush, tagged with the sequence
/// number assigned at rotation (newer sequence numbers shadow older
/// ones during `get`).
pub struct ImmutableMemtable {
    pub seq: u64,
    pub memtable: Memtable,
}

/// Aggregate counters surfaced via `Store::stats`.
#[derive(Debug, Clone, Default)]
pub struct MemtableStats {
    pub active_entries: usize,
    pub active_size_bytes: usize,
    pub immutable_memtables: usize,
    pub rotations: u64,
    pub async_flushes: u64,
    pub backpressure_flushes: u64,
}

struct ManagerState {
    active: Memtable,
    immutable: VecDeque<Arc<ImmutableMemtable>>,
}

/// Callback invoked (outside every manager lock) to durably persist an
/// immutable memtable as an SSTable and trim the WAL of its records.
///
/// This is the dynamic-dispatch seam between the manager and the store
/// facade: the manager knows nothing about SSTables or the WAL.
pub type FlushCallback =
    Arc<dyn Fn(Arc<ImmutableMemtable>) -> Result<(), MemtableError> + Send + Sync>;

/// State shared between the manager handle and its flush worker pool,
/// so a worker that completes a flush can retire the handle from the
/// immutable queue itself, exactly as `flush_one_sync` does.
struct Shared {
    state: Mutex<ManagerState>,
    next_seq: AtomicU64,
    memtable_size: usize,
    max_immutable: usize,
    flush_callback: FlushCallback,
    rotations: AtomicU64,
    async_flushes: AtomicU64,
    backpressure_flushes: AtomicU64,
}

/// Persists `immutable` via the flush callback and, only on success,
/// removes it from the immutable queue and counts it as an async flush.
/// Shared by the background workers and `MemtableManager::flush_one_sync`
/// so there is exactly one place that retires a flushed handle.
fn flush_one(shared: &Shared, immutable: Arc<ImmutableMemtable>) -> Result<(), MemtableError> {
    let seq = immutable.seq;
    (shared.flush_callback)(Arc::clone(&immutable))?;
    shared.async_flushes.fetch_add(1, Ordering::Relaxed);

    let mut guard = shared
        .state
        .lock()
        .map_err(|_| MemtableError::Internal("memtable manager mutex poisoned".into()))?;
    guard.immutable.retain(|m| m.seq != seq);
    Ok(())
}

/// Owns the active/immutable memtable pipeline and its flush worker pool.
pub struct MemtableManager {
    shared: Arc<Shared>,
    flush_tx: Mutex<Option<Sender<Arc<ImmutableMemtable>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemtableManager {
    /// Starts the manager with an already-recovered active memtable
    /// (e.g. from WAL replay) and spawns `flush_workers` background
    /// threads that drain the immutable queue via `flush_callback`.
    pub fn new(
        recovered_active: Memtable,
        memtable_size: usize,
        max_immutable: usize,
        flush_workers: usize,
        flush_callback: FlushCallback,
    ) -> Self {
        let (flush_tx, flush_rx): (Sender<Arc<ImmutableMemtable>>, Receiver<Arc<ImmutableMemtable>>) =
            channel::unbounded();

        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState {
                active: recovered_active,
                immutable: VecDeque::new(),
            }),
            next_seq: AtomicU64::new(0),
            memtable_size,
            max_immutable,
            flush_callback,
            rotations: AtomicU64::new(0),
            async_flushes: AtomicU64::new(0),
            backpressure_flushes: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(flush_workers);
        for id in 0..flush_workers {
            let rx = flush_rx.clone();
            let worker_shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("memtable-flush-{id}"))
                    .spawn(move || {
                        for immutable in rx.iter() {
                            let seq = immutable.seq;
                            if let Err(err) = flush_one(&worker_shared, immutable) {
                                error!(seq, %err, "async flush failed, immutable memtable remains queued");
                            } else {
                                trace!(seq, "async flush completed");
                            }
                        }
                    })
                    .expect("failed to spawn memtable flush worker"),
            );
        }

        Self {
            shared,
            flush_tx: Mutex::new(Some(flush_tx)),
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        }
    }

    /// Applies a put or delete entry to the active memtable, rotating
    /// (and, under backpressure, synchronously flushing) as needed.
    pub fn apply(&self, entry: Entry) -> Result<(), MemtableError> {
        let overflow = {
            let mut guard = self.lock()?;
            guard.active.insert(entry);

            if guard.active.len() >= self.shared.memtable_size {
                let rotated = std::mem::take(&mut guard.active);
                let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
                self.shared.rotations.fetch_add(1, Ordering::Relaxed);
                let handle = Arc::new(ImmutableMemtable {
                    seq,
                    memtable: rotated,
                });
                guard.immutable.push_back(Arc::clone(&handle));
                debug!(seq, "rotated active memtable");

                if guard.immutable.len() > self.shared.max_immutable {
                    guard.immutable.pop_front()
                } else {
                    if let Some(tx) = self.flush_tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                        let _ = tx.send(handle);
                    }
                    None
                }
            } else {
                None
            }
        };

        if let Some(overflow) = overflow {
            // Backpressure: the immutable queue was already at capacity
            // before this rotation, so the caller flushes the oldest
            // entry synchronously rather than letting the queue grow
            // unbounded.
            warn!(seq = overflow.seq, "immutable queue full, flushing synchronously");
            self.shared.backpressure_flushes.fetch_add(1, Ordering::Relaxed);
            self.flush_one_sync(overflow)?;
        }

        Ok(())
    }

    /// Searches the active memtable, then the immutable queue from
    /// newest to oldest sequence number.
    pub fn get(&self, key: &[u8]) -> Result<MemtableGetResult, MemtableError> {
        let guard = self.lock()?;
        if let Some(entry) = guard.active.get(key) {
            return Ok(Self::to_result(entry));
        }
        for immutable in guard.immutable.iter().rev() {
            if let Some(entry) = immutable.memtable.get(key) {
                return Ok(Self::to_result(entry));
            }
        }
        Ok(MemtableGetResult::Missing)
    }

    fn to_result(entry: &Entry) -> MemtableGetResult {
        if entry.deleted {
            MemtableGetResult::Deleted
        } else {
            MemtableGetResult::Live(entry.value.clone().expect("live entry must have a value"))
        }
    }

    /// Rotates the active memtable (if non-empty) into the immutable
    /// queue and returns the handle, without invoking any flush
    /// callback — the caller (the store facade) flushes it outside this
    /// lock.
    pub fn flush_active_sync(&self) -> Result<Option<Arc<ImmutableMemtable>>, MemtableError> {
        let mut guard = self.lock()?;
        if guard.active.is_empty() {
            return Ok(None);
        }
        let rotated = std::mem::take(&mut guard.active);
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        self.shared.rotations.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ImmutableMemtable {
            seq,
            memtable: rotated,
        });
        guard.immutable.push_back(Arc::clone(&handle));
        Ok(Some(handle))
    }

    /// Flushes one immutable memtable synchronously via the flush
    /// callback, then removes it from the queue once persisted. Shares
    /// its retirement logic with the background flush workers via
    /// `flush_one`, so a handle is only ever dropped from the queue
    /// after its callback has actually succeeded.
    pub fn flush_one_sync(&self, immutable: Arc<ImmutableMemtable>) -> Result<(), MemtableError> {
        flush_one(&self.shared, immutable)
    }

    /// Flushes the active memtable and every queued immutable memtable,
    /// in FIFO order, blocking until all are durably persisted.
    pub fn force_flush_all(&self) -> Result<(), MemtableError> {
        if let Some(active) = self.flush_active_sync()? {
            self.flush_one_sync(active)?;
        }
        loop {
            let next = {
                let guard = self.lock()?;
                guard.immutable.front().cloned()
            };
            let Some(next) = next else { break };
            self.flush_one_sync(next)?;
        }
        Ok(())
    }

    /// Current counters for `Store::stats`.
    pub fn stats(&self) -> Result<MemtableStats, MemtableError> {
        let guard = self.lock()?;
        Ok(MemtableStats {
            active_entries: guard.active.len(),
            active_size_bytes: guard.active.approximate_size(),
            immutable_memtables: guard.immutable.len(),
            rotations: self.shared.rotations.load(Ordering::Relaxed),
            async_flushes: self.shared.async_flushes.load(Ordering::Relaxed),
            backpressure_flushes: self.shared.backpressure_flushes.load(Ordering::Relaxed),
        })
    }

    /// Stops accepting new async flush work and joins every worker
    /// thread. Callers should invoke `force_flush_all` first.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the one sender disconnects the channel, which ends
        // every worker's `rx.iter()` loop so the joins below return.
        self.flush_tx.lock().unwrap_or_else(|e| e.into_inner()).take();

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagerState>, MemtableError> {
        self.shared
            .state
            .lock()
            .map_err(|_| MemtableError::Internal("memtable manager mutex poisoned".into()))
    }
}
