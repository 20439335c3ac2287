//! # StrataKV
//!
//! An embeddable, persistent key-value storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture. Designed for
//! fast writes and crash-safe operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Store                             │
//! │  ┌────────────┐  ┌──────────────┐                         │
//! │  │  Active     │  │  Immutable   │   flush callback        │
//! │  │  Memtable   │─►│  Memtables   │─────────────┐           │
//! │  └─────┬───────┘  └──────────────┘             │           │
//! │        │ append                                ▼           │
//! │        ▼                                 ┌─────────────┐   │
//! │  ┌────────────┐                          │  SSTables   │   │
//! │  │    WAL      │◄────── trim on flush ───│  (on disk)  │   │
//! │  └────────────┘                          └──────┬──────┘   │
//! │                                                  │ compact  │
//! │                                          ┌───────▼──────┐  │
//! │                                          │ Per-level     │  │
//! │                                          │ manifests     │  │
//! │                                          └───────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | The public facade — open, get, put, delete, flush, compact |
//! | [`memtable`] | In-memory write buffer plus its rotation/flush manager |
//! | [`wal`] | CRC-protected, self-framing write-ahead log for crash recovery |
//! | [`sstable`] | Immutable, sorted, mmapped tables with bloom filters and sparse indices |
//! | [`manifest`] | Per-level, JSON-text SSTable metadata with atomic installation |
//! | [`compaction`] | Leveled compaction engine driving L0 → L1 → ... merges |
//! | [`bloom`] | Bloom filter construction and on-disk (de)serialization |
//! | [`config`] | Tuning knobs for a [`Store`](store::Store) instance |
//! | [`entry`] | The single versioned mutation record threaded through every layer |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation is persisted to a WAL before
//!   being acknowledged, guaranteeing durability and crash recovery.
//! - **Strictly monotonic ordering** — every mutation is assigned a
//!   strictly increasing sequence number, used both for WAL ordering and
//!   for resolving which version of a key is authoritative.
//! - **Tombstone deletes** — a delete leaves a tombstone that shadows
//!   older versions until it is safely dropped at the bottommost level.
//! - **Bloom filter lookups** — each SSTable carries a bloom filter for
//!   fast negative point-lookup responses.
//! - **Leveled compaction** — L0 holds overlapping flushed memtables;
//!   every level below holds at most one SSTable with a disjoint key
//!   range, merged downward by a single background worker.
//! - **Block-level CRC32 integrity** — every WAL record and SSTable data
//!   block is checksummed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratakv::config::StoreConfig;
//! use stratakv::store::Store;
//!
//! let store = Store::open("/tmp/my_db", StoreConfig::default()).unwrap();
//!
//! // Write
//! store.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//!
//! // Read
//! assert_eq!(store.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! // Delete
//! store.delete(b"hello".to_vec()).unwrap();
//! assert_eq!(store.get(b"hello").unwrap(), None);
//!
//! // Graceful shutdown
//! store.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod bloom;
pub mod compaction;
pub mod config;
pub mod encoding;
pub mod entry;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod store;
pub mod wal;
