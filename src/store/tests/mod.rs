use tempfile::tempdir;

use super::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_config() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.memtable_size = 4;
    config.max_immutable_memtables = 2;
    config.sparse_index_interval = 2;
    config
}

fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!("condition not met in time");
}

#[test]
fn put_then_get_roundtrip() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), small_config()).unwrap();
    store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    store.close().unwrap();
}

#[test]
fn delete_masks_prior_put() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), small_config()).unwrap();
    store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    store.delete(b"a".to_vec()).unwrap();
    assert_eq!(store.get(b"a").unwrap(), None);
    store.close().unwrap();
}

#[test]
fn missing_key_is_none() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), small_config()).unwrap();
    assert_eq!(store.get(b"nope").unwrap(), None);
    store.close().unwrap();
}

#[test]
fn empty_key_is_rejected() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), small_config()).unwrap();
    let err = store.put(Vec::new(), b"1".to_vec()).unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    store.close().unwrap();
}

#[test]
fn oversized_key_is_rejected() {
    init_tracing();
    let dir = tempdir().unwrap();
    let mut config = small_config();
    config.max_key_size = 4;
    let store = Store::open(dir.path(), config).unwrap();
    let err = store.put(b"toolong".to_vec(), b"1".to_vec()).unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    store.close().unwrap();
}

#[test]
fn oversized_value_is_rejected() {
    init_tracing();
    let dir = tempdir().unwrap();
    let mut config = small_config();
    config.max_value_size = 2;
    let store = Store::open(dir.path(), config).unwrap();
    let err = store.put(b"a".to_vec(), b"toolong".to_vec()).unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    store.close().unwrap();
}

#[test]
fn operations_after_close_are_rejected() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), small_config()).unwrap();
    store.close().unwrap();
    assert!(matches!(store.put(b"a".to_vec(), b"1".to_vec()), Err(StoreError::Closed)));
    assert!(matches!(store.get(b"a"), Err(StoreError::Closed)));
}

#[test]
fn manual_flush_persists_and_empties_active_memtable() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), small_config()).unwrap();
    store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    let meta = store.flush().unwrap();
    assert_eq!(meta.entries_flushed, 1);
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

    let stats = store.stats().unwrap();
    assert_eq!(stats.active_memtable_entries, 0);
    assert_eq!(stats.num_sstables, 1);
    store.close().unwrap();
}

#[test]
fn flush_on_empty_memtable_errors() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), small_config()).unwrap();
    assert!(matches!(store.flush(), Err(StoreError::EmptyMemtable)));
    store.close().unwrap();
}

#[test]
fn rotation_flushes_asynchronously_and_stays_readable() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = small_config();
    let memtable_size = config.memtable_size;
    let store = Store::open(dir.path(), config).unwrap();

    for i in 0..memtable_size {
        store
            .put(format!("k{i}").into_bytes(), format!("v{i}").into_bytes())
            .unwrap();
    }

    wait_for(|| store.stats().unwrap().num_sstables >= 1);
    assert_eq!(store.get(b"k0").unwrap(), Some(b"v0".to_vec()));
    store.close().unwrap();
}

#[test]
fn close_flushes_pending_active_memtable() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let store = Store::open(dir.path(), small_config()).unwrap();
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.close().unwrap();
    }

    let store = Store::open(dir.path(), small_config()).unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    let stats = store.stats().unwrap();
    assert_eq!(stats.num_sstables, 1);
    store.close().unwrap();
}

#[test]
fn recovery_replays_unflushed_wal_entries() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let store = Store::open(dir.path(), small_config()).unwrap();
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        // Not closed: WAL is left with unflushed records.
    }

    let store = Store::open(dir.path(), small_config()).unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    store.close().unwrap();
}

#[test]
fn timestamps_remain_monotonic_across_reopen() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let store = Store::open(dir.path(), small_config()).unwrap();
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"a".to_vec(), b"2".to_vec()).unwrap();
    }

    let store = Store::open(dir.path(), small_config()).unwrap();
    store.put(b"a".to_vec(), b"3".to_vec()).unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"3".to_vec()));
    store.close().unwrap();
}

#[test]
fn full_compaction_merges_flushed_sstables() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), small_config()).unwrap();
    store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    store.flush().unwrap();
    store.put(b"a".to_vec(), b"2".to_vec()).unwrap();
    store.flush().unwrap();

    store.compact().unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
    let stats = store.stats().unwrap();
    assert_eq!(stats.num_sstables, 1);
    store.close().unwrap();
}

#[test]
fn concurrent_puts_are_all_durable() {
    init_tracing();
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path(), small_config()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..10 {
                    store
                        .put(format!("t{t}-k{i}").into_bytes(), b"v".to_vec())
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4 {
        for i in 0..10 {
            let key = format!("t{t}-k{i}").into_bytes();
            assert_eq!(store.get(&key).unwrap(), Some(b"v".to_vec()));
        }
    }
    store.close().unwrap();
}
