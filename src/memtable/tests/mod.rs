use std::sync::{Arc, Mutex};

use super::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn recording_callback() -> (FlushCallback, Arc<Mutex<Vec<u64>>>) {
    let flushed = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&flushed);
    let cb: FlushCallback = Arc::new(move |immutable| {
        recorded.lock().unwrap().push(immutable.seq);
        Ok(())
    });
    (cb, flushed)
}

#[test]
fn put_then_get_sees_live_value() {
    init_tracing();
    let (cb, _) = recording_callback();
    let manager = MemtableManager::new(Memtable::new(), 1024, 4, 1, cb);
    manager.apply(Entry::put(b"k".to_vec(), b"v".to_vec(), 1)).unwrap();
    assert_eq!(manager.get(b"k").unwrap(), MemtableGetResult::Live(b"v".to_vec()));
    manager.close();
}

#[test]
fn delete_shadows_prior_put() {
    init_tracing();
    let (cb, _) = recording_callback();
    let manager = MemtableManager::new(Memtable::new(), 1024, 4, 1, cb);
    manager.apply(Entry::put(b"k".to_vec(), b"v".to_vec(), 1)).unwrap();
    manager.apply(Entry::tombstone(b"k".to_vec(), 2)).unwrap();
    assert_eq!(manager.get(b"k").unwrap(), MemtableGetResult::Deleted);
    manager.close();
}

#[test]
fn missing_key_is_missing() {
    init_tracing();
    let (cb, _) = recording_callback();
    let manager = MemtableManager::new(Memtable::new(), 1024, 4, 1, cb);
    assert_eq!(manager.get(b"nope").unwrap(), MemtableGetResult::Missing);
    manager.close();
}

#[test]
fn rotation_triggers_at_capacity() {
    init_tracing();
    let (cb, flushed) = recording_callback();
    let manager = MemtableManager::new(Memtable::new(), 2, 4, 1, cb);
    manager.apply(Entry::put(b"a".to_vec(), b"1".to_vec(), 1)).unwrap();
    manager.apply(Entry::put(b"b".to_vec(), b"2".to_vec(), 2)).unwrap();

    // Give the async worker a moment to drain the queued rotation.
    for _ in 0..200 {
        if !flushed.lock().unwrap().is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(manager.stats().unwrap().rotations, 1);
    assert_eq!(flushed.lock().unwrap().len(), 1);
    manager.close();
}

#[test]
fn immutable_queue_shadows_active_by_recency() {
    init_tracing();
    let (cb, _) = recording_callback();
    // memtable_size = 1 forces a rotation on every second distinct key.
    let manager = MemtableManager::new(Memtable::new(), 1, 8, 1, cb);
    manager.apply(Entry::put(b"k".to_vec(), b"old".to_vec(), 1)).unwrap();
    manager.apply(Entry::put(b"other".to_vec(), b"x".to_vec(), 2)).unwrap();
    // "k" is no longer in the fresh active memtable, but should still be
    // found in the immutable queue.
    assert_eq!(manager.get(b"k").unwrap(), MemtableGetResult::Live(b"old".to_vec()));
    manager.close();
}

#[test]
fn backpressure_flushes_synchronously_when_queue_full() {
    init_tracing();
    let (cb, flushed) = recording_callback();
    let manager = MemtableManager::new(Memtable::new(), 1, 1, 1, cb);
    manager.apply(Entry::put(b"a".to_vec(), b"1".to_vec(), 1)).unwrap();
    manager.apply(Entry::put(b"b".to_vec(), b"2".to_vec(), 2)).unwrap();
    manager.apply(Entry::put(b"c".to_vec(), b"3".to_vec(), 3)).unwrap();

    assert!(manager.stats().unwrap().backpressure_flushes >= 1);
    assert!(!flushed.lock().unwrap().is_empty());
    manager.close();
}

#[test]
fn flush_active_sync_returns_none_when_empty() {
    init_tracing();
    let (cb, _) = recording_callback();
    let manager = MemtableManager::new(Memtable::new(), 1024, 4, 1, cb);
    assert!(manager.flush_active_sync().unwrap().is_none());
    manager.close();
}

#[test]
fn force_flush_all_drains_active_and_immutable() {
    init_tracing();
    let (cb, flushed) = recording_callback();
    let manager = MemtableManager::new(Memtable::new(), 1024, 4, 1, cb);
    manager.apply(Entry::put(b"a".to_vec(), b"1".to_vec(), 1)).unwrap();
    manager.force_flush_all().unwrap();

    let stats = manager.stats().unwrap();
    assert_eq!(stats.active_entries, 0);
    assert_eq!(stats.immutable_memtables, 0);
    assert_eq!(flushed.lock().unwrap().len(), 1);
    manager.close();
}

#[test]
fn recovered_active_memtable_is_visible_immediately() {
    init_tracing();
    let (cb, _) = recording_callback();
    let mut recovered = Memtable::new();
    recovered.insert(Entry::put(b"recovered".to_vec(), b"v".to_vec(), 1));
    let manager = MemtableManager::new(recovered, 1024, 4, 1, cb);
    assert_eq!(
        manager.get(b"recovered").unwrap(),
        MemtableGetResult::Live(b"v".to_vec())
    );
    manager.close();
}
