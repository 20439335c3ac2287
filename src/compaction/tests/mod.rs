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
    config.max_l0_sstables = 3;
    config.soft_limit_ratio = 1.0;
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
fn install_and_point_lookup() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manager = SstableManager::open(dir.path(), small_config()).unwrap();
    manager
        .add_sstable(vec![Entry::put(b"a".to_vec(), b"1".to_vec(), 1)])
        .unwrap();

    let got = manager.get(b"a").unwrap().unwrap();
    assert_eq!(got.value, Some(b"1".to_vec()));
    manager.close();
}

#[test]
fn newest_l0_sstable_wins_on_conflict() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manager = SstableManager::open(dir.path(), small_config()).unwrap();
    manager
        .add_sstable(vec![Entry::put(b"a".to_vec(), b"old".to_vec(), 1)])
        .unwrap();
    manager
        .add_sstable(vec![Entry::put(b"a".to_vec(), b"new".to_vec(), 2)])
        .unwrap();

    let got = manager.get(b"a").unwrap().unwrap();
    assert_eq!(got.value, Some(b"new".to_vec()));
    manager.close();
}

#[test]
fn tombstone_is_visible_through_get() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manager = SstableManager::open(dir.path(), small_config()).unwrap();
    manager
        .add_sstable(vec![Entry::tombstone(b"a".to_vec(), 1)])
        .unwrap();

    let got = manager.get(b"a").unwrap().unwrap();
    assert!(got.deleted);
    manager.close();
}

#[test]
fn missing_key_returns_none() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manager = SstableManager::open(dir.path(), small_config()).unwrap();
    manager
        .add_sstable(vec![Entry::put(b"a".to_vec(), b"1".to_vec(), 1)])
        .unwrap();
    assert!(manager.get(b"z").unwrap().is_none());
    manager.close();
}

#[test]
fn l0_overflow_triggers_compaction_into_l1() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manager = SstableManager::open(dir.path(), small_config()).unwrap();
    for i in 0..4u64 {
        manager
            .add_sstable(vec![Entry::put(format!("k{i}").into_bytes(), b"v".to_vec(), i)])
            .unwrap();
    }

    wait_for(|| manager.stats().compactions_run > 0);
    let stats = manager.stats();
    let l1 = stats.per_level.iter().find(|l| l.level == 1);
    assert!(l1.is_some());
    manager.close();
}

#[test]
fn full_compaction_merges_all_levels_and_drops_tombstones() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StoreConfig::default();
    let manager = SstableManager::open(dir.path(), config).unwrap();
    manager
        .add_sstable(vec![Entry::put(b"a".to_vec(), b"1".to_vec(), 1)])
        .unwrap();
    manager
        .add_sstable(vec![Entry::tombstone(b"a".to_vec(), 2)])
        .unwrap();

    manager.compact().unwrap();
    assert!(manager.get(b"a").unwrap().is_none());
    manager.close();
}

#[test]
fn reopen_restores_level_map() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let manager = SstableManager::open(dir.path(), small_config()).unwrap();
        manager
            .add_sstable(vec![Entry::put(b"a".to_vec(), b"1".to_vec(), 1)])
            .unwrap();
        manager.close();
    }
    let manager = SstableManager::open(dir.path(), small_config()).unwrap();
    assert_eq!(manager.get(b"a").unwrap().unwrap().value, Some(b"1".to_vec()));
    manager.close();
}

#[test]
fn orphan_directory_is_swept_on_open() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let manager = SstableManager::open(dir.path(), small_config()).unwrap();
        manager
            .add_sstable(vec![Entry::put(b"a".to_vec(), b"1".to_vec(), 1)])
            .unwrap();
        manager.close();
    }

    let orphan_dir = dir.path().join("sstables").join("sstable_999");
    std::fs::create_dir_all(&orphan_dir).unwrap();
    std::fs::write(orphan_dir.join("data"), b"garbage").unwrap();
    assert!(orphan_dir.exists());

    let manager = SstableManager::open(dir.path(), small_config()).unwrap();
    assert!(!orphan_dir.exists());
    manager.close();
}
