use tempfile::tempdir;

use super::*;
use crate::config::StoreConfig;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build(dir: &std::path::Path, id: u64, entries: Vec<Entry>, config: &StoreConfig) -> SstableMeta {
    let count = entries.len();
    SstWriter::new(dir, id)
        .build(entries.into_iter(), count, config)
        .unwrap()
}

#[test]
fn build_and_point_lookup_roundtrip() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StoreConfig::default();
    let entries = vec![
        Entry::put(b"a".to_vec(), b"1".to_vec(), 1),
        Entry::put(b"b".to_vec(), b"2".to_vec(), 2),
        Entry::tombstone(b"c".to_vec(), 3),
        Entry::put(b"d".to_vec(), b"4".to_vec(), 4),
    ];
    let meta = build(dir.path(), 1, entries, &config);

    let table = SSTable::open(dir.path().join(meta.dirname.clone()), meta).unwrap();
    assert_eq!(table.get(b"a").unwrap().unwrap().value, Some(b"1".to_vec()));
    assert_eq!(table.get(b"b").unwrap().unwrap().value, Some(b"2".to_vec()));
    assert!(table.get(b"c").unwrap().unwrap().deleted);
    assert_eq!(table.get(b"d").unwrap().unwrap().value, Some(b"4".to_vec()));
    assert!(table.get(b"z").unwrap().is_none());
}

#[test]
fn lookup_outside_key_range_skips_scan() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StoreConfig::default();
    let entries = vec![
        Entry::put(b"m".to_vec(), b"1".to_vec(), 1),
        Entry::put(b"n".to_vec(), b"2".to_vec(), 2),
    ];
    let meta = build(dir.path(), 1, entries, &config);
    let table = SSTable::open(dir.path().join(meta.dirname.clone()), meta).unwrap();

    assert!(table.get(b"a").unwrap().is_none());
    assert!(table.get(b"z").unwrap().is_none());
}

#[test]
fn bloom_negative_avoids_data_scan() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StoreConfig::default();
    let entries = vec![
        Entry::put(b"m".to_vec(), b"1".to_vec(), 1),
        Entry::put(b"n".to_vec(), b"2".to_vec(), 2),
    ];
    let meta = build(dir.path(), 1, entries, &config);
    let table = SSTable::open(dir.path().join(meta.dirname.clone()), meta).unwrap();

    // "mm" falls within [min_key, max_key] but was never inserted, so it
    // must be rejected by the bloom filter rather than the range check.
    assert!(table.get(b"mm").unwrap().is_none());
}

#[test]
fn sparse_index_spans_many_entries() {
    init_tracing();
    let dir = tempdir().unwrap();
    let mut config = StoreConfig::default();
    config.sparse_index_interval = 4;
    let entries: Vec<Entry> = (0..100u32)
        .map(|i| Entry::put(format!("key{i:04}").into_bytes(), format!("v{i}").into_bytes(), i as u64))
        .collect();
    let meta = build(dir.path(), 1, entries, &config);
    let table = SSTable::open(dir.path().join(meta.dirname.clone()), meta).unwrap();

    for i in 0..100u32 {
        let key = format!("key{i:04}").into_bytes();
        let got = table.get(&key).unwrap().unwrap();
        assert_eq!(got.value, Some(format!("v{i}").into_bytes()));
    }
}

#[test]
fn read_all_preserves_key_order() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StoreConfig::default();
    let entries = vec![
        Entry::put(b"a".to_vec(), b"1".to_vec(), 1),
        Entry::put(b"b".to_vec(), b"2".to_vec(), 2),
        Entry::put(b"c".to_vec(), b"3".to_vec(), 3),
    ];
    let meta = build(dir.path(), 1, entries, &config);
    let table = SSTable::open(dir.path().join(meta.dirname.clone()), meta).unwrap();

    let all = table.read_all().unwrap();
    let keys: Vec<&[u8]> = all.iter().map(|e| e.key.as_slice()).collect();
    assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c"]);
}

#[test]
fn special_byte_keys_and_values_roundtrip() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StoreConfig::default();
    let key = b"weird\0key\n|\t".to_vec();
    let value = b"\xff\x00value".to_vec();
    let entries = vec![Entry::put(key.clone(), value.clone(), 1)];
    let meta = build(dir.path(), 1, entries, &config);
    let table = SSTable::open(dir.path().join(meta.dirname.clone()), meta).unwrap();

    let got = table.get(&key).unwrap().unwrap();
    assert_eq!(got.value, Some(value));
}

#[test]
fn build_rejects_empty_entry_set() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StoreConfig::default();
    let err = SstWriter::new(dir.path(), 1)
        .build(std::iter::empty(), 0, &config)
        .unwrap_err();
    assert!(matches!(err, SstableError::Internal(_)));
}

#[test]
fn corrupted_data_file_is_rejected_on_read() {
    init_tracing();
    let dir = tempdir().unwrap();
    let config = StoreConfig::default();
    let entries = vec![Entry::put(b"a".to_vec(), b"1".to_vec(), 1)];
    let meta = build(dir.path(), 1, entries, &config);
    let table_dir = dir.path().join(meta.dirname.clone());

    let (data_path, _, _) = SSTable::file_paths(&table_dir);
    let mut bytes = std::fs::read(&data_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&data_path, bytes).unwrap();

    let table = SSTable::open(table_dir, meta).unwrap();
    let err = table.get(b"a").unwrap_err();
    assert!(matches!(err, SstableError::ChecksumMismatch(_)));
}
