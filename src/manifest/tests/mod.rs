use tempfile::tempdir;

use super::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn meta(id: u64) -> SstableMeta {
    SstableMeta {
        id,
        dirname: SstableMeta::dirname_for(id),
        min_key: vec![0],
        max_key: vec![255],
        num_entries: 1,
        size_bytes: 100,
        max_timestamp: id,
    }
}

#[test]
fn next_id_is_monotonic_and_persisted() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manifest = Manifest::open(dir.path()).unwrap();
    assert_eq!(manifest.get_next_id().unwrap(), 0);
    assert_eq!(manifest.get_next_id().unwrap(), 1);
    drop(manifest);

    let reopened = Manifest::open(dir.path()).unwrap();
    assert_eq!(reopened.get_next_id().unwrap(), 2);
}

#[test]
fn add_and_get_level_roundtrip() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manifest = Manifest::open(dir.path()).unwrap();
    manifest.add(0, meta(1)).unwrap();
    manifest.add(0, meta(2)).unwrap();

    let entries = manifest.get_level(0).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, 1);
    assert_eq!(entries[1].id, 2);
}

#[test]
fn remove_drops_matching_ids_only() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manifest = Manifest::open(dir.path()).unwrap();
    manifest.add(0, meta(1)).unwrap();
    manifest.add(0, meta(2)).unwrap();
    manifest.remove(0, &[1]).unwrap();

    let entries = manifest.get_level(0).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, 2);
}

#[test]
fn replace_level_overwrites_entire_list() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manifest = Manifest::open(dir.path()).unwrap();
    manifest.add(1, meta(1)).unwrap();
    manifest.replace_level(1, vec![meta(9)]).unwrap();

    let entries = manifest.get_level(1).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, 9);
}

#[test]
fn state_survives_reopen() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let manifest = Manifest::open(dir.path()).unwrap();
        manifest.add(0, meta(1)).unwrap();
        manifest.add(1, meta(2)).unwrap();
    }
    let manifest = Manifest::open(dir.path()).unwrap();
    assert_eq!(manifest.get_level(0).unwrap().len(), 1);
    assert_eq!(manifest.get_level(1).unwrap().len(), 1);
    assert_eq!(manifest.levels().unwrap(), vec![0, 1]);
}

#[test]
fn all_live_dirnames_spans_every_level() {
    init_tracing();
    let dir = tempdir().unwrap();
    let manifest = Manifest::open(dir.path()).unwrap();
    manifest.add(0, meta(1)).unwrap();
    manifest.add(1, meta(2)).unwrap();

    let mut dirnames = manifest.all_live_dirnames().unwrap();
    dirnames.sort();
    assert_eq!(dirnames, vec![SstableMeta::dirname_for(1), SstableMeta::dirname_for(2)]);
}

#[test]
fn malformed_level_file_is_rejected_on_open() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let manifest = Manifest::open(dir.path()).unwrap();
        manifest.add(0, meta(1)).unwrap();
    }
    std::fs::write(dir.path().join("level_0.json"), b"not json").unwrap();

    let err = Manifest::open(dir.path()).unwrap_err();
    assert!(matches!(err, ManifestError::Malformed { .. }));
}
