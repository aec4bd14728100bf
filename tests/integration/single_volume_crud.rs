use std::sync::Arc;

use tempfile::TempDir;
use tessera::{CommitPolicy, Config, Direction, Engine, Key, TreeCursor, VolumeSpec};

fn string_key(s: &str) -> Key {
    let mut key = Key::new();
    key.append_string(s);
    key
}

fn open_engine(dir: &TempDir) -> Arc<Engine> {
    let config = Config::new(dir.path())
        .with_page_size(16384)
        .with_volume(VolumeSpec::new(dir.path().join("crud.v01")));
    Engine::open(config).expect("open engine")
}

#[test]
fn store_traverse_remove_roundtrip() {
    let dir = TempDir::new().expect("tempdir");
    let engine = open_engine(&dir);
    let tree = engine.tree("crud", "t", true).expect("tree");

    let mut txn = engine.begin().expect("begin");
    txn.store(&tree, &string_key("apple"), &[0x01]).expect("store");
    txn.store(&tree, &string_key("banana"), &[0x02]).expect("store");
    txn.store(&tree, &string_key("cherry"), &[0x03]).expect("store");
    txn.commit(CommitPolicy::Group).expect("commit");

    let txn = engine.begin().expect("begin reader");
    let mut cursor = TreeCursor::new(Arc::clone(&tree));
    let mut seen = Vec::new();
    while let Some((key, value)) = txn.traverse(&mut cursor, Direction::Gt, None).expect("traverse") {
        seen.push((key, value));
    }
    assert_eq!(
        seen,
        vec![
            (string_key("apple"), vec![0x01]),
            (string_key("banana"), vec![0x02]),
            (string_key("cherry"), vec![0x03]),
        ]
    );
    drop(txn);

    let mut txn = engine.begin().expect("begin remover");
    assert!(txn.remove(&tree, &string_key("banana")).expect("remove"));
    txn.commit(CommitPolicy::Group).expect("commit remove");

    let txn = engine.begin().expect("begin reader 2");
    let mut cursor = TreeCursor::new(Arc::clone(&tree));
    let mut seen = Vec::new();
    while let Some((key, value)) = txn.traverse(&mut cursor, Direction::Gt, None).expect("traverse") {
        seen.push((key, value));
    }
    assert_eq!(
        seen,
        vec![
            (string_key("apple"), vec![0x01]),
            (string_key("cherry"), vec![0x03]),
        ]
    );
    drop(txn);

    let report = engine.integrity_check("crud", "t").expect("integrity");
    assert!(!report.has_faults(), "faults: {:?}", report.faults);
    engine.close().expect("close");
}

#[test]
fn fetch_by_direction_eq() {
    let dir = TempDir::new().expect("tempdir");
    let engine = open_engine(&dir);
    let tree = engine.tree("crud", "t", true).expect("tree");

    let mut txn = engine.begin().expect("begin");
    txn.store(&tree, &string_key("only"), b"value").expect("store");
    txn.commit(CommitPolicy::Group).expect("commit");

    let txn = engine.begin().expect("reader");
    let mut cursor = TreeCursor::new(Arc::clone(&tree));
    cursor.seek(&string_key("only"));
    let hit = txn
        .traverse(&mut cursor, Direction::Eq, None)
        .expect("traverse");
    assert_eq!(hit, Some((string_key("only"), b"value".to_vec())));

    cursor.seek(&string_key("absent"));
    assert_eq!(txn.traverse(&mut cursor, Direction::Eq, None).expect("traverse"), None);
    drop(txn);
    engine.close().expect("close");
}
