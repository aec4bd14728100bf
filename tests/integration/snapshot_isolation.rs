use tempfile::TempDir;
use tessera::{CommitPolicy, Config, Engine, Key, VolumeSpec};

fn key_x() -> Key {
    let mut key = Key::new();
    key.append_string("x");
    key
}

#[test]
fn reader_keeps_its_snapshot_across_concurrent_commit() {
    let dir = TempDir::new().expect("tempdir");
    let config = Config::new(dir.path()).with_volume(VolumeSpec::new(dir.path().join("si.v01")));
    let engine = Engine::open(config).expect("open engine");
    let tree = engine.tree("si", "t", true).expect("tree");

    // T1 commits v1.
    let mut t1 = engine.begin().expect("t1");
    t1.store(&tree, &key_x(), b"v1").expect("t1 store");
    t1.commit(CommitPolicy::Group).expect("t1 commit");

    // T2 snapshots after T1.
    let mut t2 = engine.begin().expect("t2");
    assert_eq!(t2.fetch(&tree, &key_x()).expect("t2 read"), Some(b"v1".to_vec()));

    // T3 commits v2 while T2 is open.
    let mut t3 = engine.begin().expect("t3");
    t3.store(&tree, &key_x(), b"v2").expect("t3 store");
    t3.commit(CommitPolicy::Group).expect("t3 commit");

    // T2 still sees v1.
    assert_eq!(t2.fetch(&tree, &key_x()).expect("t2 reread"), Some(b"v1".to_vec()));
    t2.commit(CommitPolicy::Group).expect("t2 commit");

    // A fresh transaction sees v2.
    let t4 = engine.begin().expect("t4");
    assert_eq!(t4.fetch(&tree, &key_x()).expect("t4 read"), Some(b"v2".to_vec()));
    drop(t4);
    engine.close().expect("close");
}

#[test]
fn uncommitted_writes_stay_invisible() {
    let dir = TempDir::new().expect("tempdir");
    let config = Config::new(dir.path()).with_volume(VolumeSpec::new(dir.path().join("si2.v01")));
    let engine = Engine::open(config).expect("open engine");
    let tree = engine.tree("si2", "t", true).expect("tree");

    let mut writer = engine.begin().expect("writer");
    writer.store(&tree, &key_x(), b"hidden").expect("store");

    let reader = engine.begin().expect("reader");
    assert_eq!(reader.fetch(&tree, &key_x()).expect("read"), None);
    drop(reader);

    writer.rollback().expect("rollback");

    let reader = engine.begin().expect("reader 2");
    assert_eq!(reader.fetch(&tree, &key_x()).expect("read"), None);
    drop(reader);
    engine.close().expect("close");
}
