use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tessera::{CommitPolicy, Config, Engine, Error, Key, VolumeSpec};

fn key_x() -> Key {
    let mut key = Key::new();
    key.append_string("x");
    key
}

#[test]
fn second_writer_rolls_back_and_retry_wins() {
    let dir = TempDir::new().expect("tempdir");
    let config = Config::new(dir.path()).with_volume(VolumeSpec::new(dir.path().join("ww.v01")));
    let engine = Engine::open(config).expect("open engine");
    let tree = engine.tree("ww", "t", true).expect("tree");

    // T1 writes x and holds its transaction open.
    let mut t1 = engine.begin().expect("t1");
    t1.store(&tree, &key_x(), b"a").expect("t1 store");

    // T2 attempts the same record on another thread; it blocks on the
    // write-write dependency until T1 commits, then must roll back.
    let engine_bg = Arc::clone(&engine);
    let tree_bg = Arc::clone(&tree);
    let contender = thread::spawn(move || {
        engine_bg.transact(CommitPolicy::Group, 5, |txn| {
            txn.store(&tree_bg, &key_x(), b"b")
        })
    });

    thread::sleep(Duration::from_millis(100));
    t1.commit(CommitPolicy::Group).expect("t1 commit");

    // The retry loop absorbs the rollback and lands T2's value.
    contender.join().expect("join").expect("t2 retried to success");

    let reader = engine.begin().expect("reader");
    assert_eq!(reader.fetch(&tree, &key_x()).expect("read"), Some(b"b".to_vec()));
    drop(reader);
    engine.close().expect("close");
}

#[test]
fn conflict_without_retry_surfaces_rollback() {
    let dir = TempDir::new().expect("tempdir");
    let config = Config::new(dir.path()).with_volume(VolumeSpec::new(dir.path().join("ww2.v01")));
    let engine = Engine::open(config).expect("open engine");
    let tree = engine.tree("ww2", "t", true).expect("tree");

    let mut t1 = engine.begin().expect("t1");
    t1.store(&tree, &key_x(), b"first").expect("t1 store");

    let mut t2 = engine.begin().expect("t2");
    t1.commit(CommitPolicy::Group).expect("t1 commit");

    // T1 committed after T2's snapshot: concurrent, so T2 must roll back.
    let err = t2.store(&tree, &key_x(), b"second").expect_err("conflict");
    assert!(matches!(err, Error::Rollback(_)), "got {err:?}");
    assert!(err.is_retryable());
    t2.rollback().expect("rollback");
    engine.close().expect("close");
}
