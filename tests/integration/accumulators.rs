use tempfile::TempDir;
use tessera::{CommitPolicy, Config, Engine, Key, VolumeSpec};

fn config_for(dir: &TempDir) -> Config {
    Config::new(dir.path()).with_volume(VolumeSpec::new(dir.path().join("acc.v01")))
}

fn row_key(i: i64) -> Key {
    let mut key = Key::new();
    key.append_long(i);
    key
}

#[test]
fn deltas_fold_at_commit_only() {
    let dir = TempDir::new().expect("tempdir");
    let engine = Engine::open(config_for(&dir)).expect("open");
    let tree = engine.tree("acc", "rows", true).expect("tree");
    let volume = engine.volume("acc").expect("volume");

    let mut txn = engine.begin().expect("begin");
    for i in 0..10 {
        txn.store(&tree, &row_key(i), b"row").expect("store");
        txn.update_accumulator(&tree, 0, 1).expect("delta");
    }
    // The transaction sees its own pending delta; the shared total does not.
    assert_eq!(txn.accumulator_snapshot(&tree, 0).expect("snapshot"), 10);
    assert_eq!(
        engine.context().accumulator_total(&volume, "rows", 0).expect("total"),
        0
    );
    txn.commit(CommitPolicy::Group).expect("commit");
    assert_eq!(
        engine.context().accumulator_total(&volume, "rows", 0).expect("total"),
        10
    );
    engine.close().expect("close");
}

#[test]
fn rolled_back_deltas_vanish() {
    let dir = TempDir::new().expect("tempdir");
    let engine = Engine::open(config_for(&dir)).expect("open");
    let tree = engine.tree("acc", "rows", true).expect("tree");
    let volume = engine.volume("acc").expect("volume");

    let mut txn = engine.begin().expect("begin");
    txn.update_accumulator(&tree, 0, 7).expect("delta");
    txn.rollback().expect("rollback");
    assert_eq!(
        engine.context().accumulator_total(&volume, "rows", 0).expect("total"),
        0
    );
    engine.close().expect("close");
}

#[test]
fn totals_survive_close_and_reopen() {
    let dir = TempDir::new().expect("tempdir");
    {
        let engine = Engine::open(config_for(&dir)).expect("open");
        let tree = engine.tree("acc", "rows", true).expect("tree");
        for batch in 0..5i64 {
            let mut txn = engine.begin().expect("begin");
            txn.store(&tree, &row_key(batch), b"row").expect("store");
            txn.update_accumulator(&tree, 0, 1).expect("count");
            txn.update_accumulator(&tree, 1, batch).expect("sum");
            txn.commit(CommitPolicy::Hard).expect("commit");
        }
        engine.close().expect("close");
    }
    let engine = Engine::open(config_for(&dir)).expect("reopen");
    let volume = engine.volume("acc").expect("volume");
    assert_eq!(
        engine.context().accumulator_total(&volume, "rows", 0).expect("count"),
        5
    );
    assert_eq!(
        engine.context().accumulator_total(&volume, "rows", 1).expect("sum"),
        0 + 1 + 2 + 3 + 4
    );
    engine.close().expect("close");
}
