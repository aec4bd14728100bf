use tempfile::TempDir;
use tessera::{CommitPolicy, Config, Engine, Key, VolumeSpec};

fn key_k() -> Key {
    let mut key = Key::new();
    key.append_string("k");
    key
}

#[test]
fn steps_gate_a_transactions_own_writes() {
    let dir = TempDir::new().expect("tempdir");
    let config = Config::new(dir.path()).with_volume(VolumeSpec::new(dir.path().join("step.v01")));
    let engine = Engine::open(config).expect("open engine");
    let tree = engine.tree("step", "t", true).expect("tree");

    let mut txn = engine.begin().expect("begin");
    txn.store(&tree, &key_k(), b"v0").expect("store v0");
    txn.set_step(1).expect("step 1");
    txn.store(&tree, &key_k(), b"v1").expect("store v1");

    // At step 0 the step-1 write is not yet visible to the transaction
    // itself (the Halloween guard).
    txn.set_step(0).expect("back to 0");
    assert_eq!(txn.fetch(&tree, &key_k()).expect("fetch"), Some(b"v0".to_vec()));

    txn.set_step(1).expect("step 1 again");
    assert_eq!(txn.fetch(&tree, &key_k()).expect("fetch"), Some(b"v1".to_vec()));

    txn.commit(CommitPolicy::Group).expect("commit");

    // After commit the latest step wins for everyone.
    let reader = engine.begin().expect("reader");
    assert_eq!(reader.fetch(&tree, &key_k()).expect("fetch"), Some(b"v1".to_vec()));
    drop(reader);
    engine.close().expect("close");
}

#[test]
fn increment_step_walks_forward_and_is_bounded() {
    let dir = TempDir::new().expect("tempdir");
    let config = Config::new(dir.path()).with_volume(VolumeSpec::new(dir.path().join("step2.v01")));
    let engine = Engine::open(config).expect("open engine");
    let tree = engine.tree("step2", "t", true).expect("tree");

    let mut txn = engine.begin().expect("begin");
    assert_eq!(txn.get_step(), 0);
    for expected in 1..=5u8 {
        assert_eq!(txn.increment_step().expect("increment"), expected);
        txn.store(&tree, &key_k(), format!("s{expected}").as_bytes())
            .expect("store");
    }
    assert_eq!(txn.fetch(&tree, &key_k()).expect("fetch"), Some(b"s5".to_vec()));

    assert!(txn.set_step(100).is_err(), "step must stay below the radix");
    txn.set_step(99).expect("max step");
    assert!(txn.increment_step().is_err());
    txn.commit(CommitPolicy::Group).expect("commit");
    engine.close().expect("close");
}
