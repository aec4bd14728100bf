use tempfile::TempDir;
use tessera::{CommitPolicy, Config, Engine, Key, VolumeSpec};

fn key_k() -> Key {
    let mut key = Key::new();
    key.append_string("k");
    key
}

#[test]
fn oversized_value_spills_and_is_reclaimed() {
    let dir = TempDir::new().expect("tempdir");
    let mut spec = VolumeSpec::new(dir.path().join("long.v01"));
    spec.initial_pages = 64;
    let config = Config::new(dir.path())
        .with_page_size(1024)
        .with_volume(spec);
    let engine = Engine::open(config).expect("open engine");
    let tree = engine.tree("long", "t", true).expect("tree");
    let volume = engine.volume("long").expect("volume");

    let garbage_before = volume
        .garbage_page_count(&engine.context().pool)
        .expect("garbage before");

    // 8 KiB across 1 KiB pages: at least eight chain pages.
    let big: Vec<u8> = (0..=8191u32).map(|i| (i % 253) as u8).collect();
    let mut txn = engine.begin().expect("begin");
    txn.store(&tree, &key_k(), &big).expect("store big");
    txn.commit(CommitPolicy::Hard).expect("commit");

    let txn = engine.begin().expect("reader");
    let fetched = txn.fetch(&tree, &key_k()).expect("fetch").expect("present");
    assert_eq!(fetched, big);
    drop(txn);

    // The spill allocated at least eight chain pages beyond the tree root.
    let allocated = volume.next_available_page();
    assert!(allocated >= 2 + 1 + 8, "chain pages allocated: {allocated}");

    // Remove, then prune: the chain lands on the garbage chain.
    let mut txn = engine.begin().expect("remover");
    assert!(txn.remove(&tree, &key_k()).expect("remove"));
    txn.commit(CommitPolicy::Hard).expect("commit remove");

    engine.prune("long", "t").expect("prune");
    let txn = engine.begin().expect("reader 2");
    assert_eq!(txn.fetch(&tree, &key_k()).expect("fetch"), None);
    drop(txn);

    let garbage_after = volume
        .garbage_page_count(&engine.context().pool)
        .expect("garbage after");
    assert!(
        garbage_after >= garbage_before + 8,
        "spilled chain not reclaimed: {garbage_before} -> {garbage_after}"
    );

    let report = engine.integrity_check_volume("long").expect("integrity");
    assert!(!report.has_faults(), "faults: {:?}", report.faults);
    engine.close().expect("close");
}
