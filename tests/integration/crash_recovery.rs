use std::path::PathBuf;
use std::process::{abort, Command};

use tempfile::TempDir;
use tessera::{CommitPolicy, Config, Engine, Key, VolumeSpec};

const KEY_COUNT: usize = 2000;
const CRASH_DB_ENV: &str = "TESSERA_CRASH_DIR";

fn numbered_key(i: usize) -> Key {
    let mut key = Key::new();
    key.append_string("user").append_long(i as i64);
    key
}

fn engine_config(dir: &PathBuf) -> Config {
    let mut spec = VolumeSpec::new(dir.join("crash.v01"));
    spec.initial_pages = 128;
    let mut config = Config::new(dir.clone())
        .with_page_size(4096)
        .with_volume(spec);
    // Small segments exercise rollover and truncation under load.
    config.journal_segment_size = 4 * 1024 * 1024;
    config
}

/// Spawns this test binary in a mode that commits `KEY_COUNT` transactions
/// with HARD durability and then dies without any shutdown path, then
/// reopens the engine and verifies every key.
#[test]
fn hard_commits_survive_a_kill() {
    let dir = TempDir::new().expect("tempdir");
    let status = Command::new(std::env::current_exe().expect("current exe"))
        .env(CRASH_DB_ENV, dir.path())
        .arg("--nocapture")
        .arg("--ignored")
        .arg("crash_child_commits_then_aborts")
        .status()
        .expect("spawn crash child");
    assert!(!status.success(), "the crash child must die abnormally");

    let engine = Engine::open(engine_config(&dir.path().to_path_buf())).expect("reopen");
    let tree = engine.tree("crash", "t", false).expect("tree survives");
    let txn = engine.begin().expect("reader");
    for i in 0..KEY_COUNT {
        let value = txn
            .fetch(&tree, &numbered_key(i))
            .expect("fetch")
            .unwrap_or_else(|| panic!("key {i} lost by the crash"));
        assert_eq!(value, i.to_be_bytes().to_vec(), "key {i} has wrong bytes");
    }
    drop(txn);

    let report = engine.integrity_check("crash", "t").expect("integrity");
    assert!(!report.has_faults(), "faults after recovery: {:?}", report.faults);

    // The accumulator deltas committed by the child also survived.
    let volume = engine.volume("crash").expect("volume");
    let total = engine
        .context()
        .accumulator_total(&volume, "t", 0)
        .expect("total");
    assert_eq!(total, KEY_COUNT as i64);
    engine.close().expect("close");
}

#[test]
#[ignore]
fn crash_child_commits_then_aborts() {
    let dir = PathBuf::from(std::env::var(CRASH_DB_ENV).expect("missing crash dir"));
    let engine = Engine::open(engine_config(&dir)).expect("open");
    let tree = engine.tree("crash", "t", true).expect("tree");
    for i in 0..KEY_COUNT {
        let mut txn = engine.begin().expect("begin");
        txn.store(&tree, &numbered_key(i), &i.to_be_bytes())
            .expect("store");
        txn.update_accumulator(&tree, 0, 1).expect("delta");
        txn.commit(CommitPolicy::Hard).expect("commit");
    }
    // Die with no close, no checkpoint, no flush.
    abort();
}

/// A transaction whose chunks reached the journal but whose commit record
/// did not must roll back on recovery.
#[test]
fn unfinished_transaction_rolls_back_on_recovery() {
    let dir = TempDir::new().expect("tempdir");
    let status = Command::new(std::env::current_exe().expect("current exe"))
        .env(CRASH_DB_ENV, dir.path())
        .arg("--nocapture")
        .arg("--ignored")
        .arg("crash_child_dies_mid_transaction")
        .status()
        .expect("spawn crash child");
    assert!(!status.success(), "the crash child must die abnormally");

    let engine = Engine::open(engine_config(&dir.path().to_path_buf())).expect("reopen");
    let tree = engine.tree("crash", "t", false).expect("tree");
    let txn = engine.begin().expect("reader");

    // The committed marker key is there; the in-flight bulk write is not.
    let mut committed = Key::new();
    committed.append_string("committed");
    assert!(txn.fetch(&tree, &committed).expect("fetch").is_some());
    let mut doomed = Key::new();
    doomed.append_string("doomed");
    assert_eq!(txn.fetch(&tree, &doomed).expect("fetch"), None);
    drop(txn);
    engine.close().expect("close");
}

#[test]
#[ignore]
fn crash_child_dies_mid_transaction() {
    let dir = PathBuf::from(std::env::var(CRASH_DB_ENV).expect("missing crash dir"));
    let engine = Engine::open(engine_config(&dir)).expect("open");
    let tree = engine.tree("crash", "t", true).expect("tree");

    let mut marker = engine.begin().expect("marker txn");
    let mut committed = Key::new();
    committed.append_string("committed");
    marker.store(&tree, &committed, b"yes").expect("store marker");
    marker.commit(CommitPolicy::Hard).expect("commit marker");

    // Push enough records through the open transaction that chunks reach
    // the journal, then die before committing.
    let txn = engine.begin().expect("doomed txn");
    let mut doomed = Key::new();
    doomed.append_string("doomed");
    let filler = vec![0xDDu8; 512];
    txn.store(&tree, &doomed, b"no").expect("store doomed");
    for i in 0..200i64 {
        let mut key = Key::new();
        key.append_string("doomed-bulk").append_long(i);
        txn.store(&tree, &key, &filler).expect("bulk store");
    }
    engine.context().journal.flush().expect("flush journal");
    abort();
}
