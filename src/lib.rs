//! # Tessera
//!
//! Tessera is an embedded, transactional key-value storage engine. Data
//! lives in B+-trees inside fixed-page volume files; durability comes from
//! an append-only journal with checkpoints; isolation is MVCC snapshot
//! isolation with write-write conflict and deadlock detection.
//!
//! ## Quick start
//!
//! ```no_run
//! use tessera::{CommitPolicy, Config, Engine, Key, VolumeSpec};
//!
//! let config = Config::new("/tmp/tessera-demo")
//!     .with_volume(VolumeSpec::new("demo.v01"));
//! let engine = Engine::open(config)?;
//! let tree = engine.tree("demo", "fruit", true)?;
//!
//! let mut txn = engine.begin()?;
//! let mut key = Key::new();
//! key.append_string("apple");
//! txn.store(&tree, &key, b"crisp")?;
//! txn.commit(CommitPolicy::Hard)?;
//!
//! let txn = engine.begin()?;
//! assert_eq!(txn.fetch(&tree, &key)?, Some(b"crisp".to_vec()));
//! # Ok::<(), tessera::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - **Volumes** (`volume`): one file per volume; a head page, a directory
//!   tree of named trees, a garbage chain of reclaimed pages.
//! - **Buffer pool** (`buffer`): claim-aware page cache feeding a page
//!   writer that journals dirty pages.
//! - **B+-trees** (`tree`): slot-directory pages, long-record spill,
//!   index-hole tolerance and repair, directional cursors.
//! - **MVCC** (`mvv`, `txn`): multi-version values inside data pages, a
//!   bucketed transaction index, snapshot reads, background pruning.
//! - **Journal** (`journal`, `recovery`): single-writer append-only
//!   segments, page and transaction maps, group commit, checkpoints, and
//!   crash recovery with committed-transaction redo.

pub mod buffer;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod journal;
pub mod key;
pub mod logging;
pub mod mvv;
pub mod page;
pub mod recovery;
pub mod timestamp;
pub mod tree;
pub mod txn;
pub mod value;
pub mod volume;

pub use crate::config::{CommitPolicy, Config, VolumeSpec};
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::integrity::IntegrityReport;
pub use crate::key::{Key, Segment};
pub use crate::tree::cursor::{Direction, KeyFilter, RangeTerm, TreeCursor};
pub use crate::tree::Tree;
pub use crate::txn::{Transaction, TxnState};
pub use crate::value::Value;
