//! User-facing transaction scope.
//!
//! A transaction owns its status in the index, a step counter for
//! self-visibility, a record buffer that spills to the journal in chunks,
//! and the accumulator deltas it has not committed yet. Nested `begin`s
//! just deepen a counter; only the outermost commit writes a `TC` record
//! and publishes the commit timestamp.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tracing::warn;

use crate::engine::{AccumulatorKey, EngineContext};
use crate::error::{Error, Result};
use crate::journal::record;
use crate::key::Key;
use crate::mvv::ABORTED;
use crate::tree::cursor::{Direction, KeyFilter, TreeCursor};
use crate::tree::{self, StoreMode, Tree, Visibility};
use crate::txn::index::TransactionStatus;
use crate::config::CommitPolicy;

pub mod index;

/// Records buffered past this size are flushed to the journal as a chunk.
const CHUNK_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}

struct TxnInner {
    status: Arc<TransactionStatus>,
    state: TxnState,
    depth: usize,
    step: u8,
    buffer: BytesMut,
    /// True until the first chunk reaches the journal.
    first_chunk: bool,
    /// True once any chunk reached the journal (a TC must follow).
    journaled: bool,
    /// True once the buffer holds more than the bare TS record.
    wrote_anything: bool,
    pending_deltas: FxHashMap<AccumulatorKey, i64>,
}

pub struct Transaction {
    ctx: Arc<EngineContext>,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(crate) fn begin(ctx: Arc<EngineContext>) -> Result<Self> {
        let status = ctx.txn_index.register_transaction()?;
        let mut buffer = BytesMut::with_capacity(4 * 1024);
        record::encode_txn_start(&mut buffer, status.ts());
        Ok(Self {
            ctx,
            inner: Mutex::new(TxnInner {
                status,
                state: TxnState::Active,
                depth: 1,
                step: 0,
                buffer,
                first_chunk: true,
                journaled: false,
                wrote_anything: false,
                pending_deltas: FxHashMap::default(),
            }),
        })
    }

    pub fn ts(&self) -> i64 {
        self.inner.lock().status.ts()
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// Nested begin: deepens the scope; nothing else happens.
    pub fn begin_nested(&self) {
        self.inner.lock().depth += 1;
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().depth
    }

    pub fn get_step(&self) -> u8 {
        self.inner.lock().step
    }

    pub fn set_step(&self, step: u8) -> Result<u8> {
        if step > crate::mvv::MAX_STEP {
            return Err(Error::InvalidArgument(format!(
                "step {step} above the per-transaction maximum"
            )));
        }
        let mut inner = self.inner.lock();
        let previous = inner.step;
        inner.step = step;
        Ok(previous)
    }

    pub fn increment_step(&self) -> Result<u8> {
        let mut inner = self.inner.lock();
        if inner.step >= crate::mvv::MAX_STEP {
            return Err(Error::InvalidArgument(
                "transaction step counter exhausted".into(),
            ));
        }
        inner.step += 1;
        Ok(inner.step)
    }

    fn ensure_active(inner: &TxnInner) -> Result<()> {
        if inner.state != TxnState::Active {
            return Err(Error::InvalidArgument(
                "transaction is no longer active".into(),
            ));
        }
        Ok(())
    }

    fn ensure_writable_tree(tree: &Tree) -> Result<()> {
        if tree.is_directory() {
            return Err(Error::InvalidArgument(
                "the directory tree is engine-internal".into(),
            ));
        }
        if tree.volume().is_read_only() {
            return Err(Error::ReadOnly(format!(
                "volume {} is read-only",
                tree.volume().name()
            )));
        }
        Ok(())
    }

    /// Flushes the buffered records as one journal chunk when `force` is
    /// set or the chunk limit is reached.
    fn maybe_flush_chunk(&self, inner: &mut TxnInner, force: bool) -> Result<()> {
        if inner.buffer.is_empty() || (!force && inner.buffer.len() < CHUNK_LIMIT) {
            return Ok(());
        }
        let chunk = inner.buffer.split();
        self.ctx
            .journal
            .append_transaction(inner.status.ts(), &chunk, inner.first_chunk)?;
        inner.first_chunk = false;
        inner.journaled = true;
        Ok(())
    }

    /// Stores `value` under `key` in `tree`.
    pub fn store(&self, tree: &Arc<Tree>, key: &Key, value: &[u8]) -> Result<()> {
        Self::ensure_writable_tree(tree)?;
        if value.len() as u64 + 1024 > self.ctx.config.journal_segment_size {
            return Err(Error::InvalidArgument(format!(
                "value of {} bytes exceeds the journal segment size",
                value.len()
            )));
        }
        let mut inner = self.inner.lock();
        Self::ensure_active(&inner)?;
        let (status, step) = (Arc::clone(&inner.status), inner.step);
        tree::store(
            &self.ctx,
            tree,
            key,
            value,
            StoreMode::Transaction {
                status: &status,
                step,
            },
        )?;
        record::StoreRecord {
            ts: status.ts(),
            tree_handle: tree.handle(),
            step,
            key: key.encoded(),
            value,
        }
        .encode(&mut inner.buffer);
        inner.wrote_anything = true;
        self.maybe_flush_chunk(&mut inner, false)
    }

    /// Snapshot-isolated read.
    pub fn fetch(&self, tree: &Arc<Tree>, key: &Key) -> Result<Option<Vec<u8>>> {
        let (ts, step) = {
            let inner = self.inner.lock();
            Self::ensure_active(&inner)?;
            (inner.status.ts(), inner.step)
        };
        tree::fetch(&self.ctx, tree, key, Visibility::Snapshot { ts, step })
    }

    /// Removes one key; true when the key was visible to this transaction.
    pub fn remove(&self, tree: &Arc<Tree>, key: &Key) -> Result<bool> {
        Self::ensure_writable_tree(tree)?;
        let mut inner = self.inner.lock();
        Self::ensure_active(&inner)?;
        let (status, step) = (Arc::clone(&inner.status), inner.step);
        let removed = tree::remove(
            &self.ctx,
            tree,
            key,
            StoreMode::Transaction {
                status: &status,
                step,
            },
        )?;
        // Journal the exact key as a minimal range.
        let mut key2 = key.encoded().to_vec();
        key2.push(0);
        record::DeleteRangeRecord {
            ts: status.ts(),
            tree_handle: tree.handle(),
            step,
            key1: key.encoded(),
            key2: &key2,
        }
        .encode(&mut inner.buffer);
        inner.wrote_anything = true;
        self.maybe_flush_chunk(&mut inner, false)?;
        Ok(removed)
    }

    /// Removes every key in `[key1, key2)`; returns how many were visible.
    pub fn remove_range(&self, tree: &Arc<Tree>, key1: &Key, key2: &Key) -> Result<usize> {
        Self::ensure_writable_tree(tree)?;
        let mut inner = self.inner.lock();
        Self::ensure_active(&inner)?;
        let (status, step) = (Arc::clone(&inner.status), inner.step);
        let removed = tree::remove_range(
            &self.ctx,
            tree,
            key1,
            key2,
            StoreMode::Transaction {
                status: &status,
                step,
            },
        )?;
        record::DeleteRangeRecord {
            ts: status.ts(),
            tree_handle: tree.handle(),
            step,
            key1: key1.encoded(),
            key2: key2.encoded(),
        }
        .encode(&mut inner.buffer);
        inner.wrote_anything = true;
        self.maybe_flush_chunk(&mut inner, false)?;
        Ok(removed)
    }

    /// Drops a whole tree. The removal itself is immediate (it requires
    /// exclusive use of the tree); the `DT` record makes it replayable.
    pub fn remove_tree(&self, tree: &Arc<Tree>) -> Result<()> {
        Self::ensure_writable_tree(tree)?;
        let mut inner = self.inner.lock();
        Self::ensure_active(&inner)?;
        self.ctx.drop_tree(tree)?;
        record::DeleteTreeRecord {
            ts: inner.status.ts(),
            tree_handle: tree.handle(),
        }
        .encode(&mut inner.buffer);
        inner.wrote_anything = true;
        self.maybe_flush_chunk(&mut inner, false)
    }

    /// Directional traversal under this transaction's snapshot.
    pub fn traverse(
        &self,
        cursor: &mut TreeCursor,
        direction: Direction,
        filter: Option<&KeyFilter>,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        let (ts, step) = {
            let inner = self.inner.lock();
            Self::ensure_active(&inner)?;
            (inner.status.ts(), inner.step)
        };
        cursor.traverse(
            &self.ctx,
            direction,
            Visibility::Snapshot { ts, step },
            filter,
        )
    }

    /// Adds `delta` to a per-tree accumulator; folded into the shared
    /// total at commit.
    pub fn update_accumulator(&self, tree: &Arc<Tree>, index: u32, delta: i64) -> Result<()> {
        Self::ensure_writable_tree(tree)?;
        let mut inner = self.inner.lock();
        Self::ensure_active(&inner)?;
        let key = (tree.volume().id(), tree.name().to_owned(), index);
        *inner.pending_deltas.entry(key).or_insert(0) += delta;
        Ok(())
    }

    /// Committed total plus this transaction's own pending delta.
    pub fn accumulator_snapshot(&self, tree: &Arc<Tree>, index: u32) -> Result<i64> {
        let inner = self.inner.lock();
        Self::ensure_active(&inner)?;
        let committed = self
            .ctx
            .accumulator_total(tree.volume(), tree.name(), index)?;
        let own = inner
            .pending_deltas
            .get(&(tree.volume().id(), tree.name().to_owned(), index))
            .copied()
            .unwrap_or(0);
        Ok(committed + own)
    }

    /// Commits. Nested scopes just pop; the outermost commit journals the
    /// record stream, folds accumulator deltas under the commit gate, and
    /// waits for durability per `policy`.
    pub fn commit(&mut self, policy: CommitPolicy) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_active(&inner)?;
        if inner.depth > 1 {
            inner.depth -= 1;
            return Ok(());
        }

        // Accumulator deltas ride in the journal before the TC record.
        let deltas: Vec<(AccumulatorKey, i64)> = inner
            .pending_deltas
            .iter()
            .map(|(k, &v)| (k.clone(), v))
            .collect();
        let ts = inner.status.ts();
        for ((volume_id, tree_name, index), delta) in &deltas {
            let handle = match self.ctx.volume_by_id(*volume_id) {
                Some(volume) => self.ctx.journal.tree_handle(&volume, tree_name)?,
                None => continue,
            };
            record::DeltaRecord {
                ts,
                tree_handle: handle,
                index: *index,
                delta: *delta,
            }
            .encode(&mut inner.buffer);
            inner.wrote_anything = true;
        }

        if !inner.wrote_anything && !inner.journaled {
            // Read-only transaction: nothing to journal.
            let tc = self.ctx.allocator.allocate();
            self.ctx.txn_index.notify_completed(&inner.status, tc);
            inner.state = TxnState::Committed;
            return Ok(());
        }

        self.maybe_flush_chunk(&mut inner, true)?;

        // The commit gate orders tc allocation + fold against checkpoints.
        let tc = {
            let mut gate = self.ctx.commit_gate();
            let tc = self.ctx.allocator.allocate();
            for ((volume_id, tree_name, index), delta) in &deltas {
                if let Some(volume) = self.ctx.volume_by_id(*volume_id) {
                    let seeded =
                        self.ctx
                            .seed_total_locked(&mut gate, &volume, tree_name, *index)?;
                    gate.insert(
                        (*volume_id, tree_name.clone(), *index),
                        seeded + delta,
                    );
                }
            }
            tc
        };

        let end_address = self.ctx.journal.append_transaction_end(ts, tc)?;
        self.ctx.txn_index.notify_completed(&inner.status, tc);
        inner.state = TxnState::Committed;
        drop(inner);

        self.ctx.journal.wait_for_durability(
            end_address,
            policy,
            Duration::from_nanos(self.ctx.config.transaction_commit_stall_ns),
        )
    }

    /// Rolls back: marks the status aborted and journals the abort marker
    /// so recovery retires any flushed chunks.
    pub fn rollback(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_active(&inner)?;
        let ts = inner.status.ts();
        inner.pending_deltas.clear();
        if inner.journaled {
            // Chunks already reached the journal: a TC(aborted) marker is
            // required so recovery rolls them back.
            self.maybe_flush_chunk(&mut inner, true)?;
            self.ctx.journal.append_transaction_end(ts, ABORTED)?;
        } else {
            inner.buffer.clear();
        }
        self.ctx.txn_index.notify_completed(&inner.status, ABORTED);
        inner.state = TxnState::RolledBack;
        // Versions already written to pages will be pruned; nudge the
        // cleanup manager via the cache poller's next pass.
        Ok(())
    }

    /// Ends the scope. The outermost end of a still-active transaction
    /// rolls it back.
    pub fn end(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.depth > 1 {
            inner.depth -= 1;
            return Ok(());
        }
        if inner.state == TxnState::Active {
            drop(inner);
            warn!("transaction ended without commit; rolling back");
            return self.rollback();
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            warn!(ts = self.ts(), "transaction dropped while active; rolling back");
            if let Err(err) = self.rollback() {
                warn!(%err, "rollback on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("ts", &inner.status.ts())
            .field("state", &inner.state)
            .field("depth", &inner.depth)
            .field("step", &inner.step)
            .finish()
    }
}
