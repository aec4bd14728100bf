//! Startup recovery.
//!
//! The journal open already scanned every segment: page map, handle maps,
//! finished and unfinished transactions, last checkpoint. This pass turns
//! that into live state. Committed transactions newer than the checkpoint
//! are re-applied through the normal store path with their original version
//! handles (replace-in-place makes the redo idempotent); aborted and
//! unfinished transactions are injected into the transaction index so their
//! leftover versions read as rolled back and eventually prune away.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::engine::EngineContext;
use crate::error::Result;
use crate::journal::{RecoveredOp, RecoveredState};
use crate::key::Key;
use crate::tree::{self, StoreMode, Tree};
use crate::txn::index::TransactionStatus;
use crate::volume::Volume;

pub fn recover(ctx: &Arc<EngineContext>) -> Result<()> {
    let Some(state) = ctx.journal.take_recovered_state() else {
        return Ok(());
    };
    ctx.allocator.bump_to(state.max_timestamp + 1);

    // The file's head page lags the journal between checkpoints: adopt the
    // newest journaled image, and clear the allocator past every page the
    // journal knows about (pages referenced by durable structure always
    // have a durable image of their own).
    for volume in ctx.volumes_snapshot().values() {
        let mut head = vec![0u8; ctx.pool.page_size()];
        if ctx.journal.read_page(volume, 0, &mut head)? {
            let header = crate::volume::header::VolumeHeader::decode(&head)?;
            volume.adopt_header(header)?;
        }
        if let Some(max_page) = ctx.journal.max_mapped_page(volume) {
            volume.ensure_next_available(max_page + 1)?;
        }
    }

    for &(ts, mvv_count) in &state.aborted {
        ctx.txn_index.inject_aborted(ts, mvv_count);
    }

    if state.committed.is_empty() {
        if !state.aborted.is_empty() {
            info!(
                aborted = state.aborted.len(),
                "recovery injected aborted transactions"
            );
        }
        return Ok(());
    }

    let resolver = HandleResolver::new(ctx, &state);
    let mut applied = 0usize;
    for txn in &state.committed {
        let status = Arc::new(TransactionStatus::recovered(txn.ts));
        for op in &txn.ops {
            match op {
                RecoveredOp::Store {
                    tree_handle,
                    step,
                    key,
                    value,
                } => {
                    let Some(tree) = resolver.tree(ctx, *tree_handle, true)? else {
                        continue;
                    };
                    tree::store(
                        ctx,
                        &tree,
                        &Key::from_encoded(key),
                        value,
                        StoreMode::Redo {
                            status: &status,
                            step: *step,
                        },
                    )?;
                }
                RecoveredOp::RemoveRange {
                    tree_handle,
                    step,
                    key1,
                    key2,
                } => {
                    let Some(tree) = resolver.tree(ctx, *tree_handle, false)? else {
                        continue;
                    };
                    tree::remove_range(
                        ctx,
                        &tree,
                        &Key::from_encoded(key1),
                        &Key::from_encoded(key2),
                        StoreMode::Redo {
                            status: &status,
                            step: *step,
                        },
                    )?;
                }
                RecoveredOp::RemoveTree { tree_handle } => {
                    if let Some(tree) = resolver.tree(ctx, *tree_handle, false)? {
                        ctx.drop_tree(&tree)?;
                    }
                }
                RecoveredOp::Delta {
                    tree_handle,
                    index,
                    delta,
                } => {
                    let Some((volume, tree_name)) = resolver.tree_location(*tree_handle) else {
                        continue;
                    };
                    let mut gate = ctx.commit_gate();
                    let seeded = ctx.seed_total_locked(&mut gate, &volume, &tree_name, *index)?;
                    gate.insert((volume.id(), tree_name, *index), seeded + delta);
                }
            }
        }
        applied += 1;
        debug!(ts = txn.ts, tc = txn.commit_ts, "transaction re-applied");
    }
    info!(
        committed = applied,
        aborted = state.aborted.len(),
        checkpoint_ts = state.last_checkpoint_ts,
        "recovery complete"
    );
    Ok(())
}

/// Maps journal handles back to live volumes and trees.
struct HandleResolver {
    volumes: FxHashMap<u32, Arc<Volume>>,
    trees: FxHashMap<u32, (u32, String)>,
}

impl HandleResolver {
    fn new(ctx: &Arc<EngineContext>, state: &RecoveredState) -> Self {
        let mut volumes = FxHashMap::default();
        for intro in &state.volumes {
            match ctx.volume_by_id(intro.volume_id) {
                Some(volume) => {
                    volumes.insert(intro.handle, volume);
                }
                None => warn!(
                    volume = %intro.name,
                    "journal references a volume that is not configured; skipping its records"
                ),
            }
        }
        let trees = state
            .trees
            .iter()
            .map(|intro| (intro.handle, (intro.volume_handle, intro.name.clone())))
            .collect();
        Self { volumes, trees }
    }

    fn tree_location(&self, tree_handle: u32) -> Option<(Arc<Volume>, String)> {
        let (volume_handle, name) = self.trees.get(&tree_handle)?;
        let volume = self.volumes.get(volume_handle)?;
        Some((Arc::clone(volume), name.clone()))
    }

    fn tree(
        &self,
        ctx: &Arc<EngineContext>,
        tree_handle: u32,
        create: bool,
    ) -> Result<Option<Arc<Tree>>> {
        let Some((volume, name)) = self.tree_location(tree_handle) else {
            warn!(tree_handle, "journal references an unknown tree handle");
            return Ok(None);
        };
        match ctx.open_tree(&volume, &name, create) {
            Ok(tree) => Ok(Some(tree)),
            Err(crate::error::Error::NotFound(_)) if !create => Ok(None),
            Err(err) => Err(err),
        }
    }
}
