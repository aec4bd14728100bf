//! Background maintenance: the cleanup manager and the checkpointer.
//!
//! Both run the same worker shape: an mpsc-fed loop with a `recv_timeout`
//! cadence, explicit Trigger/Shutdown messages, and cooperative exit. The
//! cleanup manager drains prune and index-hole-repair actions and flushes
//! dirty tree statistics; the checkpointer periodically drives the
//! journal's checkpoint protocol.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::EngineContext;
use crate::error::Result;
use crate::tree::{self, directory};
use crate::value::PageAddr;

#[derive(Debug)]
pub enum CleanupAction {
    /// Prune every MVV on a data page; free what falls out.
    PruneMvv {
        volume_id: u64,
        tree_name: String,
        page: PageAddr,
    },
    /// Re-insert a missing separator for `page` into its parent.
    IndexHole {
        volume_id: u64,
        tree_name: String,
        page: PageAddr,
        level: u8,
    },
    /// Write dirty tree statistics to the directory.
    FlushStats,
    Shutdown,
}

pub struct CleanupManager {
    sender: Sender<CleanupAction>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CleanupManager {
    pub fn spawn(ctx: Arc<EngineContext>, interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("tessera-cleanup".into())
            .spawn(move || Self::run(ctx, receiver, interval))
            .expect("spawn cleanup thread");
        Self {
            sender,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> Sender<CleanupAction> {
        self.sender.clone()
    }

    fn run(ctx: Arc<EngineContext>, receiver: Receiver<CleanupAction>, interval: Duration) {
        loop {
            match receiver.recv_timeout(interval) {
                Ok(CleanupAction::Shutdown) => break,
                Ok(action) => {
                    if let Err(err) = Self::perform(&ctx, action) {
                        warn!(%err, "cleanup action failed");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = Self::perform(&ctx, CleanupAction::FlushStats) {
                        warn!(%err, "statistics flush failed");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("cleanup manager stopped");
    }

    fn perform(ctx: &Arc<EngineContext>, action: CleanupAction) -> Result<()> {
        match action {
            CleanupAction::PruneMvv {
                volume_id,
                tree_name,
                page,
            } => {
                if let Some(tree) = ctx.tree(volume_id, &tree_name) {
                    tree::prune_page(ctx, &tree, page)?;
                }
                Ok(())
            }
            CleanupAction::IndexHole {
                volume_id,
                tree_name,
                page,
                level: _,
            } => {
                if let Some(tree) = ctx.tree(volume_id, &tree_name) {
                    tree::repair_index_hole(ctx, &tree, page)?;
                }
                Ok(())
            }
            CleanupAction::FlushStats => {
                for tree in ctx.registered_trees() {
                    if tree.is_directory() {
                        continue;
                    }
                    if tree.stats.dirty.load(std::sync::atomic::Ordering::Relaxed) {
                        directory::write_stats(ctx, &tree)?;
                    }
                }
                Ok(())
            }
            CleanupAction::Shutdown => Ok(()),
        }
    }

    pub fn shutdown(mut self) {
        let _ = self.sender.send(CleanupAction::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        let _ = self.sender.send(CleanupAction::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum CheckpointMessage {
    Run,
    Shutdown,
}

pub struct Checkpointer {
    sender: Sender<CheckpointMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Checkpointer {
    pub fn spawn(ctx: Arc<EngineContext>, interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("tessera-checkpoint".into())
            .spawn(move || Self::run(ctx, receiver, interval))
            .expect("spawn checkpoint thread");
        Self {
            sender,
            handle: Some(handle),
        }
    }

    pub fn trigger(&self) {
        let _ = self.sender.send(CheckpointMessage::Run);
    }

    fn run(ctx: Arc<EngineContext>, receiver: Receiver<CheckpointMessage>, interval: Duration) {
        loop {
            match receiver.recv_timeout(interval) {
                Ok(CheckpointMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(CheckpointMessage::Run) | Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = run_checkpoint(&ctx) {
                        warn!(%err, "checkpoint failed");
                    }
                }
            }
        }
        debug!("checkpointer stopped");
    }

    pub fn shutdown(mut self) {
        let _ = self.sender.send(CheckpointMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        let _ = self.sender.send(CheckpointMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One full checkpoint: persist accumulator totals and volume headers,
/// flush every page dirtied before the checkpoint timestamp, then hand the
/// journal the record group + copy-back + truncation.
pub fn run_checkpoint(ctx: &Arc<EngineContext>) -> Result<()> {
    let _only_one = ctx.checkpoint_guard();
    let volumes = ctx.volumes_snapshot();
    // Totals persist under the commit gate, and the checkpoint timestamp
    // is allocated before releasing it: "folded into the persisted totals"
    // is then exactly "tc < cp_ts", which recovery relies on to re-apply
    // only the deltas the totals miss. The pages written here are dirtied
    // before cp_ts, so the flush below captures them.
    let cp_ts = {
        let gate = ctx.commit_gate();
        ctx.persist_totals_locked(&gate)?;
        for volume in volumes.values() {
            if !volume.is_read_only() {
                volume.set_global_timestamp(ctx.allocator.current());
                volume.write_header(&ctx.pool, ctx.allocator.current())?;
            }
        }
        ctx.allocator.allocate()
    };
    ctx.pool.write_dirty_pages(Some(cp_ts))?;
    let aborted = ctx.txn_index.aborted_with_versions();
    ctx.journal.checkpoint(cp_ts, &volumes, &aborted)?;
    debug!(cp_ts, "checkpoint recorded");
    Ok(())
}
