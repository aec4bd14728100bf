//! Engine lifecycle and shared context.
//!
//! One `Engine` owns every subsystem: the timestamp allocator, the
//! transaction index, the journal, the buffer pool, the volume and tree
//! registries, and the background workers (page writer, journal flusher,
//! checkpointer, cleanup manager, active-transaction-cache poller). All of
//! it hangs off one `EngineContext` so internal layers take a single
//! context reference instead of owning each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::cleanup::{self, CleanupAction, CleanupManager, Checkpointer};
use crate::config::{CommitPolicy, Config};
use crate::error::{Error, Result};
use crate::integrity::{self, IntegrityReport};
use crate::journal::JournalManager;
use crate::timestamp::TimestampAllocator;
use crate::tree::{self, cursor::TreeCursor, directory, Tree};
use crate::txn::index::TransactionIndex;
use crate::txn::Transaction;
use crate::volume::Volume;

pub(crate) type AccumulatorKey = (u64, String, u32);
pub(crate) type AccumulatorMap = FxHashMap<AccumulatorKey, i64>;

/// Shared state every subsystem reaches through.
pub struct EngineContext {
    pub config: Config,
    pub allocator: Arc<TimestampAllocator>,
    pub txn_index: Arc<TransactionIndex>,
    pub journal: Arc<JournalManager>,
    pub pool: BufferPool,
    volumes: Mutex<FxHashMap<u64, Arc<Volume>>>,
    trees: Mutex<FxHashMap<(u64, String), Arc<Tree>>>,
    /// Accumulator totals; doubles as the commit gate ordering commits
    /// against checkpoints.
    accumulators: Mutex<AccumulatorMap>,
    /// At most one checkpoint runs at a time (copy-back writes volume
    /// pages directly).
    checkpoint_lock: Mutex<()>,
    /// Serializes tree create/open/remove admin operations.
    tree_admin: Mutex<()>,
    cleanup_tx: Mutex<Option<Sender<CleanupAction>>>,
}

impl EngineContext {
    pub(crate) fn new(config: Config) -> Result<Self> {
        let allocator = Arc::new(TimestampAllocator::new());
        let txn_index = Arc::new(TransactionIndex::new(
            Arc::clone(&allocator),
            512,
            config.max_free_list_size,
            config.long_running_threshold,
        ));
        let journal = Arc::new(JournalManager::open(
            config.journal_prefix(),
            config.page_size,
            config.journal_segment_size,
            config.append_only,
        )?);
        let pool = BufferPool::new(config.page_size, config.buffer_count, Arc::clone(&journal));
        Ok(Self {
            config,
            allocator,
            txn_index,
            journal,
            pool,
            volumes: Mutex::new(FxHashMap::default()),
            trees: Mutex::new(FxHashMap::default()),
            accumulators: Mutex::new(FxHashMap::default()),
            checkpoint_lock: Mutex::new(()),
            tree_admin: Mutex::new(()),
            cleanup_tx: Mutex::new(None),
        })
    }

    pub(crate) fn enqueue_cleanup(&self, action: CleanupAction) {
        if let Some(sender) = &*self.cleanup_tx.lock() {
            let _ = sender.send(action);
        }
    }

    pub(crate) fn register_volume(&self, volume: Arc<Volume>) {
        self.volumes.lock().insert(volume.id(), volume);
    }

    pub fn volume_by_id(&self, volume_id: u64) -> Option<Arc<Volume>> {
        self.volumes.lock().get(&volume_id).cloned()
    }

    pub fn volume_by_name(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes
            .lock()
            .values()
            .find(|v| v.name() == name)
            .cloned()
    }

    pub(crate) fn volumes_snapshot(&self) -> FxHashMap<u64, Arc<Volume>> {
        self.volumes.lock().clone()
    }

    pub(crate) fn tree(&self, volume_id: u64, name: &str) -> Option<Arc<Tree>> {
        self.trees.lock().get(&(volume_id, name.to_owned())).cloned()
    }

    pub(crate) fn registered_trees(&self) -> Vec<Arc<Tree>> {
        self.trees.lock().values().cloned().collect()
    }

    /// The shared directory-tree instance of a volume. One instance per
    /// volume so every directory writer serializes on the same latch.
    pub(crate) fn cached_directory_tree(&self, volume: &Arc<Volume>) -> Arc<Tree> {
        let mut trees = self.trees.lock();
        let key = (volume.id(), directory::DIRECTORY_TREE_NAME.to_owned());
        if let Some(tree) = trees.get(&key) {
            return Arc::clone(tree);
        }
        let tree = Arc::new(Tree::new(
            directory::DIRECTORY_TREE_NAME,
            Arc::clone(volume),
            0,
            volume.directory_root(),
            1,
            true,
        ));
        trees.insert(key, Arc::clone(&tree));
        tree
    }

    /// Opens (or, when `create` is set, creates) a named tree.
    ///
    /// Serialized per engine so two racing creators cannot both allocate a
    /// root; the registry lock itself is never held across page I/O.
    pub(crate) fn open_tree(
        self: &Arc<Self>,
        volume: &Arc<Volume>,
        name: &str,
        create: bool,
    ) -> Result<Arc<Tree>> {
        if name == directory::DIRECTORY_TREE_NAME {
            return Err(Error::InvalidArgument(
                "the directory tree is not directly accessible".into(),
            ));
        }
        let _admin = self.tree_admin.lock();
        if let Some(tree) = self.tree(volume.id(), name) {
            return Ok(tree);
        }
        let tree = match directory::read_tree_record(self, volume, name)? {
            Some((root, depth, _recorded_handle)) => {
                let handle = self.journal.tree_handle(volume, name)?;
                Arc::new(Tree::new(name, Arc::clone(volume), handle, root, depth, false))
            }
            None => {
                if !create {
                    return Err(Error::NotFound(format!(
                        "tree {name} in volume {}",
                        volume.name()
                    )));
                }
                if volume.is_read_only() {
                    return Err(Error::ReadOnly(format!(
                        "cannot create tree {name} in read-only volume {}",
                        volume.name()
                    )));
                }
                let handle = self.journal.tree_handle(volume, name)?;
                let root = tree::create_tree_root(self, volume)?;
                let tree = Arc::new(Tree::new(name, Arc::clone(volume), handle, root, 1, false));
                directory::write_tree_record(self, &tree)?;
                debug!(tree = name, volume = volume.name(), "tree created");
                tree
            }
        };
        self.trees
            .lock()
            .insert((volume.id(), name.to_owned()), Arc::clone(&tree));
        Ok(tree)
    }

    /// Drops a tree: directory records, registry entry, then every page.
    pub(crate) fn drop_tree(self: &Arc<Self>, tree: &Arc<Tree>) -> Result<()> {
        if tree.is_directory() {
            return Err(Error::InvalidArgument(
                "the directory tree cannot be removed".into(),
            ));
        }
        let _admin = self.tree_admin.lock();
        let volume = Arc::clone(tree.volume());
        self.trees
            .lock()
            .remove(&(volume.id(), tree.name().to_owned()));
        directory::remove_tree_records(self, &volume, tree.name())?;
        tree::release_tree_pages(self, tree)?;
        {
            let mut accumulators = self.accumulators.lock();
            accumulators.retain(|(vid, tname, _), _| {
                !(*vid == volume.id() && tname == tree.name())
            });
        }
        info!(tree = tree.name(), volume = volume.name(), "tree removed");
        Ok(())
    }

    /// The commit gate: commits fold accumulator deltas and allocate their
    /// commit timestamp under this lock; the checkpointer snapshots totals
    /// and allocates the checkpoint timestamp under it.
    pub(crate) fn commit_gate(&self) -> MutexGuard<'_, AccumulatorMap> {
        self.accumulators.lock()
    }

    /// Serializes whole checkpoints.
    pub(crate) fn checkpoint_guard(&self) -> MutexGuard<'_, ()> {
        self.checkpoint_lock.lock()
    }

    /// Ensures a total is seeded from its directory record, then returns it.
    pub(crate) fn seed_total_locked(
        self: &Arc<Self>,
        map: &mut AccumulatorMap,
        volume: &Arc<Volume>,
        tree_name: &str,
        index: u32,
    ) -> Result<i64> {
        let key = (volume.id(), tree_name.to_owned(), index);
        if let Some(&total) = map.get(&key) {
            return Ok(total);
        }
        let total = directory::read_total(self, volume, tree_name, index)?.unwrap_or(0);
        map.insert(key, total);
        Ok(total)
    }

    /// Live accumulator total (committed folds only).
    pub fn accumulator_total(
        self: &Arc<Self>,
        volume: &Arc<Volume>,
        tree_name: &str,
        index: u32,
    ) -> Result<i64> {
        let mut map = self.accumulators.lock();
        self.seed_total_locked(&mut map, volume, tree_name, index)
    }

    /// Writes every in-memory total to the directory. Caller holds the
    /// commit gate.
    pub(crate) fn persist_totals_locked(self: &Arc<Self>, map: &AccumulatorMap) -> Result<()> {
        for (&(volume_id, ref tree_name, index), &total) in map.iter() {
            let Some(volume) = self.volume_by_id(volume_id) else {
                continue;
            };
            if volume.is_read_only() {
                continue;
            }
            directory::write_total(self, &volume, tree_name, index, total)?;
        }
        Ok(())
    }
}

pub struct Engine {
    ctx: Arc<EngineContext>,
    cleanup: Mutex<Option<CleanupManager>>,
    checkpointer: Mutex<Option<Checkpointer>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Engine {
    /// Opens volumes and journal, runs recovery, and starts the background
    /// workers.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.datapath)?;
        let page_size = config.page_size;
        let volume_specs = config.volumes.clone();
        let ctx = Arc::new(EngineContext::new(config)?);

        for spec in &volume_specs {
            let mut spec = spec.clone();
            if spec.path.is_relative() {
                spec.path = ctx.config.datapath.join(&spec.path);
            }
            let volume = Arc::new(Volume::open_or_create(&spec, page_size)?);
            self_check_unique_name(&ctx, &volume)?;
            if !volume.is_read_only() {
                ctx.journal.volume_handle(&volume)?;
            }
            ctx.register_volume(volume);
        }

        crate::recovery::recover(&ctx)?;

        let engine = Arc::new(Self {
            ctx: Arc::clone(&ctx),
            cleanup: Mutex::new(None),
            checkpointer: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        });
        engine.start_workers();
        info!("engine open");
        Ok(engine)
    }

    fn start_workers(self: &Arc<Self>) {
        let ctx = &self.ctx;

        let cleanup = CleanupManager::spawn(
            Arc::clone(ctx),
            Duration::from_millis(ctx.config.cleanup_interval_ms.max(1)),
        );
        *ctx.cleanup_tx.lock() = Some(cleanup.sender());
        *self.cleanup.lock() = Some(cleanup);

        *self.checkpointer.lock() = Some(Checkpointer::spawn(
            Arc::clone(ctx),
            Duration::from_secs(ctx.config.checkpoint_interval_s.max(1)),
        ));

        let mut workers = self.workers.lock();

        // Page writer: drains dirty buffers to the journal.
        {
            let ctx = Arc::clone(ctx);
            let shutdown = Arc::clone(&self.shutdown);
            workers.push(
                thread::Builder::new()
                    .name("tessera-page-writer".into())
                    .spawn(move || {
                        while !shutdown.load(Ordering::SeqCst) {
                            if let Err(err) = ctx.pool.write_dirty_pages(None) {
                                warn!(%err, "page writer pass failed");
                            }
                            thread::sleep(Duration::from_millis(50));
                        }
                    })
                    .expect("spawn page writer"),
            );
        }

        // Journal flusher: bounds how long a SOFT commit stays volatile.
        {
            let ctx = Arc::clone(ctx);
            let shutdown = Arc::clone(&self.shutdown);
            let interval = Duration::from_millis(ctx.config.journal_flush_interval_ms.max(1));
            workers.push(
                thread::Builder::new()
                    .name("tessera-journal-flush".into())
                    .spawn(move || {
                        while !shutdown.load(Ordering::SeqCst) {
                            if let Err(err) = ctx.journal.flush() {
                                warn!(%err, "journal flush failed");
                                break;
                            }
                            thread::sleep(interval);
                        }
                    })
                    .expect("spawn journal flusher"),
            );
        }

        // Active-transaction-cache poller.
        {
            let ctx = Arc::clone(ctx);
            let shutdown = Arc::clone(&self.shutdown);
            let interval = Duration::from_millis(ctx.config.cache_poll_interval_ms.max(1));
            workers.push(
                thread::Builder::new()
                    .name("tessera-txn-cache".into())
                    .spawn(move || {
                        while !shutdown.load(Ordering::SeqCst) {
                            ctx.txn_index.refresh_cache();
                            thread::sleep(interval);
                        }
                    })
                    .expect("spawn cache poller"),
            );
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn volume(&self, name: &str) -> Result<Arc<Volume>> {
        self.ctx
            .volume_by_name(name)
            .ok_or_else(|| Error::NotFound(format!("volume {name}")))
    }

    /// Opens a tree, creating it when `create` is set.
    pub fn tree(&self, volume_name: &str, tree_name: &str, create: bool) -> Result<Arc<Tree>> {
        let volume = self.volume(volume_name)?;
        self.ctx.open_tree(&volume, tree_name, create)
    }

    /// Names of every tree recorded in a volume's directory.
    pub fn tree_names(&self, volume_name: &str) -> Result<Vec<String>> {
        let volume = self.volume(volume_name)?;
        let directory = directory::directory_tree(&self.ctx, &volume);
        let mut cursor = TreeCursor::new(directory);
        let mut names = Vec::new();
        let mut anchor = crate::key::Key::new();
        anchor.append_string("root");
        cursor.seek(&anchor);
        while let Some((key, _)) = cursor.traverse(
            &self.ctx,
            tree::cursor::Direction::Gt,
            tree::Visibility::System,
            None,
        )? {
            let mut segments = key.segments();
            match segments.next()? {
                Some(crate::key::Segment::String(class)) if class == "root" => {}
                _ => break,
            }
            if let Some(crate::key::Segment::String(name)) = segments.next()? {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Starts a top-level transaction.
    pub fn begin(self: &Arc<Self>) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.ctx))
    }

    /// Runs `work` in a transaction, retrying `Rollback`/`Timeout` up to
    /// `retries` times, committing with `policy` on success.
    pub fn transact<T, F>(self: &Arc<Self>, policy: CommitPolicy, retries: usize, work: F) -> Result<T>
    where
        F: Fn(&mut Transaction) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let mut txn = self.begin()?;
            match work(&mut txn).and_then(|out| txn.commit(policy).map(|_| out)) {
                Ok(out) => return Ok(out),
                Err(err) if err.is_retryable() && attempt < retries => {
                    attempt += 1;
                    if txn.is_active() {
                        let _ = txn.rollback();
                    }
                    let _ = txn.end();
                    debug!(attempt, %err, "transaction retry");
                }
                Err(err) => {
                    if txn.is_active() {
                        let _ = txn.rollback();
                    }
                    let _ = txn.end();
                    return Err(err);
                }
            }
        }
    }

    /// Takes a checkpoint now.
    pub fn checkpoint(&self) -> Result<()> {
        cleanup::run_checkpoint(&self.ctx)
    }

    /// Journals every dirty page and forces the journal.
    pub fn flush(&self) -> Result<()> {
        self.ctx.pool.write_dirty_pages(None)?;
        self.ctx.journal.flush()
    }

    /// Synchronously prunes every MVV in a tree (the cleanup manager does
    /// the same work incrementally in the background).
    pub fn prune(&self, volume_name: &str, tree_name: &str) -> Result<usize> {
        self.ctx.txn_index.refresh_cache();
        let tree = self.tree(volume_name, tree_name, false)?;
        tree::prune_tree(&self.ctx, &tree)
    }

    /// Offline structural verification of one tree.
    pub fn integrity_check(&self, volume_name: &str, tree_name: &str) -> Result<IntegrityReport> {
        let tree = self.tree(volume_name, tree_name, false)?;
        integrity::check_tree(&self.ctx, &tree)
    }

    /// Structural verification of a whole volume, including the page
    /// accounting invariant.
    pub fn integrity_check_volume(&self, volume_name: &str) -> Result<IntegrityReport> {
        let volume = self.volume(volume_name)?;
        integrity::check_volume(&self.ctx, &volume, &self.tree_names(volume_name)?)
    }

    /// Stops workers, takes a final checkpoint, and releases everything.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup.shutdown();
        }
        let final_checkpoint = cleanup::run_checkpoint(&self.ctx);
        if let Err(err) = &final_checkpoint {
            warn!(%err, "final checkpoint failed; journal replay will cover it");
        }
        if let Some(checkpointer) = self.checkpointer.lock().take() {
            checkpointer.shutdown();
        }
        self.ctx.journal.flush()?;
        info!("engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(err) = self.close() {
                warn!(%err, "engine close on drop failed");
            }
        }
    }
}

fn self_check_unique_name(ctx: &Arc<EngineContext>, volume: &Arc<Volume>) -> Result<()> {
    if ctx.volume_by_name(volume.name()).is_some() {
        return Err(Error::InvalidArgument(format!(
            "duplicate volume name {}",
            volume.name()
        )));
    }
    Ok(())
}
