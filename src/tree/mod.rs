//! B+-tree operations over pooled pages.
//!
//! Writers serialize per tree on the structure latch and claim pages
//! writer-exclusively; readers run on claims alone. Parents can transiently
//! lack the separator for a freshly split child (after crash recovery);
//! traversal tolerates that by walking right siblings, bounded by
//! `MAX_WALK_RIGHT`, and queues the hole for repair.
//!
//! Values larger than the inline budget spill to chains of long-record
//! pages threaded by right-sibling pointers; the data page keeps a 32-byte
//! stub. Deletes under a transaction write AntiValue versions; physical
//! removal happens in the background pruner.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{Claim, PageGuard};
use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::mvv::{self, StatusView, UNCOMMITTED};
use crate::page::{self, Node, NodeMut, PageType};
use crate::txn::index::{TransactionStatus, TIMED_OUT};
use crate::value::{
    self, LongRecordStub, PageAddr, ValueBody, LONG_RECORD_PREFIX_LEN,
};
use crate::volume::Volume;

pub mod cursor;

/// Right-sibling steps tolerated while resolving an index hole.
pub const MAX_WALK_RIGHT: usize = 1000;

/// Timeout handed to ww-dependency resolution on a conflicting store.
const WW_TIMEOUT: Duration = Duration::from_secs(30);

/// MVV version count past which a prune action is queued.
const PRUNE_VERSION_THRESHOLD: usize = 4;

/// Per-tree live statistics, flushed lazily to the directory tree.
#[derive(Debug, Default)]
pub struct TreeStatistics {
    pub fetch_count: AtomicU64,
    pub store_count: AtomicU64,
    pub remove_count: AtomicU64,
    pub traverse_count: AtomicU64,
    pub dirty: AtomicBool,
}

impl TreeStatistics {
    pub fn snapshot(&self) -> [u64; 4] {
        [
            self.fetch_count.load(Ordering::Relaxed),
            self.store_count.load(Ordering::Relaxed),
            self.remove_count.load(Ordering::Relaxed),
            self.traverse_count.load(Ordering::Relaxed),
        ]
    }

    fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
    }
}

/// A named B+-tree inside a volume.
pub struct Tree {
    name: String,
    volume: Arc<Volume>,
    handle: u32,
    root: AtomicU64,
    depth: AtomicU32,
    is_directory: bool,
    /// Serializes structural writers; readers never take it.
    write_latch: Mutex<()>,
    pub stats: TreeStatistics,
}

impl Tree {
    pub(crate) fn new(
        name: impl Into<String>,
        volume: Arc<Volume>,
        handle: u32,
        root: PageAddr,
        depth: u32,
        is_directory: bool,
    ) -> Self {
        Self {
            name: name.into(),
            volume,
            handle,
            root: AtomicU64::new(root),
            depth: AtomicU32::new(depth),
            is_directory,
            write_latch: Mutex::new(()),
            stats: TreeStatistics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn root(&self) -> PageAddr {
        self.root.load(Ordering::SeqCst)
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("name", &self.name)
            .field("root", &self.root())
            .field("depth", &self.depth())
            .finish()
    }
}

/// What a reader is allowed to see.
#[derive(Debug, Clone, Copy)]
pub enum Visibility {
    /// Raw primordial payloads; system trees only.
    System,
    /// Snapshot-isolated MVCC read.
    Snapshot { ts: i64, step: u8 },
}

/// How a store is versioned.
pub enum StoreMode<'a> {
    /// Overwrite in place with a primordial payload; system trees only.
    System,
    /// Append an MVV version for the given transaction.
    Transaction {
        status: &'a Arc<TransactionStatus>,
        step: u8,
    },
    /// Recovery redo: like `Transaction`, but conflict-free by construction
    /// and tolerant of versions landing below survivors in durable pages.
    Redo {
        status: &'a Arc<TransactionStatus>,
        step: u8,
    },
}

/// Largest raw value stored inline; longer values spill to a chain.
pub fn max_inline_value(page_size: usize) -> usize {
    page_size / 8
}

fn max_key_length(page_size: usize) -> usize {
    crate::key::MAX_KEY_LENGTH.min(page_size / 8)
}

fn check_key(ctx: &EngineContext, key: &Key) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("empty key".into()));
    }
    if key.len() > max_key_length(ctx.pool.page_size()) {
        return Err(Error::InvalidArgument(format!(
            "key of {} bytes exceeds the limit for this page size",
            key.len()
        )));
    }
    Ok(())
}

/// Descent result: the leaf guard plus the index-page addresses visited.
struct LeafTarget {
    guard: PageGuard,
    path: Vec<PageAddr>,
}

/// Descent record used by traversal: the leaf address plus the index pages
/// visited with the child slot taken in each.
pub(crate) struct LeafPath {
    pub leaf: PageAddr,
    pub stack: Vec<(PageAddr, usize)>,
}

/// Plain claim-free descent to the leaf the index currently routes `key`
/// to. Hole tolerance is layered on top by the claiming callers.
pub(crate) fn locate_path(ctx: &EngineContext, tree: &Tree, key: &[u8]) -> Result<LeafPath> {
    let volume = tree.volume();
    let mut addr = tree.root();
    let mut stack = Vec::new();
    loop {
        let guard = ctx.pool.get(volume, addr, Claim::Reader, true)?;
        match page::page_type(guard.bytes())
            .map_err(|e| Error::corrupt_page(addr, e.to_string()))?
        {
            PageType::Index => {
                let node = Node::new(guard.bytes(), addr)?;
                let child_idx = match node.search(key)? {
                    Ok(idx) => idx,
                    // Only the empty traversal anchor can sort below the
                    // left guard; route it to the leftmost child.
                    Err(0) => 0,
                    Err(idx) => idx - 1,
                };
                let child = node.child_at(child_idx)?;
                stack.push((addr, child_idx));
                drop(guard);
                addr = child;
            }
            PageType::Data => {
                return Ok(LeafPath { leaf: addr, stack });
            }
            other => {
                return Err(Error::corrupt_page(
                    addr,
                    format!("descent reached a {other:?} page"),
                ))
            }
        }
    }
}

/// Descends to the leaf owning `key`, tolerating index holes by walking
/// right siblings. `leaf_claim` picks the claim taken on the leaf.
fn locate_leaf(
    ctx: &EngineContext,
    tree: &Tree,
    key: &[u8],
    leaf_claim: Claim,
) -> Result<LeafTarget> {
    let path = locate_path(ctx, tree, key)?;
    let addrs: Vec<PageAddr> = path.stack.iter().map(|&(addr, _)| addr).collect();
    let guard = claim_leaf(ctx, tree, path.leaf, key, leaf_claim, &addrs)?;
    Ok(LeafTarget { guard, path: addrs })
}

/// Claims the leaf, then walks right siblings while the key provably
/// belongs further right (an index hole left by a crashed split).
fn claim_leaf(
    ctx: &EngineContext,
    tree: &Tree,
    mut addr: PageAddr,
    key: &[u8],
    claim: Claim,
    path: &[PageAddr],
) -> Result<PageGuard> {
    let volume = tree.volume();
    let mut walked = 0usize;
    loop {
        let guard = ctx.pool.get(volume, addr, claim, true)?;
        page::expect_type(guard.bytes(), addr, PageType::Data)?;
        let node = Node::new(guard.bytes(), addr)?;
        let beyond = matches!(node.search(key)?, Err(idx) if idx == node.slot_count());
        let sibling = page::right_sibling(guard.bytes());
        if !beyond || sibling == 0 {
            if walked > 0 {
                // The parent is missing this page's separator; have the
                // cleanup manager repair it.
                let level = path.len().max(1) as u8;
                ctx.enqueue_cleanup(crate::cleanup::CleanupAction::IndexHole {
                    volume_id: volume.id(),
                    tree_name: tree.name().to_owned(),
                    page: addr,
                    level,
                });
            }
            return Ok(guard);
        }
        walked += 1;
        if walked > MAX_WALK_RIGHT {
            return Err(Error::corrupt_page(
                addr,
                format!("walked {MAX_WALK_RIGHT} right siblings without finding the key's leaf"),
            ));
        }
        drop(guard);
        addr = sibling;
    }
}

/// Reads the value bytes behind one visible version body.
fn materialize(ctx: &EngineContext, volume: &Arc<Volume>, body: ValueBody<'_>) -> Result<Option<Vec<u8>>> {
    match body {
        ValueBody::Undefined | ValueBody::AntiValue => Ok(None),
        ValueBody::Literal(bytes) => Ok(Some(bytes.to_vec())),
        ValueBody::LongRecord(stub) => Ok(Some(read_long_record(ctx, volume, &stub)?)),
    }
}

/// Fetches the value for `key`, or `None` when absent / deleted / invisible.
pub fn fetch(
    ctx: &EngineContext,
    tree: &Tree,
    key: &Key,
    visibility: Visibility,
) -> Result<Option<Vec<u8>>> {
    check_key(ctx, key)?;
    tree.stats.bump(&tree.stats.fetch_count);
    tree.volume().note_get();
    let target = locate_leaf(ctx, tree, key.encoded(), Claim::Reader)?;
    let node = Node::new(target.guard.bytes(), target.guard.page())?;
    let payload = match node.search(key.encoded())? {
        Ok(idx) => node.payload_at(idx)?,
        Err(_) => return Ok(None),
    };
    resolve_payload(ctx, tree.volume(), payload, visibility)
}

fn resolve_payload(
    ctx: &EngineContext,
    volume: &Arc<Volume>,
    payload: &[u8],
    visibility: Visibility,
) -> Result<Option<Vec<u8>>> {
    match visibility {
        Visibility::System => {
            if mvv::is_mvv(payload) {
                return Err(Error::Corruption(
                    "mvv payload in a system-visibility tree".into(),
                ));
            }
            materialize(ctx, volume, value::classify(payload)?)
        }
        Visibility::Snapshot { ts, step } => {
            match mvv::read_visible(payload, ctx.txn_index.as_ref(), ts, step)? {
                None => Ok(None),
                Some(version) => materialize(ctx, volume, value::classify(version)?),
            }
        }
    }
}

/// Builds the version body for a raw value, spilling oversized values to a
/// long-record chain.
fn encode_value_body(ctx: &EngineContext, volume: &Arc<Volume>, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() <= max_inline_value(ctx.pool.page_size()) {
        return Ok(value::encode_literal(raw));
    }
    let stub = write_long_record(ctx, volume, raw)?;
    Ok(stub.encode().to_vec())
}

/// Writes `bytes` into a chain of long-record pages (tail first, so each
/// page links to an already-written successor) and returns the stub.
fn write_long_record(
    ctx: &EngineContext,
    volume: &Arc<Volume>,
    bytes: &[u8],
) -> Result<LongRecordStub> {
    let capacity = page::long_record::capacity(ctx.pool.page_size());
    let chunks: Vec<&[u8]> = bytes.chunks(capacity).collect();
    let mut next: PageAddr = 0;
    for chunk in chunks.iter().rev() {
        let mut guard = volume.allocate_page(&ctx.pool, &ctx.allocator)?;
        page::init_page(guard.bytes_mut(), PageType::LongRecord, 0);
        page::long_record::set_content(guard.bytes_mut(), chunk);
        page::set_right_sibling(guard.bytes_mut(), next);
        let ts = ctx.allocator.current();
        page::set_timestamp(guard.bytes_mut(), ts);
        guard.mark_dirty(ts);
        // Chain pages reach the journal before the leaf that will hold the
        // stub can; tail-first build keeps each link durable-before-use.
        ctx.pool.journal_page_now(&guard, ts)?;
        next = guard.page();
    }
    Ok(LongRecordStub {
        total_length: bytes.len() as u64,
        head_page: next,
        prefix: bytes[..bytes.len().min(LONG_RECORD_PREFIX_LEN)].to_vec(),
    })
}

/// Reassembles a spilled value by following the chain from the stub.
pub fn read_long_record(
    ctx: &EngineContext,
    volume: &Arc<Volume>,
    stub: &LongRecordStub,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(stub.total_length as usize);
    let mut addr = stub.head_page;
    let limit = stub.total_length as usize / page::long_record::capacity(ctx.pool.page_size()) + 2;
    let mut hops = 0usize;
    while addr != 0 {
        hops += 1;
        if hops > limit {
            return Err(Error::corrupt_page(
                stub.head_page,
                "long-record chain longer than its recorded length",
            ));
        }
        let guard = ctx.pool.get(volume, addr, Claim::Reader, true)?;
        page::expect_type(guard.bytes(), addr, PageType::LongRecord)?;
        out.extend_from_slice(page::long_record::content(guard.bytes(), addr)?);
        addr = page::right_sibling(guard.bytes());
    }
    if out.len() != stub.total_length as usize {
        return Err(Error::corrupt_page(
            stub.head_page,
            format!(
                "long-record chain holds {} bytes, stub records {}",
                out.len(),
                stub.total_length
            ),
        ));
    }
    Ok(out)
}

/// Long-record chains referenced anywhere in a slot payload.
pub fn harvest_long_record_heads(payload: &[u8]) -> Result<Vec<PageAddr>> {
    let mut heads = Vec::new();
    mvv::visit_all_versions(payload, |_, version| {
        if let Ok(ValueBody::LongRecord(stub)) = value::classify(version) {
            heads.push(stub.head_page);
        }
        Ok(())
    })?;
    Ok(heads)
}

/// Releases one long-record chain to the volume's garbage chain.
pub fn free_long_record_chain(
    ctx: &EngineContext,
    volume: &Arc<Volume>,
    head: PageAddr,
) -> Result<()> {
    let mut tail = head;
    let mut hops = 0usize;
    loop {
        let guard = ctx.pool.get(volume, tail, Claim::Reader, true)?;
        page::expect_type(guard.bytes(), tail, PageType::LongRecord)?;
        let next = page::right_sibling(guard.bytes());
        if next == 0 {
            break;
        }
        tail = next;
        hops += 1;
        if hops > MAX_WALK_RIGHT {
            return Err(Error::corrupt_page(head, "unterminated long-record chain"));
        }
    }
    volume.free_chain(&ctx.pool, &ctx.allocator, head, tail)
}

/// Outcome of a transactional store against the existing slot payload.
fn versioned_payload(
    ctx: &EngineContext,
    existing: &[u8],
    status: &Arc<TransactionStatus>,
    step: u8,
    body: &[u8],
    redo: bool,
) -> Result<(Vec<u8>, bool)> {
    if !redo {
        // Write-write dependency: find the newest version by someone else.
        let mut newest_other: Option<u64> = None;
        mvv::visit_all_versions(existing, |vh, _| {
            if mvv::handle_ts(vh) != status.ts() && vh != 0 {
                newest_other = Some(vh);
            }
            Ok(())
        })?;
        if let Some(other_vh) = newest_other {
            match ctx.txn_index.ww_dependency(other_vh, status, WW_TIMEOUT)? {
                0 => {}
                TIMED_OUT => {
                    return Err(Error::Timeout(
                        "write-write dependency unresolved".into(),
                    ))
                }
                UNCOMMITTED => {
                    return Err(Error::Rollback(
                        "write-write deadlock; transaction must retry".into(),
                    ))
                }
                tc => {
                    return Err(Error::Rollback(format!(
                        "write-write conflict with transaction committed at {tc}"
                    )))
                }
            }
        }
    }
    let vh = mvv::version_handle(status.ts(), step);
    let stored = if redo {
        mvv::store_version_unordered(existing, vh, body)?
    } else {
        mvv::store_version(existing, vh, body)?
    };
    Ok((stored.payload, stored.existed))
}

/// Reads the current payload of `key` under a reader claim. The caller
/// holds the tree latch, so no writer can change it afterwards.
fn read_existing_payload(ctx: &EngineContext, tree: &Tree, key: &Key) -> Result<Option<Vec<u8>>> {
    let target = locate_leaf(ctx, tree, key.encoded(), Claim::Reader)?;
    let node = Node::new(target.guard.bytes(), target.guard.page())?;
    match node.search(key.encoded())? {
        Ok(idx) => Ok(Some(node.payload_at(idx)?.to_vec())),
        Err(_) => Ok(None),
    }
}

/// Writes `new_payload` into the slot for `key` under a writer claim,
/// splitting as needed. Returns the leaf address written.
fn apply_payload(
    ctx: &EngineContext,
    tree: &Tree,
    key: &Key,
    new_payload: &[u8],
) -> Result<PageAddr> {
    let target = locate_leaf(ctx, tree, key.encoded(), Claim::Writer)?;
    let mut guard = target.guard;
    let leaf_addr = guard.page();
    let fits = {
        let mut node = NodeMut::new(guard.bytes_mut(), leaf_addr)?;
        match node.as_node().search(key.encoded())? {
            Ok(idx) => node.replace_payload(idx, new_payload)?,
            Err(idx) => node.insert_data(idx, key.encoded(), new_payload)?,
        }
    };
    if fits {
        let ts = ctx.allocator.current();
        page::set_timestamp(guard.bytes_mut(), ts);
        guard.mark_dirty(ts);
    } else {
        split_and_insert(ctx, tree, guard, target.path, key.encoded(), new_payload)?;
    }
    Ok(leaf_addr)
}

/// Stores `value` under `key`.
pub fn store(
    ctx: &EngineContext,
    tree: &Tree,
    key: &Key,
    raw_value: &[u8],
    mode: StoreMode<'_>,
) -> Result<()> {
    check_key(ctx, key)?;
    tree.stats.bump(&tree.stats.store_count);
    let _latch = tree.write_latch.lock();
    let volume = Arc::clone(tree.volume());
    let body = encode_value_body(ctx, &volume, raw_value)?;

    // Resolve the payload under a reader claim only: a write-write wait
    // must never pin a page. The tree latch keeps the slot stable.
    let existing = read_existing_payload(ctx, tree, key)?.unwrap_or_default();
    let (new_payload, replaced_existing_version, freed_heads) = match &mode {
        StoreMode::System => {
            // Overwritten primordial long records are freed eagerly.
            let heads = harvest_long_record_heads(&existing)?;
            (body.clone(), false, heads)
        }
        StoreMode::Transaction { status, step } => {
            let (payload, existed) =
                versioned_payload(ctx, &existing, status, *step, &body, false)?;
            (payload, existed, Vec::new())
        }
        StoreMode::Redo { status, step } => {
            let (payload, existed) =
                versioned_payload(ctx, &existing, status, *step, &body, true)?;
            (payload, existed, Vec::new())
        }
    };

    let leaf_addr = apply_payload(ctx, tree, key, &new_payload)?;

    // Bookkeeping outside the page claim.
    if let StoreMode::Transaction { status, .. } | StoreMode::Redo { status, .. } = &mode {
        if !replaced_existing_version {
            status.increment_mvv_count();
        }
        if mvv::is_mvv(&new_payload) {
            let mut versions = 0usize;
            mvv::visit_all_versions(&new_payload, |_, _| {
                versions += 1;
                Ok(())
            })?;
            if versions >= PRUNE_VERSION_THRESHOLD {
                ctx.enqueue_cleanup(crate::cleanup::CleanupAction::PruneMvv {
                    volume_id: volume.id(),
                    tree_name: tree.name().to_owned(),
                    page: leaf_addr,
                });
            }
        }
    }
    for head in freed_heads {
        free_long_record_chain(ctx, &volume, head)?;
    }
    Ok(())
}

/// Splits `guard` (which rejected an insert of `key`/`payload`), inserts
/// into the proper half, and propagates the separator upward.
fn split_and_insert(
    ctx: &EngineContext,
    tree: &Tree,
    mut guard: PageGuard,
    mut path: Vec<PageAddr>,
    key: &[u8],
    payload: &[u8],
) -> Result<()> {
    let volume = Arc::clone(tree.volume());
    let mut pending_key = key.to_vec();
    let mut pending_payload = payload.to_vec();
    let mut pending_child: Option<PageAddr> = None;

    loop {
        let addr = guard.page();
        let level = page::level(guard.bytes());
        let kind = Node::new(guard.bytes(), addr)?.kind();

        let mut right = volume.allocate_page(&ctx.pool, &ctx.allocator)?;
        let right_addr = right.page();
        page::init_page(
            right.bytes_mut(),
            if kind == page::NodeKind::Data {
                PageType::Data
            } else {
                PageType::Index
            },
            level,
        );

        // Size-weighted midpoint.
        let split_idx = {
            let node = Node::new(guard.bytes(), addr)?;
            choose_split_index(&node)?
        };

        // Move the upper half to the right page.
        {
            let node = Node::new(guard.bytes(), addr)?;
            let count = node.slot_count();
            let mut right_node = NodeMut::new(right.bytes_mut(), right_addr)?;
            for (to, from) in (split_idx..count).enumerate() {
                let record_key = node.key_at(from)?;
                let inserted = match kind {
                    page::NodeKind::Data => {
                        right_node.insert_data(to, record_key, node.payload_at(from)?)?
                    }
                    page::NodeKind::Index => {
                        right_node.insert_index(to, record_key, node.child_at(from)?)?
                    }
                };
                if !inserted {
                    return Err(Error::corrupt_page(
                        right_addr,
                        "fresh right page rejected half of a split",
                    ));
                }
            }
        }
        {
            let mut node = NodeMut::new(guard.bytes_mut(), addr)?;
            while node.slot_count() > split_idx {
                let last = node.slot_count() - 1;
                node.remove(last)?;
            }
            node.compact()?;
        }

        page::set_right_sibling(right.bytes_mut(), page::right_sibling(guard.bytes()));
        page::set_right_sibling(guard.bytes_mut(), right_addr);

        let separator = {
            let right_node = Node::new(right.bytes(), right_addr)?;
            right_node.key_at(0)?.to_vec()
        };

        // Insert the pending record into whichever side owns it.
        {
            let (target_guard, target_addr) = if pending_key.as_slice() < separator.as_slice() {
                (&mut guard, addr)
            } else {
                (&mut right, right_addr)
            };
            let mut node = NodeMut::new(target_guard.bytes_mut(), target_addr)?;
            let inserted = match node.as_node().search(&pending_key)? {
                Ok(idx) => match kind {
                    page::NodeKind::Data => node.replace_payload(idx, &pending_payload)?,
                    page::NodeKind::Index => {
                        node.set_child(idx, pending_child.expect("index insert carries a child"))?;
                        true
                    }
                },
                Err(idx) => match kind {
                    page::NodeKind::Data => node.insert_data(idx, &pending_key, &pending_payload)?,
                    page::NodeKind::Index => node.insert_index(
                        idx,
                        &pending_key,
                        pending_child.expect("index insert carries a child"),
                    )?,
                },
            };
            if !inserted {
                return Err(Error::corrupt_page(
                    target_addr,
                    "record does not fit in either half of a split",
                ));
            }
        }

        let ts = ctx.allocator.current();
        page::set_timestamp(guard.bytes_mut(), ts);
        page::set_timestamp(right.bytes_mut(), ts);
        guard.mark_dirty(ts);
        right.mark_dirty(ts);
        // The left page (still claimed) now points at the right page, so
        // the right image must reach the journal first; a crash in between
        // leaves only an unreferenced orphan.
        ctx.pool.journal_page_now(&right, ts)?;
        drop(right);
        drop(guard);

        // Propagate the separator.
        match path.pop() {
            Some(parent_addr) => {
                let mut parent = ctx.pool.get(&volume, parent_addr, Claim::Writer, true)?;
                page::expect_type(parent.bytes(), parent_addr, PageType::Index)?;
                let inserted = {
                    let mut node = NodeMut::new(parent.bytes_mut(), parent_addr)?;
                    match node.as_node().search(&separator)? {
                        Ok(idx) => {
                            node.set_child(idx, right_addr)?;
                            true
                        }
                        Err(idx) => node.insert_index(idx, &separator, right_addr)?,
                    }
                };
                if inserted {
                    let ts = ctx.allocator.current();
                    page::set_timestamp(parent.bytes_mut(), ts);
                    parent.mark_dirty(ts);
                    return Ok(());
                }
                // Parent full: split it too.
                pending_key = separator;
                pending_payload = Vec::new();
                pending_child = Some(right_addr);
                guard = parent;
            }
            None => {
                // Root split: one level taller.
                let new_level = level + 1;
                if new_level > page::MAX_INDEX_LEVELS {
                    return Err(Error::corrupt_page(addr, "tree exceeds maximum depth"));
                }
                let mut new_root = volume.allocate_page(&ctx.pool, &ctx.allocator)?;
                let new_root_addr = new_root.page();
                page::init_page(new_root.bytes_mut(), PageType::Index, new_level);
                {
                    let mut node = NodeMut::new(new_root.bytes_mut(), new_root_addr)?;
                    if !node.insert_index(0, Key::left_guard().encoded(), addr)?
                        || !node.insert_index(1, &separator, right_addr)?
                    {
                        return Err(Error::corrupt_page(
                            new_root_addr,
                            "fresh root rejected its two seed records",
                        ));
                    }
                }
                let ts = ctx.allocator.current();
                page::set_timestamp(new_root.bytes_mut(), ts);
                new_root.mark_dirty(ts);
                ctx.pool.journal_page_now(&new_root, ts)?;
                drop(new_root);
                tree.root.store(new_root_addr, Ordering::SeqCst);
                tree.depth.fetch_add(1, Ordering::SeqCst);
                persist_tree_root(ctx, tree)?;
                debug!(tree = tree.name(), root = new_root_addr, "root split");
                return Ok(());
            }
        }
    }
}

/// Byte-weighted split point: the first index where the left side reaches
/// half the used bytes, clamped so both halves are non-empty.
fn choose_split_index(node: &Node<'_>) -> Result<usize> {
    let count = node.slot_count();
    if count < 2 {
        return Err(Error::Corruption("split of a page with fewer than two records".into()));
    }
    let total = node.used_bytes()?;
    let mut acc = 0usize;
    for idx in 0..count {
        let key_len = node.key_at(idx)?.len();
        let payload_len = match node.kind() {
            page::NodeKind::Data => node.payload_at(idx)?.len(),
            page::NodeKind::Index => 8,
        };
        acc += key_len + payload_len + 6;
        if acc * 2 >= total {
            return Ok(idx.clamp(1, count - 1));
        }
    }
    Ok(count / 2)
}

/// Persists a root change: directory trees update the head page, user
/// trees update their directory record.
fn persist_tree_root(ctx: &EngineContext, tree: &Tree) -> Result<()> {
    if tree.is_directory() {
        tree.volume().set_directory_root(tree.root());
        return tree.volume().write_header(&ctx.pool, ctx.allocator.current());
    }
    directory::write_tree_record(ctx, tree)
}

/// Removes `key`. Transactional removes write an AntiValue version (the
/// pruner reclaims the slot later); system removes drop the record and free
/// its long records immediately. Returns whether the key existed.
pub fn remove(
    ctx: &EngineContext,
    tree: &Tree,
    key: &Key,
    mode: StoreMode<'_>,
) -> Result<bool> {
    check_key(ctx, key)?;
    tree.stats.bump(&tree.stats.remove_count);
    let _latch = tree.write_latch.lock();
    let volume = Arc::clone(tree.volume());

    let Some(existing) = read_existing_payload(ctx, tree, key)? else {
        return Ok(false);
    };

    match &mode {
        StoreMode::System => {
            let heads = harvest_long_record_heads(&existing)?;
            let target = locate_leaf(ctx, tree, key.encoded(), Claim::Writer)?;
            let mut guard = target.guard;
            let leaf_addr = guard.page();
            {
                let mut node = NodeMut::new(guard.bytes_mut(), leaf_addr)?;
                match node.as_node().search(key.encoded())? {
                    Ok(idx) => node.remove(idx)?,
                    Err(_) => return Ok(false),
                }
            }
            let ts = ctx.allocator.current();
            page::set_timestamp(guard.bytes_mut(), ts);
            guard.mark_dirty(ts);
            drop(guard);
            for head in heads {
                free_long_record_chain(ctx, &volume, head)?;
            }
            Ok(true)
        }
        StoreMode::Transaction { status, step } | StoreMode::Redo { status, step } => {
            let redo = matches!(&mode, StoreMode::Redo { .. });
            // Invisible keys still get a tombstone version so the delete is
            // journaled and conflict-checked.
            let was_visible = match mvv::read_visible(
                &existing,
                ctx.txn_index.as_ref(),
                status.ts(),
                *step,
            )? {
                None => false,
                Some(body) => !matches!(
                    value::classify(body)?,
                    ValueBody::AntiValue | ValueBody::Undefined
                ),
            };
            let (payload, existed) =
                versioned_payload(ctx, &existing, status, *step, &value::antivalue(), redo)?;
            let leaf_addr = apply_payload(ctx, tree, key, &payload)?;
            if !existed {
                status.increment_mvv_count();
            }
            ctx.enqueue_cleanup(crate::cleanup::CleanupAction::PruneMvv {
                volume_id: volume.id(),
                tree_name: tree.name().to_owned(),
                page: leaf_addr,
            });
            Ok(was_visible)
        }
    }
}

/// Removes every key in `[key1, key2)`. Two descents plus a right-sibling
/// walk over the leaves in between. Returns the number of keys removed.
pub fn remove_range(
    ctx: &EngineContext,
    tree: &Tree,
    key1: &Key,
    key2: &Key,
    mode: StoreMode<'_>,
) -> Result<usize> {
    check_key(ctx, key1)?;
    if key2.encoded() <= key1.encoded() {
        return Err(Error::InvalidArgument(
            "range delete bounds out of order".into(),
        ));
    }
    // Collect the victim keys under reader claims, then remove one by one;
    // the per-key path re-checks under its writer claim.
    let mut victims = Vec::new();
    {
        let target = locate_leaf(ctx, tree, key1.encoded(), Claim::Reader)?;
        let mut guard = target.guard;
        let mut hops = 0usize;
        'walk: loop {
            let addr = guard.page();
            let node = Node::new(guard.bytes(), addr)?;
            let start = match node.search(key1.encoded())? {
                Ok(idx) => idx,
                Err(idx) => idx,
            };
            for idx in start..node.slot_count() {
                let record_key = node.key_at(idx)?;
                if record_key >= key2.encoded() {
                    break 'walk;
                }
                let key = Key::from_encoded(record_key);
                if key.is_left_guard() || key.is_right_guard() {
                    continue;
                }
                victims.push(key);
            }
            let sibling = page::right_sibling(guard.bytes());
            if sibling == 0 {
                break;
            }
            hops += 1;
            if hops > MAX_WALK_RIGHT {
                return Err(Error::corrupt_page(addr, "runaway leaf walk in range delete"));
            }
            drop(guard);
            guard = ctx.pool.get(tree.volume(), sibling, Claim::Reader, true)?;
            page::expect_type(guard.bytes(), sibling, PageType::Data)?;
        }
    }
    let mut removed = 0usize;
    for key in &victims {
        let mode_ref = match &mode {
            StoreMode::System => StoreMode::System,
            StoreMode::Transaction { status, step } => StoreMode::Transaction {
                status: *status,
                step: *step,
            },
            StoreMode::Redo { status, step } => StoreMode::Redo {
                status: *status,
                step: *step,
            },
        };
        if remove(ctx, tree, key, mode_ref)? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Prunes every MVV on a page, frees harvested long-record chains, retires
/// aborted version counts, and physically drops slots whose payload
/// collapsed to a bare tombstone. Called by the cleanup manager.
pub fn prune_page(ctx: &EngineContext, tree: &Tree, page_addr: PageAddr) -> Result<()> {
    let _latch = tree.write_latch.lock();
    let volume = Arc::clone(tree.volume());
    let mut guard = match ctx.pool.get(&volume, page_addr, Claim::Writer, false) {
        Ok(guard) => guard,
        Err(Error::InUse(_)) => return Ok(()), // busy page: the next pass gets it
        Err(err) => return Err(err),
    };
    if page::page_type(guard.bytes())? != PageType::Data {
        return Ok(()); // page was repurposed since the action was queued
    }

    let mut pruned_versions = Vec::new();
    let mut drop_slots = Vec::new();
    let mut changed = false;
    {
        let count = Node::new(guard.bytes(), page_addr)?.slot_count();
        for idx in 0..count {
            let (key_is_guard, payload) = {
                let node = Node::new(guard.bytes(), page_addr)?;
                let key = Key::from_encoded(node.key_at(idx)?);
                (
                    key.is_left_guard() || key.is_right_guard(),
                    node.payload_at(idx)?.to_vec(),
                )
            };
            if key_is_guard || !mvv::is_mvv(&payload) {
                // A bare committed tombstone is a dead slot.
                if !key_is_guard
                    && matches!(value::classify(&payload), Ok(ValueBody::AntiValue))
                {
                    drop_slots.push(idx);
                }
                continue;
            }
            let new_payload =
                mvv::prune(&payload, ctx.txn_index.as_ref(), true, &mut pruned_versions)?;
            if new_payload != payload {
                changed = true;
                if matches!(value::classify(&new_payload), Ok(ValueBody::AntiValue)) {
                    drop_slots.push(idx);
                } else {
                    let mut node = NodeMut::new(guard.bytes_mut(), page_addr)?;
                    if !node.replace_payload(idx, &new_payload)? {
                        return Err(Error::corrupt_page(
                            page_addr,
                            "pruned payload larger than its page slot",
                        ));
                    }
                }
            }
        }
        for &idx in drop_slots.iter().rev() {
            let mut node = NodeMut::new(guard.bytes_mut(), page_addr)?;
            node.remove(idx)?;
            changed = true;
        }
    }
    if changed {
        let ts = ctx.allocator.current();
        page::set_timestamp(guard.bytes_mut(), ts);
        guard.mark_dirty(ts);
    }
    let merged_away = try_merge_right(ctx, tree, &mut guard)?;
    drop(guard);
    if let Some(freed) = merged_away {
        volume.free_chain(&ctx.pool, &ctx.allocator, freed, freed)?;
    }

    for pruned in &pruned_versions {
        let ts = mvv::handle_ts(pruned.handle);
        if ts != 0 {
            ctx.txn_index.decrement_mvv_count(ts);
        }
        if let Some(head) = pruned.long_record_page {
            free_long_record_chain(ctx, &volume, head)?;
        }
    }
    Ok(())
}

/// Merges an underfull data page with its right sibling when the combined
/// records fit. Deletes never merge eagerly; this runs on the pruner's
/// cadence, under the tree latch. Returns the absorbed page, which the
/// caller frees once the claims are released.
fn try_merge_right(
    ctx: &EngineContext,
    tree: &Tree,
    left: &mut PageGuard,
) -> Result<Option<PageAddr>> {
    let left_addr = left.page();
    let right_addr = page::right_sibling(left.bytes());
    if right_addr == 0 {
        return Ok(None);
    }
    let body_capacity = ctx.pool.page_size() - page::PAGE_HDR_LEN;
    let left_used = Node::new(left.bytes(), left_addr)?.used_bytes()?;
    if left_used * 3 > body_capacity {
        return Ok(None); // not underfull
    }
    let separator;
    {
        let right = match ctx
            .pool
            .get(left.volume(), right_addr, Claim::Writer, false)
        {
            Ok(right) => right,
            Err(Error::InUse(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        if page::page_type(right.bytes())? != PageType::Data {
            return Ok(None);
        }
        let (sep, right_used, right_count) = {
            let node = Node::new(right.bytes(), right_addr)?;
            if node.slot_count() == 0 {
                (Vec::new(), 0, 0)
            } else {
                (node.key_at(0)?.to_vec(), node.used_bytes()?, node.slot_count())
            }
        };
        if right_count > 0 && left_used + right_used + 64 > body_capacity {
            return Ok(None); // would not fit
        }
        separator = sep;

        // Absorb the right page's records.
        for idx in 0..right_count {
            let (key, payload) = {
                let node = Node::new(right.bytes(), right_addr)?;
                (node.key_at(idx)?.to_vec(), node.payload_at(idx)?.to_vec())
            };
            let mut node = NodeMut::new(left.bytes_mut(), left_addr)?;
            let at = node.slot_count();
            if !node.insert_data(at, &key, &payload)? {
                return Err(Error::corrupt_page(
                    left_addr,
                    "merge overflow after a successful fit check",
                ));
            }
        }
        page::set_right_sibling(left.bytes_mut(), page::right_sibling(right.bytes()));
        // The right guard drops here: until the parent loses its
        // separator, readers routed to the absorbed page still see its
        // (unchanged) records.
    }
    let ts = ctx.allocator.current();
    page::set_timestamp(left.bytes_mut(), ts);
    left.mark_dirty(ts);

    // Drop the right page's separator from its parent, if present; a
    // missing one is just an index hole that no longer needs repairing.
    if !separator.is_empty() {
        let path = locate_path(ctx, tree, &separator)?;
        if let Some(&(parent_addr, _)) = path.stack.last() {
            let mut parent = ctx
                .pool
                .get(left.volume(), parent_addr, Claim::Writer, true)?;
            if page::page_type(parent.bytes())? == PageType::Index {
                let remove_at = {
                    let node = Node::new(parent.bytes(), parent_addr)?;
                    match node.search(&separator)? {
                        Ok(idx) if node.child_at(idx)? == right_addr => Some(idx),
                        _ => None,
                    }
                };
                if let Some(idx) = remove_at {
                    let mut node = NodeMut::new(parent.bytes_mut(), parent_addr)?;
                    node.remove(idx)?;
                    page::set_timestamp(parent.bytes_mut(), ts);
                    parent.mark_dirty(ts);
                    ctx.pool.journal_page_now(&parent, ts)?;
                }
            }
        }
    }
    ctx.pool.journal_page_now(left, ts)?;
    debug!(tree = tree.name(), left = left_addr, right = right_addr, "pages merged");
    Ok(Some(right_addr))
}

/// Prunes every leaf of a tree; the synchronous form of the cleanup
/// manager's per-page actions, used by admin surfaces and tests.
pub fn prune_tree(ctx: &EngineContext, tree: &Tree) -> Result<usize> {
    let volume = Arc::clone(tree.volume());
    // Leftmost leaf, then the sibling chain.
    let mut addr = {
        let path = locate_path(ctx, tree, Key::left_guard().encoded())?;
        path.leaf
    };
    let mut pruned = 0usize;
    let mut hops = 0usize;
    while addr != 0 {
        hops += 1;
        if hops > MAX_WALK_RIGHT {
            return Err(Error::corrupt_page(addr, "runaway leaf walk while pruning"));
        }
        let next = {
            let copy = ctx.pool.get_copy(&volume, addr)?;
            page::right_sibling(&copy)
        };
        prune_page(ctx, tree, addr)?;
        pruned += 1;
        addr = next;
    }
    Ok(pruned)
}

/// Repairs an index hole: re-inserts `child`'s separator into its parent
/// level if still missing. Called by the cleanup manager.
pub fn repair_index_hole(ctx: &EngineContext, tree: &Tree, child: PageAddr) -> Result<()> {
    let _latch = tree.write_latch.lock();
    let volume = tree.volume();
    let first_key = {
        let guard = match ctx.pool.get(volume, child, Claim::Reader, false) {
            Ok(guard) => guard,
            Err(Error::InUse(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if page::page_type(guard.bytes())? != PageType::Data {
            return Ok(());
        }
        let node = Node::new(guard.bytes(), child)?;
        if node.slot_count() == 0 {
            return Ok(());
        }
        node.key_at(0)?.to_vec()
    };
    if tree.depth() < 2 {
        return Ok(()); // single-leaf tree has no parent to repair
    }
    // Walk-free descent: does the index alone route to this page?
    let path = locate_path(ctx, tree, &first_key)?;
    if path.leaf == child {
        return Ok(()); // navigable already; nothing to repair
    }
    let Some(&(parent_addr, _)) = path.stack.last() else {
        return Ok(());
    };
    let mut parent = ctx.pool.get(volume, parent_addr, Claim::Writer, true)?;
    page::expect_type(parent.bytes(), parent_addr, PageType::Index)?;
    let inserted = {
        let mut node = NodeMut::new(parent.bytes_mut(), parent_addr)?;
        match node.as_node().search(&first_key)? {
            Ok(_) => true, // someone repaired it first
            Err(idx) => node.insert_index(idx, &first_key, child)?,
        }
    };
    if inserted {
        let ts = ctx.allocator.current();
        page::set_timestamp(parent.bytes_mut(), ts);
        parent.mark_dirty(ts);
        debug!(tree = tree.name(), child, "index hole repaired");
    } else {
        warn!(
            tree = tree.name(),
            child, "index hole repair deferred: parent full"
        );
    }
    Ok(())
}

pub mod directory {
    //! The `_directory` system tree: tree records, statistics, accumulator
    //! totals, all primordial.

    use super::*;

    pub const DIRECTORY_TREE_NAME: &str = "_directory";

    const CLASS_ROOT: &str = "root";
    const CLASS_STATS: &str = "stats";
    const CLASS_TOTALS: &str = "totals";

    /// The directory tree of a volume. Cached in the tree registry so every
    /// caller shares one structure latch.
    pub fn directory_tree(ctx: &EngineContext, volume: &Arc<Volume>) -> Arc<Tree> {
        ctx.cached_directory_tree(volume)
    }

    fn record_key(class: &str, tree_name: &str) -> Key {
        let mut key = Key::new();
        key.append_string(class).append_string(tree_name);
        key
    }

    /// `root/<name>` record payload: root page, depth, journal handle.
    fn encode_tree_record(tree: &Tree) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        out.extend_from_slice(&tree.root().to_be_bytes());
        out.push(tree.depth() as u8);
        out.extend_from_slice(&tree.handle().to_be_bytes());
        out
    }

    pub fn decode_tree_record(bytes: &[u8]) -> Result<(PageAddr, u32, u32)> {
        if bytes.len() != 13 {
            return Err(Error::Corruption("malformed directory tree record".into()));
        }
        let root = u64::from_be_bytes(bytes[0..8].try_into().expect("slice len"));
        let depth = bytes[8] as u32;
        let handle = u32::from_be_bytes(bytes[9..13].try_into().expect("slice len"));
        Ok((root, depth, handle))
    }

    pub fn write_tree_record(ctx: &EngineContext, tree: &Tree) -> Result<()> {
        let directory = directory_tree(ctx, tree.volume());
        store(
            ctx,
            &directory,
            &record_key(CLASS_ROOT, tree.name()),
            &encode_tree_record(tree),
            StoreMode::System,
        )
    }

    pub fn read_tree_record(
        ctx: &EngineContext,
        volume: &Arc<Volume>,
        name: &str,
    ) -> Result<Option<(PageAddr, u32, u32)>> {
        let directory = directory_tree(ctx, volume);
        match fetch(ctx, &directory, &record_key(CLASS_ROOT, name), Visibility::System)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_tree_record(&bytes)?)),
        }
    }

    pub fn write_stats(ctx: &EngineContext, tree: &Tree) -> Result<()> {
        let directory = directory_tree(ctx, tree.volume());
        let snapshot = tree.stats.snapshot();
        let mut out = Vec::with_capacity(32);
        for counter in snapshot {
            out.extend_from_slice(&counter.to_be_bytes());
        }
        tree.stats.dirty.store(false, Ordering::Relaxed);
        store(
            ctx,
            &directory,
            &record_key(CLASS_STATS, tree.name()),
            &out,
            StoreMode::System,
        )
    }

    pub fn read_stats(
        ctx: &EngineContext,
        volume: &Arc<Volume>,
        name: &str,
    ) -> Result<Option<[u64; 4]>> {
        let directory = directory_tree(ctx, volume);
        match fetch(ctx, &directory, &record_key(CLASS_STATS, name), Visibility::System)? {
            None => Ok(None),
            Some(bytes) => {
                if bytes.len() != 32 {
                    return Err(Error::Corruption("malformed statistics record".into()));
                }
                let mut out = [0u64; 4];
                for (i, chunk) in bytes.chunks(8).enumerate() {
                    out[i] = u64::from_be_bytes(chunk.try_into().expect("slice len"));
                }
                Ok(Some(out))
            }
        }
    }

    fn totals_key(tree_name: &str, index: u32) -> Key {
        let mut key = record_key(CLASS_TOTALS, tree_name);
        key.append_varint(index as u64);
        key
    }

    pub fn write_total(
        ctx: &EngineContext,
        volume: &Arc<Volume>,
        tree_name: &str,
        index: u32,
        total: i64,
    ) -> Result<()> {
        let directory = directory_tree(ctx, volume);
        store(
            ctx,
            &directory,
            &totals_key(tree_name, index),
            &total.to_be_bytes(),
            StoreMode::System,
        )
    }

    pub fn read_total(
        ctx: &EngineContext,
        volume: &Arc<Volume>,
        tree_name: &str,
        index: u32,
    ) -> Result<Option<i64>> {
        let directory = directory_tree(ctx, volume);
        match fetch(ctx, &directory, &totals_key(tree_name, index), Visibility::System)? {
            None => Ok(None),
            Some(bytes) => {
                if bytes.len() != 8 {
                    return Err(Error::Corruption("malformed accumulator total".into()));
                }
                Ok(Some(i64::from_be_bytes(
                    bytes.as_slice().try_into().expect("slice len"),
                )))
            }
        }
    }

    /// Drops every directory record of `name`: root, stats, totals.
    pub fn remove_tree_records(
        ctx: &EngineContext,
        volume: &Arc<Volume>,
        name: &str,
    ) -> Result<()> {
        let directory = directory_tree(ctx, volume);
        remove(ctx, &directory, &record_key(CLASS_ROOT, name), StoreMode::System)?;
        remove(ctx, &directory, &record_key(CLASS_STATS, name), StoreMode::System)?;
        let mut low = record_key(CLASS_TOTALS, name);
        let mut high = record_key(CLASS_TOTALS, name);
        low.append_varint(0);
        high.append_varint(u64::MAX);
        remove_range(ctx, &directory, &low, &high, StoreMode::System)?;
        Ok(())
    }
}

/// Creates the page backing a new tree: one leaf holding the two guards.
pub fn create_tree_root(ctx: &EngineContext, volume: &Arc<Volume>) -> Result<PageAddr> {
    let mut guard = volume.allocate_page(&ctx.pool, &ctx.allocator)?;
    let addr = guard.page();
    page::init_page(guard.bytes_mut(), PageType::Data, 0);
    {
        let mut node = NodeMut::new(guard.bytes_mut(), addr)?;
        if !node.insert_data(0, Key::left_guard().encoded(), &[])?
            || !node.insert_data(1, Key::right_guard().encoded(), &[])?
        {
            return Err(Error::corrupt_page(addr, "page too small for guard records"));
        }
    }
    let ts = ctx.allocator.current();
    page::set_timestamp(guard.bytes_mut(), ts);
    guard.mark_dirty(ts);
    ctx.pool.journal_page_now(&guard, ts)?;
    Ok(addr)
}

/// Walks the whole tree and releases every page (and every long-record
/// chain its leaves reference) to the garbage chain. The caller removes the
/// directory records and drops the registry entry.
pub fn release_tree_pages(ctx: &EngineContext, tree: &Tree) -> Result<()> {
    let _latch = tree.write_latch.lock();
    let volume = Arc::clone(tree.volume());

    // Collect the head page of each level by walking the leftmost spine.
    let mut level_heads = Vec::new();
    let mut addr = tree.root();
    loop {
        let guard = ctx.pool.get(&volume, addr, Claim::Reader, true)?;
        level_heads.push(addr);
        match page::page_type(guard.bytes())? {
            PageType::Index => {
                let node = Node::new(guard.bytes(), addr)?;
                let child = node.child_at(0)?;
                drop(guard);
                addr = child;
            }
            PageType::Data => break,
            other => {
                return Err(Error::corrupt_page(
                    addr,
                    format!("tree spine reached a {other:?} page"),
                ))
            }
        }
    }

    // Harvest long records from every leaf before the pages are recycled.
    let leaf_head = *level_heads.last().expect("at least one level");
    let mut leaf = leaf_head;
    let mut heads = Vec::new();
    while leaf != 0 {
        let guard = ctx.pool.get(&volume, leaf, Claim::Reader, true)?;
        page::expect_type(guard.bytes(), leaf, PageType::Data)?;
        let node = Node::new(guard.bytes(), leaf)?;
        for idx in 0..node.slot_count() {
            heads.extend(harvest_long_record_heads(node.payload_at(idx)?)?);
        }
        leaf = page::right_sibling(guard.bytes());
    }
    for head in heads {
        free_long_record_chain(ctx, &volume, head)?;
    }

    // Free each level as one right-linked chain.
    for head in level_heads {
        let mut tail = head;
        loop {
            let guard = ctx.pool.get(&volume, tail, Claim::Reader, true)?;
            let next = page::right_sibling(guard.bytes());
            if next == 0 {
                break;
            }
            tail = next;
        }
        volume.free_chain(&ctx.pool, &ctx.allocator, head, tail)?;
    }
    Ok(())
}
