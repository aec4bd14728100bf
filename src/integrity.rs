//! Offline structural verification.
//!
//! Walks a tree level by level checking page types, in-page key order,
//! sibling chains, parent/child agreement, MVV well-formedness, and
//! long-record chains; at volume scope it additionally proves the page
//! accounting invariant: every page is reachable from exactly one owner
//! (directory tree, user tree, long-record chain, garbage chain) or sits in
//! the unallocated tail.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::mvv;
use crate::page::{self, garbage, Node, PageType};
use crate::tree::{directory, Tree};
use crate::value::{self, PageAddr, ValueBody};
use crate::volume::Volume;

#[derive(Debug, Clone)]
pub struct Fault {
    pub page: PageAddr,
    pub description: String,
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub pages_visited: u64,
    pub index_pages: u64,
    pub data_pages: u64,
    pub long_record_pages: u64,
    pub garbage_pages: u64,
    pub faults: Vec<Fault>,
}

impl IntegrityReport {
    pub fn has_faults(&self) -> bool {
        !self.faults.is_empty()
    }

    fn fault(&mut self, page: PageAddr, description: impl Into<String>) {
        self.faults.push(Fault {
            page,
            description: description.into(),
        });
    }
}

/// Ownership classes for the volume-wide accounting pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Tree,
    LongRecord,
    Garbage,
}

struct Walker<'a> {
    ctx: &'a Arc<EngineContext>,
    volume: Arc<Volume>,
    report: IntegrityReport,
    /// Page -> owner, for the disjointness check.
    seen: HashMap<PageAddr, Owner>,
}

impl<'a> Walker<'a> {
    fn new(ctx: &'a Arc<EngineContext>, volume: Arc<Volume>) -> Self {
        Self {
            ctx,
            volume,
            report: IntegrityReport::default(),
            seen: HashMap::new(),
        }
    }

    fn claim_page(&mut self, addr: PageAddr, owner: Owner) -> bool {
        self.report.pages_visited += 1;
        match self.seen.insert(addr, owner) {
            None => true,
            Some(previous) => {
                self.report.fault(
                    addr,
                    format!("page owned by both {previous:?} and {owner:?}"),
                );
                false
            }
        }
    }

    /// Checks one tree: key ordering, levels, sibling chains, child
    /// reachability, leaf payloads.
    fn check_tree(&mut self, tree: &Tree) -> Result<()> {
        let mut level_head = tree.root();
        let mut expected_level: Option<u8> = None;
        let mut levels = 0u32;
        loop {
            let head_copy = self.ctx.pool.get_copy(&self.volume, level_head)?;
            let head_type = match page::page_type(&head_copy) {
                Ok(t) => t,
                Err(err) => {
                    self.report.fault(level_head, err.to_string());
                    return Ok(());
                }
            };
            let level = page::level(&head_copy);
            if let Some(expected) = expected_level {
                if level != expected {
                    self.report.fault(
                        level_head,
                        format!("level {level} where {expected} was expected"),
                    );
                }
            }
            levels += 1;
            match head_type {
                PageType::Index => {
                    let next_head = {
                        let node = Node::new(&head_copy, level_head)?;
                        if node.slot_count() == 0 {
                            self.report.fault(level_head, "empty index page");
                            return Ok(());
                        }
                        node.child_at(0)?
                    };
                    self.check_level(tree, level_head, true)?;
                    expected_level = Some(level.saturating_sub(1));
                    level_head = next_head;
                }
                PageType::Data => {
                    self.check_level(tree, level_head, false)?;
                    break;
                }
                other => {
                    self.report.fault(
                        level_head,
                        format!("tree spine reached a {other:?} page"),
                    );
                    return Ok(());
                }
            }
        }
        if levels != tree.depth() {
            debug!(
                tree = tree.name(),
                walked = levels,
                recorded = tree.depth(),
                "tree depth drifted from its directory record"
            );
        }
        Ok(())
    }

    /// Walks one level left to right via sibling pointers.
    fn check_level(&mut self, tree: &Tree, head: PageAddr, is_index: bool) -> Result<()> {
        let mut addr = head;
        let mut prev_last_key: Option<Vec<u8>> = None;
        let mut hops = 0u64;
        while addr != 0 {
            hops += 1;
            if hops > 1_000_000 {
                self.report.fault(addr, "sibling chain does not terminate");
                return Ok(());
            }
            if !self.claim_page(addr, Owner::Tree) {
                return Ok(());
            }
            let copy = self.ctx.pool.get_copy(&self.volume, addr)?;
            let expected = if is_index {
                PageType::Index
            } else {
                PageType::Data
            };
            if let Err(err) = page::expect_type(&copy, addr, expected) {
                self.report.fault(addr, err.to_string());
                return Ok(());
            }
            if is_index {
                self.report.index_pages += 1;
            } else {
                self.report.data_pages += 1;
            }
            let node = Node::new(&copy, addr)?;

            // In-page ordering and cross-page ordering.
            let mut last_key: Option<Vec<u8>> = prev_last_key.take();
            for idx in 0..node.slot_count() {
                let key = node.key_at(idx)?.to_vec();
                if let Some(prev) = &last_key {
                    if *prev >= key {
                        self.report.fault(
                            addr,
                            format!("key order violation at slot {idx}"),
                        );
                    }
                }
                if !is_index {
                    self.check_payload(tree, addr, node.payload_at(idx)?)?;
                } else {
                    let child = node.child_at(idx)?;
                    if child == 0 {
                        self.report.fault(addr, format!("slot {idx} has a null child"));
                    }
                }
                last_key = Some(key);
            }
            prev_last_key = last_key;
            addr = page::right_sibling(&copy);
        }
        Ok(())
    }

    /// Leaf slot payload checks: MVV ordering and long-record chains.
    fn check_payload(&mut self, tree: &Tree, addr: PageAddr, payload: &[u8]) -> Result<()> {
        let mut last_handle: Option<u64> = None;
        let mut heads = Vec::new();
        let visit = mvv::visit_all_versions(payload, |vh, body| {
            if let Some(prev) = last_handle {
                if prev >= vh {
                    return Err(Error::Corruption(
                        "mvv versions out of handle order".into(),
                    ));
                }
            }
            last_handle = Some(vh);
            if let Ok(ValueBody::LongRecord(stub)) = value::classify(body) {
                heads.push(stub);
            }
            Ok(())
        });
        if let Err(err) = visit {
            self.report.fault(addr, err.to_string());
            return Ok(());
        }
        let _ = tree;
        for stub in heads {
            self.check_long_record(stub.head_page, stub.total_length)?;
        }
        Ok(())
    }

    fn check_long_record(&mut self, head: PageAddr, total_length: u64) -> Result<()> {
        let mut addr = head;
        let mut collected = 0u64;
        let mut hops = 0u64;
        while addr != 0 {
            hops += 1;
            if hops > 1_000_000 {
                self.report.fault(head, "long-record chain does not terminate");
                return Ok(());
            }
            if !self.claim_page(addr, Owner::LongRecord) {
                return Ok(());
            }
            let copy = self.ctx.pool.get_copy(&self.volume, addr)?;
            if let Err(err) = page::expect_type(&copy, addr, PageType::LongRecord) {
                self.report.fault(addr, err.to_string());
                return Ok(());
            }
            self.report.long_record_pages += 1;
            match page::long_record::content(&copy, addr) {
                Ok(content) => collected += content.len() as u64,
                Err(err) => self.report.fault(addr, err.to_string()),
            }
            addr = page::right_sibling(&copy);
        }
        if collected != total_length {
            self.report.fault(
                head,
                format!("long-record chain holds {collected} bytes, stub records {total_length}"),
            );
        }
        Ok(())
    }

    /// Walks the garbage chain, claiming every page it parks.
    fn check_garbage(&mut self) -> Result<()> {
        let mut garbage_page = self.volume.garbage_root();
        let mut hops = 0u64;
        while garbage_page != 0 {
            hops += 1;
            if hops > 1_000_000 {
                self.report
                    .fault(garbage_page, "garbage chain does not terminate");
                return Ok(());
            }
            if !self.claim_page(garbage_page, Owner::Garbage) {
                return Ok(());
            }
            let copy = self.ctx.pool.get_copy(&self.volume, garbage_page)?;
            if let Err(err) = page::expect_type(&copy, garbage_page, PageType::Garbage) {
                self.report.fault(garbage_page, err.to_string());
                return Ok(());
            }
            self.report.garbage_pages += 1;
            for idx in 0..garbage::count(&copy) {
                let entry = garbage::entry(&copy, idx)?;
                let mut chain = entry.left;
                loop {
                    if !self.claim_page(chain, Owner::Garbage) {
                        break;
                    }
                    if chain == entry.right {
                        break;
                    }
                    let link = self.ctx.pool.get_copy(&self.volume, chain)?;
                    chain = page::right_sibling(&link);
                    if chain == 0 {
                        self.report.fault(
                            entry.left,
                            "garbage chain ends before its recorded tail",
                        );
                        break;
                    }
                }
            }
            garbage_page = page::right_sibling(&copy);
        }
        Ok(())
    }
}

/// Verifies one tree.
pub fn check_tree(ctx: &Arc<EngineContext>, tree: &Tree) -> Result<IntegrityReport> {
    let mut walker = Walker::new(ctx, Arc::clone(tree.volume()));
    walker.check_tree(tree)?;
    Ok(walker.report)
}

/// Verifies a whole volume: the directory tree, every named tree, the
/// garbage chain, and the page accounting invariant.
pub fn check_volume(
    ctx: &Arc<EngineContext>,
    volume: &Arc<Volume>,
    tree_names: &[String],
) -> Result<IntegrityReport> {
    let mut walker = Walker::new(ctx, Arc::clone(volume));

    let dir = directory::directory_tree(ctx, volume);
    walker.check_tree(&dir)?;
    for name in tree_names {
        match directory::read_tree_record(ctx, volume, name)? {
            Some((root, depth, handle)) => {
                let tree = Tree::new(
                    name.clone(),
                    Arc::clone(volume),
                    handle,
                    root,
                    depth,
                    false,
                );
                walker.check_tree(&tree)?;
            }
            None => walker
                .report
                .fault(0, format!("tree {name} missing its directory record")),
        }
    }
    walker.check_garbage()?;

    // Accounting: everything below the high-water mark is owned exactly
    // once; page 0 is the head page and never claimed.
    let next_available = volume.next_available_page();
    for addr in 2..next_available {
        if !walker.seen.contains_key(&addr) {
            walker
                .report
                .fault(addr, "allocated page reachable from no owner");
        }
    }
    Ok(walker.report)
}
