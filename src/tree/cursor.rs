//! Directional traversal over a tree.
//!
//! A cursor holds only its anchor key between calls; every `traverse`
//! descends afresh, so concurrent updates at worst repeat or skip keys that
//! moved, never corrupt the walk. At most one page claim is held at a time.

use std::sync::Arc;

use crate::buffer::Claim;
use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::page::{self, Node, PageType};
use crate::value::PageAddr;

use super::{fetch, locate_path, resolve_payload, Tree, Visibility, MAX_WALK_RIGHT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Gt,
    Gteq,
    Lt,
    Lteq,
    Eq,
    Neq,
}

/// One per-depth bound on the keys a traversal accepts. Bounds are encoded
/// single-segment keys; `None` leaves that side open.
#[derive(Debug, Clone, Default)]
pub struct RangeTerm {
    pub low: Option<Key>,
    pub low_inclusive: bool,
    pub high: Option<Key>,
    pub high_inclusive: bool,
}

impl RangeTerm {
    pub fn exactly(segment: Key) -> Self {
        Self {
            low: Some(segment.clone()),
            low_inclusive: true,
            high: Some(segment),
            high_inclusive: true,
        }
    }

    pub fn between(low: Key, high: Key, low_inclusive: bool, high_inclusive: bool) -> Self {
        Self {
            low: Some(low),
            low_inclusive,
            high: Some(high),
            high_inclusive,
        }
    }

    fn accept(&self, segment: &[u8]) -> bool {
        if let Some(low) = &self.low {
            match segment.cmp(low.encoded()) {
                std::cmp::Ordering::Less => return false,
                std::cmp::Ordering::Equal if !self.low_inclusive => return false,
                _ => {}
            }
        }
        if let Some(high) = &self.high {
            match segment.cmp(high.encoded()) {
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal if !self.high_inclusive => return false,
                _ => {}
            }
        }
        true
    }
}

/// Declarative set of allowed key ranges, one term per segment depth.
/// Depths beyond the last term are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    terms: Vec<RangeTerm>,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_term(mut self, term: RangeTerm) -> Self {
        self.terms.push(term);
        self
    }

    pub fn accept(&self, key: &Key) -> Result<bool> {
        if self.terms.is_empty() {
            return Ok(true);
        }
        let slices = key.segment_slices()?;
        for (depth, term) in self.terms.iter().enumerate() {
            match slices.get(depth) {
                Some(segment) => {
                    if !term.accept(segment) {
                        return Ok(false);
                    }
                }
                // Shorter keys cannot satisfy a constrained deeper term.
                None => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// Resumable directional cursor bound to one tree.
pub struct TreeCursor {
    tree: Arc<Tree>,
    anchor: Key,
}

impl TreeCursor {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self {
            tree,
            anchor: Key::new(),
        }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn anchor(&self) -> &Key {
        &self.anchor
    }

    pub fn seek(&mut self, key: &Key) {
        self.anchor = key.clone();
    }

    pub fn reset(&mut self) {
        self.anchor.clear();
    }

    /// Advances in `direction`, returning the next accepted, visible
    /// `(key, value)` and re-anchoring on it. `None` means the walk is
    /// exhausted (the anchor is left untouched).
    pub fn traverse(
        &mut self,
        ctx: &EngineContext,
        direction: Direction,
        visibility: Visibility,
        filter: Option<&KeyFilter>,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        self.tree.stats.bump(&self.tree.stats.traverse_count);
        let result = match direction {
            Direction::Eq => self.exact(ctx, visibility, filter)?,
            Direction::Gt => self.forward(ctx, false, visibility, filter)?,
            Direction::Gteq => self.forward(ctx, true, visibility, filter)?,
            Direction::Lt => self.backward(ctx, false, visibility, filter)?,
            Direction::Lteq => self.backward(ctx, true, visibility, filter)?,
            Direction::Neq => match self.forward(ctx, false, visibility, filter)? {
                Some(hit) => Some(hit),
                None => self.backward(ctx, false, visibility, filter)?,
            },
        };
        if let Some((key, _)) = &result {
            self.anchor = key.clone();
        }
        Ok(result)
    }

    fn exact(
        &self,
        ctx: &EngineContext,
        visibility: Visibility,
        filter: Option<&KeyFilter>,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        if let Some(filter) = filter {
            if !filter.accept(&self.anchor)? {
                return Ok(None);
            }
        }
        Ok(fetch(ctx, &self.tree, &self.anchor, visibility)?
            .map(|value| (self.anchor.clone(), value)))
    }

    fn accept_slot(
        &self,
        ctx: &EngineContext,
        node: &Node<'_>,
        idx: usize,
        visibility: Visibility,
        filter: Option<&KeyFilter>,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        let key = Key::from_encoded(node.key_at(idx)?);
        if key.is_left_guard() || key.is_right_guard() {
            return Ok(None);
        }
        if let Some(filter) = filter {
            if !filter.accept(&key)? {
                return Ok(None);
            }
        }
        let payload = node.payload_at(idx)?.to_vec();
        match resolve_payload(ctx, self.tree.volume(), &payload, visibility)? {
            Some(value) => Ok(Some((key, value))),
            None => Ok(None),
        }
    }

    fn forward(
        &self,
        ctx: &EngineContext,
        include_equal: bool,
        visibility: Visibility,
        filter: Option<&KeyFilter>,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        let volume = self.tree.volume();
        let path = locate_path(ctx, &self.tree, self.anchor.encoded())?;
        let mut addr = path.leaf;
        let mut first_page = true;
        let mut hops = 0usize;
        loop {
            let guard = ctx.pool.get(volume, addr, Claim::Reader, true)?;
            page::expect_type(guard.bytes(), addr, PageType::Data)?;
            let node = Node::new(guard.bytes(), addr)?;
            let start = if first_page {
                match node.search(self.anchor.encoded())? {
                    Ok(idx) => {
                        if include_equal {
                            idx
                        } else {
                            idx + 1
                        }
                    }
                    Err(idx) => idx,
                }
            } else {
                0
            };
            for idx in start..node.slot_count() {
                if let Some(hit) = self.accept_slot(ctx, &node, idx, visibility, filter)? {
                    return Ok(Some(hit));
                }
            }
            let sibling = page::right_sibling(guard.bytes());
            if sibling == 0 {
                return Ok(None);
            }
            hops += 1;
            if hops > MAX_WALK_RIGHT {
                return Err(Error::corrupt_page(addr, "runaway forward traversal"));
            }
            drop(guard);
            addr = sibling;
            first_page = false;
        }
    }

    fn backward(
        &self,
        ctx: &EngineContext,
        include_equal: bool,
        visibility: Visibility,
        filter: Option<&KeyFilter>,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        // An empty anchor means "from the end".
        let anchor: Vec<u8> = if self.anchor.is_empty() {
            Key::right_guard().encoded().to_vec()
        } else {
            self.anchor.encoded().to_vec()
        };
        let volume = self.tree.volume();
        let mut path = locate_path(ctx, &self.tree, &anchor)?;
        {
            let addr = path.leaf;
            let guard = ctx.pool.get(volume, addr, Claim::Reader, true)?;
            page::expect_type(guard.bytes(), addr, PageType::Data)?;
            let node = Node::new(guard.bytes(), addr)?;
            let start: isize = match node.search(&anchor)? {
                Ok(idx) => {
                    if include_equal {
                        idx as isize
                    } else {
                        idx as isize - 1
                    }
                }
                Err(idx) => idx as isize - 1,
            };
            let mut idx = start.min(node.slot_count() as isize - 1);
            while idx >= 0 {
                if let Some(hit) =
                    self.accept_slot(ctx, &node, idx as usize, visibility, filter)?
                {
                    return Ok(Some(hit));
                }
                idx -= 1;
            }
        }
        // Anchor page exhausted: continue with the leaf to its left.
        match self.descend_left_neighbor(ctx, &mut path)? {
            Some(prev_leaf) => {
                path.leaf = prev_leaf;
                self.drain_backward(ctx, &mut path, visibility, filter)
            }
            None => Ok(None),
        }
    }

    /// Scans leaves right-to-left once the anchor page is exhausted.
    fn drain_backward(
        &self,
        ctx: &EngineContext,
        path: &mut super::LeafPath,
        visibility: Visibility,
        filter: Option<&KeyFilter>,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        let volume = self.tree.volume();
        loop {
            let addr = path.leaf;
            let guard = ctx.pool.get(volume, addr, Claim::Reader, true)?;
            page::expect_type(guard.bytes(), addr, PageType::Data)?;
            let node = Node::new(guard.bytes(), addr)?;
            let mut idx = node.slot_count() as isize - 1;
            while idx >= 0 {
                if let Some(hit) =
                    self.accept_slot(ctx, &node, idx as usize, visibility, filter)?
                {
                    return Ok(Some(hit));
                }
                idx -= 1;
            }
            drop(guard);
            match self.descend_left_neighbor(ctx, path)? {
                Some(prev_leaf) => path.leaf = prev_leaf,
                None => return Ok(None),
            }
        }
    }

    /// Finds the leaf immediately left of the current path position by
    /// backing up the stack to the nearest ancestor with a left sibling
    /// child, then descending its rightmost spine.
    fn descend_left_neighbor(
        &self,
        ctx: &EngineContext,
        path: &mut super::LeafPath,
    ) -> Result<Option<PageAddr>> {
        let volume = self.tree.volume();
        while let Some((parent_addr, child_idx)) = path.stack.pop() {
            if child_idx == 0 {
                continue;
            }
            let guard = ctx.pool.get(volume, parent_addr, Claim::Reader, true)?;
            page::expect_type(guard.bytes(), parent_addr, PageType::Index)?;
            let node = Node::new(guard.bytes(), parent_addr)?;
            let count = node.slot_count();
            if count == 0 {
                continue;
            }
            // Clamp in case the page shrank under us.
            let new_idx = child_idx.min(count) - 1;
            let mut addr = node.child_at(new_idx)?;
            path.stack.push((parent_addr, new_idx));
            drop(guard);
            // Rightmost spine down to a leaf.
            loop {
                let guard = ctx.pool.get(volume, addr, Claim::Reader, true)?;
                match page::page_type(guard.bytes())? {
                    PageType::Index => {
                        let node = Node::new(guard.bytes(), addr)?;
                        let count = node.slot_count();
                        if count == 0 {
                            return Err(Error::corrupt_page(addr, "empty index page"));
                        }
                        let child = node.child_at(count - 1)?;
                        path.stack.push((addr, count - 1));
                        drop(guard);
                        addr = child;
                    }
                    PageType::Data => return Ok(Some(addr)),
                    other => {
                        return Err(Error::corrupt_page(
                            addr,
                            format!("descent reached a {other:?} page"),
                        ))
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_key(s: &str) -> Key {
        let mut key = Key::new();
        key.append_string(s);
        key
    }

    #[test]
    fn key_filter_terms_bound_segments() {
        let filter = KeyFilter::new()
            .with_term(RangeTerm::exactly(string_key("fruits")))
            .with_term(RangeTerm::between(
                string_key("b"),
                string_key("d"),
                true,
                false,
            ));

        let mut ok = string_key("fruits");
        ok.append_string("cherry");
        assert!(filter.accept(&ok).unwrap());

        let mut wrong_first = string_key("vegetables");
        wrong_first.append_string("cherry");
        assert!(!filter.accept(&wrong_first).unwrap());

        let mut above = string_key("fruits");
        above.append_string("date");
        assert!(!filter.accept(&above).unwrap());

        // Too shallow for the second term.
        assert!(!filter.accept(&string_key("fruits")).unwrap());

        // No terms: everything passes.
        assert!(KeyFilter::new().accept(&string_key("anything")).unwrap());
    }

    #[test]
    fn range_term_inclusivity() {
        let term = RangeTerm::between(string_key("b"), string_key("d"), false, true);
        assert!(!term.accept(string_key("b").encoded()));
        assert!(term.accept(string_key("c").encoded()));
        assert!(term.accept(string_key("d").encoded()));
        assert!(!term.accept(string_key("a").encoded()));
        assert!(!term.accept(string_key("e").encoded()));
    }
}
