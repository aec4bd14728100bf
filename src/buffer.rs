//! Claim-aware buffer pool.
//!
//! A fixed array of buffers caches pages of one size. The pool-global mutex
//! guards the page index and the invalid/LRU queues; each buffer carries its
//! own claim ledger (reader count, writer flag, owning thread) and condvar.
//! Page misses read through the journal's page map before falling back to
//! the volume file. Dirty buffers are drained to the journal by the page
//! writer thread; eviction takes clean un-claimed buffers, journaling one
//! inline only when nothing clean is available.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::journal::JournalManager;
use crate::value::PageAddr;
use crate::volume::Volume;

/// How long a waiting claim may block before reporting `Timeout`.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(60);
/// How long `get(wait=true)` may wait for an evictable buffer.
const EVICTION_TIMEOUT: Duration = Duration::from_secs(60);

type PoolKey = (u64, PageAddr);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Reader,
    Writer,
}

#[derive(Default)]
struct BufferState {
    key: Option<PoolKey>,
    volume: Option<Arc<Volume>>,
    valid: bool,
    dirty: bool,
    fixed: bool,
    permanent: bool,
    dirty_timestamp: i64,
    readers: usize,
    writer: bool,
    writer_thread: Option<ThreadId>,
}

impl BufferState {
    fn claim_free(&self) -> bool {
        self.readers == 0 && !self.writer
    }

    fn evictable(&self) -> bool {
        self.valid && self.claim_free() && !self.dirty && !self.fixed && !self.permanent
    }
}

struct PoolInner {
    index: FxHashMap<PoolKey, usize>,
    invalid: Vec<usize>,
    lru: VecDeque<usize>,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    space: Condvar,
}

pub struct Buffer {
    slot: usize,
    shared: Arc<PoolShared>,
    state: Mutex<BufferState>,
    released: Condvar,
    data: Arc<RwLock<Vec<u8>>>,
}

impl Buffer {
    /// Acquires a claim, waiting up to `CLAIM_TIMEOUT` when `wait` is set.
    /// Returns false when the claim is unavailable and `wait` is false.
    fn try_claim(&self, claim: Claim, wait: bool) -> Result<bool> {
        let mut state = self.state.lock();
        loop {
            let free = match claim {
                Claim::Reader => !state.writer,
                Claim::Writer => state.claim_free(),
            };
            if free {
                match claim {
                    Claim::Reader => state.readers += 1,
                    Claim::Writer => {
                        state.writer = true;
                        state.writer_thread = Some(std::thread::current().id());
                    }
                }
                return Ok(true);
            }
            if !wait {
                return Ok(false);
            }
            if self
                .released
                .wait_for(&mut state, CLAIM_TIMEOUT)
                .timed_out()
            {
                return Err(Error::Timeout(format!(
                    "claim on buffer slot {} not released",
                    self.slot
                )));
            }
        }
    }

    fn release_claim(&self, claim: Claim) {
        let push_to_lru = {
            let mut state = self.state.lock();
            match claim {
                Claim::Reader => {
                    debug_assert!(state.readers > 0);
                    state.readers -= 1;
                }
                Claim::Writer => {
                    debug_assert!(state.writer);
                    state.writer = false;
                    state.writer_thread = None;
                }
            }
            self.released.notify_all();
            state.evictable()
        };
        if push_to_lru {
            let mut inner = self.shared.inner.lock();
            inner.lru.push_back(self.slot);
            self.shared.space.notify_all();
        }
    }

    /// Downgrades the load-time writer claim to the requested claim.
    fn downgrade_to(&self, claim: Claim) {
        if claim == Claim::Writer {
            return;
        }
        let mut state = self.state.lock();
        debug_assert!(state.writer);
        state.writer = false;
        state.writer_thread = None;
        state.readers += 1;
        self.released.notify_all();
    }
}

enum GuardData {
    Read(ArcRwLockReadGuard<RawRwLock, Vec<u8>>),
    Write(ArcRwLockWriteGuard<RawRwLock, Vec<u8>>),
}

/// A claimed page resident in the pool. Dropping the guard releases the
/// claim and requeues the buffer for eviction when appropriate.
pub struct PageGuard {
    buffer: Arc<Buffer>,
    volume: Arc<Volume>,
    page: PageAddr,
    claim: Claim,
    data: Option<GuardData>,
}

impl PageGuard {
    pub fn page(&self) -> PageAddr {
        self.page
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn claim(&self) -> Claim {
        self.claim
    }

    pub fn bytes(&self) -> &[u8] {
        match self.data.as_ref().expect("guard data present") {
            GuardData::Read(guard) => guard,
            GuardData::Write(guard) => guard,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.claim, Claim::Writer);
        match self.data.as_mut().expect("guard data present") {
            GuardData::Write(guard) => guard,
            GuardData::Read(_) => unreachable!("writer claim carries a write guard"),
        }
    }

    /// Marks the page dirty under the claim, recording the timestamp the
    /// checkpointer groups it with.
    pub fn mark_dirty(&mut self, timestamp: i64) {
        debug_assert_eq!(self.claim, Claim::Writer);
        let mut state = self.buffer.state.lock();
        state.dirty = true;
        if state.dirty_timestamp == 0 || timestamp < state.dirty_timestamp {
            state.dirty_timestamp = timestamp;
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.data.take();
        self.buffer.release_claim(self.claim);
    }
}

pub struct BufferPool {
    page_size: usize,
    buffers: Vec<Arc<Buffer>>,
    shared: Arc<PoolShared>,
    journal: Arc<JournalManager>,
}

impl BufferPool {
    pub fn new(page_size: usize, buffer_count: usize, journal: Arc<JournalManager>) -> Self {
        let shared = Arc::new(PoolShared {
            inner: Mutex::new(PoolInner {
                index: FxHashMap::default(),
                invalid: (0..buffer_count).rev().collect(),
                lru: VecDeque::new(),
            }),
            space: Condvar::new(),
        });
        let buffers = (0..buffer_count)
            .map(|slot| {
                Arc::new(Buffer {
                    slot,
                    shared: Arc::clone(&shared),
                    state: Mutex::new(BufferState::default()),
                    released: Condvar::new(),
                    data: Arc::new(RwLock::new(Vec::new())),
                })
            })
            .collect();
        Self {
            page_size,
            buffers,
            shared,
            journal,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Fetches `page` of `volume` under the requested claim.
    ///
    /// With `wait=false` any contention (claim or pool full) reports
    /// `InUse`; with `wait=true` the caller blocks up to a bounded timeout.
    pub fn get(
        &self,
        volume: &Arc<Volume>,
        page: PageAddr,
        claim: Claim,
        wait: bool,
    ) -> Result<PageGuard> {
        self.get_inner(volume, page, claim, wait, false)
    }

    /// Like [`get`], additionally pinning the buffer so it is never evicted.
    /// Used for head pages.
    pub fn get_fixed(
        &self,
        volume: &Arc<Volume>,
        page: PageAddr,
        claim: Claim,
        wait: bool,
    ) -> Result<PageGuard> {
        self.get_inner(volume, page, claim, wait, true)
    }

    fn get_inner(
        &self,
        volume: &Arc<Volume>,
        page: PageAddr,
        claim: Claim,
        wait: bool,
        fixed: bool,
    ) -> Result<PageGuard> {
        let key = (volume.id(), page);
        loop {
            let slot_hit = {
                let inner = self.shared.inner.lock();
                inner.index.get(&key).copied()
            };
            if let Some(slot) = slot_hit {
                let buffer = Arc::clone(&self.buffers[slot]);
                if !buffer.try_claim(claim, wait)? {
                    return Err(Error::InUse(format!(
                        "page {page} of volume {} is claimed",
                        volume.name()
                    )));
                }
                // The buffer may have been evicted and remapped while we
                // waited for the claim; verify and retry on mismatch.
                let still_ours = {
                    let mut state = buffer.state.lock();
                    if state.valid && state.key == Some(key) {
                        if fixed {
                            state.fixed = true;
                        }
                        true
                    } else {
                        false
                    }
                };
                if !still_ours {
                    buffer.release_claim(claim);
                    continue;
                }
                return Ok(self.make_guard(buffer, volume, page, claim));
            }

            match self.install_slot(key, volume, wait)? {
                Some(slot) => {
                    let buffer = Arc::clone(&self.buffers[slot]);
                    if let Err(err) = self.load_page(&buffer, volume, page) {
                        self.abandon_load(&buffer, key);
                        return Err(err);
                    }
                    {
                        let mut state = buffer.state.lock();
                        state.valid = true;
                        if fixed {
                            state.fixed = true;
                        }
                    }
                    buffer.downgrade_to(claim);
                    return Ok(self.make_guard(buffer, volume, page, claim));
                }
                None => continue,
            }
        }
    }

    /// Reserves a slot for `key` and takes the load-time writer claim.
    /// Returns `None` when the caller should re-run the lookup.
    fn install_slot(&self, key: PoolKey, volume: &Arc<Volume>, wait: bool) -> Result<Option<usize>> {
        let mut inner = self.shared.inner.lock();
        if inner.index.contains_key(&key) {
            return Ok(None);
        }
        let slot = if let Some(slot) = inner.invalid.pop() {
            Some(slot)
        } else {
            self.pop_evictable(&mut inner)
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                drop(inner);
                if let Some(slot) = self.evict_dirty_inline()? {
                    let mut inner = self.shared.inner.lock();
                    if inner.index.contains_key(&key)
                        || !self.assign_slot(&mut inner, slot, key, volume)
                    {
                        return Ok(None);
                    }
                    return Ok(Some(slot));
                }
                if !wait {
                    return Err(Error::InUse("buffer pool exhausted".into()));
                }
                let mut inner = self.shared.inner.lock();
                if self
                    .shared
                    .space
                    .wait_for(&mut inner, EVICTION_TIMEOUT)
                    .timed_out()
                {
                    return Err(Error::Timeout("no evictable buffer appeared".into()));
                }
                return Ok(None);
            }
        };
        if !self.assign_slot(&mut inner, slot, key, volume) {
            return Ok(None);
        }
        Ok(Some(slot))
    }

    /// Rebinds `slot` to `key` under the load-time writer claim. Fails (and
    /// asks the caller to retry) when the buffer got claimed or re-dirtied
    /// between candidate selection and here.
    fn assign_slot(
        &self,
        inner: &mut PoolInner,
        slot: usize,
        key: PoolKey,
        volume: &Arc<Volume>,
    ) -> bool {
        let buffer = &self.buffers[slot];
        let mut state = buffer.state.lock();
        if !state.claim_free() || (state.valid && state.dirty) || state.fixed {
            return false;
        }
        if let Some(old) = state.key.take() {
            inner.index.remove(&old);
        }
        state.key = Some(key);
        state.volume = Some(Arc::clone(volume));
        state.valid = false;
        state.dirty = false;
        state.fixed = false;
        state.dirty_timestamp = 0;
        state.writer = true;
        state.writer_thread = Some(std::thread::current().id());
        inner.index.insert(key, slot);
        true
    }

    /// Pops the first clean, claim-free buffer off the LRU queue.
    fn pop_evictable(&self, inner: &mut PoolInner) -> Option<usize> {
        let mut scanned = 0;
        let limit = inner.lru.len();
        while scanned < limit {
            let slot = inner.lru.pop_front()?;
            scanned += 1;
            let state = self.buffers[slot].state.lock();
            if state.evictable() {
                return Some(slot);
            }
            // Claimed, dirty, or pinned: drop the stale queue entry; the
            // next release re-queues it.
        }
        None
    }

    /// Last resort: journal one dirty un-claimed buffer and hand its slot
    /// to the caller.
    fn evict_dirty_inline(&self) -> Result<Option<usize>> {
        for buffer in &self.buffers {
            if self.write_one(buffer, None, false)? {
                let state = buffer.state.lock();
                if state.evictable() {
                    drop(state);
                    let mut inner = self.shared.inner.lock();
                    inner.lru.retain(|&s| s != buffer.slot);
                    return Ok(Some(buffer.slot));
                }
            }
        }
        Ok(None)
    }

    fn load_page(&self, buffer: &Arc<Buffer>, volume: &Arc<Volume>, page: PageAddr) -> Result<()> {
        let mut data = buffer.data.write();
        data.resize(self.page_size, 0);
        if self.journal.read_page(volume, page, &mut data)? {
            return Ok(());
        }
        volume.read_page_from_file(page, &mut data)
    }

    fn abandon_load(&self, buffer: &Arc<Buffer>, key: PoolKey) {
        let mut inner = self.shared.inner.lock();
        let mut state = buffer.state.lock();
        inner.index.remove(&key);
        state.key = None;
        state.volume = None;
        state.valid = false;
        state.writer = false;
        state.writer_thread = None;
        inner.invalid.push(buffer.slot);
        buffer.released.notify_all();
        self.shared.space.notify_all();
    }

    fn make_guard(
        &self,
        buffer: Arc<Buffer>,
        volume: &Arc<Volume>,
        page: PageAddr,
        claim: Claim,
    ) -> PageGuard {
        let data = match claim {
            Claim::Reader => GuardData::Read(RwLock::read_arc(&buffer.data)),
            Claim::Writer => GuardData::Write(RwLock::write_arc(&buffer.data)),
        };
        PageGuard {
            buffer,
            volume: Arc::clone(volume),
            page,
            claim,
            data: Some(data),
        }
    }

    /// Appends the page's current image to the journal immediately, ahead
    /// of the page writer.
    ///
    /// Callers use this to order journal images: a page that a claimed
    /// referrer points at must reach the journal before the referrer can,
    /// or a crash leaves a dangling pointer. The buffer stays dirty; the
    /// page writer's later image is a harmless duplicate.
    pub fn journal_page_now(&self, guard: &PageGuard, timestamp: i64) -> Result<u64> {
        self.journal
            .write_page(guard.volume(), guard.page(), timestamp, guard.bytes())
    }

    /// Point-in-time copy of a page without installing it in the pool.
    pub fn get_copy(&self, volume: &Arc<Volume>, page: PageAddr) -> Result<Vec<u8>> {
        let key = (volume.id(), page);
        let slot_hit = {
            let inner = self.shared.inner.lock();
            inner.index.get(&key).copied()
        };
        if let Some(slot) = slot_hit {
            let buffer = Arc::clone(&self.buffers[slot]);
            if buffer.try_claim(Claim::Reader, true)? {
                let ours = {
                    let state = buffer.state.lock();
                    state.valid && state.key == Some(key)
                };
                if ours {
                    let copy = buffer.data.read().clone();
                    buffer.release_claim(Claim::Reader);
                    return Ok(copy);
                }
                buffer.release_claim(Claim::Reader);
            }
        }
        let mut buf = vec![0u8; self.page_size];
        if !self.journal.read_page(volume, page, &mut buf)? {
            volume.read_page_from_file(page, &mut buf)?;
        }
        Ok(buf)
    }

    /// Journals one buffer if it is dirty (and, with `before` set, only when
    /// it was dirtied before that timestamp). Returns true when the buffer
    /// is clean afterwards.
    fn write_one(&self, buffer: &Arc<Buffer>, before: Option<i64>, wait: bool) -> Result<bool> {
        let (volume, page, dirty_ts) = {
            let state = buffer.state.lock();
            if !state.valid || !state.dirty {
                return Ok(false);
            }
            if let Some(limit) = before {
                if state.dirty_timestamp >= limit {
                    return Ok(false);
                }
            }
            let Some((_, page)) = state.key else {
                return Ok(false);
            };
            let volume = state.volume.clone().ok_or_else(|| {
                Error::Corruption("dirty buffer without a volume binding".into())
            })?;
            (volume, page, state.dirty_timestamp)
        };
        // Reader claim keeps writers off the bytes while the image is
        // appended to the journal.
        if !buffer.try_claim(Claim::Reader, wait)? {
            return Ok(false);
        }
        let result = (|| -> Result<()> {
            let data = buffer.data.read();
            self.journal.write_page(&volume, page, dirty_ts, &data)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                {
                    let mut state = buffer.state.lock();
                    state.dirty = false;
                    state.dirty_timestamp = 0;
                }
                buffer.release_claim(Claim::Reader);
                Ok(true)
            }
            Err(err) => {
                buffer.release_claim(Claim::Reader);
                Err(err)
            }
        }
    }

    /// Drains dirty buffers to the journal. With `before` set, only buffers
    /// dirtied strictly before the timestamp are written (the checkpoint
    /// boundary); those are waited for rather than skipped.
    pub fn write_dirty_pages(&self, before: Option<i64>) -> Result<usize> {
        let mut written = 0;
        for buffer in &self.buffers {
            if self.write_one(buffer, before, before.is_some())? {
                written += 1;
            }
        }
        if written > 0 {
            self.shared.space.notify_all();
        }
        Ok(written)
    }

    /// Number of currently dirty buffers.
    pub fn dirty_count(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| {
                let state = b.state.lock();
                state.valid && state.dirty
            })
            .count()
    }

    /// Forgets every cached page of `volume`; used by `remove_tree`-style
    /// bulk releases and at volume close. Buffers must be claim-free.
    pub fn invalidate_volume(&self, volume_id: u64) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        for buffer in &self.buffers {
            let mut state = buffer.state.lock();
            if let Some((vid, _)) = state.key {
                if vid == volume_id {
                    if !state.claim_free() {
                        return Err(Error::InUse(
                            "cannot invalidate a claimed buffer".into(),
                        ));
                    }
                    let key = state.key.take().expect("key present");
                    inner.index.remove(&key);
                    state.volume = None;
                    state.valid = false;
                    state.dirty = false;
                    state.fixed = false;
                    inner.lru.retain(|&s| s != buffer.slot);
                    inner.invalid.push(buffer.slot);
                }
            }
        }
        self.shared.space.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeSpec;
    use crate::journal::JournalManager;
    use crate::page::{self, PageType};
    use crate::volume::Volume;
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 1024;

    fn fixture(buffer_count: usize) -> (TempDir, Arc<Volume>, Arc<JournalManager>, BufferPool) {
        let dir = TempDir::new().expect("tempdir");
        let journal = Arc::new(
            JournalManager::open(dir.path().join("journal"), PAGE_SIZE, 1024 * 1024, false)
                .expect("journal"),
        );
        let volume = Arc::new(
            Volume::create(&VolumeSpec::new(dir.path().join("t.v01")), PAGE_SIZE).expect("volume"),
        );
        let pool = BufferPool::new(PAGE_SIZE, buffer_count, Arc::clone(&journal));
        (dir, volume, journal, pool)
    }

    #[test]
    fn writes_are_visible_to_later_reads() {
        let (_dir, volume, _journal, pool) = fixture(16);
        {
            let mut guard = pool.get(&volume, 3, Claim::Writer, true).expect("writer");
            page::init_page(guard.bytes_mut(), PageType::Data, 0);
            guard.bytes_mut()[100] = 0x7E;
            guard.mark_dirty(5);
        }
        let guard = pool.get(&volume, 3, Claim::Reader, true).expect("reader");
        assert_eq!(guard.bytes()[100], 0x7E);
        assert_eq!(pool.dirty_count(), 1);
    }

    #[test]
    fn reader_claims_share_writer_claims_exclude() {
        let (_dir, volume, _journal, pool) = fixture(16);
        let a = pool.get(&volume, 1, Claim::Reader, true).expect("reader a");
        let _b = pool.get(&volume, 1, Claim::Reader, true).expect("reader b");
        assert!(matches!(
            pool.get(&volume, 1, Claim::Writer, false),
            Err(Error::InUse(_))
        ));
        drop(a);
        assert!(matches!(
            pool.get(&volume, 1, Claim::Writer, false),
            Err(Error::InUse(_))
        ));
    }

    #[test]
    fn eviction_prefers_clean_buffers_and_preserves_dirty_data() {
        let (_dir, volume, _journal, pool) = fixture(8);
        {
            let mut guard = pool.get(&volume, 0, Claim::Writer, true).expect("writer");
            guard.bytes_mut()[0] = 0xAB;
            guard.mark_dirty(1);
        }
        // Touch enough other pages to force eviction traffic.
        for p in 1..32u64 {
            let _ = pool.get(&volume, p, Claim::Reader, true).expect("fill");
        }
        let guard = pool.get(&volume, 0, Claim::Reader, true).expect("reread");
        assert_eq!(guard.bytes()[0], 0xAB, "dirty page survived eviction");
    }

    #[test]
    fn write_dirty_pages_cleans_and_journal_serves_reads() {
        let (_dir, volume, _journal, pool) = fixture(8);
        {
            let mut guard = pool.get(&volume, 2, Claim::Writer, true).expect("writer");
            page::init_page(guard.bytes_mut(), PageType::Data, 0);
            guard.bytes_mut()[7] = 0x42;
            guard.mark_dirty(9);
        }
        assert_eq!(pool.write_dirty_pages(None).expect("flush"), 1);
        assert_eq!(pool.dirty_count(), 0);

        // Evict everything, then re-read: the image must come back from the
        // journal page map, not the (never-written) volume file.
        pool.invalidate_volume(volume.id()).expect("invalidate");
        let guard = pool.get(&volume, 2, Claim::Reader, true).expect("reload");
        assert_eq!(guard.bytes()[7], 0x42);
    }

    #[test]
    fn checkpoint_boundary_skips_newer_dirt() {
        let (_dir, volume, _journal, pool) = fixture(8);
        {
            let mut guard = pool.get(&volume, 1, Claim::Writer, true).expect("w1");
            guard.bytes_mut()[0] = 1;
            guard.mark_dirty(5);
        }
        {
            let mut guard = pool.get(&volume, 2, Claim::Writer, true).expect("w2");
            guard.bytes_mut()[0] = 2;
            guard.mark_dirty(50);
        }
        let written = pool.write_dirty_pages(Some(10)).expect("flush older");
        assert_eq!(written, 1);
        assert_eq!(pool.dirty_count(), 1);
    }

    #[test]
    fn get_copy_does_not_install() {
        let (_dir, volume, _journal, pool) = fixture(8);
        let copy = pool.get_copy(&volume, 6).expect("copy");
        assert_eq!(copy.len(), PAGE_SIZE);
        let inner = pool.shared.inner.lock();
        assert!(!inner.index.contains_key(&(volume.id(), 6)));
    }

    #[test]
    fn pool_exhaustion_without_wait_reports_in_use() {
        let (_dir, volume, _journal, pool) = fixture(8);
        let guards: Vec<_> = (0..8u64)
            .map(|p| pool.get(&volume, p, Claim::Reader, true).expect("claim"))
            .collect();
        assert!(matches!(
            pool.get(&volume, 99, Claim::Reader, false),
            Err(Error::InUse(_))
        ));
        drop(guards);
        assert!(pool.get(&volume, 99, Claim::Reader, false).is_ok());
    }
}
