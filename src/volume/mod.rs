//! Volumes: one file, one page size, one head page.
//!
//! The `Volume` owns the in-memory copy of its head page, the page
//! allocator, and the garbage chain. Pages come from the garbage chain when
//! it is non-empty, otherwise from the file tail (extending the file in
//! `extension_pages` steps up to `maximum_pages`). Freed page chains are
//! threaded through their right-sibling pointers and parked on garbage
//! pages hanging off the head's garbage root.
//!
//! Directory-tree content (named tree records, statistics, accumulator
//! totals) is written through the B-tree layer; this module only reserves
//! page 1 for the directory root at creation time.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::{BufferPool, Claim, PageGuard};
use crate::config::VolumeSpec;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::page::{self, garbage, NodeMut, PageType};
use crate::timestamp::TimestampAllocator;
use crate::value::PageAddr;

pub mod file;
pub mod header;

use file::VolumeFile;
use header::VolumeHeader;

/// Reserved address of the directory-tree root page.
pub const DIRECTORY_ROOT_PAGE: PageAddr = 1;

pub struct Volume {
    name: String,
    file: VolumeFile,
    header: Mutex<VolumeHeader>,
    read_counter: AtomicU64,
    write_counter: AtomicU64,
    get_counter: AtomicU64,
}

impl Volume {
    /// Creates a brand-new volume file: head page, empty directory-root
    /// leaf, initial extension. Fails if the file already holds data.
    pub fn create(spec: &VolumeSpec, page_size: usize) -> Result<Self> {
        let file = VolumeFile::open(&spec.path, page_size, false, true)?;
        if file.size()? != 0 {
            return Err(Error::InvalidArgument(format!(
                "volume file {} already exists",
                spec.path.display()
            )));
        }
        let initial = spec.initial_pages.max(2);
        file.extend(initial)?;
        let header = VolumeHeader::new(
            page_size as u32,
            initial,
            spec.maximum_pages,
            spec.extension_pages.max(1),
        );

        let mut page0 = vec![0u8; page_size];
        header.encode(&mut page0);
        file.write_page(0, &page0)?;

        let mut root = vec![0u8; page_size];
        page::init_page(&mut root, PageType::Data, 0);
        let mut node = NodeMut::new(&mut root, DIRECTORY_ROOT_PAGE)?;
        if !node.insert_data(0, Key::left_guard().encoded(), &[])?
            || !node.insert_data(1, Key::right_guard().encoded(), &[])?
        {
            return Err(Error::Corruption(
                "page too small for directory guard records".into(),
            ));
        }
        file.write_page(DIRECTORY_ROOT_PAGE, &root)?;
        file.force()?;
        debug!(volume = %spec.name, "volume created");

        Ok(Self {
            name: spec.name.clone(),
            file,
            header: Mutex::new(header),
            read_counter: AtomicU64::new(0),
            write_counter: AtomicU64::new(0),
            get_counter: AtomicU64::new(0),
        })
    }

    /// Opens an existing volume, verifying signature and page size.
    pub fn open(spec: &VolumeSpec, page_size: usize) -> Result<Self> {
        let file = VolumeFile::open(&spec.path, page_size, spec.read_only, false)?;
        let mut page0 = vec![0u8; page_size];
        file.read_page(0, &mut page0)?;
        let mut header = VolumeHeader::decode(&page0)?;
        if header.page_size as usize != page_size {
            return Err(Error::Corruption(format!(
                "volume {} uses page size {}, engine configured {}",
                spec.path.display(),
                header.page_size,
                page_size
            )));
        }
        header.last_read_time_ms = header::now_ms();
        Ok(Self {
            name: spec.name.clone(),
            file,
            header: Mutex::new(header),
            read_counter: AtomicU64::new(0),
            write_counter: AtomicU64::new(0),
            get_counter: AtomicU64::new(0),
        })
    }

    /// Opens per `spec`, creating when allowed and the file is absent or
    /// empty.
    pub fn open_or_create(spec: &VolumeSpec, page_size: usize) -> Result<Self> {
        let exists = Path::new(&spec.path).exists()
            && std::fs::metadata(&spec.path).map(|m| m.len() > 0).unwrap_or(false);
        if exists {
            if spec.create_only {
                return Err(Error::InvalidArgument(format!(
                    "volume {} exists but createOnly was specified",
                    spec.path.display()
                )));
            }
            Self::open(spec, page_size)
        } else {
            if !spec.create && !spec.create_only {
                return Err(Error::NotFound(format!(
                    "volume file {}",
                    spec.path.display()
                )));
            }
            Self::create(spec, page_size)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.header.lock().volume_id
    }

    pub fn page_size(&self) -> usize {
        self.file.page_size()
    }

    pub fn is_read_only(&self) -> bool {
        self.file.is_read_only()
    }

    pub fn header_snapshot(&self) -> VolumeHeader {
        self.header.lock().clone()
    }

    pub fn directory_root(&self) -> PageAddr {
        self.header.lock().directory_root
    }

    pub fn garbage_root(&self) -> PageAddr {
        self.header.lock().garbage_root
    }

    pub fn next_available_page(&self) -> PageAddr {
        self.header.lock().next_available_page
    }

    pub fn set_global_timestamp(&self, ts: i64) {
        self.header.lock().global_timestamp = ts;
    }

    /// Repoints the directory root after a directory-tree root split.
    pub fn set_directory_root(&self, page: PageAddr) {
        self.header.lock().directory_root = page;
    }

    /// Replaces the in-memory header with a newer journaled image; recovery
    /// calls this because the file's head page lags behind the journal
    /// between checkpoints.
    pub fn adopt_header(&self, newer: VolumeHeader) -> Result<()> {
        let mut header = self.header.lock();
        if newer.volume_id != header.volume_id {
            return Err(Error::Corruption(format!(
                "journaled head page belongs to volume {:x}, file holds {:x}",
                newer.volume_id, header.volume_id
            )));
        }
        *header = newer;
        Ok(())
    }

    /// Raises the allocation high-water mark past pages known to be in use
    /// (recovery derives this from the journal's page map). The file size
    /// is authoritative for the extended region; extensions are forced.
    pub fn ensure_next_available(&self, at_least: PageAddr) -> Result<()> {
        let file_pages = self.file.page_count()?;
        let mut header = self.header.lock();
        if at_least > header.next_available_page {
            header.next_available_page = at_least;
        }
        if file_pages > header.extended_page_count {
            header.extended_page_count = file_pages;
        }
        Ok(())
    }

    /// Raw file read used by the buffer pool on a journal miss.
    pub fn read_page_from_file(&self, page: PageAddr, buf: &mut [u8]) -> Result<()> {
        self.read_counter.fetch_add(1, Ordering::Relaxed);
        self.file.read_page(page, buf)
    }

    /// Raw file write; checkpoint copier only.
    pub fn write_page_raw(&self, page: PageAddr, buf: &[u8]) -> Result<()> {
        self.write_counter.fetch_add(1, Ordering::Relaxed);
        self.file.write_page(page, buf)
    }

    pub fn force(&self) -> Result<()> {
        self.file.force()
    }

    pub fn note_get(&self) {
        self.get_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Encodes the current header into the pooled head page so the page
    /// writer journals it with everything else.
    pub fn write_header(self: &Arc<Self>, pool: &BufferPool, ts: i64) -> Result<()> {
        let mut guard = pool.get_fixed(self, 0, Claim::Writer, true)?;
        {
            let mut header = self.header.lock();
            header.last_write_time_ms = header::now_ms();
            header.read_counter = self.read_counter.load(Ordering::Relaxed);
            header.write_counter = self.write_counter.load(Ordering::Relaxed);
            header.get_counter = self.get_counter.load(Ordering::Relaxed);
            header.encode(guard.bytes_mut());
        }
        guard.mark_dirty(ts);
        Ok(())
    }

    /// Allocates one page: garbage chain first, then the file tail. The
    /// page comes back under a fresh writer claim, typed `Unallocated`.
    pub fn allocate_page(
        self: &Arc<Self>,
        pool: &BufferPool,
        allocator: &TimestampAllocator,
    ) -> Result<PageGuard> {
        if self.is_read_only() {
            return Err(Error::ReadOnly(format!(
                "allocation on read-only volume {}",
                self.name
            )));
        }
        let addr = {
            let mut header = self.header.lock();
            if header.garbage_root != 0 {
                let root_addr = header.garbage_root;
                let mut root = pool.get(self, root_addr, Claim::Writer, true)?;
                page::expect_type(root.bytes(), root_addr, PageType::Garbage)?;
                match garbage::pop(root.bytes_mut()) {
                    Some(entry) => {
                        root.mark_dirty(allocator.current());
                        let allocated = entry.left;
                        if entry.left != entry.right {
                            // Re-park the remainder of the chain.
                            let next = {
                                let chain_head =
                                    pool.get(self, entry.left, Claim::Reader, true)?;
                                page::right_sibling(chain_head.bytes())
                            };
                            if next == 0 {
                                return Err(Error::corrupt_page(
                                    entry.left,
                                    "garbage chain ends before its recorded tail",
                                ));
                            }
                            if !garbage::push(
                                root.bytes_mut(),
                                garbage::ChainEntry {
                                    left: next,
                                    right: entry.right,
                                },
                            ) {
                                return Err(Error::corrupt_page(
                                    root_addr,
                                    "garbage page rejected a just-popped entry",
                                ));
                            }
                        }
                        // The chain must not resurrect the handed-out page
                        // after a crash.
                        pool.journal_page_now(&root, allocator.current())?;
                        Some(allocated)
                    }
                    None => {
                        // Empty garbage page: the page itself is reusable.
                        header.garbage_root = page::right_sibling(root.bytes());
                        root.mark_dirty(allocator.current());
                        Some(root_addr)
                    }
                }
            } else {
                None
            }
        };

        let addr = match addr {
            Some(addr) => addr,
            None => self.allocate_from_tail()?,
        };

        let mut guard = pool.get(self, addr, Claim::Writer, true)?;
        page::init_page(guard.bytes_mut(), PageType::Unallocated, 0);
        guard.mark_dirty(allocator.current());
        self.write_header(pool, allocator.current())?;
        Ok(guard)
    }

    fn allocate_from_tail(&self) -> Result<PageAddr> {
        let mut header = self.header.lock();
        if header.next_available_page >= header.extended_page_count {
            let target = header
                .extended_page_count
                .saturating_add(header.extension_pages)
                .min(header.maximum_pages);
            if target <= header.next_available_page {
                return Err(Error::VolumeFull(format!(
                    "volume {} reached its maximum of {} pages",
                    self.name, header.maximum_pages
                )));
            }
            self.file.extend(target)?;
            header.extended_page_count = target;
            header.last_extension_time_ms = header::now_ms();
        }
        let addr = header.next_available_page;
        header.next_available_page += 1;
        Ok(addr)
    }

    /// Splices the chain `[left, right]` (linked by right-sibling pointers)
    /// onto the garbage root, starting a new garbage page when needed.
    pub fn free_chain(
        self: &Arc<Self>,
        pool: &BufferPool,
        allocator: &TimestampAllocator,
        left: PageAddr,
        right: PageAddr,
    ) -> Result<()> {
        if left == 0 || right == 0 {
            return Err(Error::InvalidArgument(
                "attempt to free the head page region".into(),
            ));
        }
        let mut header = self.header.lock();
        let entry = garbage::ChainEntry { left, right };
        if header.garbage_root != 0 {
            let root_addr = header.garbage_root;
            let mut root = pool.get(self, root_addr, Claim::Writer, true)?;
            page::expect_type(root.bytes(), root_addr, PageType::Garbage)?;
            if garbage::push(root.bytes_mut(), entry) {
                root.mark_dirty(allocator.current());
                pool.journal_page_now(&root, allocator.current())?;
                drop(root);
                drop(header);
                return self.write_header(pool, allocator.current());
            }
        }
        // Root missing or full: the first page of the freed chain becomes
        // the new garbage root and carries the remainder as its entry.
        let old_root = header.garbage_root;
        let (chain_left, reuse_as_root) = (left, right != left);
        let mut root = pool.get(self, chain_left, Claim::Writer, true)?;
        let remainder = if reuse_as_root {
            let next = page::right_sibling(root.bytes());
            if next == 0 {
                return Err(Error::corrupt_page(
                    chain_left,
                    "freed chain shorter than its recorded tail",
                ));
            }
            Some(garbage::ChainEntry { left: next, right })
        } else {
            None
        };
        page::init_page(root.bytes_mut(), PageType::Garbage, 0);
        page::set_right_sibling(root.bytes_mut(), old_root);
        if let Some(entry) = remainder {
            if !garbage::push(root.bytes_mut(), entry) {
                return Err(Error::corrupt_page(
                    chain_left,
                    "fresh garbage page rejected its first entry",
                ));
            }
        }
        root.mark_dirty(allocator.current());
        pool.journal_page_now(&root, allocator.current())?;
        header.garbage_root = chain_left;
        drop(root);
        drop(header);
        self.write_header(pool, allocator.current())
    }

    /// Pages currently recorded on the garbage chain (garbage pages
    /// themselves included). Walks the chain; intended for integrity
    /// checking and tests.
    pub fn garbage_page_count(self: &Arc<Self>, pool: &BufferPool) -> Result<u64> {
        let mut count = 0u64;
        let mut garbage_page = self.garbage_root();
        while garbage_page != 0 {
            let guard = pool.get(self, garbage_page, Claim::Reader, true)?;
            page::expect_type(guard.bytes(), garbage_page, PageType::Garbage)?;
            count += 1;
            for idx in 0..garbage::count(guard.bytes()) {
                let entry = garbage::entry(guard.bytes(), idx)?;
                let mut page_addr = entry.left;
                loop {
                    count += 1;
                    if page_addr == entry.right {
                        break;
                    }
                    let link = pool.get(self, page_addr, Claim::Reader, true)?;
                    page_addr = page::right_sibling(link.bytes());
                    if page_addr == 0 {
                        return Err(Error::corrupt_page(
                            entry.left,
                            "garbage chain ends before its recorded tail",
                        ));
                    }
                }
            }
            garbage_page = page::right_sibling(guard.bytes());
        }
        Ok(count)
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("path", &self.file.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalManager;
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 1024;

    fn fixture() -> (TempDir, Arc<Volume>, BufferPool, TimestampAllocator) {
        let dir = TempDir::new().expect("tempdir");
        let journal = Arc::new(
            JournalManager::open(dir.path().join("jr"), PAGE_SIZE, 256 * 1024, false)
                .expect("journal"),
        );
        let mut spec = VolumeSpec::new(dir.path().join("v.v01"));
        spec.initial_pages = 4;
        spec.maximum_pages = 64;
        spec.extension_pages = 4;
        let volume = Arc::new(Volume::create(&spec, PAGE_SIZE).expect("volume"));
        let pool = BufferPool::new(PAGE_SIZE, 32, journal);
        (dir, volume, pool, TimestampAllocator::new())
    }

    #[test]
    fn create_then_open_preserves_header() {
        let dir = TempDir::new().expect("tempdir");
        let mut spec = VolumeSpec::new(dir.path().join("v.v01"));
        spec.initial_pages = 8;
        let id = {
            let volume = Volume::create(&spec, PAGE_SIZE).expect("create");
            volume.id()
        };
        let volume = Volume::open(&spec, PAGE_SIZE).expect("open");
        assert_eq!(volume.id(), id);
        assert_eq!(volume.directory_root(), DIRECTORY_ROOT_PAGE);
        assert_eq!(volume.next_available_page(), 2);
    }

    #[test]
    fn tail_allocation_extends_and_respects_maximum() {
        let (_dir, volume, pool, alloc) = fixture();
        let mut last = 0;
        for _ in 0..10 {
            let guard = volume.allocate_page(&pool, &alloc).expect("alloc");
            last = guard.page();
        }
        assert_eq!(last, 11, "allocation starts at page 2");

        // Exhaust up to the configured maximum.
        let mut hit_full = false;
        for _ in 0..80 {
            match volume.allocate_page(&pool, &alloc) {
                Ok(_) => {}
                Err(Error::VolumeFull(_)) => {
                    hit_full = true;
                    break;
                }
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert!(hit_full, "maximum_pages must bound the volume");
    }

    #[test]
    fn freed_chain_is_reallocated_first() {
        let (_dir, volume, pool, alloc) = fixture();
        // Build a two-page chain linked by right siblings.
        let (a, b);
        {
            let mut ga = volume.allocate_page(&pool, &alloc).expect("a");
            a = ga.page();
            let gb = volume.allocate_page(&pool, &alloc).expect("b");
            b = gb.page();
            page::set_right_sibling(ga.bytes_mut(), b);
            ga.mark_dirty(alloc.current());
        }
        volume.free_chain(&pool, &alloc, a, b).expect("free");
        assert_ne!(volume.garbage_root(), 0);

        // The chain head became the garbage root; the remainder (b) is the
        // first page handed back out.
        let next = volume.allocate_page(&pool, &alloc).expect("realloc");
        assert_eq!(next.page(), b);
        drop(next);
        // Then the emptied garbage page itself.
        let next2 = volume.allocate_page(&pool, &alloc).expect("realloc2");
        assert_eq!(next2.page(), a);
        drop(next2);
        assert_eq!(volume.garbage_root(), 0);
    }

    #[test]
    fn garbage_conservation_counts() {
        let (_dir, volume, pool, alloc) = fixture();
        let pages: Vec<PageAddr> = (0..3)
            .map(|_| {
                let g = volume.allocate_page(&pool, &alloc).expect("alloc");
                g.page()
            })
            .collect();
        // Free each singly.
        for &p in &pages {
            volume.free_chain(&pool, &alloc, p, p).expect("free");
        }
        let garbage = volume.garbage_page_count(&pool).expect("count");
        // All three pages are on the chain (one serves as the root).
        assert_eq!(garbage, 3);
        let next_available = volume.next_available_page();
        assert_eq!(next_available, 5, "2 reserved + 3 allocated");
    }
}
