//! Append-only journal: the sole writer of durable state.
//!
//! Journal addresses are one monotonically increasing byte offset across
//! segment files of fixed size; segment `k` covers addresses
//! `[k * segment_size, (k + 1) * segment_size)`. Each segment is pre-extended
//! and starts with a `JH` record; a record never crosses a segment boundary
//! (the tail is left zeroed and the scanner treats a zero length as
//! padding). All appends funnel through the single-writer core mutex, which
//! also owns the page map, the handle maps, and the live-transaction map.
//!
//! Opening the journal scans every existing segment forward, CRC-checking
//! each record; the first torn record is the crash point, the tail beyond it
//! is zeroed, and appending resumes there. What the scan learned (handle
//! maps, page map, committed/aborted transactions, last checkpoint) is
//! handed to recovery.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::config::CommitPolicy;
use crate::error::{Error, Result};
use crate::mvv::{ABORTED, UNCOMMITTED};
use crate::value::PageAddr;
use crate::volume::Volume;

pub mod record;

use record::{
    Checkpoint, Frame, Framed, JournalHeader, PageImage, PageMapEntry, TreeIntro, TxnEnd,
    TxnMapEntry, VolumeIntro,
};

/// Width of the segment counter in file names.
const SEGMENT_DIGITS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageNode {
    address: u64,
    timestamp: i64,
}

/// One operation replayed from a recovered transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveredOp {
    Store {
        tree_handle: u32,
        step: u8,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    RemoveRange {
        tree_handle: u32,
        step: u8,
        key1: Vec<u8>,
        key2: Vec<u8>,
    },
    RemoveTree {
        tree_handle: u32,
    },
    Delta {
        tree_handle: u32,
        index: u32,
        delta: i64,
    },
}

#[derive(Debug, Clone)]
pub struct RecoveredTransaction {
    pub ts: i64,
    pub commit_ts: i64,
    pub ops: Vec<RecoveredOp>,
}

/// Everything the startup scan learned from the journal.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub volumes: Vec<VolumeIntro>,
    pub trees: Vec<TreeIntro>,
    /// Transactions committed after the last checkpoint, in commit order.
    pub committed: Vec<RecoveredTransaction>,
    /// Transactions that aborted or never finished, as
    /// `(start ts, outstanding-version estimate)`.
    pub aborted: Vec<(i64, i64)>,
    pub last_checkpoint_ts: i64,
    pub max_timestamp: i64,
}

struct Core {
    /// Next journal address to be assigned.
    current_address: u64,
    /// Unflushed bytes; `buffer` starts at address `buffer_base`.
    buffer: BytesMut,
    buffer_base: u64,
    /// Everything below this address is on disk and forced.
    durable_address: u64,
    current_file: Option<File>,
    page_map: FxHashMap<(u32, PageAddr), PageNode>,
    volume_handles: FxHashMap<u64, u32>,
    tree_handles: FxHashMap<(u32, String), u32>,
    next_volume_handle: u32,
    next_tree_handle: u32,
    /// Live transactions: start ts -> address of their first record.
    live_txns: FxHashMap<i64, u64>,
    /// Recently committed transactions whose records must outlive segment
    /// truncation until a checkpoint covers them: ts -> (start, commit ts).
    recent_commits: FxHashMap<i64, (u64, i64)>,
    base_address: u64,
}

pub struct JournalManager {
    prefix: PathBuf,
    page_size: usize,
    segment_size: u64,
    append_only: bool,
    core: Mutex<Core>,
    durable: Condvar,
    panicked: AtomicBool,
    recovered: Mutex<Option<RecoveredState>>,
}

impl JournalManager {
    pub fn open(
        prefix: impl Into<PathBuf>,
        page_size: usize,
        segment_size: u64,
        append_only: bool,
    ) -> Result<Self> {
        let prefix = prefix.into();
        if let Some(parent) = prefix.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let scan = scan_journal(&prefix, segment_size)?;
        let core = Core {
            current_address: scan.end_address,
            buffer: BytesMut::with_capacity(256 * 1024),
            buffer_base: scan.end_address,
            durable_address: scan.end_address,
            current_file: None,
            page_map: scan.page_map,
            volume_handles: scan.volume_handles,
            tree_handles: scan.tree_handles,
            next_volume_handle: scan.next_volume_handle,
            next_tree_handle: scan.next_tree_handle,
            live_txns: FxHashMap::default(),
            recent_commits: FxHashMap::default(),
            base_address: scan.base_address,
        };
        if scan.truncate_at.is_some() {
            warn!(
                address = scan.end_address,
                "journal tail truncated at crash point"
            );
        }
        Ok(Self {
            prefix,
            page_size,
            segment_size,
            append_only,
            core: Mutex::new(core),
            durable: Condvar::new(),
            panicked: AtomicBool::new(false),
            recovered: Mutex::new(Some(scan.recovered)),
        })
    }

    /// Hands the startup scan result to recovery; `None` after the first call.
    pub fn take_recovered_state(&self) -> Option<RecoveredState> {
        self.recovered.lock().take()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn current_address(&self) -> u64 {
        self.core.lock().current_address
    }

    pub fn durable_address(&self) -> u64 {
        self.core.lock().durable_address
    }

    pub fn base_address(&self) -> u64 {
        self.core.lock().base_address
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_panicked() {
            return Err(Error::JournalPanic(
                "journal entered read-only panic state after a write failure".into(),
            ));
        }
        Ok(())
    }

    fn segment_path(&self, index: u64) -> PathBuf {
        let mut name = self.prefix.as_os_str().to_owned();
        name.push(format!(".{:0width$}", index, width = SEGMENT_DIGITS));
        PathBuf::from(name)
    }

    /// Ensures `core.current_file` is the segment containing
    /// `core.current_address`, creating and pre-extending it when new.
    fn ensure_segment(&self, core: &mut Core) -> Result<()> {
        if core.current_file.is_some() {
            return Ok(());
        }
        let index = core.current_address / self.segment_size;
        let offset = core.current_address % self.segment_size;
        let path = self.segment_path(index);
        if offset == 0 {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.set_len(self.segment_size)?;
            file.sync_all()?;
            core.current_file = Some(file);
            let header = JournalHeader {
                version: record::JOURNAL_FORMAT_VERSION,
                segment_size: self.segment_size,
                base_address: core.base_address,
                segment_address: core.current_address,
                created_ms: crate::volume::header::now_ms(),
                path: path.display().to_string(),
            };
            let start = core.buffer.len();
            header.encode(&mut core.buffer);
            core.current_address += (core.buffer.len() - start) as u64;
            debug!(segment = index, "journal segment created");
        } else {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            core.current_file = Some(file);
        }
        Ok(())
    }

    /// Writes buffered bytes into the current segment and forces them.
    fn flush_core(&self, core: &mut Core) -> Result<()> {
        if core.buffer.is_empty() {
            return Ok(());
        }
        let file = core
            .current_file
            .as_ref()
            .ok_or_else(|| Error::JournalPanic("journal buffer without a segment file".into()))?;
        let offset = core.buffer_base % self.segment_size;
        let result = write_at(file, &core.buffer, offset).and_then(|_| file.sync_data());
        if let Err(err) = result {
            self.panicked.store(true, Ordering::SeqCst);
            return Err(Error::JournalPanic(format!("journal write failed: {err}")));
        }
        core.buffer_base += core.buffer.len() as u64;
        core.durable_address = core.buffer_base;
        core.buffer.clear();
        self.durable.notify_all();
        Ok(())
    }

    /// Makes room for a record of `len` bytes, rolling to a new segment when
    /// it would cross the boundary. Returns the record's address.
    fn prepare_append(&self, core: &mut Core, len: usize) -> Result<u64> {
        if len as u64 + 256 > self.segment_size {
            return Err(Error::JournalPanic(format!(
                "record of {len} bytes cannot fit in a {} byte segment",
                self.segment_size
            )));
        }
        self.ensure_segment(core)?;
        let offset = core.current_address % self.segment_size;
        if offset + len as u64 > self.segment_size {
            // Flush what we have, leave the zeroed tail as padding, and
            // start the next segment.
            self.flush_core(core)?;
            core.current_address = (core.current_address / self.segment_size + 1)
                .checked_mul(self.segment_size)
                .ok_or_else(|| Error::JournalPanic("journal address space exhausted".into()))?;
            core.buffer_base = core.current_address;
            core.durable_address = core.current_address;
            core.current_file = None;
            self.ensure_segment(core)?;
        }
        Ok(core.current_address)
    }

    fn volume_handle_locked(&self, core: &mut Core, volume: &Volume) -> Result<u32> {
        if let Some(&handle) = core.volume_handles.get(&volume.id()) {
            return Ok(handle);
        }
        let handle = core.next_volume_handle;
        core.next_volume_handle += 1;
        let intro = VolumeIntro {
            handle,
            volume_id: volume.id(),
            page_size: self.page_size as u32,
            name: volume.name().to_owned(),
        };
        let mut encoded = BytesMut::new();
        intro.encode(&mut encoded);
        self.prepare_append(core, encoded.len())?;
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;
        core.volume_handles.insert(volume.id(), handle);
        Ok(handle)
    }

    /// Small-integer handle for a volume, introducing it with an `IV` record
    /// on first use.
    pub fn volume_handle(&self, volume: &Volume) -> Result<u32> {
        self.check_writable()?;
        let mut core = self.core.lock();
        self.volume_handle_locked(&mut core, volume)
    }

    /// Small-integer handle for a tree, introducing it with an `IT` record
    /// on first use.
    pub fn tree_handle(&self, volume: &Volume, tree_name: &str) -> Result<u32> {
        self.check_writable()?;
        let mut core = self.core.lock();
        let volume_handle = self.volume_handle_locked(&mut core, volume)?;
        if let Some(&handle) = core
            .tree_handles
            .get(&(volume_handle, tree_name.to_owned()))
        {
            return Ok(handle);
        }
        let handle = core.next_tree_handle;
        core.next_tree_handle += 1;
        let intro = TreeIntro {
            handle,
            volume_handle,
            name: tree_name.to_owned(),
        };
        let mut encoded = BytesMut::new();
        intro.encode(&mut encoded);
        self.prepare_append(&mut core, encoded.len())?;
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;
        core.tree_handles
            .insert((volume_handle, tree_name.to_owned()), handle);
        Ok(handle)
    }

    /// Appends a `PA` page image and points the page map at it.
    pub fn write_page(
        &self,
        volume: &Volume,
        page: PageAddr,
        timestamp: i64,
        bytes: &[u8],
    ) -> Result<u64> {
        self.check_writable()?;
        debug_assert_eq!(bytes.len(), self.page_size);
        let mut core = self.core.lock();
        let volume_handle = self.volume_handle_locked(&mut core, volume)?;
        let mut encoded = BytesMut::with_capacity(bytes.len() + 64);
        PageImage {
            volume_handle,
            page,
            timestamp,
            bytes,
        }
        .encode(&mut encoded);
        let address = self.prepare_append(&mut core, encoded.len())?;
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;
        core.page_map.insert(
            (volume_handle, page),
            PageNode {
                address,
                timestamp,
            },
        );
        Ok(address)
    }

    /// Serves a page from the newest `PA` in the page map. Returns false
    /// when the journal has no copy and the caller should read the volume.
    pub fn read_page(&self, volume: &Volume, page: PageAddr, buf: &mut [u8]) -> Result<bool> {
        let core = self.core.lock();
        let Some(&volume_handle) = core.volume_handles.get(&volume.id()) else {
            return Ok(false);
        };
        let Some(&node) = core.page_map.get(&(volume_handle, page)) else {
            return Ok(false);
        };
        self.read_page_image_locked(&core, node.address, volume_handle, page, buf)?;
        Ok(true)
    }

    /// Reads and validates the `PA` record at `address`, either still in the
    /// write buffer or out of a segment file.
    fn read_page_image_locked(
        &self,
        core: &Core,
        address: u64,
        volume_handle: u32,
        page: PageAddr,
        buf: &mut [u8],
    ) -> Result<()> {
        let frame_bytes: Vec<u8>;
        let frame: Frame<'_> = if address >= core.buffer_base {
            let offset = (address - core.buffer_base) as usize;
            match record::read_frame(&core.buffer[offset..])? {
                Framed::Record(frame) => frame,
                _ => {
                    return Err(Error::Corruption(format!(
                        "page map points at invalid buffered record {address}"
                    )))
                }
            }
        } else {
            let index = address / self.segment_size;
            let offset = address % self.segment_size;
            let file = File::open(self.segment_path(index))?;
            let mut len_bytes = [0u8; 4];
            read_at(&file, &mut len_bytes, offset)?;
            let len = u32::from_be_bytes(len_bytes) as usize;
            if len < record::RECORD_OVERHEAD || offset + len as u64 > self.segment_size {
                return Err(Error::Corruption(format!(
                    "page map points at unframed record {address}"
                )));
            }
            let mut bytes = vec![0u8; len];
            read_at(&file, &mut bytes, offset)?;
            frame_bytes = bytes;
            match record::read_frame(&frame_bytes)? {
                Framed::Record(frame) => frame,
                _ => {
                    return Err(Error::Corruption(format!(
                        "page map points at invalid record {address}"
                    )))
                }
            }
        };
        if frame.rtype != record::TYPE_PA {
            return Err(Error::Corruption(format!(
                "page map points at {} record",
                record::type_name(frame.rtype)
            )));
        }
        let image = PageImage::decode(frame.payload)?;
        if image.volume_handle != volume_handle || image.page != page {
            return Err(Error::Corruption(format!(
                "page map address {address} resolves to a different page"
            )));
        }
        if image.bytes.len() != buf.len() {
            return Err(Error::Corruption(format!(
                "journal page image size {} does not match page size {}",
                image.bytes.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(image.bytes);
        Ok(())
    }

    /// Highest page address of `volume` with a journaled image; recovery
    /// uses it to clear the allocator past every durable page.
    pub fn max_mapped_page(&self, volume: &Volume) -> Option<PageAddr> {
        let core = self.core.lock();
        let handle = *core.volume_handles.get(&volume.id())?;
        core.page_map
            .keys()
            .filter(|&&(h, _)| h == handle)
            .map(|&(_, page)| page)
            .max()
    }

    /// Appends one chunk of a transaction's record stream. The first chunk
    /// registers the transaction in the live map.
    pub fn append_transaction(&self, ts: i64, encoded: &[u8], first_chunk: bool) -> Result<u64> {
        self.check_writable()?;
        let mut core = self.core.lock();
        let address = self.prepare_append(&mut core, encoded.len())?;
        core.buffer.extend_from_slice(encoded);
        core.current_address += encoded.len() as u64;
        if first_chunk {
            core.live_txns.insert(ts, address);
        }
        Ok(core.current_address)
    }

    /// Appends the `TC` record ending a transaction (commit or abort) and
    /// retires it from the live map. Returns the address the caller must
    /// wait on for durability.
    pub fn append_transaction_end(&self, ts: i64, commit_ts: i64) -> Result<u64> {
        self.check_writable()?;
        let mut core = self.core.lock();
        let start_address = core.live_txns.remove(&ts).unwrap_or(0);
        if commit_ts != ABORTED && start_address != 0 {
            // Keep the record stream reachable for redo until a checkpoint
            // observes the commit.
            core.recent_commits.insert(ts, (start_address, commit_ts));
        }
        let mut encoded = BytesMut::new();
        TxnEnd {
            ts,
            commit_ts,
            start_address,
        }
        .encode(&mut encoded);
        self.prepare_append(&mut core, encoded.len())?;
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;
        Ok(core.current_address)
    }

    /// Forces everything buffered so far.
    pub fn flush(&self) -> Result<()> {
        let mut core = self.core.lock();
        self.flush_core(&mut core)
    }

    /// Blocks until the journal is durable past `address`, per policy.
    /// Group commit parks for `stall` first so concurrent committers share
    /// one force.
    pub fn wait_for_durability(
        &self,
        address: u64,
        policy: CommitPolicy,
        stall: Duration,
    ) -> Result<()> {
        match policy {
            CommitPolicy::Soft => Ok(()),
            CommitPolicy::Hard => {
                let mut core = self.core.lock();
                if core.durable_address >= address {
                    return Ok(());
                }
                self.flush_core(&mut core)
            }
            CommitPolicy::Group => {
                let mut core = self.core.lock();
                if core.durable_address >= address {
                    return Ok(());
                }
                // Park briefly; whoever wakes first performs the shared force.
                let timed_out = self
                    .durable
                    .wait_for(&mut core, stall.max(Duration::from_micros(100)))
                    .timed_out();
                if core.durable_address >= address {
                    return Ok(());
                }
                let _ = timed_out;
                self.flush_core(&mut core)
            }
        }
    }

    /// Writes the checkpoint record group (`PM`, `TM`, `CP`), forces it,
    /// copies every mapped page image back to its volume, prunes the map,
    /// advances the base address, and drops dead segments.
    ///
    /// The caller must already have journaled every page dirtied before
    /// `cp_ts` (see `BufferPool::write_dirty_pages`).
    pub fn checkpoint(
        &self,
        cp_ts: i64,
        volumes_by_id: &FxHashMap<u64, Arc<Volume>>,
        aborted_outstanding: &[i64],
    ) -> Result<()> {
        self.check_writable()?;
        // Phase 1: snapshot + record group + force, under the core lock.
        let (snapshot, handles_to_volumes) = {
            let mut core = self.core.lock();
            // Commits a checkpoint has now covered no longer pin segments.
            core.recent_commits.retain(|_, &mut (_, tc)| tc > cp_ts);
            let snapshot: Vec<PageMapEntry> = core
                .page_map
                .iter()
                .map(|(&(volume_handle, page), node)| PageMapEntry {
                    volume_handle,
                    page,
                    journal_address: node.address,
                    timestamp: node.timestamp,
                })
                .collect();
            let mut txns: Vec<TxnMapEntry> = core
                .live_txns
                .iter()
                .map(|(&start_ts, &start_address)| TxnMapEntry {
                    start_ts,
                    commit_ts: UNCOMMITTED,
                    start_address,
                })
                .collect();
            // Aborted transactions with versions still in pages travel in
            // the TM so recovery re-injects them even after their original
            // records age out of the journal.
            for &ts in aborted_outstanding {
                txns.push(TxnMapEntry {
                    start_ts: ts,
                    commit_ts: ABORTED,
                    start_address: 0,
                });
            }
            let mut encoded = BytesMut::new();
            record::encode_page_map(&mut encoded, &snapshot);
            record::encode_txn_map(&mut encoded, &txns);
            let min_live = core.live_txns.values().copied().min();
            let min_recent = core.recent_commits.values().map(|&(start, _)| start).min();
            let min_mapped = snapshot.iter().map(|e| e.journal_address).min();
            let cp_address = core.current_address;
            let base = [Some(cp_address), min_live, min_recent, min_mapped]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(cp_address);
            Checkpoint {
                timestamp: cp_ts,
                base_address: base,
                wallclock_ms: crate::volume::header::now_ms(),
            }
            .encode(&mut encoded);
            // The checkpoint record group must stay within one segment so a
            // scan never finds half of it.
            self.prepare_append(&mut core, encoded.len())?;
            core.buffer.extend_from_slice(&encoded);
            core.current_address += encoded.len() as u64;
            self.flush_core(&mut core)?;

            let mut by_handle: FxHashMap<u32, Arc<Volume>> = FxHashMap::default();
            for (&volume_id, &handle) in core.volume_handles.iter() {
                if let Some(volume) = volumes_by_id.get(&volume_id) {
                    by_handle.insert(handle, Arc::clone(volume));
                }
            }
            (snapshot, by_handle)
        };

        // Phase 2: copy page images back to the volume files. Reads are
        // all below the durable boundary after the flush above.
        let mut page_buf = vec![0u8; self.page_size];
        let mut copied = 0usize;
        for entry in &snapshot {
            let Some(volume) = handles_to_volumes.get(&entry.volume_handle) else {
                continue;
            };
            if volume.is_read_only() {
                continue;
            }
            {
                let core = self.core.lock();
                self.read_page_image_locked(
                    &core,
                    entry.journal_address,
                    entry.volume_handle,
                    entry.page,
                    &mut page_buf,
                )?;
            }
            volume.write_page_raw(entry.page, &page_buf)?;
            copied += 1;
        }
        for volume in handles_to_volumes.values() {
            if !volume.is_read_only() {
                volume.force()?;
            }
        }

        // Phase 3: prune copied entries (unless superseded) and advance the
        // base past everything no longer needed.
        {
            let mut core = self.core.lock();
            for entry in &snapshot {
                if let Some(node) = core.page_map.get(&(entry.volume_handle, entry.page)) {
                    if node.address == entry.journal_address {
                        core.page_map.remove(&(entry.volume_handle, entry.page));
                    }
                }
            }
            let min_live = core.live_txns.values().copied().min();
            let min_recent = core.recent_commits.values().map(|&(start, _)| start).min();
            let min_mapped = core.page_map.values().map(|n| n.address).min();
            let ceiling = core.durable_address;
            core.base_address = [Some(ceiling), min_live, min_recent, min_mapped]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(ceiling);
        }
        info!(cp_ts, copied, "checkpoint complete");
        if !self.append_only {
            self.delete_dead_segments()?;
        }
        Ok(())
    }

    /// Removes whole segment files entirely below the base address.
    fn delete_dead_segments(&self) -> Result<()> {
        let (base, current) = {
            let core = self.core.lock();
            (core.base_address, core.current_address)
        };
        let first_live_segment = base / self.segment_size;
        let current_segment = current / self.segment_size;
        for index in 0..first_live_segment.min(current_segment) {
            let path = self.segment_path(index);
            if path.exists() {
                fs::remove_file(&path)?;
                debug!(segment = index, "journal segment deleted");
            }
        }
        Ok(())
    }
}

fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        file.write_all_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        let _ = (file, buf, offset);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned writes unsupported on this platform",
        ))
    }
}

fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        file.read_exact_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        let _ = (file, buf, offset);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned reads unsupported on this platform",
        ))
    }
}

struct ScanResult {
    end_address: u64,
    truncate_at: Option<u64>,
    page_map: FxHashMap<(u32, PageAddr), PageNode>,
    volume_handles: FxHashMap<u64, u32>,
    tree_handles: FxHashMap<(u32, String), u32>,
    next_volume_handle: u32,
    next_tree_handle: u32,
    base_address: u64,
    recovered: RecoveredState,
}

/// Lists existing segment files of `prefix` as `(index, path)` in order.
fn list_segments(prefix: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let parent = prefix
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let Some(stem) = prefix.file_name().map(|s| s.to_string_lossy().into_owned()) else {
        return Ok(Vec::new());
    };
    if !parent.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(suffix) = name
            .strip_prefix(&stem)
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };
        if suffix.len() == SEGMENT_DIGITS {
            if let Ok(index) = suffix.parse::<u64>() {
                out.push((index, entry.path()));
            }
        }
    }
    out.sort();
    Ok(out)
}

/// In-flight transaction state during the scan.
#[derive(Default)]
struct ScanTxn {
    ops: Vec<RecoveredOp>,
}

fn scan_journal(prefix: &Path, segment_size: u64) -> Result<ScanResult> {
    let mut result = ScanResult {
        end_address: 0,
        truncate_at: None,
        page_map: FxHashMap::default(),
        volume_handles: FxHashMap::default(),
        tree_handles: FxHashMap::default(),
        next_volume_handle: 1,
        next_tree_handle: 1,
        base_address: 0,
        recovered: RecoveredState::default(),
    };
    let segments = list_segments(prefix)?;
    if segments.is_empty() {
        return Ok(result);
    }

    let mut volume_intros: FxHashMap<u32, VolumeIntro> = FxHashMap::default();
    let mut tree_intros: FxHashMap<u32, TreeIntro> = FxHashMap::default();
    let mut open_txns: FxHashMap<i64, ScanTxn> = FxHashMap::default();
    let mut carried_aborted: Vec<i64> = Vec::new();
    let mut finished: Vec<RecoveredTransaction> = Vec::new();
    let mut last_cp: Option<Checkpoint> = None;
    let mut max_ts = 0i64;
    let mut stop = false;

    result.base_address = segments[0].0 * segment_size;
    result.end_address = result.base_address;

    'segments: for (index, path) in &segments {
        if stop {
            break;
        }
        let segment_base = index * segment_size;
        let bytes = fs::read(path)?;
        let mut offset = 0usize;
        let mut saw_header = false;
        while offset < bytes.len() {
            let address = segment_base + offset as u64;
            let framed = match record::read_frame(&bytes[offset..]) {
                Ok(framed) => framed,
                Err(err) => {
                    warn!(address, %err, "journal scan stopped at invalid record");
                    result.truncate_at = Some(address);
                    result.end_address = address;
                    stop = true;
                    break 'segments;
                }
            };
            let frame = match framed {
                Framed::Record(frame) => frame,
                Framed::Padding => {
                    let has_successor = segments.iter().any(|(i, _)| *i == index + 1);
                    if has_successor {
                        // Clean rollover: continue with the next segment.
                        result.end_address = segment_base + segment_size;
                        continue 'segments;
                    }
                    // Zeroed pre-extended tail of the last segment: appends
                    // resume right here.
                    result.end_address = address;
                    stop = true;
                    break 'segments;
                }
                Framed::Incomplete => {
                    result.truncate_at = Some(address);
                    result.end_address = address;
                    stop = true;
                    break 'segments;
                }
            };
            if !saw_header {
                if frame.rtype != record::TYPE_JH {
                    warn!(address, "segment does not begin with a journal header");
                    result.truncate_at = Some(address);
                    result.end_address = address;
                    stop = true;
                    break 'segments;
                }
                saw_header = true;
            }
            match frame.rtype {
                record::TYPE_JH => {
                    JournalHeader::decode(frame.payload)?;
                }
                record::TYPE_IV => {
                    let intro = VolumeIntro::decode(frame.payload)?;
                    result
                        .volume_handles
                        .insert(intro.volume_id, intro.handle);
                    result.next_volume_handle = result.next_volume_handle.max(intro.handle + 1);
                    volume_intros.insert(intro.handle, intro);
                }
                record::TYPE_IT => {
                    let intro = TreeIntro::decode(frame.payload)?;
                    result
                        .tree_handles
                        .insert((intro.volume_handle, intro.name.clone()), intro.handle);
                    result.next_tree_handle = result.next_tree_handle.max(intro.handle + 1);
                    tree_intros.insert(intro.handle, intro);
                }
                record::TYPE_PA => {
                    let image = PageImage::decode(frame.payload)?;
                    max_ts = max_ts.max(image.timestamp);
                    result.page_map.insert(
                        (image.volume_handle, image.page),
                        PageNode {
                            address,
                            timestamp: image.timestamp,
                        },
                    );
                }
                record::TYPE_PM => {
                    for entry in record::decode_page_map(frame.payload)? {
                        let node = PageNode {
                            address: entry.journal_address,
                            timestamp: entry.timestamp,
                        };
                        result
                            .page_map
                            .entry((entry.volume_handle, entry.page))
                            .and_modify(|existing| {
                                if existing.address < node.address {
                                    *existing = node;
                                }
                            })
                            .or_insert(node);
                    }
                }
                record::TYPE_TM => {
                    for entry in record::decode_txn_map(frame.payload)? {
                        if entry.commit_ts == ABORTED {
                            carried_aborted.push(entry.start_ts);
                        } else {
                            open_txns.entry(entry.start_ts).or_default();
                        }
                    }
                }
                record::TYPE_TS => {
                    let ts = record::decode_txn_start(frame.payload)?;
                    max_ts = max_ts.max(ts);
                    open_txns.entry(ts).or_default();
                }
                record::TYPE_SR => {
                    let sr = record::StoreRecord::decode(frame.payload)?;
                    max_ts = max_ts.max(sr.ts);
                    open_txns
                        .entry(sr.ts)
                        .or_default()
                        .ops
                        .push(RecoveredOp::Store {
                            tree_handle: sr.tree_handle,
                            step: sr.step,
                            key: sr.key.to_vec(),
                            value: sr.value.to_vec(),
                        });
                }
                record::TYPE_DR => {
                    let dr = record::DeleteRangeRecord::decode(frame.payload)?;
                    open_txns
                        .entry(dr.ts)
                        .or_default()
                        .ops
                        .push(RecoveredOp::RemoveRange {
                            tree_handle: dr.tree_handle,
                            step: dr.step,
                            key1: dr.key1.to_vec(),
                            key2: dr.key2.to_vec(),
                        });
                }
                record::TYPE_DT => {
                    let dt = record::DeleteTreeRecord::decode(frame.payload)?;
                    open_txns
                        .entry(dt.ts)
                        .or_default()
                        .ops
                        .push(RecoveredOp::RemoveTree {
                            tree_handle: dt.tree_handle,
                        });
                }
                record::TYPE_D0 | record::TYPE_D1 => {
                    let delta = record::DeltaRecord::decode(frame.payload)?;
                    open_txns
                        .entry(delta.ts)
                        .or_default()
                        .ops
                        .push(RecoveredOp::Delta {
                            tree_handle: delta.tree_handle,
                            index: delta.index,
                            delta: delta.delta,
                        });
                }
                record::TYPE_TC => {
                    let end = TxnEnd::decode(frame.payload)?;
                    max_ts = max_ts.max(end.ts).max(end.commit_ts);
                    let txn = open_txns.remove(&end.ts).unwrap_or_default();
                    finished.push(RecoveredTransaction {
                        ts: end.ts,
                        commit_ts: end.commit_ts,
                        ops: txn.ops,
                    });
                }
                record::TYPE_CP => {
                    let cp = Checkpoint::decode(frame.payload)?;
                    max_ts = max_ts.max(cp.timestamp);
                    last_cp = Some(cp);
                }
                other => {
                    warn!(
                        address,
                        rtype = %record::type_name(other),
                        "unknown journal record type treated as crash point"
                    );
                    result.truncate_at = Some(address);
                    result.end_address = address;
                    stop = true;
                    break 'segments;
                }
            }
            offset += frame.total_len;
            result.end_address = segment_base + offset as u64;
        }
    }

    // Zero the torn tail so resumed appends meet clean padding.
    if let Some(address) = result.truncate_at {
        let index = address / segment_size;
        let offset = address % segment_size;
        if let Some((_, path)) = segments.iter().find(|(i, _)| *i == index) {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let zeros = vec![0u8; (segment_size - offset) as usize];
            write_at(&file, &zeros, offset)?;
            file.sync_data()?;
        }
    }

    let cp_ts = last_cp.map(|cp| cp.timestamp).unwrap_or(0);
    let mut committed: Vec<RecoveredTransaction> = finished
        .iter()
        .filter(|t| t.commit_ts != ABORTED && t.commit_ts > cp_ts)
        .cloned()
        .collect();
    committed.sort_by_key(|t| t.commit_ts);
    let mut aborted: Vec<(i64, i64)> = finished
        .iter()
        .filter(|t| t.commit_ts == ABORTED)
        .map(|t| (t.ts, (t.ops.len() as i64).max(1)))
        .collect();
    // Transactions with no TC never finished: their versions must read as
    // rolled back. The same goes for aborted entries carried in a TM,
    // whose op counts are no longer known.
    aborted.extend(
        open_txns
            .iter()
            .map(|(&ts, txn)| (ts, (txn.ops.len() as i64).max(1))),
    );
    aborted.extend(carried_aborted.into_iter().map(|ts| (ts, 1_000_000)));
    aborted.sort_unstable();
    aborted.dedup_by_key(|&mut (ts, _)| ts);

    result.recovered = RecoveredState {
        volumes: volume_intros.into_values().collect(),
        trees: tree_intros.into_values().collect(),
        committed,
        aborted,
        last_checkpoint_ts: cp_ts,
        max_timestamp: max_ts,
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeSpec;
    use bytes::BufMut;
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 1024;
    const SEGMENT: u64 = 64 * 1024;

    fn volume_fixture(dir: &TempDir) -> Arc<Volume> {
        Arc::new(
            Volume::create(&VolumeSpec::new(dir.path().join("j.v01")), PAGE_SIZE)
                .expect("volume"),
        )
    }

    #[test]
    fn page_roundtrip_through_buffer_and_file() {
        let dir = TempDir::new().expect("tempdir");
        let journal =
            JournalManager::open(dir.path().join("jr"), PAGE_SIZE, SEGMENT, false).expect("open");
        let volume = volume_fixture(&dir);

        let mut bytes = vec![0u8; PAGE_SIZE];
        bytes[10] = 0xBE;
        journal.write_page(&volume, 7, 3, &bytes).expect("write");

        // Still buffered: served from memory.
        let mut out = vec![0u8; PAGE_SIZE];
        assert!(journal.read_page(&volume, 7, &mut out).expect("read"));
        assert_eq!(out[10], 0xBE);

        // After a flush: served from the segment file.
        journal.flush().expect("flush");
        let mut out2 = vec![0u8; PAGE_SIZE];
        assert!(journal.read_page(&volume, 7, &mut out2).expect("read"));
        assert_eq!(out2, out);

        assert!(!journal
            .read_page(&volume, 99, &mut out2)
            .expect("missing page"));
    }

    #[test]
    fn reopen_rebuilds_page_map_and_handles() {
        let dir = TempDir::new().expect("tempdir");
        let volume = volume_fixture(&dir);
        {
            let journal = JournalManager::open(dir.path().join("jr"), PAGE_SIZE, SEGMENT, false)
                .expect("open");
            let mut bytes = vec![0u8; PAGE_SIZE];
            bytes[0] = 0x11;
            journal.write_page(&volume, 4, 9, &bytes).expect("write");
            journal.flush().expect("flush");
        }
        let journal =
            JournalManager::open(dir.path().join("jr"), PAGE_SIZE, SEGMENT, false).expect("reopen");
        let mut out = vec![0u8; PAGE_SIZE];
        assert!(journal.read_page(&volume, 4, &mut out).expect("read"));
        assert_eq!(out[0], 0x11);
    }

    #[test]
    fn torn_tail_is_discarded_on_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let volume = volume_fixture(&dir);
        let (addr_before, path);
        {
            let journal = JournalManager::open(dir.path().join("jr"), PAGE_SIZE, SEGMENT, false)
                .expect("open");
            let bytes = vec![0u8; PAGE_SIZE];
            journal.write_page(&volume, 1, 1, &bytes).expect("write");
            journal.flush().expect("flush");
            addr_before = journal.current_address();
            path = journal.segment_path(0);
        }
        // Simulate a torn append: a record header claiming more bytes than
        // were ever written.
        {
            let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let mut garbage = BytesMut::new();
            garbage.put_u32(60);
            garbage.put_u16(record::TYPE_TS);
            garbage.put_slice(&[0xAA; 10]);
            write_at(&file, &garbage, addr_before % SEGMENT).unwrap();
            file.sync_data().unwrap();
        }
        let journal =
            JournalManager::open(dir.path().join("jr"), PAGE_SIZE, SEGMENT, false).expect("reopen");
        assert_eq!(journal.current_address(), addr_before);
        // The earlier page survived.
        let mut out = vec![0u8; PAGE_SIZE];
        assert!(journal.read_page(&volume, 1, &mut out).expect("read"));
    }

    #[test]
    fn transactions_surface_in_recovered_state() {
        let dir = TempDir::new().expect("tempdir");
        let volume = volume_fixture(&dir);
        {
            let journal = JournalManager::open(dir.path().join("jr"), PAGE_SIZE, SEGMENT, false)
                .expect("open");
            let tree = journal.tree_handle(&volume, "t1").expect("tree handle");

            // Committed transaction.
            let mut chunk = BytesMut::new();
            record::encode_txn_start(&mut chunk, 10);
            record::StoreRecord {
                ts: 10,
                tree_handle: tree,
                step: 0,
                key: b"k",
                value: b"v",
            }
            .encode(&mut chunk);
            journal.append_transaction(10, &chunk, true).expect("chunk");
            journal.append_transaction_end(10, 11).expect("commit");

            // Aborted transaction.
            let mut chunk2 = BytesMut::new();
            record::encode_txn_start(&mut chunk2, 12);
            journal.append_transaction(12, &chunk2, true).expect("chunk");
            journal.append_transaction_end(12, ABORTED).expect("abort");

            // Unfinished transaction: chunk but no TC.
            let mut chunk3 = BytesMut::new();
            record::encode_txn_start(&mut chunk3, 14);
            journal.append_transaction(14, &chunk3, true).expect("chunk");
            journal.flush().expect("flush");
        }
        let journal =
            JournalManager::open(dir.path().join("jr"), PAGE_SIZE, SEGMENT, false).expect("reopen");
        let state = journal.take_recovered_state().expect("state");
        assert_eq!(state.committed.len(), 1);
        assert_eq!(state.committed[0].ts, 10);
        assert_eq!(state.committed[0].commit_ts, 11);
        assert_eq!(state.committed[0].ops.len(), 1);
        let aborted_ts: Vec<i64> = state.aborted.iter().map(|&(ts, _)| ts).collect();
        assert_eq!(aborted_ts, vec![12, 14]);
        assert!(state.max_timestamp >= 14);
        assert!(journal.take_recovered_state().is_none());
    }

    #[test]
    fn segment_rollover_and_checkpoint_truncation() {
        let dir = TempDir::new().expect("tempdir");
        let volume = volume_fixture(&dir);
        let journal = JournalManager::open(dir.path().join("jr"), PAGE_SIZE, 8 * 1024, false)
            .expect("open");
        // Push enough page images through to roll several segments.
        let mut bytes = vec![0u8; PAGE_SIZE];
        for i in 0..40u64 {
            bytes[0] = i as u8;
            journal.write_page(&volume, i % 4, i as i64 + 1, &bytes).expect("write");
        }
        journal.flush().expect("flush");
        assert!(journal.current_address() > 8 * 1024);

        let mut volumes = FxHashMap::default();
        volumes.insert(volume.id(), Arc::clone(&volume));
        journal.checkpoint(1000, &volumes, &[]).expect("checkpoint");

        // Page images were copied back to the volume file.
        let mut from_volume = vec![0u8; PAGE_SIZE];
        volume.read_page_from_file(3, &mut from_volume).expect("read");
        assert_eq!(from_volume[0], 39);

        // Old segments are gone; the journal still answers reads (from the
        // volume now, so read_page reports a miss).
        let segments = list_segments(&dir.path().join("jr")).expect("list");
        assert!(
            segments.first().map(|(i, _)| *i).unwrap_or(0) > 0,
            "dead segments deleted"
        );
        let mut out = vec![0u8; PAGE_SIZE];
        assert!(!journal.read_page(&volume, 3, &mut out).expect("read"));
    }
}
