//! On-page byte layout.
//!
//! Every page opens with a fixed 22-byte header: type tag, level, right
//! sibling, timestamp, and the alloc cursor. Data and index pages then carry
//! a slot directory growing up from the front and a record heap growing down
//! from the back; the alloc cursor tracks the heap floor. Long-record pages
//! use the alloc cursor as their content length. Garbage pages hold a packed
//! array of reclaimed page-chain entries.

use crate::error::{Error, Result};
use crate::value::PageAddr;

pub const PAGE_HDR_LEN: usize = 22;

const TYPE_OFFSET: usize = 0;
const LEVEL_OFFSET: usize = 1;
const RIGHT_SIBLING_OFFSET: usize = 2;
const TIMESTAMP_OFFSET: usize = 10;
const ALLOC_OFFSET: usize = 18;

/// Body header of data/index pages: slot count, then the slot directory.
const SLOT_COUNT_OFFSET: usize = PAGE_HDR_LEN;
const SLOT_DIR_OFFSET: usize = PAGE_HDR_LEN + 2;
const SLOT_ENTRY_LEN: usize = 2;

/// Data record header: `klen u16 | plen u16`.
const DATA_RECORD_HDR_LEN: usize = 4;
/// Index record header: `klen u16 | child u64`.
const INDEX_RECORD_HDR_LEN: usize = 10;

/// Deepest index level the engine will build.
pub const MAX_INDEX_LEVELS: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unallocated,
    Head,
    Garbage,
    LongRecord,
    Data,
    Index,
}

impl PageType {
    pub fn tag(self) -> u8 {
        match self {
            PageType::Unallocated => b'U',
            PageType::Head => b'H',
            PageType::Garbage => b'G',
            PageType::LongRecord => b'L',
            PageType::Data => b'D',
            PageType::Index => b'I',
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            b'U' => Ok(PageType::Unallocated),
            b'H' => Ok(PageType::Head),
            b'G' => Ok(PageType::Garbage),
            b'L' => Ok(PageType::LongRecord),
            b'D' => Ok(PageType::Data),
            b'I' => Ok(PageType::Index),
            other => Err(Error::Corruption(format!(
                "unknown page type tag 0x{other:02X}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub level: u8,
    pub right_sibling: PageAddr,
    pub timestamp: i64,
    pub alloc: u32,
}

impl PageHeader {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HDR_LEN {
            return Err(Error::Corruption("page shorter than header".into()));
        }
        Ok(Self {
            page_type: PageType::from_tag(buf[TYPE_OFFSET])?,
            level: buf[LEVEL_OFFSET],
            right_sibling: u64::from_be_bytes(
                buf[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + 8]
                    .try_into()
                    .expect("slice len"),
            ),
            timestamp: i64::from_be_bytes(
                buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]
                    .try_into()
                    .expect("slice len"),
            ),
            alloc: u32::from_be_bytes(
                buf[ALLOC_OFFSET..ALLOC_OFFSET + 4]
                    .try_into()
                    .expect("slice len"),
            ),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[TYPE_OFFSET] = self.page_type.tag();
        buf[LEVEL_OFFSET] = self.level;
        buf[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + 8]
            .copy_from_slice(&self.right_sibling.to_be_bytes());
        buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[ALLOC_OFFSET..ALLOC_OFFSET + 4].copy_from_slice(&self.alloc.to_be_bytes());
    }
}

pub fn page_type(buf: &[u8]) -> Result<PageType> {
    PageType::from_tag(buf[TYPE_OFFSET])
}

pub fn level(buf: &[u8]) -> u8 {
    buf[LEVEL_OFFSET]
}

pub fn right_sibling(buf: &[u8]) -> PageAddr {
    u64::from_be_bytes(
        buf[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + 8]
            .try_into()
            .expect("slice len"),
    )
}

pub fn set_right_sibling(buf: &mut [u8], sibling: PageAddr) {
    buf[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + 8].copy_from_slice(&sibling.to_be_bytes());
}

pub fn timestamp(buf: &[u8]) -> i64 {
    i64::from_be_bytes(
        buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]
            .try_into()
            .expect("slice len"),
    )
}

pub fn set_timestamp(buf: &mut [u8], ts: i64) {
    buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].copy_from_slice(&ts.to_be_bytes());
}

pub fn alloc_cursor(buf: &[u8]) -> u32 {
    u32::from_be_bytes(
        buf[ALLOC_OFFSET..ALLOC_OFFSET + 4]
            .try_into()
            .expect("slice len"),
    )
}

pub fn set_alloc_cursor(buf: &mut [u8], alloc: u32) {
    buf[ALLOC_OFFSET..ALLOC_OFFSET + 4].copy_from_slice(&alloc.to_be_bytes());
}

/// Zeroes the body and stamps a fresh header of the given type.
pub fn init_page(buf: &mut [u8], page_type: PageType, level: u8) {
    buf.fill(0);
    let alloc = match page_type {
        PageType::Data | PageType::Index => buf.len() as u32,
        PageType::LongRecord => 0,
        _ => 0,
    };
    PageHeader {
        page_type,
        level,
        right_sibling: 0,
        timestamp: 0,
        alloc,
    }
    .write(buf);
}

/// Checks the type tag, reporting the page address on mismatch.
pub fn expect_type(buf: &[u8], page: PageAddr, expected: PageType) -> Result<()> {
    let actual = page_type(buf).map_err(|_| {
        Error::corrupt_page(page, format!("unreadable type tag 0x{:02X}", buf[TYPE_OFFSET]))
    })?;
    if actual != expected {
        return Err(Error::corrupt_page(
            page,
            format!("expected {expected:?} page, found {actual:?}"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Data,
    Index,
}

impl NodeKind {
    fn record_hdr_len(self) -> usize {
        match self {
            NodeKind::Data => DATA_RECORD_HDR_LEN,
            NodeKind::Index => INDEX_RECORD_HDR_LEN,
        }
    }
}

/// Read-side view over a data or index page body.
#[derive(Debug)]
pub struct Node<'a> {
    buf: &'a [u8],
    kind: NodeKind,
}

impl<'a> Node<'a> {
    pub fn new(buf: &'a [u8], page: PageAddr) -> Result<Self> {
        let kind = match page_type(buf)
            .map_err(|e| Error::corrupt_page(page, e.to_string()))?
        {
            PageType::Data => NodeKind::Data,
            PageType::Index => NodeKind::Index,
            other => {
                return Err(Error::corrupt_page(
                    page,
                    format!("expected data or index page, found {other:?}"),
                ))
            }
        };
        Ok(Self { buf, kind })
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn slot_count(&self) -> usize {
        read_u16(self.buf, SLOT_COUNT_OFFSET) as usize
    }

    fn record_offset(&self, idx: usize) -> Result<usize> {
        if idx >= self.slot_count() {
            return Err(Error::Corruption(format!(
                "slot index {idx} out of range ({} slots)",
                self.slot_count()
            )));
        }
        let off = read_u16(self.buf, SLOT_DIR_OFFSET + idx * SLOT_ENTRY_LEN) as usize;
        if off < PAGE_HDR_LEN || off + self.kind.record_hdr_len() > self.buf.len() {
            return Err(Error::Corruption(format!(
                "slot {idx} record offset {off} out of bounds"
            )));
        }
        Ok(off)
    }

    pub fn key_at(&self, idx: usize) -> Result<&'a [u8]> {
        let off = self.record_offset(idx)?;
        let klen = read_u16(self.buf, off) as usize;
        let start = off + self.kind.record_hdr_len();
        self.buf
            .get(start..start + klen)
            .ok_or_else(|| Error::Corruption(format!("slot {idx} key overruns page")))
    }

    /// Data pages only: the slot payload bytes.
    pub fn payload_at(&self, idx: usize) -> Result<&'a [u8]> {
        debug_assert_eq!(self.kind, NodeKind::Data);
        let off = self.record_offset(idx)?;
        let klen = read_u16(self.buf, off) as usize;
        let plen = read_u16(self.buf, off + 2) as usize;
        let start = off + DATA_RECORD_HDR_LEN + klen;
        self.buf
            .get(start..start + plen)
            .ok_or_else(|| Error::Corruption(format!("slot {idx} payload overruns page")))
    }

    /// Index pages only: the child pointer.
    pub fn child_at(&self, idx: usize) -> Result<PageAddr> {
        debug_assert_eq!(self.kind, NodeKind::Index);
        let off = self.record_offset(idx)?;
        let child = u64::from_be_bytes(
            self.buf
                .get(off + 2..off + 10)
                .ok_or_else(|| Error::Corruption(format!("slot {idx} child overruns page")))?
                .try_into()
                .expect("slice len"),
        );
        Ok(child)
    }

    /// Binary search over the slot directory: `Ok(i)` on exact match,
    /// `Err(i)` with the insertion point otherwise.
    pub fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0usize;
        let mut hi = self.slot_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key_at(mid)?.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Bytes of the record heap plus slot directory currently in use.
    pub fn used_bytes(&self) -> Result<usize> {
        let mut used = SLOT_DIR_OFFSET - PAGE_HDR_LEN + self.slot_count() * SLOT_ENTRY_LEN;
        for idx in 0..self.slot_count() {
            used += self.record_len(idx)?;
        }
        Ok(used)
    }

    fn record_len(&self, idx: usize) -> Result<usize> {
        let off = self.record_offset(idx)?;
        let klen = read_u16(self.buf, off) as usize;
        Ok(match self.kind {
            NodeKind::Data => {
                let plen = read_u16(self.buf, off + 2) as usize;
                DATA_RECORD_HDR_LEN + klen + plen
            }
            NodeKind::Index => INDEX_RECORD_HDR_LEN + klen,
        })
    }
}

/// Write-side view over a data or index page body.
pub struct NodeMut<'a> {
    buf: &'a mut [u8],
    kind: NodeKind,
    page: PageAddr,
}

impl<'a> NodeMut<'a> {
    pub fn new(buf: &'a mut [u8], page: PageAddr) -> Result<Self> {
        let kind = match page_type(buf).map_err(|e| Error::corrupt_page(page, e.to_string()))? {
            PageType::Data => NodeKind::Data,
            PageType::Index => NodeKind::Index,
            other => {
                return Err(Error::corrupt_page(
                    page,
                    format!("expected data or index page, found {other:?}"),
                ))
            }
        };
        Ok(Self { buf, kind, page })
    }

    pub fn as_node(&self) -> Node<'_> {
        Node {
            buf: self.buf,
            kind: self.kind,
        }
    }

    pub fn slot_count(&self) -> usize {
        read_u16(self.buf, SLOT_COUNT_OFFSET) as usize
    }

    fn set_slot_count(&mut self, count: usize) {
        write_u16(self.buf, SLOT_COUNT_OFFSET, count as u16);
    }

    fn slot_dir_end(&self) -> usize {
        SLOT_DIR_OFFSET + self.slot_count() * SLOT_ENTRY_LEN
    }

    pub fn free_space(&self) -> usize {
        (alloc_cursor(self.buf) as usize).saturating_sub(self.slot_dir_end())
    }

    fn record_len_for(&self, klen: usize, payload_len: usize) -> usize {
        self.kind.record_hdr_len() + klen + payload_len
    }

    /// Space one insert of this shape needs (record plus slot entry).
    pub fn space_needed(&self, klen: usize, payload_len: usize) -> usize {
        self.record_len_for(klen, payload_len) + SLOT_ENTRY_LEN
    }

    /// Inserts a data record at `idx`. Returns false (page unchanged) when
    /// the record does not fit even after compaction.
    pub fn insert_data(&mut self, idx: usize, key: &[u8], payload: &[u8]) -> Result<bool> {
        debug_assert_eq!(self.kind, NodeKind::Data);
        let record_len = self.record_len_for(key.len(), payload.len());
        if !self.reserve(record_len)? {
            return Ok(false);
        }
        let off = alloc_cursor(self.buf) as usize - record_len;
        write_u16(self.buf, off, key.len() as u16);
        write_u16(self.buf, off + 2, payload.len() as u16);
        self.buf[off + DATA_RECORD_HDR_LEN..off + DATA_RECORD_HDR_LEN + key.len()]
            .copy_from_slice(key);
        let pstart = off + DATA_RECORD_HDR_LEN + key.len();
        self.buf[pstart..pstart + payload.len()].copy_from_slice(payload);
        set_alloc_cursor(self.buf, off as u32);
        self.insert_slot(idx, off);
        Ok(true)
    }

    /// Inserts an index record at `idx`.
    pub fn insert_index(&mut self, idx: usize, key: &[u8], child: PageAddr) -> Result<bool> {
        debug_assert_eq!(self.kind, NodeKind::Index);
        let record_len = self.record_len_for(key.len(), 0);
        if !self.reserve(record_len)? {
            return Ok(false);
        }
        let off = alloc_cursor(self.buf) as usize - record_len;
        write_u16(self.buf, off, key.len() as u16);
        self.buf[off + 2..off + 10].copy_from_slice(&child.to_be_bytes());
        self.buf[off + INDEX_RECORD_HDR_LEN..off + INDEX_RECORD_HDR_LEN + key.len()]
            .copy_from_slice(key);
        set_alloc_cursor(self.buf, off as u32);
        self.insert_slot(idx, off);
        Ok(true)
    }

    /// Replaces the payload of data slot `idx`. Returns false when the new
    /// payload does not fit.
    pub fn replace_payload(&mut self, idx: usize, payload: &[u8]) -> Result<bool> {
        debug_assert_eq!(self.kind, NodeKind::Data);
        let key = self.as_node().key_at(idx)?.to_vec();
        let old = self.as_node().payload_at(idx)?.to_vec();
        self.remove(idx)?;
        if self.insert_data(idx, &key, payload)? {
            return Ok(true);
        }
        // Does not fit: put the original record back before reporting.
        if !self.insert_data(idx, &key, &old)? {
            return Err(Error::corrupt_page(
                self.page,
                "failed to restore record after oversized replace",
            ));
        }
        Ok(false)
    }

    /// Removes slot `idx`; heap space is reclaimed by the next compaction.
    pub fn remove(&mut self, idx: usize) -> Result<()> {
        let count = self.slot_count();
        if idx >= count {
            return Err(Error::corrupt_page(
                self.page,
                format!("remove of slot {idx} beyond {count}"),
            ));
        }
        for i in idx..count - 1 {
            let next = read_u16(self.buf, SLOT_DIR_OFFSET + (i + 1) * SLOT_ENTRY_LEN);
            write_u16(self.buf, SLOT_DIR_OFFSET + i * SLOT_ENTRY_LEN, next);
        }
        self.set_slot_count(count - 1);
        Ok(())
    }

    pub fn set_child(&mut self, idx: usize, child: PageAddr) -> Result<()> {
        debug_assert_eq!(self.kind, NodeKind::Index);
        let node = self.as_node();
        let off = node.record_offset(idx)?;
        self.buf[off + 2..off + 10].copy_from_slice(&child.to_be_bytes());
        Ok(())
    }

    fn insert_slot(&mut self, idx: usize, record_offset: usize) {
        let count = self.slot_count();
        debug_assert!(idx <= count);
        for i in (idx..count).rev() {
            let cur = read_u16(self.buf, SLOT_DIR_OFFSET + i * SLOT_ENTRY_LEN);
            write_u16(self.buf, SLOT_DIR_OFFSET + (i + 1) * SLOT_ENTRY_LEN, cur);
        }
        write_u16(
            self.buf,
            SLOT_DIR_OFFSET + idx * SLOT_ENTRY_LEN,
            record_offset as u16,
        );
        self.set_slot_count(count + 1);
    }

    /// Ensures `record_len + slot entry` bytes of contiguous free space,
    /// compacting if fragmentation allows.
    fn reserve(&mut self, record_len: usize) -> Result<bool> {
        let needed = record_len + SLOT_ENTRY_LEN;
        if self.free_space() >= needed {
            return Ok(true);
        }
        self.compact()?;
        Ok(self.free_space() >= needed)
    }

    /// Rewrites the record heap packed against the page end.
    pub fn compact(&mut self) -> Result<()> {
        let node = self.as_node();
        let count = node.slot_count();
        let mut records: Vec<Vec<u8>> = Vec::with_capacity(count);
        for idx in 0..count {
            let off = node.record_offset(idx)?;
            let len = node.record_len(idx)?;
            records.push(self.buf[off..off + len].to_vec());
        }
        let mut floor = self.buf.len();
        for (idx, record) in records.iter().enumerate() {
            floor -= record.len();
            self.buf[floor..floor + record.len()].copy_from_slice(record);
            write_u16(self.buf, SLOT_DIR_OFFSET + idx * SLOT_ENTRY_LEN, floor as u16);
        }
        set_alloc_cursor(self.buf, floor as u32);
        Ok(())
    }
}

/// Garbage-page body: `count u16` then packed `(left u64, right u64)` chain
/// entries.
pub mod garbage {
    use super::*;

    const COUNT_OFFSET: usize = PAGE_HDR_LEN;
    const ENTRIES_OFFSET: usize = PAGE_HDR_LEN + 2;
    const ENTRY_LEN: usize = 16;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChainEntry {
        pub left: PageAddr,
        pub right: PageAddr,
    }

    pub fn count(buf: &[u8]) -> usize {
        read_u16(buf, COUNT_OFFSET) as usize
    }

    pub fn capacity(page_size: usize) -> usize {
        (page_size - ENTRIES_OFFSET) / ENTRY_LEN
    }

    pub fn entry(buf: &[u8], idx: usize) -> Result<ChainEntry> {
        if idx >= count(buf) {
            return Err(Error::Corruption(format!(
                "garbage entry {idx} out of range"
            )));
        }
        let off = ENTRIES_OFFSET + idx * ENTRY_LEN;
        Ok(ChainEntry {
            left: u64::from_be_bytes(buf[off..off + 8].try_into().expect("slice len")),
            right: u64::from_be_bytes(buf[off + 8..off + 16].try_into().expect("slice len")),
        })
    }

    /// Appends an entry; false when the page is full.
    pub fn push(buf: &mut [u8], entry: ChainEntry) -> bool {
        let n = count(buf);
        if n >= capacity(buf.len()) {
            return false;
        }
        let off = ENTRIES_OFFSET + n * ENTRY_LEN;
        buf[off..off + 8].copy_from_slice(&entry.left.to_be_bytes());
        buf[off + 8..off + 16].copy_from_slice(&entry.right.to_be_bytes());
        write_u16(buf, COUNT_OFFSET, (n + 1) as u16);
        true
    }

    /// Removes and returns the last entry.
    pub fn pop(buf: &mut [u8]) -> Option<ChainEntry> {
        let n = count(buf);
        if n == 0 {
            return None;
        }
        let out = entry(buf, n - 1).ok()?;
        write_u16(buf, COUNT_OFFSET, (n - 1) as u16);
        Some(out)
    }
}

/// Long-record page content helpers; the alloc cursor is the content length.
pub mod long_record {
    use super::*;

    pub fn capacity(page_size: usize) -> usize {
        page_size - PAGE_HDR_LEN
    }

    pub fn content(buf: &[u8], page: PageAddr) -> Result<&[u8]> {
        let len = alloc_cursor(buf) as usize;
        buf.get(PAGE_HDR_LEN..PAGE_HDR_LEN + len)
            .ok_or_else(|| Error::corrupt_page(page, "long-record content length overruns page"))
    }

    pub fn set_content(buf: &mut [u8], content: &[u8]) {
        debug_assert!(content.len() <= capacity(buf.len()));
        buf[PAGE_HDR_LEN..PAGE_HDR_LEN + content.len()].copy_from_slice(content);
        set_alloc_cursor(buf, content.len() as u32);
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(buf[offset..offset + 2].try_into().expect("slice len"))
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 1024;

    fn data_page() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        init_page(&mut buf, PageType::Data, 0);
        buf
    }

    #[test]
    fn header_roundtrip() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let header = PageHeader {
            page_type: PageType::Index,
            level: 3,
            right_sibling: 99,
            timestamp: -1,
            alloc: 512,
        };
        header.write(&mut buf);
        assert_eq!(PageHeader::read(&buf).unwrap(), header);
        assert_eq!(right_sibling(&buf), 99);
        assert_eq!(timestamp(&buf), -1);
        assert_eq!(alloc_cursor(&buf), 512);
    }

    #[test]
    fn insert_search_remove_data_records() {
        let mut buf = data_page();
        let mut node = NodeMut::new(&mut buf, 5).unwrap();
        assert!(node.insert_data(0, b"banana", b"two").unwrap());
        assert!(node.insert_data(0, b"apple", b"one").unwrap());
        assert!(node.insert_data(2, b"cherry", b"three").unwrap());

        let view = Node::new(&buf, 5).unwrap();
        assert_eq!(view.slot_count(), 3);
        assert_eq!(view.key_at(0).unwrap(), b"apple");
        assert_eq!(view.payload_at(1).unwrap(), b"two");
        assert_eq!(view.search(b"banana").unwrap(), Ok(1));
        assert_eq!(view.search(b"blueberry").unwrap(), Err(2));
        assert_eq!(view.search(b"a").unwrap(), Err(0));

        let mut node = NodeMut::new(&mut buf, 5).unwrap();
        node.remove(1).unwrap();
        let view = Node::new(&buf, 5).unwrap();
        assert_eq!(view.slot_count(), 2);
        assert_eq!(view.key_at(1).unwrap(), b"cherry");
    }

    #[test]
    fn compaction_reclaims_removed_records() {
        let mut buf = data_page();
        let payload = vec![0xAB; 200];
        {
            let mut node = NodeMut::new(&mut buf, 1).unwrap();
            for i in 0..4 {
                assert!(node.insert_data(i, format!("key{i}").as_bytes(), &payload).unwrap());
            }
            assert!(!node.insert_data(4, b"key4", &payload).unwrap());
            node.remove(0).unwrap();
            node.remove(0).unwrap();
            // Heap space freed by the removals is only usable after compaction,
            // which reserve() performs on demand.
            assert!(node.insert_data(2, b"key9", &payload).unwrap());
        }
        let view = Node::new(&buf, 1).unwrap();
        assert_eq!(view.slot_count(), 3);
        assert_eq!(view.key_at(2).unwrap(), b"key9");
    }

    #[test]
    fn index_records_carry_children() {
        let mut buf = vec![0u8; PAGE_SIZE];
        init_page(&mut buf, PageType::Index, 1);
        let mut node = NodeMut::new(&mut buf, 2).unwrap();
        assert!(node.insert_index(0, b"\x01", 10).unwrap());
        assert!(node.insert_index(1, b"m", 20).unwrap());
        node.set_child(1, 21).unwrap();

        let view = Node::new(&buf, 2).unwrap();
        assert_eq!(view.child_at(0).unwrap(), 10);
        assert_eq!(view.child_at(1).unwrap(), 21);
        assert_eq!(view.kind(), NodeKind::Index);
    }

    #[test]
    fn replace_payload_in_place() {
        let mut buf = data_page();
        let mut node = NodeMut::new(&mut buf, 3).unwrap();
        assert!(node.insert_data(0, b"k", b"small").unwrap());
        assert!(node.replace_payload(0, &vec![7u8; 100]).unwrap());
        let view = Node::new(&buf, 3).unwrap();
        assert_eq!(view.payload_at(0).unwrap(), &vec![7u8; 100][..]);
        assert_eq!(view.slot_count(), 1);
    }

    #[test]
    fn garbage_page_push_pop() {
        let mut buf = vec![0u8; PAGE_SIZE];
        init_page(&mut buf, PageType::Garbage, 0);
        assert!(garbage::push(
            &mut buf,
            garbage::ChainEntry { left: 4, right: 9 }
        ));
        assert!(garbage::push(
            &mut buf,
            garbage::ChainEntry { left: 11, right: 11 }
        ));
        assert_eq!(garbage::count(&buf), 2);
        assert_eq!(
            garbage::pop(&mut buf),
            Some(garbage::ChainEntry { left: 11, right: 11 })
        );
        assert_eq!(garbage::count(&buf), 1);
    }

    #[test]
    fn long_record_content_roundtrip() {
        let mut buf = vec![0u8; PAGE_SIZE];
        init_page(&mut buf, PageType::LongRecord, 0);
        long_record::set_content(&mut buf, b"spilled bytes");
        assert_eq!(long_record::content(&buf, 7).unwrap(), b"spilled bytes");
        assert_eq!(long_record::capacity(PAGE_SIZE), PAGE_SIZE - PAGE_HDR_LEN);
    }

    #[test]
    fn wrong_page_type_is_reported_with_address() {
        let mut buf = vec![0u8; PAGE_SIZE];
        init_page(&mut buf, PageType::Garbage, 0);
        let err = Node::new(&buf, 42).unwrap_err();
        assert!(err.to_string().contains("page 42"));
        assert!(expect_type(&buf, 42, PageType::Data).is_err());
        assert!(expect_type(&buf, 42, PageType::Garbage).is_ok());
    }
}
