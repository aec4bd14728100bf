//! Journal record framing and codecs.
//!
//! Every record is `len u32 | type u16 | payload | crc32 u32`, big-endian,
//! where `len` covers the whole record and the CRC covers type + payload.
//! A zero length marks segment padding; a record that fails to frame or
//! checksum is treated as the crash point by the recovery scan.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::value::PageAddr;

pub const RECORD_OVERHEAD: usize = 10;

const fn type_tag(tag: &[u8; 2]) -> u16 {
    u16::from_be_bytes(*tag)
}

pub const TYPE_JH: u16 = type_tag(b"JH");
pub const TYPE_PA: u16 = type_tag(b"PA");
pub const TYPE_PM: u16 = type_tag(b"PM");
pub const TYPE_TM: u16 = type_tag(b"TM");
pub const TYPE_IV: u16 = type_tag(b"IV");
pub const TYPE_IT: u16 = type_tag(b"IT");
pub const TYPE_SR: u16 = type_tag(b"SR");
pub const TYPE_DR: u16 = type_tag(b"DR");
pub const TYPE_DT: u16 = type_tag(b"DT");
pub const TYPE_D0: u16 = type_tag(b"D0");
pub const TYPE_D1: u16 = type_tag(b"D1");
pub const TYPE_TS: u16 = type_tag(b"TS");
pub const TYPE_TC: u16 = type_tag(b"TC");
pub const TYPE_CP: u16 = type_tag(b"CP");

pub fn type_name(rtype: u16) -> String {
    let bytes = rtype.to_be_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Starts a record of `rtype` in `out`; returns the patch cookie for
/// [`finish_record`]. Payload bytes go straight into `out` in between.
pub fn begin_record(out: &mut BytesMut, rtype: u16) -> usize {
    let start = out.len();
    out.put_u32(0); // length patched on finish
    out.put_u16(rtype);
    start
}

/// Patches the length and appends the CRC.
pub fn finish_record(out: &mut BytesMut, start: usize) {
    let crc = crc32fast::hash(&out[start + 4..]);
    out.put_u32(crc);
    let total = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&total.to_be_bytes());
}

/// One framed record sliced out of a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub rtype: u16,
    pub payload: &'a [u8],
    pub total_len: usize,
}

/// Outcome of framing the bytes at the head of `buf`.
#[derive(Debug)]
pub enum Framed<'a> {
    Record(Frame<'a>),
    /// Zero length word: padding to the end of the segment.
    Padding,
    /// Not enough bytes for a complete record (torn tail).
    Incomplete,
}

pub fn read_frame(buf: &[u8]) -> Result<Framed<'_>> {
    if buf.len() < 4 {
        return Ok(Framed::Incomplete);
    }
    let len = u32::from_be_bytes(buf[..4].try_into().expect("slice len")) as usize;
    if len == 0 {
        return Ok(Framed::Padding);
    }
    if len < RECORD_OVERHEAD {
        return Err(Error::Corruption(format!(
            "journal record length {len} below framing overhead"
        )));
    }
    if len > buf.len() {
        return Ok(Framed::Incomplete);
    }
    let rtype = u16::from_be_bytes(buf[4..6].try_into().expect("slice len"));
    let payload = &buf[6..len - 4];
    let stored_crc = u32::from_be_bytes(buf[len - 4..len].try_into().expect("slice len"));
    let actual_crc = crc32fast::hash(&buf[4..len - 4]);
    if stored_crc != actual_crc {
        return Err(Error::Corruption(format!(
            "journal record {} fails checksum",
            type_name(rtype)
        )));
    }
    Ok(Framed::Record(Frame {
        rtype,
        payload,
        total_len: len,
    }))
}

/// Cursor-style payload reader with bounds-checked take operations.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.offset + n;
        let slice = self
            .buf
            .get(self.offset..end)
            .ok_or_else(|| Error::Corruption("journal record payload truncated".into()))?;
        self.offset = end;
        Ok(slice)
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("slice len")))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("slice len")))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("slice len")))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().expect("slice len")))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Corruption("journal record string is not UTF-8".into()))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.offset..];
        self.offset = self.buf.len();
        out
    }
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

/// `JH`: opens every segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    pub version: u32,
    pub segment_size: u64,
    pub base_address: u64,
    pub segment_address: u64,
    pub created_ms: u64,
    pub path: String,
}

pub const JOURNAL_FORMAT_VERSION: u32 = 1;

impl JournalHeader {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_JH);
        out.put_u32(self.version);
        out.put_u64(self.segment_size);
        out.put_u64(self.base_address);
        out.put_u64(self.segment_address);
        out.put_u64(self.created_ms);
        put_string(out, &self.path);
        finish_record(out, start);
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let header = Self {
            version: r.u32()?,
            segment_size: r.u64()?,
            base_address: r.u64()?,
            segment_address: r.u64()?,
            created_ms: r.u64()?,
            path: r.string()?,
        };
        if header.version != JOURNAL_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported journal format version {}",
                header.version
            )));
        }
        Ok(header)
    }
}

/// `PA`: one full page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage<'a> {
    pub volume_handle: u32,
    pub page: PageAddr,
    pub timestamp: i64,
    pub bytes: &'a [u8],
}

impl<'a> PageImage<'a> {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_PA);
        out.put_u32(self.volume_handle);
        out.put_u64(self.page);
        out.put_i64(self.timestamp);
        out.put_u32(self.bytes.len() as u32);
        out.put_slice(self.bytes);
        finish_record(out, start);
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let volume_handle = r.u32()?;
        let page = r.u64()?;
        let timestamp = r.i64()?;
        let len = r.u32()? as usize;
        let bytes = r.take(len)?;
        Ok(Self {
            volume_handle,
            page,
            timestamp,
            bytes,
        })
    }
}

/// One `PM` page-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapEntry {
    pub volume_handle: u32,
    pub page: PageAddr,
    pub journal_address: u64,
    pub timestamp: i64,
}

pub fn encode_page_map(out: &mut BytesMut, entries: &[PageMapEntry]) {
    let start = begin_record(out, TYPE_PM);
    out.put_u32(entries.len() as u32);
    for e in entries {
        out.put_u32(e.volume_handle);
        out.put_u64(e.page);
        out.put_u64(e.journal_address);
        out.put_i64(e.timestamp);
    }
    finish_record(out, start);
}

pub fn decode_page_map(payload: &[u8]) -> Result<Vec<PageMapEntry>> {
    let mut r = PayloadReader::new(payload);
    let count = r.u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(PageMapEntry {
            volume_handle: r.u32()?,
            page: r.u64()?,
            journal_address: r.u64()?,
            timestamp: r.i64()?,
        });
    }
    Ok(out)
}

/// One `TM` transaction-map entry: a transaction still running at the
/// checkpoint (`commit_ts` = UNCOMMITTED sentinel) or an aborted one whose
/// versions have not all been pruned yet (`commit_ts` = ABORTED sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnMapEntry {
    pub start_ts: i64,
    pub commit_ts: i64,
    pub start_address: u64,
}

pub fn encode_txn_map(out: &mut BytesMut, entries: &[TxnMapEntry]) {
    let start = begin_record(out, TYPE_TM);
    out.put_u32(entries.len() as u32);
    for e in entries {
        out.put_i64(e.start_ts);
        out.put_i64(e.commit_ts);
        out.put_u64(e.start_address);
    }
    finish_record(out, start);
}

pub fn decode_txn_map(payload: &[u8]) -> Result<Vec<TxnMapEntry>> {
    let mut r = PayloadReader::new(payload);
    let count = r.u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(TxnMapEntry {
            start_ts: r.i64()?,
            commit_ts: r.i64()?,
            start_address: r.u64()?,
        });
    }
    Ok(out)
}

/// `IV`: volume handle introduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeIntro {
    pub handle: u32,
    pub volume_id: u64,
    pub page_size: u32,
    pub name: String,
}

impl VolumeIntro {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_IV);
        out.put_u32(self.handle);
        out.put_u64(self.volume_id);
        out.put_u32(self.page_size);
        put_string(out, &self.name);
        finish_record(out, start);
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            handle: r.u32()?,
            volume_id: r.u64()?,
            page_size: r.u32()?,
            name: r.string()?,
        })
    }
}

/// `IT`: tree handle introduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeIntro {
    pub handle: u32,
    pub volume_handle: u32,
    pub name: String,
}

impl TreeIntro {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_IT);
        out.put_u32(self.handle);
        out.put_u32(self.volume_handle);
        put_string(out, &self.name);
        finish_record(out, start);
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            handle: r.u32()?,
            volume_handle: r.u32()?,
            name: r.string()?,
        })
    }
}

/// `TS`: transaction start.
pub fn encode_txn_start(out: &mut BytesMut, ts: i64) {
    let start = begin_record(out, TYPE_TS);
    out.put_i64(ts);
    finish_record(out, start);
}

pub fn decode_txn_start(payload: &[u8]) -> Result<i64> {
    PayloadReader::new(payload).i64()
}

/// `TC`: transaction commit (positive `commit_ts`) or abort (`ABORTED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnEnd {
    pub ts: i64,
    pub commit_ts: i64,
    /// Journal address of the transaction's first record.
    pub start_address: u64,
}

impl TxnEnd {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_TC);
        out.put_i64(self.ts);
        out.put_i64(self.commit_ts);
        out.put_u64(self.start_address);
        finish_record(out, start);
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            ts: r.i64()?,
            commit_ts: r.i64()?,
            start_address: r.u64()?,
        })
    }
}

/// `SR`: one store inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord<'a> {
    pub ts: i64,
    pub tree_handle: u32,
    pub step: u8,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> StoreRecord<'a> {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_SR);
        out.put_i64(self.ts);
        out.put_u32(self.tree_handle);
        out.put_u8(self.step);
        out.put_u16(self.key.len() as u16);
        out.put_slice(self.key);
        out.put_slice(self.value);
        finish_record(out, start);
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let ts = r.i64()?;
        let tree_handle = r.u32()?;
        let step = r.take(1)?[0];
        let key_len = r.u16()? as usize;
        let key = r.take(key_len)?;
        let value = r.rest();
        Ok(Self {
            ts,
            tree_handle,
            step,
            key,
            value,
        })
    }
}

/// `DR`: range delete inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRangeRecord<'a> {
    pub ts: i64,
    pub tree_handle: u32,
    pub step: u8,
    pub key1: &'a [u8],
    pub key2: &'a [u8],
}

impl<'a> DeleteRangeRecord<'a> {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_DR);
        out.put_i64(self.ts);
        out.put_u32(self.tree_handle);
        out.put_u8(self.step);
        out.put_u16(self.key1.len() as u16);
        out.put_u16(self.key2.len() as u16);
        out.put_slice(self.key1);
        out.put_slice(self.key2);
        finish_record(out, start);
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let ts = r.i64()?;
        let tree_handle = r.u32()?;
        let step = r.take(1)?[0];
        let k1 = r.u16()? as usize;
        let k2 = r.u16()? as usize;
        let key1 = r.take(k1)?;
        let key2 = r.take(k2)?;
        Ok(Self {
            ts,
            tree_handle,
            step,
            key1,
            key2,
        })
    }
}

/// `DT`: whole-tree delete inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteTreeRecord {
    pub ts: i64,
    pub tree_handle: u32,
}

impl DeleteTreeRecord {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_DT);
        out.put_i64(self.ts);
        out.put_u32(self.tree_handle);
        finish_record(out, start);
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            ts: r.i64()?,
            tree_handle: r.u32()?,
        })
    }
}

/// `D1` (and legacy `D0`): accumulator delta inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaRecord {
    pub ts: i64,
    pub tree_handle: u32,
    pub index: u32,
    pub delta: i64,
}

impl DeltaRecord {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_D1);
        out.put_i64(self.ts);
        out.put_u32(self.tree_handle);
        out.put_u32(self.index);
        out.put_i64(self.delta);
        finish_record(out, start);
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let ts = r.i64()?;
        let tree_handle = r.u32()?;
        let index = r.u32()?;
        // The zero-argument legacy form implies a delta of one.
        let delta = if r.remaining() >= 8 { r.i64()? } else { 1 };
        Ok(Self {
            ts,
            tree_handle,
            index,
            delta,
        })
    }
}

/// `CP`: checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub timestamp: i64,
    pub base_address: u64,
    pub wallclock_ms: u64,
}

impl Checkpoint {
    pub fn encode(&self, out: &mut BytesMut) {
        let start = begin_record(out, TYPE_CP);
        out.put_i64(self.timestamp);
        out.put_u64(self.base_address);
        out.put_u64(self.wallclock_ms);
        finish_record(out, start);
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            timestamp: r.i64()?,
            base_address: r.u64()?,
            wallclock_ms: r.u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_frame(buf: &[u8]) -> Frame<'_> {
        match read_frame(buf).expect("frame") {
            Framed::Record(frame) => frame,
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn page_image_roundtrip() {
        let mut out = BytesMut::new();
        let page_bytes = vec![0x5A; 512];
        PageImage {
            volume_handle: 3,
            page: 42,
            timestamp: 1000,
            bytes: &page_bytes,
        }
        .encode(&mut out);
        let frame = first_frame(&out);
        assert_eq!(frame.rtype, TYPE_PA);
        let decoded = PageImage::decode(frame.payload).expect("decode");
        assert_eq!(decoded.volume_handle, 3);
        assert_eq!(decoded.page, 42);
        assert_eq!(decoded.timestamp, 1000);
        assert_eq!(decoded.bytes, &page_bytes[..]);
    }

    #[test]
    fn one_bit_corruption_is_rejected() {
        let mut out = BytesMut::new();
        encode_txn_start(&mut out, 77);
        let mut bytes = out.to_vec();
        bytes[7] ^= 0x01;
        assert!(matches!(read_frame(&bytes), Err(Error::Corruption(_))));
    }

    #[test]
    fn torn_tail_reads_as_incomplete() {
        let mut out = BytesMut::new();
        encode_txn_start(&mut out, 5);
        let cut = out.len() - 3;
        assert!(matches!(
            read_frame(&out[..cut]).expect("frame"),
            Framed::Incomplete
        ));
    }

    #[test]
    fn zero_length_is_padding() {
        assert!(matches!(
            read_frame(&[0, 0, 0, 0, 9, 9]).expect("frame"),
            Framed::Padding
        ));
    }

    #[test]
    fn store_record_roundtrip() {
        let mut out = BytesMut::new();
        StoreRecord {
            ts: 9,
            tree_handle: 2,
            step: 1,
            key: b"key-bytes",
            value: b"value-bytes",
        }
        .encode(&mut out);
        let frame = first_frame(&out);
        let decoded = StoreRecord::decode(frame.payload).expect("decode");
        assert_eq!(decoded.ts, 9);
        assert_eq!(decoded.tree_handle, 2);
        assert_eq!(decoded.step, 1);
        assert_eq!(decoded.key, b"key-bytes");
        assert_eq!(decoded.value, b"value-bytes");
    }

    #[test]
    fn maps_and_checkpoint_roundtrip() {
        let mut out = BytesMut::new();
        let pm = vec![
            PageMapEntry {
                volume_handle: 1,
                page: 7,
                journal_address: 4096,
                timestamp: 11,
            },
            PageMapEntry {
                volume_handle: 1,
                page: 8,
                journal_address: 8192,
                timestamp: 12,
            },
        ];
        encode_page_map(&mut out, &pm);
        let tm = vec![TxnMapEntry {
            start_ts: 5,
            commit_ts: i64::MAX,
            start_address: 2048,
        }];
        encode_txn_map(&mut out, &tm);
        Checkpoint {
            timestamp: 20,
            base_address: 1024,
            wallclock_ms: 999,
        }
        .encode(&mut out);

        let frame = first_frame(&out);
        assert_eq!(frame.rtype, TYPE_PM);
        assert_eq!(decode_page_map(frame.payload).unwrap(), pm);
        let rest = &out[frame.total_len..];
        let frame2 = first_frame(rest);
        assert_eq!(frame2.rtype, TYPE_TM);
        assert_eq!(decode_txn_map(frame2.payload).unwrap(), tm);
        let rest = &rest[frame2.total_len..];
        let frame3 = first_frame(rest);
        assert_eq!(frame3.rtype, TYPE_CP);
        let cp = Checkpoint::decode(frame3.payload).unwrap();
        assert_eq!(cp.timestamp, 20);
        assert_eq!(cp.base_address, 1024);
    }

    #[test]
    fn chained_records_parse_sequentially() {
        let mut out = BytesMut::new();
        encode_txn_start(&mut out, 1);
        DeltaRecord {
            ts: 1,
            tree_handle: 4,
            index: 0,
            delta: -3,
        }
        .encode(&mut out);
        TxnEnd {
            ts: 1,
            commit_ts: 2,
            start_address: 0,
        }
        .encode(&mut out);

        let mut offset = 0;
        let mut types = Vec::new();
        while offset < out.len() {
            let frame = first_frame(&out[offset..]);
            types.push(frame.rtype);
            offset += frame.total_len;
        }
        assert_eq!(types, vec![TYPE_TS, TYPE_D1, TYPE_TC]);
    }
}
