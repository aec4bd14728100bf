//! Order-preserving key encoding.
//!
//! A key is a sequence of typed segments encoded so that an unsigned bytewise
//! comparison of two encoded keys matches the logical ordering of their
//! segment values. Each segment is self-delimiting: fixed-width types carry a
//! tag and a transformed big-endian payload, variable-width types escape the
//! bytes 0x00/0x01 and close with a 0x00 terminator. Segments of different
//! types order by tag.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

pub const TAG_LEFT_GUARD: u8 = 0x01;
pub const TAG_NULL: u8 = 0x02;
pub const TAG_FALSE: u8 = 0x03;
pub const TAG_TRUE: u8 = 0x04;
pub const TAG_SHORT: u8 = 0x13;
pub const TAG_LONG: u8 = 0x15;
pub const TAG_FLOAT: u8 = 0x1E;
pub const TAG_DOUBLE: u8 = 0x20;
pub const TAG_VARINT: u8 = 0x26;
pub const TAG_BYTES: u8 = 0x28;
pub const TAG_STRING: u8 = 0x30;
pub const TAG_RIGHT_GUARD: u8 = 0xFF;

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;
const ESCAPE_ZERO: u8 = 0x20;
const ESCAPE_ONE: u8 = 0x21;

/// Maximum encoded key length accepted by the engine.
pub const MAX_KEY_LENGTH: usize = 2047;

/// A multi-segment, order-preserving key.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sentinel sorting below every real key in a tree.
    pub fn left_guard() -> Self {
        Self {
            bytes: vec![TAG_LEFT_GUARD],
        }
    }

    /// Sentinel sorting above every real key in a tree.
    pub fn right_guard() -> Self {
        Self {
            bytes: vec![TAG_RIGHT_GUARD],
        }
    }

    pub fn from_encoded(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn encoded(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_left_guard(&self) -> bool {
        self.bytes == [TAG_LEFT_GUARD]
    }

    pub fn is_right_guard(&self) -> bool {
        self.bytes == [TAG_RIGHT_GUARD]
    }

    pub fn clear(&mut self) -> &mut Self {
        self.bytes.clear();
        self
    }

    pub fn append_null(&mut self) -> &mut Self {
        self.bytes.push(TAG_NULL);
        self
    }

    pub fn append_bool(&mut self, value: bool) -> &mut Self {
        self.bytes.push(if value { TAG_TRUE } else { TAG_FALSE });
        self
    }

    pub fn append_short(&mut self, value: i16) -> &mut Self {
        self.bytes.push(TAG_SHORT);
        let biased = (value as u16) ^ 0x8000;
        self.bytes.extend_from_slice(&biased.to_be_bytes());
        self
    }

    pub fn append_long(&mut self, value: i64) -> &mut Self {
        self.bytes.push(TAG_LONG);
        let biased = (value as u64) ^ 0x8000_0000_0000_0000;
        self.bytes.extend_from_slice(&biased.to_be_bytes());
        self
    }

    pub fn append_float(&mut self, value: f32) -> &mut Self {
        self.bytes.push(TAG_FLOAT);
        self.bytes
            .extend_from_slice(&order_f32(value).to_be_bytes());
        self
    }

    pub fn append_double(&mut self, value: f64) -> &mut Self {
        self.bytes.push(TAG_DOUBLE);
        self.bytes
            .extend_from_slice(&order_f64(value).to_be_bytes());
        self
    }

    /// Unsigned varint segment: one length byte followed by the minimal
    /// big-endian representation. Shorter representations sort first, so the
    /// encoding is order-preserving without bias.
    pub fn append_varint(&mut self, value: u64) -> &mut Self {
        self.bytes.push(TAG_VARINT);
        let needed = ((64 - value.leading_zeros() as usize) + 7) / 8;
        let needed = needed.max(1);
        self.bytes.push(needed as u8);
        self.bytes
            .extend_from_slice(&value.to_be_bytes()[8 - needed..]);
        self
    }

    pub fn append_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.bytes.push(TAG_BYTES);
        self.append_escaped(value);
        self
    }

    pub fn append_string(&mut self, value: &str) -> &mut Self {
        self.bytes.push(TAG_STRING);
        self.append_escaped(value.as_bytes());
        self
    }

    fn append_escaped(&mut self, value: &[u8]) {
        for &b in value {
            match b {
                TERMINATOR => {
                    self.bytes.push(ESCAPE);
                    self.bytes.push(ESCAPE_ZERO);
                }
                ESCAPE => {
                    self.bytes.push(ESCAPE);
                    self.bytes.push(ESCAPE_ONE);
                }
                other => self.bytes.push(other),
            }
        }
        self.bytes.push(TERMINATOR);
    }

    /// Removes the last segment; returns false on an empty key.
    pub fn truncate_last(&mut self) -> bool {
        let mut last_start = None;
        let mut cursor = SegmentCursor::new(&self.bytes);
        loop {
            let start = cursor.offset;
            match cursor.next() {
                Ok(Some(_)) => last_start = Some(start),
                Ok(None) => break,
                Err(_) => return false,
            }
        }
        match last_start {
            Some(start) => {
                self.bytes.truncate(start);
                true
            }
            None => false,
        }
    }

    pub fn segments(&self) -> SegmentCursor<'_> {
        SegmentCursor::new(&self.bytes)
    }

    /// Encoded byte range of each segment, in order.
    pub fn segment_slices(&self) -> Result<Vec<&[u8]>> {
        let mut out = Vec::new();
        let mut cursor = self.segments();
        let mut start = cursor.offset;
        while cursor.next()?.is_some() {
            out.push(&self.bytes[start..cursor.offset]);
            start = cursor.offset;
        }
        Ok(out)
    }

    /// Depth of the key: number of decodable segments.
    pub fn depth(&self) -> usize {
        let mut cursor = self.segments();
        let mut n = 0;
        while let Ok(Some(_)) = cursor.next() {
            n += 1;
        }
        n
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key{{")?;
        let mut cursor = self.segments();
        let mut first = true;
        loop {
            match cursor.next() {
                Ok(Some(segment)) => {
                    if !first {
                        write!(f, ",")?;
                    }
                    first = false;
                    write!(f, "{segment:?}")?;
                }
                Ok(None) => break,
                Err(_) => {
                    write!(f, "<invalid>")?;
                    break;
                }
            }
        }
        write!(f, "}}")
    }
}

/// One decoded key segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    LeftGuard,
    RightGuard,
    Null,
    Bool(bool),
    Short(i16),
    Long(i64),
    Float(f32),
    Double(f64),
    Varint(u64),
    Bytes(Vec<u8>),
    String(String),
}

/// Forward decoder over the segments of an encoded key.
pub struct SegmentCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> SegmentCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Segment>> {
        if self.offset >= self.bytes.len() {
            return Ok(None);
        }
        let tag = self.bytes[self.offset];
        self.offset += 1;
        let segment = match tag {
            TAG_LEFT_GUARD => Segment::LeftGuard,
            TAG_RIGHT_GUARD => Segment::RightGuard,
            TAG_NULL => Segment::Null,
            TAG_FALSE => Segment::Bool(false),
            TAG_TRUE => Segment::Bool(true),
            TAG_SHORT => {
                let raw = u16::from_be_bytes(self.take_array::<2>()?);
                Segment::Short((raw ^ 0x8000) as i16)
            }
            TAG_LONG => {
                let raw = u64::from_be_bytes(self.take_array::<8>()?);
                Segment::Long((raw ^ 0x8000_0000_0000_0000) as i64)
            }
            TAG_FLOAT => {
                let raw = u32::from_be_bytes(self.take_array::<4>()?);
                Segment::Float(f32::from_bits(unorder_f32(raw)))
            }
            TAG_DOUBLE => {
                let raw = u64::from_be_bytes(self.take_array::<8>()?);
                Segment::Double(f64::from_bits(unorder_f64(raw)))
            }
            TAG_VARINT => {
                let len = self.take_byte()? as usize;
                if len == 0 || len > 8 {
                    return Err(Error::Corruption("varint segment length out of range".into()));
                }
                let mut buf = [0u8; 8];
                let slice = self.take(len)?;
                buf[8 - len..].copy_from_slice(slice);
                Segment::Varint(u64::from_be_bytes(buf))
            }
            TAG_BYTES => Segment::Bytes(self.take_escaped()?),
            TAG_STRING => {
                let raw = self.take_escaped()?;
                let s = String::from_utf8(raw)
                    .map_err(|_| Error::Corruption("string segment is not UTF-8".into()))?;
                Segment::String(s)
            }
            other => {
                return Err(Error::Corruption(format!(
                    "unknown key segment tag 0x{other:02X}"
                )))
            }
        };
        Ok(Some(segment))
    }

    fn take_byte(&mut self) -> Result<u8> {
        let b = *self
            .bytes
            .get(self.offset)
            .ok_or_else(|| Error::Corruption("truncated key segment".into()))?;
        self.offset += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.offset + n;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| Error::Corruption("truncated key segment".into()))?;
        self.offset = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_escaped(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match self.take_byte()? {
                TERMINATOR => return Ok(out),
                ESCAPE => match self.take_byte()? {
                    ESCAPE_ZERO => out.push(TERMINATOR),
                    ESCAPE_ONE => out.push(ESCAPE),
                    other => {
                        return Err(Error::Corruption(format!(
                            "invalid key escape 0x{other:02X}"
                        )))
                    }
                },
                other => out.push(other),
            }
        }
    }
}

fn order_f32(value: f32) -> u32 {
    let bits = value.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

fn unorder_f32(raw: u32) -> u32 {
    if raw & 0x8000_0000 != 0 {
        raw & !0x8000_0000
    } else {
        !raw
    }
}

fn order_f64(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits & 0x8000_0000_0000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000_0000_0000
    }
}

fn unorder_f64(raw: u64) -> u64 {
    if raw & 0x8000_0000_0000_0000 != 0 {
        raw & !0x8000_0000_0000_0000
    } else {
        !raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn long_key(v: i64) -> Key {
        let mut k = Key::new();
        k.append_long(v);
        k
    }

    fn string_key(v: &str) -> Key {
        let mut k = Key::new();
        k.append_string(v);
        k
    }

    #[test]
    fn guards_bound_every_real_segment() {
        let left = Key::left_guard();
        let right = Key::right_guard();
        for key in [
            {
                let mut k = Key::new();
                k.append_null();
                k
            },
            long_key(i64::MIN),
            long_key(i64::MAX),
            string_key(""),
            string_key("zzz"),
        ] {
            assert!(left < key, "left guard above {key:?}");
            assert!(key < right, "right guard below {key:?}");
        }
    }

    #[test]
    fn roundtrip_each_segment_type() {
        let mut key = Key::new();
        key.append_null()
            .append_bool(true)
            .append_short(-7)
            .append_long(123_456_789_000)
            .append_float(-1.5)
            .append_double(std::f64::consts::PI)
            .append_varint(300)
            .append_bytes(&[0x00, 0x01, 0x02])
            .append_string("páge");
        let mut cursor = key.segments();
        assert_eq!(cursor.next().unwrap(), Some(Segment::Null));
        assert_eq!(cursor.next().unwrap(), Some(Segment::Bool(true)));
        assert_eq!(cursor.next().unwrap(), Some(Segment::Short(-7)));
        assert_eq!(cursor.next().unwrap(), Some(Segment::Long(123_456_789_000)));
        assert_eq!(cursor.next().unwrap(), Some(Segment::Float(-1.5)));
        assert_eq!(
            cursor.next().unwrap(),
            Some(Segment::Double(std::f64::consts::PI))
        );
        assert_eq!(cursor.next().unwrap(), Some(Segment::Varint(300)));
        assert_eq!(
            cursor.next().unwrap(),
            Some(Segment::Bytes(vec![0x00, 0x01, 0x02]))
        );
        assert_eq!(
            cursor.next().unwrap(),
            Some(Segment::String("páge".to_owned()))
        );
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn string_prefix_sorts_first() {
        assert!(string_key("a") < string_key("ab"));
        assert!(string_key("ab") < string_key("b"));
        assert!(string_key("") < string_key("\u{0}"));
    }

    #[test]
    fn truncate_last_removes_one_segment() {
        let mut key = Key::new();
        key.append_string("root").append_long(42);
        assert!(key.truncate_last());
        assert_eq!(key, string_key("root"));
        assert!(key.truncate_last());
        assert!(key.is_empty());
        assert!(!key.truncate_last());
    }

    #[test]
    fn multi_segment_order_follows_first_difference() {
        let mut a = Key::new();
        a.append_string("tree").append_long(1);
        let mut b = Key::new();
        b.append_string("tree").append_long(2);
        let mut c = Key::new();
        c.append_string("trees");
        assert!(a < b);
        assert!(b < c);
    }

    proptest! {
        #[test]
        fn long_order_preserved(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(a.cmp(&b), long_key(a).cmp(&long_key(b)));
        }

        #[test]
        fn varint_order_preserved(a in any::<u64>(), b in any::<u64>()) {
            let mut ka = Key::new();
            ka.append_varint(a);
            let mut kb = Key::new();
            kb.append_varint(b);
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn double_order_preserved(a in any::<f64>(), b in any::<f64>()) {
            prop_assume!(!a.is_nan() && !b.is_nan());
            let mut ka = Key::new();
            ka.append_double(a);
            let mut kb = Key::new();
            kb.append_double(b);
            match a.partial_cmp(&b).unwrap() {
                Ordering::Less => prop_assert!(ka < kb || (a == 0.0 && b == 0.0)),
                Ordering::Greater => prop_assert!(ka > kb || (a == 0.0 && b == 0.0)),
                Ordering::Equal => prop_assert!(ka == kb || (a == 0.0 && b == 0.0)),
            }
        }

        #[test]
        fn string_order_matches_bytes(a in ".*", b in ".*") {
            prop_assert_eq!(
                a.as_bytes().cmp(b.as_bytes()),
                string_key(&a).cmp(&string_key(&b))
            );
        }

        #[test]
        fn bytes_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut key = Key::new();
            key.append_bytes(&data);
            let mut cursor = key.segments();
            prop_assert_eq!(cursor.next().unwrap(), Some(Segment::Bytes(data)));
            prop_assert_eq!(cursor.next().unwrap(), None);
        }
    }
}
