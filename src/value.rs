//! Value representation inside data-page slots.
//!
//! A slot payload (or one version inside an MVV) is raw value bytes, a
//! 32-byte long-record stub pointing at a chain of long-record pages, or a
//! single-byte AntiValue tombstone. Raw values whose first byte collides
//! with the reserved tag range are escaped with a one-byte prefix.

use crate::error::{Error, Result};

/// Page address type used across the engine; volume-unique.
pub type PageAddr = u64;

pub const TAG_LONG_RECORD: u8 = 0xFB;
pub const TAG_LITERAL_ESCAPE: u8 = 0xFC;
pub const TAG_ANTIVALUE: u8 = 0xFD;
pub const TAG_MVV: u8 = 0xFE;

/// Encoded length of a long-record stub.
pub const LONG_RECORD_STUB_LEN: usize = 32;
/// Value prefix bytes carried inline by the stub.
pub const LONG_RECORD_PREFIX_LEN: usize = 14;

/// A caller-visible value: plain bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Value {
    bytes: Vec<u8>,
}

impl Value {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn set(&mut self, bytes: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
    }

    pub fn take_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value[{} bytes]", self.bytes.len())
    }
}

/// Stub stored in a data page in place of an oversized value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongRecordStub {
    pub total_length: u64,
    pub head_page: PageAddr,
    pub prefix: Vec<u8>,
}

impl LongRecordStub {
    pub fn encode(&self) -> [u8; LONG_RECORD_STUB_LEN] {
        debug_assert!(self.prefix.len() <= LONG_RECORD_PREFIX_LEN);
        let mut out = [0u8; LONG_RECORD_STUB_LEN];
        out[0] = TAG_LONG_RECORD;
        out[1] = self.prefix.len() as u8;
        out[2..10].copy_from_slice(&self.total_length.to_be_bytes());
        out[10..18].copy_from_slice(&self.head_page.to_be_bytes());
        out[18..18 + self.prefix.len()].copy_from_slice(&self.prefix);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != LONG_RECORD_STUB_LEN || bytes[0] != TAG_LONG_RECORD {
            return Err(Error::Corruption("malformed long-record stub".into()));
        }
        let prefix_len = bytes[1] as usize;
        if prefix_len > LONG_RECORD_PREFIX_LEN {
            return Err(Error::Corruption("long-record prefix overruns stub".into()));
        }
        let total_length = u64::from_be_bytes(bytes[2..10].try_into().expect("slice len"));
        let head_page = u64::from_be_bytes(bytes[10..18].try_into().expect("slice len"));
        Ok(Self {
            total_length,
            head_page,
            prefix: bytes[18..18 + prefix_len].to_vec(),
        })
    }
}

/// Classified form of one slot payload / MVV version body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueBody<'a> {
    /// Zero-length payload: the key exists with no defined value.
    Undefined,
    /// Inline literal value bytes (already unescaped).
    Literal(&'a [u8]),
    /// Logical delete marker.
    AntiValue,
    /// Spilled value; payload bytes live in a long-record chain.
    LongRecord(LongRecordStub),
}

/// Escapes raw value bytes into a literal payload.
pub fn encode_literal(raw: &[u8]) -> Vec<u8> {
    if raw.first().is_some_and(|&b| b >= TAG_LONG_RECORD) {
        let mut out = Vec::with_capacity(raw.len() + 1);
        out.push(TAG_LITERAL_ESCAPE);
        out.extend_from_slice(raw);
        out
    } else {
        raw.to_vec()
    }
}

/// Single-byte tombstone payload.
pub const ANTIVALUE_BYTES: [u8; 1] = [TAG_ANTIVALUE];

pub fn antivalue() -> Vec<u8> {
    ANTIVALUE_BYTES.to_vec()
}

/// Classifies one version body (never an MVV; the caller unwraps those).
pub fn classify(payload: &[u8]) -> Result<ValueBody<'_>> {
    match payload.first() {
        None => Ok(ValueBody::Undefined),
        Some(&TAG_ANTIVALUE) if payload.len() == 1 => Ok(ValueBody::AntiValue),
        Some(&TAG_LONG_RECORD) => Ok(ValueBody::LongRecord(LongRecordStub::decode(payload)?)),
        Some(&TAG_LITERAL_ESCAPE) => Ok(ValueBody::Literal(&payload[1..])),
        Some(&TAG_MVV) => Err(Error::Corruption(
            "mvv tag where a version body was expected".into(),
        )),
        Some(&TAG_ANTIVALUE) => Err(Error::Corruption(
            "antivalue tag with trailing bytes".into(),
        )),
        Some(_) => Ok(ValueBody::Literal(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_escape_roundtrip() {
        for raw in [
            b"plain".to_vec(),
            vec![],
            vec![TAG_MVV, 1, 2],
            vec![TAG_LONG_RECORD],
            vec![TAG_ANTIVALUE],
            vec![TAG_LITERAL_ESCAPE, 9],
            vec![0xFA, 0xFF],
        ] {
            let payload = encode_literal(&raw);
            match classify(&payload).expect("classify") {
                ValueBody::Literal(bytes) => assert_eq!(bytes, &raw[..]),
                ValueBody::Undefined => assert!(raw.is_empty()),
                other => panic!("unexpected body {other:?} for {raw:?}"),
            }
        }
    }

    #[test]
    fn stub_roundtrip() {
        let stub = LongRecordStub {
            total_length: 8192,
            head_page: 77,
            prefix: vec![1, 2, 3, 4, 5],
        };
        let encoded = stub.encode();
        assert_eq!(encoded.len(), LONG_RECORD_STUB_LEN);
        let decoded = LongRecordStub::decode(&encoded).expect("decode");
        assert_eq!(decoded, stub);
        match classify(&encoded).expect("classify") {
            ValueBody::LongRecord(s) => assert_eq!(s, stub),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn antivalue_is_one_byte() {
        assert_eq!(classify(&antivalue()).unwrap(), ValueBody::AntiValue);
        assert!(classify(&[TAG_ANTIVALUE, 0]).is_err());
    }

    #[test]
    fn empty_payload_is_undefined() {
        assert_eq!(classify(&[]).unwrap(), ValueBody::Undefined);
    }
}
