//! Order-preserving raw key encoding
//!
//! Window and session entries are stored in byte-ordered engines under a
//! composite key. The encoding keeps the engine's byte order equal to the
//! logical order `(key, time, ...)` even when one key is a prefix of
//! another:
//!
//! ```text
//! key bytes, 0x00 escaped as 0x00 0xFF    terminated by 0x00 0x01
//! timestamp as big-endian u64 with the sign bit flipped
//! ```
//!
//! Window raw key:  `key | start | seq`
//! Session raw key: `key | end | start`

use crate::error::{StoreError, StoreResult};

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;

/// Append the escaped, terminated form of `key`
pub fn encode_key_into(key: &[u8], out: &mut Vec<u8>) {
    out.reserve(key.len() + 2);
    for &byte in key {
        if byte == ESCAPE {
            out.push(ESCAPE);
            out.push(ESCAPED_ZERO);
        } else {
            out.push(byte);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

/// Escaped, terminated form of `key`; every composite key of `key` starts with it
pub fn encode_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 18);
    encode_key_into(key, &mut out);
    out
}

/// Split an escaped key off the front of `raw`
pub fn decode_key(raw: &[u8]) -> StoreResult<(Vec<u8>, &[u8])> {
    let mut key = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let byte = raw[i];
        if byte != ESCAPE {
            key.push(byte);
            i += 1;
            continue;
        }
        match raw.get(i + 1) {
            Some(&ESCAPED_ZERO) => {
                key.push(ESCAPE);
                i += 2;
            }
            Some(&TERMINATOR) => return Ok((key, &raw[i + 2..])),
            _ => break,
        }
    }
    Err(StoreError::Serialization(format!(
        "malformed raw key: {:?}",
        raw
    )))
}

pub fn encode_timestamp_into(timestamp: i64, out: &mut Vec<u8>) {
    out.extend_from_slice(&((timestamp as u64) ^ (1 << 63)).to_be_bytes());
}

fn decode_timestamp(raw: &[u8]) -> StoreResult<(i64, &[u8])> {
    if raw.len() < 8 {
        return Err(StoreError::Serialization(
            "raw key too short for timestamp".to_string(),
        ));
    }
    let (head, rest) = raw.split_at(8);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(head);
    Ok(((u64::from_be_bytes(bytes) ^ (1 << 63)) as i64, rest))
}

/// Logical key of a window store entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowKey {
    pub key: Vec<u8>,
    pub start: i64,
    pub seq: u32,
}

impl WindowKey {
    pub fn new(key: &[u8], start: i64, seq: u32) -> Self {
        Self {
            key: key.to_vec(),
            start,
            seq,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        Self::encode_parts(&self.key, self.start, self.seq)
    }

    pub fn encode_parts(key: &[u8], start: i64, seq: u32) -> Vec<u8> {
        let mut out = encode_key(key);
        encode_timestamp_into(start, &mut out);
        out.extend_from_slice(&seq.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> StoreResult<Self> {
        let (key, rest) = decode_key(raw)?;
        let (start, rest) = decode_timestamp(rest)?;
        if rest.len() != 4 {
            return Err(StoreError::Serialization(format!(
                "window key has {} trailing bytes, expected 4",
                rest.len()
            )));
        }
        let seq = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        Ok(Self { key, start, seq })
    }
}

/// Logical key of a session store entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub key: Vec<u8>,
    pub start: i64,
    pub end: i64,
}

impl SessionKey {
    pub fn new(key: &[u8], start: i64, end: i64) -> Self {
        Self {
            key: key.to_vec(),
            start,
            end,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        Self::encode_parts(&self.key, self.end, self.start)
    }

    /// Encode with the end timestamp first, as stored
    pub fn encode_parts(key: &[u8], end: i64, start: i64) -> Vec<u8> {
        let mut out = encode_key(key);
        encode_timestamp_into(end, &mut out);
        encode_timestamp_into(start, &mut out);
        out
    }

    pub fn decode(raw: &[u8]) -> StoreResult<Self> {
        let (key, rest) = decode_key(raw)?;
        let (end, rest) = decode_timestamp(rest)?;
        let (start, rest) = decode_timestamp(rest)?;
        if !rest.is_empty() {
            return Err(StoreError::Serialization(format!(
                "session key has {} trailing bytes",
                rest.len()
            )));
        }
        Ok(Self { key, start, end })
    }
}
