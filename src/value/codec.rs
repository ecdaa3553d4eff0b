//! Binary codec for [`Value`].
//!
//! Values are MessagePack documents. `Int` is written as a MessagePack
//! integer and `Float` as float64, so decoding never turns one into the
//! other. Maps are written in insertion order.
//!
//! Decoding rejects, as [`DecodeError::Malformed`]:
//! - truncated input and trailing bytes
//! - duplicate or non-string map keys
//! - binary and extension types
//! - unsigned integers above `i64::MAX`

use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use super::Value;

/// Failure to decode a [`Value`] from bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input is truncated or ill-typed.
    Malformed(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed value: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode a value to bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

/// Encode a value, appending to `buf`.
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    let mut serializer = rmp_serde::Serializer::new(buf);
    // Writes into a Vec fail only on allocation failure.
    if let Err(e) = value.serialize(&mut serializer) {
        log::error!("[Codec] Failed to encode {}: {e}", value.type_name());
    }
}

/// Decode a value that spans the whole of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let mut cursor = Cursor::new(bytes);
    let value = {
        let mut deserializer = rmp_serde::Deserializer::new(&mut cursor);
        Value::deserialize(&mut deserializer).map_err(|e| DecodeError::Malformed(e.to_string()))?
    };
    let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
    if consumed != bytes.len() {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes",
            bytes.len().saturating_sub(consumed)
        )));
    }
    Ok(value)
}
