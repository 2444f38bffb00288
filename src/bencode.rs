//! # Bencode Codec
//!
//! This module implements the bencoded data format used throughout BitTorrent:
//! torrent files, tracker responses and extension protocol messages are all
//! bencoded dictionaries.
//!
//! ## Format
//!
//! Bencode knows four shapes:
//!
//! - **Integer**: `i<decimal>e` (`i42e`, `i-42e`)
//! - **Byte string**: `<length>:<bytes>` (`5:hello`)
//! - **List**: `l<values>e`
//! - **Dictionary**: `d<key><value>...e`, keys are byte strings
//!
//! ## Key Ordering
//!
//! When a dictionary is encoded its keys are emitted in ascending byte order.
//! The info-hash is the SHA-1 of the re-encoded info dictionary, so encoding
//! must be deterministic across implementations.
//!
//! ## Decoding
//!
//! [`decode`] consumes the first complete value from a byte slice and returns
//! it together with the unconsumed tail. The tail matters for extension
//! protocol messages, where raw block data follows a bencoded header.
//!
//! Schema-driven (un)marshaling of record types is handled by `serde` derive
//! over `serde_bencode`; this module only covers the dynamic value tree.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors produced while decoding bencoded data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("bencode: unexpected end of input")]
    UnexpectedEof,

    /// A byte string declared a negative length.
    #[error("bencode: negative string length not allowed")]
    NegativeStringLength,

    /// A byte string length prefix is not a valid number.
    #[error("bencode: invalid string length")]
    InvalidStringLength,

    /// An integer with no digits between `i` and `e`.
    #[error("bencode: integer string is too short")]
    ShortInteger,

    /// Integers cannot start with `-0`.
    #[error("bencode: integers cannot start with -0")]
    NegativeZeroInteger,

    /// Integers other than `0` cannot start with `0`.
    #[error("bencode: integers cannot start with 0")]
    LeadingZeroInteger,

    /// Integer digits failed to parse.
    #[error("bencode: invalid integer")]
    InvalidInteger,

    /// A dictionary key that is not a byte string.
    #[error("bencode: dictionary key is not a string")]
    InvalidDictionaryKey,
}

/// A decoded bencode value.
///
/// Consumers pattern-match on the variant they expect, or use the `as_*`
/// accessors which return `None` on a shape mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed integer.
    Integer(i64),
    /// A byte string, not necessarily valid UTF-8.
    Bytes(Vec<u8>),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte string keys, kept sorted by key.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Returns the value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as a byte string, if it is one.
    #[allow(dead_code)]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a UTF-8 string, if it is a valid one.
    #[allow(dead_code)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the value as a list, if it is one.
    #[allow(dead_code)]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the value as a dictionary, if it is one.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

/// Encode a value into its bencoded byte representation.
///
/// Dictionary keys are emitted in ascending byte order without exception.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(value, &mut buf);
    buf
}

fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.extend_from_slice(format!("i{}e", i).as_bytes());
        }
        Value::Bytes(bytes) => {
            buf.extend_from_slice(format!("{}:", bytes.len()).as_bytes());
            buf.extend_from_slice(bytes);
        }
        Value::List(list) => {
            buf.push(b'l');
            for item in list {
                encode_value(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(dict) => {
            buf.push(b'd');
            // BTreeMap iterates in ascending key order
            for (key, item) in dict {
                buf.extend_from_slice(format!("{}:", key.len()).as_bytes());
                buf.extend_from_slice(key);
                encode_value(item, buf);
            }
            buf.push(b'e');
        }
    }
}

/// Decode the first top-level value from `data`.
///
/// Returns the value and the unconsumed remainder of the input.
///
/// # Errors
///
/// Returns a [`BencodeError`] if the input is truncated or malformed.
/// An EOF in the middle of a list or dictionary is a fatal parse error.
pub fn decode(data: &[u8]) -> Result<(Value, &[u8]), BencodeError> {
    let mut pos = 0;
    let value = decode_value(data, &mut pos)?;
    Ok((value, &data[pos..]))
}

fn decode_value(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    match data[*pos] {
        b'i' => decode_integer(data, pos),
        b'l' => decode_list(data, pos),
        b'd' => decode_dict(data, pos),
        _ => decode_bytes(data, pos),
    }
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    // skip 'i'
    *pos += 1;

    let start = *pos;
    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }

    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let digits = &data[start..*pos];

    if digits.is_empty() {
        return Err(BencodeError::ShortInteger);
    }

    if digits.len() > 1 {
        if digits[0] == b'-' && digits[1] == b'0' {
            return Err(BencodeError::NegativeZeroInteger);
        }

        if digits[0] == b'0' {
            return Err(BencodeError::LeadingZeroInteger);
        }
    }

    let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
    let value: i64 = text.parse().map_err(|_| BencodeError::InvalidInteger)?;

    // skip 'e'
    *pos += 1;

    Ok(Value::Integer(value))
}

fn decode_bytes(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    let start = *pos;
    while *pos < data.len() && data[*pos] != b':' {
        *pos += 1;
    }

    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let prefix = &data[start..*pos];

    if prefix.first() == Some(&b'-') {
        return Err(BencodeError::NegativeStringLength);
    }

    let text = std::str::from_utf8(prefix).map_err(|_| BencodeError::InvalidStringLength)?;
    let length: usize = text.parse().map_err(|_| BencodeError::InvalidStringLength)?;

    // skip ':'
    *pos += 1;

    if length > data.len() - *pos {
        return Err(BencodeError::UnexpectedEof);
    }

    let bytes = data[*pos..*pos + length].to_vec();
    *pos += length;

    Ok(Value::Bytes(bytes))
}

fn decode_list(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    // skip 'l'
    *pos += 1;

    let mut list = Vec::new();

    loop {
        if *pos >= data.len() {
            return Err(BencodeError::UnexpectedEof);
        }

        if data[*pos] == b'e' {
            break;
        }

        list.push(decode_value(data, pos)?);
    }

    // skip 'e'
    *pos += 1;

    Ok(Value::List(list))
}

fn decode_dict(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    // skip 'd'
    *pos += 1;

    let mut dict = BTreeMap::new();

    loop {
        if *pos >= data.len() {
            return Err(BencodeError::UnexpectedEof);
        }

        if data[*pos] == b'e' {
            break;
        }

        let key = match decode_value(data, pos)? {
            Value::Bytes(key) => key,
            _ => return Err(BencodeError::InvalidDictionaryKey),
        };

        let value = decode_value(data, pos)?;
        dict.insert(key, value);
    }

    // skip 'e'
    *pos += 1;

    Ok(Value::Dict(dict))
}
