//! Eager near cache payload codec.
//!
//! Layout: `[varint keyLen][key][varint valueLen][value][i64 version]`, the
//! version big-endian. Keys and values are marshalled as JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Encode a varint.
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a varint, advancing `buf` past it.
pub fn decode_varint(buf: &mut &[u8]) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        let (&byte, rest) = buf.split_first()?;
        *buf = rest;

        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if buf.len() < len {
        return None;
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Some(head)
}

/// Frames already marshalled key and value bytes with a version.
pub fn encode_raw(key: &[u8], value: &[u8], version: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + value.len() + 20);
    encode_varint(key.len() as u64, &mut buf);
    buf.extend_from_slice(key);
    encode_varint(value.len() as u64, &mut buf);
    buf.extend_from_slice(value);
    buf.extend_from_slice(&version.to_be_bytes());
    buf
}

/// Splits a payload into key bytes, value bytes and version.
pub fn decode_raw(payload: &[u8]) -> Result<(&[u8], &[u8], i64)> {
    let malformed = || CacheError::Serialization("malformed near cache payload".to_string());
    let mut buf = payload;

    let key_len = decode_varint(&mut buf).ok_or_else(malformed)? as usize;
    let key = take(&mut buf, key_len).ok_or_else(malformed)?;
    let value_len = decode_varint(&mut buf).ok_or_else(malformed)? as usize;
    let value = take(&mut buf, value_len).ok_or_else(malformed)?;
    let version: [u8; 8] = take(&mut buf, 8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(malformed)?;
    if !buf.is_empty() {
        return Err(malformed());
    }
    Ok((key, value, i64::from_be_bytes(version)))
}

/// Marshals and frames a key, value and version.
pub fn encode_payload<K: Serialize, V: Serialize>(key: &K, value: &V, version: i64) -> Result<Vec<u8>> {
    let key = serde_json::to_vec(key)?;
    let value = serde_json::to_vec(value)?;
    Ok(encode_raw(&key, &value, version))
}

/// Decodes a framed payload back into key, value and version.
pub fn decode_payload<K: DeserializeOwned, V: DeserializeOwned>(payload: &[u8]) -> Result<(K, V, i64)> {
    let (key, value, version) = decode_raw(payload)?;
    Ok((
        serde_json::from_slice(key)?,
        serde_json::from_slice(value)?,
        version,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_multibyte() {
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        assert_eq!(buf, vec![0xAC, 0x02]);

        let mut slice = buf.as_slice();
        assert_eq!(decode_varint(&mut slice), Some(300));
        assert!(slice.is_empty());
    }

    #[test]
    fn test_decode_varint_empty() {
        let mut slice: &[u8] = &[];
        assert_eq!(decode_varint(&mut slice), None);
    }

    #[test]
    fn test_decode_varint_overflow() {
        let bytes = [0xFFu8; 11];
        let mut slice = &bytes[..];
        assert_eq!(decode_varint(&mut slice), None);
    }

    #[test]
    fn test_payload_layout() {
        let payload = encode_raw(b"k", b"vv", 2);
        assert_eq!(payload, vec![1, b'k', 2, b'v', b'v', 0, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn test_typed_payload() {
        let payload = encode_payload(&1u64, &"a".to_string(), 7).unwrap();
        let (key, value, version): (u64, String, i64) = decode_payload(&payload).unwrap();
        assert_eq!((key, value.as_str(), version), (1, "a", 7));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let payload = encode_raw(b"key", b"value", 1);
        for len in 0..payload.len() {
            assert!(matches!(
                decode_raw(&payload[..len]),
                Err(CacheError::Serialization(_))
            ));
        }
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut payload = encode_raw(b"k", b"v", 1);
        payload.push(0);
        assert!(decode_raw(&payload).is_err());
    }
}
