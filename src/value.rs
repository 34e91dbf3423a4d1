//! On-disk payload formats for object bodies and capture-log entries.
//!
//! Attribute values travel through the data layer as raw byte strings in
//! their payload form: integers and floats are 8 bytes little-endian,
//! strings are their bytes, containers are concatenations of length-prefixed
//! elements. Order-preserving transforms exist only in index keys (codec.rs);
//! payloads optimize for decode speed, so multi-byte integers here are
//! little-endian throughout.

use byteorder::{ByteOrder, LittleEndian};

use crate::errenc;
use crate::error::Result;
use crate::schema::AttrType;

/// Encodes an object body: version, attribute count, then one
/// length-prefixed payload per attribute beyond the key.
pub fn encode_object(values: &[Vec<u8>], version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + values.iter().map(|v| 4 + v.len()).sum::<usize>());
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, version);
    out.extend_from_slice(&buf);
    LittleEndian::write_u16(&mut buf[..2], values.len() as u16);
    out.extend_from_slice(&buf[..2]);

    for value in values {
        LittleEndian::write_u32(&mut buf[..4], value.len() as u32);
        out.extend_from_slice(&buf[..4]);
        out.extend_from_slice(value);
    }

    out
}

/// Decodes an object body back into its attribute payloads and version.
pub fn decode_object(bytes: &[u8]) -> Result<(Vec<Vec<u8>>, u64)> {
    if bytes.len() < 10 {
        return Err(errenc!("object body truncated"));
    }

    let version = LittleEndian::read_u64(&bytes[..8]);
    let count = LittleEndian::read_u16(&bytes[8..10]) as usize;
    let mut values = Vec::with_capacity(count);
    let mut at = 10;

    for _ in 0..count {
        if bytes.len() < at + 4 {
            return Err(errenc!("object body truncated"));
        }

        let len = LittleEndian::read_u32(&bytes[at..at + 4]) as usize;
        at += 4;

        if bytes.len() < at + len {
            return Err(errenc!("object body truncated"));
        }

        values.push(bytes[at..at + len].to_vec());
        at += len;
    }

    if at != bytes.len() {
        return Err(errenc!("object body has trailing bytes"));
    }

    Ok((values, version))
}

/// Encodes a capture-log entry: the mutation's key plus, for writes, the
/// full object body. Deletions carry the key alone.
pub fn encode_capture(key: &[u8], write: Option<(&[Vec<u8>], u64)>) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + key.len());
    out.push(write.is_some() as u8);
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, key.len() as u32);
    out.extend_from_slice(&buf);
    out.extend_from_slice(key);

    if let Some((values, version)) = write {
        out.extend_from_slice(&encode_object(values, version));
    }

    out
}

/// Decodes a capture-log entry into `(has_value, key, values, version)`.
pub fn decode_capture(bytes: &[u8]) -> Result<(bool, Vec<u8>, Option<Vec<Vec<u8>>>, Option<u64>)> {
    if bytes.len() < 5 {
        return Err(errenc!("capture entry truncated"));
    }

    let has_value = match bytes[0] {
        0 => false,
        1 => true,
        b => {
            return Err(errenc!("capture entry has bad value marker {b}"))
        }
    };
    let key_len = LittleEndian::read_u32(&bytes[1..5]) as usize;

    if bytes.len() < 5 + key_len {
        return Err(errenc!("capture entry truncated"));
    }

    let key = bytes[5..5 + key_len].to_vec();
    let rest = &bytes[5 + key_len..];

    if !has_value {
        if !rest.is_empty() {
            return Err(errenc!("capture deletion has trailing bytes"));
        }
        return Ok((false, key, None, None));
    }

    let (values, version) = decode_object(rest)?;
    Ok((true, key, Some(values), Some(version)))
}

/// Tests whether a container payload contains the given element payload.
/// For maps, membership is on keys.
pub fn payload_contains(ty: &AttrType, payload: &[u8], element: &[u8]) -> Result<bool> {
    match ty {
        AttrType::List(_) | AttrType::Set(_) => {
            let mut at = 0;
            while at < payload.len() {
                let (item, next) = split_item(payload, at)?;
                if item == element {
                    return Ok(true);
                }
                at = next;
            }
            Ok(false)
        }
        AttrType::Map(_, _) => {
            let mut at = 0;
            while at < payload.len() {
                let (key, next) = split_item(payload, at)?;
                let (_, next) = split_item(payload, next)?;
                if key == element {
                    return Ok(true);
                }
                at = next;
            }
            Ok(false)
        }
        _ => Err(errenc!("membership check on a non-container attribute")),
    }
}

/// Builds a container payload from element payloads. Callers are expected to
/// pre-sort set elements and map pairs by key.
pub fn encode_container(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.iter().map(|i| 4 + i.len()).sum());
    let mut buf = [0u8; 4];
    for item in items {
        LittleEndian::write_u32(&mut buf, item.len() as u32);
        out.extend_from_slice(&buf);
        out.extend_from_slice(item);
    }
    out
}

fn split_item(payload: &[u8], at: usize) -> Result<(&[u8], usize)> {
    if payload.len() < at + 4 {
        return Err(errenc!("container payload truncated"));
    }

    let len = LittleEndian::read_u32(&payload[at..at + 4]) as usize;
    let start = at + 4;

    if payload.len() < start + len {
        return Err(errenc!("container payload truncated"));
    }

    Ok((&payload[start..start + len], start + len))
}

/// Payload form of an i64.
pub fn int_payload(v: i64) -> Vec<u8> {
    let mut buf = [0u8; 8];
    LittleEndian::write_i64(&mut buf, v);
    buf.to_vec()
}

/// Payload form of an f64.
pub fn float_payload(v: f64) -> Vec<u8> {
    let mut buf = [0u8; 8];
    LittleEndian::write_f64(&mut buf, v);
    buf.to_vec()
}
