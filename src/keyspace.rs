//! The on-disk key layout.
//!
//! Every stored key begins with a one-byte namespace tag followed by
//! big-endian packed fields, so byte-wise comparison orders keys by
//! `(tag, field1, field2, ...)` and each namespace forms a contiguous
//! range. All tags have the high bit clear; user keys never collide with
//! the reserved metadata keys below.
//!
//! Index entries carry two encoded fields after the prefix: the attribute
//! value, then the object key. When both encodings are variable-length, a
//! trailing big-endian u32 key length is appended so the composite can be
//! split back into its parts without disturbing the (value, key) sort.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::schema::{CaptureId, RegionId};

/// Object namespace.
pub const TAG_OBJECT: u8 = b'o';
/// Secondary-index namespace.
pub const TAG_INDEX: u8 = b'i';
/// Capture-transfer log namespace.
pub const TAG_TRANSFER: u8 = b't';
/// Acked-marker namespace.
pub const TAG_ACKED: u8 = b'a';

/// Stores the release tag of the on-disk layout.
pub const VERSION_KEY: &[u8] = b"hyperdex";
/// Stores the packed daemon identity written by save_state.
pub const STATE_KEY: &[u8] = b"state";
/// Presence flag: saved state was written but not cleared by a clean shutdown.
pub const DIRTY_KEY: &[u8] = b"dirty";

fn push_u64(out: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, v);
    out.extend_from_slice(&buf);
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, v);
    out.extend_from_slice(&buf);
}

/// Prefix covering every object of a region: `o || region`.
pub fn region_prefix(region: RegionId) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(TAG_OBJECT);
    push_u64(&mut out, region.0);
    out
}

/// Full object key: `o || region || encoded_key`.
pub fn object_key(region: RegionId, encoded_key: &[u8]) -> Vec<u8> {
    let mut out = region_prefix(region);
    out.extend_from_slice(encoded_key);
    out
}

/// Splits an object key into its region and encoded-key portion.
pub fn decode_object_key(bytes: &[u8]) -> Result<(RegionId, &[u8])> {
    if bytes.len() < 9 || bytes[0] != TAG_OBJECT {
        return Err(Error::BadEncoding("not an object key".to_string()));
    }

    let region = RegionId(BigEndian::read_u64(&bytes[1..9]));
    Ok((region, &bytes[9..]))
}

/// Prefix covering every index entry of one attribute: `i || region || attr`.
pub fn index_prefix(region: RegionId, attr: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(11);
    out.push(TAG_INDEX);
    push_u64(&mut out, region.0);
    push_u16(&mut out, attr);
    out
}

/// Full index entry key. `both_variable` is true when neither the value nor
/// the key encoding is fixed-size, in which case the key length trails the
/// composite.
pub fn index_key(
    region: RegionId,
    attr: u16,
    encoded_value: &[u8],
    encoded_key: &[u8],
    both_variable: bool,
) -> Vec<u8> {
    let mut out = index_prefix(region, attr);
    out.reserve(encoded_value.len() + encoded_key.len() + 4);
    out.extend_from_slice(encoded_value);
    out.extend_from_slice(encoded_key);

    if both_variable {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, encoded_key.len() as u32);
        out.extend_from_slice(&buf);
    }

    out
}

/// Splits an index entry key into `(region, attr, encoded_value,
/// encoded_key)`. The fixed sizes of the value and key encodings (None when
/// variable) drive the split; when both are variable the trailing u32 does.
pub fn decode_index_key<'a>(
    bytes: &'a [u8],
    value_fixed: Option<usize>,
    key_fixed: Option<usize>,
) -> Result<(RegionId, u16, &'a [u8], &'a [u8])> {
    const PREFIX: usize = 11;

    if bytes.len() < PREFIX || bytes[0] != TAG_INDEX {
        return Err(Error::BadEncoding("not an index key".to_string()));
    }

    let region = RegionId(BigEndian::read_u64(&bytes[1..9]));
    let attr = BigEndian::read_u16(&bytes[9..11]);
    let rest = &bytes[PREFIX..];

    let (value, key) = if let Some(sz) = value_fixed {
        if sz > rest.len() {
            return Err(Error::BadEncoding("index key truncated".to_string()));
        }
        (&rest[..sz], &rest[sz..])
    } else if let Some(sz) = key_fixed {
        if sz > rest.len() {
            return Err(Error::BadEncoding("index key truncated".to_string()));
        }
        (&rest[..rest.len() - sz], &rest[rest.len() - sz..])
    } else {
        if rest.len() < 4 {
            return Err(Error::BadEncoding("index key truncated".to_string()));
        }
        let key_len = BigEndian::read_u32(&rest[rest.len() - 4..]) as usize;
        if key_len + 4 > rest.len() {
            return Err(Error::BadEncoding("index key length overruns".to_string()));
        }
        let value_end = rest.len() - 4 - key_len;
        (&rest[..value_end], &rest[value_end..rest.len() - 4])
    };

    Ok((region, attr, value, key))
}

/// Capture-log entry key: `t || capture || seq`.
pub fn transfer_key(capture: CaptureId, seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(17);
    out.push(TAG_TRANSFER);
    push_u64(&mut out, capture.0);
    push_u64(&mut out, seq);
    out
}

/// Splits a capture-log key into its capture id and sequence number.
pub fn decode_transfer_key(bytes: &[u8]) -> Result<(CaptureId, u64)> {
    if bytes.len() != 17 || bytes[0] != TAG_TRANSFER {
        return Err(Error::BadEncoding("not a transfer key".to_string()));
    }

    let capture = CaptureId(BigEndian::read_u64(&bytes[1..9]));
    let seq = BigEndian::read_u64(&bytes[9..17]);
    Ok((capture, seq))
}

/// Acked marker key: `a || reg || region || inverted_seq`. The registering
/// region leads so one contiguous range covers everything `clear_acked`
/// must visit for a given `reg`; callers invert with `u64::MAX - seq_id` so
/// the largest committed seq id sorts first.
pub fn acked_key(reg: RegionId, region: RegionId, inverted_seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(25);
    out.push(TAG_ACKED);
    push_u64(&mut out, reg.0);
    push_u64(&mut out, region.0);
    push_u64(&mut out, inverted_seq);
    out
}

/// Prefix covering every acked marker of one registering region.
pub fn acked_prefix(reg: RegionId) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(TAG_ACKED);
    push_u64(&mut out, reg.0);
    out
}

/// Splits an acked marker key into `(reg, region, inverted_seq)`.
pub fn decode_acked_key(bytes: &[u8]) -> Result<(RegionId, RegionId, u64)> {
    if bytes.len() != 25 || bytes[0] != TAG_ACKED {
        return Err(Error::BadEncoding("not an acked key".to_string()));
    }

    let reg = RegionId(BigEndian::read_u64(&bytes[1..9]));
    let region = RegionId(BigEndian::read_u64(&bytes[9..17]));
    let inverted_seq = BigEndian::read_u64(&bytes[17..25]);
    Ok((reg, region, inverted_seq))
}

/// The smallest byte string strictly greater than every key beginning with
/// `prefix`: increment the last non-0xff byte and truncate. An all-0xff
/// prefix has no upper bound.
pub fn bump(prefix: &[u8]) -> Option<Vec<u8>> {
    let last = prefix.iter().rposition(|b| *b != 0xff)?;
    let mut out = prefix[..=last].to_vec();
    out[last] += 1;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_disjoint() {
        let object = object_key(RegionId(u64::MAX), b"zzz");
        let index = index_key(RegionId(0), 0, b"", b"", false);
        let transfer = transfer_key(CaptureId(0), 0);
        let acked = acked_key(RegionId(0), RegionId(0), 0);

        // tags order the namespaces: a < i < o < t
        assert!(acked < index);
        assert!(index < object);
        assert!(object < transfer);
    }

    #[test]
    fn test_object_key_round_trip() {
        let key = object_key(RegionId(7), b"alice");
        let (region, encoded) = decode_object_key(&key).unwrap();
        assert_eq!(region, RegionId(7));
        assert_eq!(encoded, b"alice");
        assert!(decode_object_key(b"x").is_err());
    }

    #[test]
    fn test_object_keys_order_by_region_then_key() {
        let a = object_key(RegionId(1), b"z");
        let b = object_key(RegionId(2), b"a");
        assert!(a < b);
    }

    #[test]
    fn test_index_key_fixed_value() {
        let key = index_key(RegionId(3), 2, &[0u8; 8], b"varkey", false);
        let (region, attr, value, user) = decode_index_key(&key, Some(8), None).unwrap();
        assert_eq!(region, RegionId(3));
        assert_eq!(attr, 2);
        assert_eq!(value, &[0u8; 8]);
        assert_eq!(user, b"varkey");
    }

    #[test]
    fn test_index_key_fixed_key() {
        let key = index_key(RegionId(3), 2, b"varvalue", &[1u8; 8], false);
        let (_, _, value, user) = decode_index_key(&key, None, Some(8)).unwrap();
        assert_eq!(value, b"varvalue");
        assert_eq!(user, &[1u8; 8]);
    }

    #[test]
    fn test_index_key_both_variable() {
        let key = index_key(RegionId(3), 2, b"value", b"key", true);
        let (_, _, value, user) = decode_index_key(&key, None, None).unwrap();
        assert_eq!(value, b"value");
        assert_eq!(user, b"key");
    }

    #[test]
    fn test_index_key_rejects_bad_length() {
        let mut key = index_key(RegionId(3), 2, b"v", b"k", true);
        let at = key.len() - 1;
        key[at] = 0xff;
        assert!(decode_index_key(&key, None, None).is_err());
    }

    #[test]
    fn test_transfer_key_round_trip_and_order() {
        let key = transfer_key(CaptureId(9), 4);
        assert_eq!(decode_transfer_key(&key).unwrap(), (CaptureId(9), 4));
        assert!(transfer_key(CaptureId(1), 5) < transfer_key(CaptureId(2), 0));
        assert!(transfer_key(CaptureId(1), 5) < transfer_key(CaptureId(1), 6));
    }

    #[test]
    fn test_acked_key_round_trip_and_inversion() {
        let key = acked_key(RegionId(7), RegionId(7), u64::MAX - 25);
        assert_eq!(
            decode_acked_key(&key).unwrap(),
            (RegionId(7), RegionId(7), u64::MAX - 25)
        );

        // larger seq ids sort first within (reg, region)
        let newer = acked_key(RegionId(7), RegionId(7), u64::MAX - 30);
        let older = acked_key(RegionId(7), RegionId(7), u64::MAX - 10);
        assert!(newer < older);
    }

    #[test]
    fn test_bump() {
        assert_eq!(bump(b"ab").unwrap(), b"ac");
        assert_eq!(bump(&[0x01, 0xff]).unwrap(), vec![0x02]);
        assert_eq!(bump(&[0xff, 0xff]), None);

        let prefix = region_prefix(RegionId(5));
        let upper = bump(&prefix).unwrap();
        assert!(object_key(RegionId(5), &[0xff; 16]) < upper);
        assert!(region_prefix(RegionId(6)) >= upper);
    }
}
