//! Per-type index codecs: order-preserving byte transforms between an
//! attribute's payload form and the form stored inside index keys, plus the
//! iterator factories the search planner asks for.
//!
//! Dispatch is a flat trait object per attribute type. Only the primitive
//! types are indexable; containers participate in search through equality
//! and membership post-filters and have no codec.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::iter::{AttrRange, AttributeCheck, DataIterator, IndexRangeIter, ObjectRangeIter};
use crate::schema::{AttrType, RegionId};
use crate::store::Snapshot;

/// One codec per indexable attribute type. `encode` maps a payload to bytes
/// whose byte-wise order matches the type's logical order; `decode` inverts
/// it.
pub trait IndexCodec: Send + Sync {
    /// Size of the encoded form. For fixed-size codecs the input is ignored.
    fn encoded_size(&self, value: &[u8]) -> usize;

    /// Payload form to order-preserving index form.
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>>;

    /// Size of the decoded payload.
    fn decoded_size(&self, encoded: &[u8]) -> usize;

    /// Index form back to payload form.
    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>>;

    /// Whether the encoded form has a fixed size.
    fn encoding_fixed(&self) -> bool;

    /// An iterator over the index entries selected by a range of this type.
    /// Attribute 0 ranges walk the object namespace itself.
    fn iterator_from_range(
        &'static self,
        snap: Arc<Snapshot>,
        region: RegionId,
        range: &AttrRange,
        key_codec: &'static dyn IndexCodec,
    ) -> Result<Box<dyn DataIterator>>;

    /// An iterator for a non-range check, when the type supports one.
    fn iterator_from_check(
        &'static self,
        snap: Arc<Snapshot>,
        region: RegionId,
        check: &AttributeCheck,
        key_codec: &'static dyn IndexCodec,
    ) -> Result<Option<Box<dyn DataIterator>>>;
}

/// The fixed encoded size of a codec, None when variable-length.
pub fn fixed_len(codec: &dyn IndexCodec) -> Option<usize> {
    codec.encoding_fixed().then(|| codec.encoded_size(&[]))
}

/// Compares two payloads of the codec's type in logical order.
pub fn compare(codec: &dyn IndexCodec, a: &[u8], b: &[u8]) -> Result<Ordering> {
    Ok(codec.encode(a)?.cmp(&codec.encode(b)?))
}

/// The codec for an attribute type; None for containers.
pub fn codec_for(ty: &AttrType) -> Option<&'static dyn IndexCodec> {
    static INT: Int64Codec = Int64Codec;
    static FLOAT: FloatCodec = FloatCodec;
    static STRING: StringCodec = StringCodec;

    match ty {
        AttrType::Int => Some(&INT),
        AttrType::Float => Some(&FLOAT),
        AttrType::Str => Some(&STRING),
        AttrType::List(_) | AttrType::Set(_) | AttrType::Map(_, _) => None,
    }
}

fn range_iterator(
    val_codec: &'static dyn IndexCodec,
    snap: Arc<Snapshot>,
    region: RegionId,
    range: &AttrRange,
    key_codec: &'static dyn IndexCodec,
) -> Result<Box<dyn DataIterator>> {
    let start = range
        .start
        .as_deref()
        .map(|v| val_codec.encode(v))
        .transpose()?;
    let end = range
        .end
        .as_deref()
        .map(|v| val_codec.encode(v))
        .transpose()?;

    if range.attr == 0 {
        Ok(Box::new(ObjectRangeIter::new(
            snap, region, start, end, key_codec,
        )))
    } else {
        Ok(Box::new(IndexRangeIter::new(
            snap, region, range.attr, start, end, val_codec, key_codec,
        )))
    }
}

/// Signed 64-bit integers: little-endian payload, sign-flipped big-endian
/// index form so negative values sort first.
pub struct Int64Codec;

impl IndexCodec for Int64Codec {
    fn encoded_size(&self, _value: &[u8]) -> usize {
        8
    }

    fn encode(&self, value: &[u8]) -> Result<Vec<u8>> {
        if value.len() != 8 {
            return Err(Error::BadEncoding(format!(
                "int payload is {} bytes, expected 8",
                value.len()
            )));
        }

        let unsigned = (LittleEndian::read_i64(value) as u64) ^ (1u64 << 63);
        let mut out = [0u8; 8];
        BigEndian::write_u64(&mut out, unsigned);
        Ok(out.to_vec())
    }

    fn decoded_size(&self, _encoded: &[u8]) -> usize {
        8
    }

    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        if encoded.len() != 8 {
            return Err(Error::BadEncoding(format!(
                "encoded int is {} bytes, expected 8",
                encoded.len()
            )));
        }

        let signed = (BigEndian::read_u64(encoded) ^ (1u64 << 63)) as i64;
        let mut out = [0u8; 8];
        LittleEndian::write_i64(&mut out, signed);
        Ok(out.to_vec())
    }

    fn encoding_fixed(&self) -> bool {
        true
    }

    fn iterator_from_range(
        &'static self,
        snap: Arc<Snapshot>,
        region: RegionId,
        range: &AttrRange,
        key_codec: &'static dyn IndexCodec,
    ) -> Result<Box<dyn DataIterator>> {
        range_iterator(self, snap, region, range, key_codec)
    }

    fn iterator_from_check(
        &'static self,
        _snap: Arc<Snapshot>,
        _region: RegionId,
        _check: &AttributeCheck,
        _key_codec: &'static dyn IndexCodec,
    ) -> Result<Option<Box<dyn DataIterator>>> {
        Ok(None)
    }
}

/// 64-bit floats: little-endian payload; the index form flips all bits of
/// negatives and the sign bit of positives, which orders IEEE-754 values
/// byte-wise.
pub struct FloatCodec;

impl IndexCodec for FloatCodec {
    fn encoded_size(&self, _value: &[u8]) -> usize {
        8
    }

    fn encode(&self, value: &[u8]) -> Result<Vec<u8>> {
        if value.len() != 8 {
            return Err(Error::BadEncoding(format!(
                "float payload is {} bytes, expected 8",
                value.len()
            )));
        }

        let bits = LittleEndian::read_f64(value).to_bits();
        let ordered = if bits & (1u64 << 63) != 0 {
            !bits
        } else {
            bits | (1u64 << 63)
        };
        let mut out = [0u8; 8];
        BigEndian::write_u64(&mut out, ordered);
        Ok(out.to_vec())
    }

    fn decoded_size(&self, _encoded: &[u8]) -> usize {
        8
    }

    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        if encoded.len() != 8 {
            return Err(Error::BadEncoding(format!(
                "encoded float is {} bytes, expected 8",
                encoded.len()
            )));
        }

        let ordered = BigEndian::read_u64(encoded);
        let bits = if ordered & (1u64 << 63) != 0 {
            ordered & !(1u64 << 63)
        } else {
            !ordered
        };
        let mut out = [0u8; 8];
        LittleEndian::write_f64(&mut out, f64::from_bits(bits));
        Ok(out.to_vec())
    }

    fn encoding_fixed(&self) -> bool {
        true
    }

    fn iterator_from_range(
        &'static self,
        snap: Arc<Snapshot>,
        region: RegionId,
        range: &AttrRange,
        key_codec: &'static dyn IndexCodec,
    ) -> Result<Box<dyn DataIterator>> {
        range_iterator(self, snap, region, range, key_codec)
    }

    fn iterator_from_check(
        &'static self,
        _snap: Arc<Snapshot>,
        _region: RegionId,
        _check: &AttributeCheck,
        _key_codec: &'static dyn IndexCodec,
    ) -> Result<Option<Box<dyn DataIterator>>> {
        Ok(None)
    }
}

/// Strings: raw bytes, already byte-wise comparable. Variable length.
pub struct StringCodec;

impl IndexCodec for StringCodec {
    fn encoded_size(&self, value: &[u8]) -> usize {
        value.len()
    }

    fn encode(&self, value: &[u8]) -> Result<Vec<u8>> {
        Ok(value.to_vec())
    }

    fn decoded_size(&self, encoded: &[u8]) -> usize {
        encoded.len()
    }

    fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        Ok(encoded.to_vec())
    }

    fn encoding_fixed(&self) -> bool {
        false
    }

    fn iterator_from_range(
        &'static self,
        snap: Arc<Snapshot>,
        region: RegionId,
        range: &AttrRange,
        key_codec: &'static dyn IndexCodec,
    ) -> Result<Box<dyn DataIterator>> {
        range_iterator(self, snap, region, range, key_codec)
    }

    fn iterator_from_check(
        &'static self,
        _snap: Arc<Snapshot>,
        _region: RegionId,
        _check: &AttributeCheck,
        _key_codec: &'static dyn IndexCodec,
    ) -> Result<Option<Box<dyn DataIterator>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{float_payload, int_payload};

    #[test]
    fn test_int_round_trip() {
        let codec = codec_for(&AttrType::Int).unwrap();
        for v in [i64::MIN, -100, -1, 0, 1, 42, i64::MAX] {
            let payload = int_payload(v);
            let encoded = codec.encode(&payload).unwrap();
            assert_eq!(encoded.len(), codec.encoded_size(&payload));
            assert_eq!(codec.decode(&encoded).unwrap(), payload);
        }
    }

    #[test]
    fn test_int_order_preserved() {
        let codec = codec_for(&AttrType::Int).unwrap();
        let values = [i64::MIN, -100, -1, 0, 1, 100, i64::MAX];
        let encoded: Vec<_> = values
            .iter()
            .map(|v| codec.encode(&int_payload(*v)).unwrap())
            .collect();

        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_int_rejects_bad_width() {
        let codec = codec_for(&AttrType::Int).unwrap();
        assert!(codec.encode(b"short").is_err());
        assert!(codec.decode(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_float_round_trip_and_order() {
        let codec = codec_for(&AttrType::Float).unwrap();
        let values = [f64::NEG_INFINITY, -100.5, -1.0, -0.0, 0.0, 1.0, 100.5, f64::INFINITY];
        let encoded: Vec<_> = values
            .iter()
            .map(|v| codec.encode(&float_payload(*v)).unwrap())
            .collect();

        for (v, e) in values.iter().zip(encoded.iter()) {
            let back = codec.decode(e).unwrap();
            assert_eq!(f64::from_le_bytes(back.try_into().unwrap()), *v);
        }

        // -0.0 and 0.0 encode adjacently; everything else strictly ordered
        for pair in encoded.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(encoded[1] < encoded[6]);
    }

    #[test]
    fn test_string_is_identity() {
        let codec = codec_for(&AttrType::Str).unwrap();
        let encoded = codec.encode(b"apple").unwrap();
        assert_eq!(encoded, b"apple");
        assert_eq!(codec.decode(&encoded).unwrap(), b"apple");
        assert!(!codec.encoding_fixed());
    }

    #[test]
    fn test_containers_have_no_codec() {
        assert!(codec_for(&AttrType::List(Box::new(AttrType::Int))).is_none());
        assert!(codec_for(&AttrType::Set(Box::new(AttrType::Str))).is_none());
        assert!(codec_for(&AttrType::Map(
            Box::new(AttrType::Str),
            Box::new(AttrType::Int)
        ))
        .is_none());
    }

    #[test]
    fn test_typed_compare() {
        let codec = codec_for(&AttrType::Int).unwrap();
        let a = int_payload(-5);
        let b = int_payload(3);
        assert_eq!(compare(codec, &a, &b).unwrap(), std::cmp::Ordering::Less);
        assert_eq!(compare(codec, &b, &a).unwrap(), std::cmp::Ordering::Greater);
        assert_eq!(compare(codec, &a, &a).unwrap(), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_fixed_len() {
        assert_eq!(fixed_len(codec_for(&AttrType::Int).unwrap()), Some(8));
        assert_eq!(fixed_len(codec_for(&AttrType::Str).unwrap()), None);
    }
}
