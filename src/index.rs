//! Secondary-index maintenance: building index entry keys and applying the
//! per-attribute delta between an object's old and new values inside the
//! enclosing write transaction.

use redb::Table;

use crate::codec::{codec_for, IndexCodec};
use crate::error::Result;
use crate::keyspace;
use crate::schema::{RegionId, Schema, Subspace};

/// Builds the index entry key for one attribute value of an object.
pub fn index_entry(
    region: RegionId,
    attr: u16,
    val_codec: &dyn IndexCodec,
    key_codec: &dyn IndexCodec,
    encoded_key: &[u8],
    value: &[u8],
) -> Result<Vec<u8>> {
    let encoded_value = val_codec.encode(value)?;
    let both_variable = !val_codec.encoding_fixed() && !key_codec.encoding_fixed();
    Ok(keyspace::index_key(
        region,
        attr,
        &encoded_value,
        encoded_key,
        both_variable,
    ))
}

/// Applies the index delta for one object mutation: for each indexed
/// attribute whose value changed, remove the entry for the old value and
/// insert the entry for the new one. Unchanged attributes produce no
/// writes. Index entries store no value.
pub fn index_changes(
    table: &mut Table<&'static [u8], &'static [u8]>,
    schema: &Schema,
    subspace: &Subspace,
    region: RegionId,
    key_codec: &'static dyn IndexCodec,
    encoded_key: &[u8],
    old_value: Option<&[Vec<u8>]>,
    new_value: Option<&[Vec<u8>]>,
) -> Result<()> {
    for attr in 1..schema.arity() as u16 {
        if !subspace.indexed(attr) {
            continue;
        }

        let Some(val_codec) = codec_for(&schema.attrs[attr as usize].ty) else {
            continue;
        };

        let old = old_value.map(|v| &v[attr as usize - 1]);
        let new = new_value.map(|v| &v[attr as usize - 1]);

        if let (Some(old), Some(new)) = (old, new) {
            if old == new {
                continue;
            }
        }

        if let Some(old) = old {
            let entry = index_entry(region, attr, val_codec, key_codec, encoded_key, old)?;
            table.remove(entry.as_slice())?;
        }

        if let Some(new) = new {
            let entry = index_entry(region, attr, val_codec, key_codec, encoded_key, new)?;
            table.insert(entry.as_slice(), &b""[..])?;
        }
    }

    Ok(())
}
