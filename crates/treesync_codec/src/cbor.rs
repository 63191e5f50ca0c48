//! CBOR encoding for cache snapshots.
//!
//! Snapshots are a local convenience: a binary dump of the mirrored tree
//! that can be reloaded before the first handshake. The wire protocol
//! itself is JSON.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use ciborium::value::Value as CborValue;

/// Encodes a value to CBOR bytes.
///
/// # Errors
///
/// Returns an error if the underlying writer fails.
pub fn to_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let item = to_item(value);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&item, &mut out)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR, or contain items the
/// value tree has no representation for (byte strings, non-text map keys).
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let item: CborValue = ciborium::de::from_reader(bytes)
        .map_err(|e| CodecError::decoding_failed(e.to_string()))?;
    from_item(item)
}

fn to_item(value: &Value) -> CborValue {
    match value {
        Value::Null => CborValue::Null,
        Value::Bool(b) => CborValue::Bool(*b),
        Value::Number(n) => CborValue::Float(*n),
        Value::String(s) => CborValue::Text(s.clone()),
        Value::Array(items) => CborValue::Array(items.iter().map(to_item).collect()),
        Value::Object(pairs) => CborValue::Map(
            pairs
                .iter()
                .map(|(k, v)| (CborValue::Text(k.clone()), to_item(v)))
                .collect(),
        ),
    }
}

#[allow(clippy::cast_precision_loss)]
fn from_item(item: CborValue) -> CodecResult<Value> {
    match item {
        CborValue::Null => Ok(Value::Null),
        CborValue::Bool(b) => Ok(Value::Bool(b)),
        CborValue::Float(f) => Ok(Value::Number(f)),
        CborValue::Integer(i) => Ok(Value::Number(i128::from(i) as f64)),
        CborValue::Text(s) => Ok(Value::String(s)),
        CborValue::Tag(_, inner) => from_item(*inner),
        CborValue::Array(items) => items
            .into_iter()
            .map(from_item)
            .collect::<CodecResult<Vec<_>>>()
            .map(Value::Array),
        CborValue::Map(pairs) => {
            let mut out = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                let CborValue::Text(key) = k else {
                    return Err(CodecError::invalid_structure("map key must be text"));
                };
                out.push((key, from_item(v)?));
            }
            Ok(Value::Object(out))
        }
        CborValue::Bytes(_) => Err(CodecError::unsupported_type("bytes")),
        _ => Err(CodecError::unsupported_type("unknown CBOR item")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_tree_survives_snapshot_encoding() {
        let value = Value::object([
            ("users", Value::Array(vec![Value::from("ada"), Value::from(1.25)])),
            ("flag", Value::Bool(false)),
        ]);
        let bytes = to_cbor(&value).unwrap();
        assert_eq!(from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn integer_items_decode_as_numbers() {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&CborValue::Integer(7.into()), &mut bytes).unwrap();
        assert_eq!(from_cbor(&bytes).unwrap(), Value::Number(7.0));
    }

    #[test]
    fn byte_strings_are_rejected() {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&CborValue::Bytes(vec![1, 2]), &mut bytes).unwrap();
        assert!(matches!(
            from_cbor(&bytes),
            Err(CodecError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(from_cbor(&[0xa1]).is_err());
    }
}
