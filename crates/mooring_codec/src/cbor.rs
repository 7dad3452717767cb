//! CBOR encoding used for on-disk records.
//!
//! Values are first mapped to their REST JSON form so that a record read
//! back from disk decodes exactly like a server response.

use crate::error::{CodecError, CodecResult};
use crate::json::{decode_json_with, encode_json, ObjectDecoder, PointerDecoder};
use crate::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value to CBOR bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    to_cbor_record(&encode_json(value))
}

/// Decode a value from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR or the decoded
/// structure is not a valid value.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    from_cbor_with(bytes, &PointerDecoder)
}

/// Decode a value from CBOR bytes, routing embedded objects to `objects`.
///
/// # Errors
///
/// See [`from_cbor`].
pub fn from_cbor_with(bytes: &[u8], objects: &dyn ObjectDecoder) -> CodecResult<Value> {
    let json: serde_json::Value = from_cbor_record(bytes)?;
    decode_json_with(&json, objects)
}

/// Encode any serde record to CBOR bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_cbor_record<T: Serialize + ?Sized>(record: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::into_writer(record, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Decode any serde record from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes do not decode into `T`.
pub fn from_cbor_record<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use crate::value::Pointer;
    use serde::Deserialize;

    #[test]
    fn value_survives_cbor() {
        let value = Value::map([
            ("count", Value::from(3)),
            ("ratio", Value::from(0.25)),
            ("where", Value::from(GeoPoint::new(10.0, 20.0).unwrap())),
            ("owner", Value::from(Pointer::local("_User", "local_abc"))),
            ("blob", Value::bytes(vec![0, 1, 2])),
        ]);
        let bytes = to_cbor(&value).unwrap();
        assert_eq!(from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            from_cbor(&[0xff, 0x00, 0x13]),
            Err(CodecError::DecodingFailed { .. })
        ));
    }

    #[test]
    fn serde_records() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Entry {
            retain_count: u32,
            object_id: Option<String>,
        }

        let entry = Entry {
            retain_count: 2,
            object_id: Some("abc".into()),
        };
        let bytes = to_cbor_record(&entry).unwrap();
        assert_eq!(from_cbor_record::<Entry>(&bytes).unwrap(), entry);
    }
}
