//! # Mooring Codec
//!
//! Value model and codecs for Mooring.
//!
//! This crate provides:
//! - [`Value`], the dynamic type held in object fields
//! - geo types ([`GeoPoint`], [`Polygon`]) with haversine distance
//! - the REST JSON encoding (`__type`-tagged special values)
//! - the CBOR encoding used for on-disk records
//!
//! ## Usage
//!
//! ```
//! use mooring_codec::{from_cbor, to_cbor, Pointer, Value};
//!
//! let value = Value::map([
//!     ("title", Value::from("hello")),
//!     ("author", Value::from(Pointer::new("_User", "u1"))),
//! ]);
//! let bytes = to_cbor(&value).unwrap();
//! assert_eq!(from_cbor(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod geo;
mod json;
mod value;

pub use cbor::{from_cbor, from_cbor_record, from_cbor_with, to_cbor, to_cbor_record};
pub use error::{CodecError, CodecResult};
pub use geo::{GeoPoint, Polygon, EARTH_MEAN_RADIUS_KM, EARTH_MEAN_RADIUS_MILE};
pub use json::{
    decode_date, decode_json, decode_json_with, encode_date, encode_json, encode_pointer,
    ObjectDecoder, PointerDecoder,
};
pub use value::{FileRef, Number, ObjectKey, Pointer, RelationRef, Value};
