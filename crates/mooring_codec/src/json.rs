//! REST JSON encoding of [`Value`].
//!
//! Special types are encoded as JSON objects tagged with `__type`:
//!
//! | value | encoding |
//! |---|---|
//! | pointer | `{"__type":"Pointer","className":…,"objectId":…}` or `"localId"` |
//! | date | `{"__type":"Date","iso":"2024-01-01T00:00:00.000Z"}` |
//! | bytes | `{"__type":"Bytes","base64":…}` |
//! | geo point | `{"__type":"GeoPoint","latitude":…,"longitude":…}` |
//! | polygon | `{"__type":"Polygon","coordinates":[[lat,lng],…]}` |
//! | file | `{"__type":"File","name":…,"url":…}` |
//! | relation | `{"__type":"Relation","className":…}` |
//!
//! Full objects embedded in responses (`"__type":"Object"`) are handed to an
//! [`ObjectDecoder`] so the caller can merge their data into live objects.

use crate::error::{CodecError, CodecResult};
use crate::geo::{GeoPoint, Polygon};
use crate::value::{FileRef, ObjectKey, Pointer, RelationRef, Value};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number as JsonNumber, Value as Json};

/// Hook for decoding embedded full objects.
pub trait ObjectDecoder {
    /// Decodes `{"__type":"Object", …}` into a pointer, optionally merging
    /// its fields into a live object.
    fn decode_object(&self, class_name: &str, json: &Map<String, Json>) -> CodecResult<Pointer>;
}

/// Decoder that reduces embedded objects to plain pointers.
#[derive(Debug, Default, Clone, Copy)]
pub struct PointerDecoder;

impl ObjectDecoder for PointerDecoder {
    fn decode_object(&self, class_name: &str, json: &Map<String, Json>) -> CodecResult<Pointer> {
        pointer_from_json(class_name, json)
    }
}

/// Formats a date the way the REST API expects.
pub fn encode_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an ISO-8601 date string.
///
/// # Errors
///
/// Returns a decoding error if the string is not a valid RFC 3339 date.
pub fn decode_date(iso: &str) -> CodecResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CodecError::decoding_failed(format!("invalid date {iso:?}: {e}")))
}

/// Encodes a pointer to its REST form.
pub fn encode_pointer(pointer: &Pointer) -> Json {
    let mut map = Map::new();
    map.insert("__type".into(), Json::from("Pointer"));
    map.insert("className".into(), Json::from(pointer.class_name.clone()));
    match &pointer.key {
        ObjectKey::ObjectId(id) => map.insert("objectId".into(), Json::from(id.clone())),
        ObjectKey::LocalId(id) => map.insert("localId".into(), Json::from(id.clone())),
    };
    Json::Object(map)
}

/// Encodes a value to its REST JSON form.
pub fn encode_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(n) => Json::from(*n),
        Value::Float(f) => JsonNumber::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::Text(s) => Json::from(s.clone()),
        Value::Bytes(b) => tagged("Bytes", [("base64", Json::from(BASE64.encode(b)))]),
        Value::Date(d) => tagged("Date", [("iso", Json::from(encode_date(d)))]),
        Value::Array(items) => Json::Array(items.iter().map(encode_json).collect()),
        Value::Map(map) => Json::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), encode_json(v)))
                .collect(),
        ),
        Value::Pointer(p) => encode_pointer(p),
        Value::GeoPoint(p) => tagged(
            "GeoPoint",
            [
                ("latitude", encode_f64(p.latitude())),
                ("longitude", encode_f64(p.longitude())),
            ],
        ),
        Value::Polygon(poly) => {
            let coordinates = poly
                .coordinates()
                .iter()
                .map(|p| Json::Array(vec![encode_f64(p.latitude()), encode_f64(p.longitude())]))
                .collect();
            tagged("Polygon", [("coordinates", Json::Array(coordinates))])
        }
        Value::File(file) => {
            let url = file.url.clone().map_or(Json::Null, Json::from);
            tagged("File", [("name", Json::from(file.name.clone())), ("url", url)])
        }
        Value::Relation(rel) => {
            let class = rel.target_class.clone().map_or(Json::Null, Json::from);
            let known = rel.known.iter().map(encode_pointer).collect();
            tagged("Relation", [("className", class), ("objects", Json::Array(known))])
        }
    }
}

/// Decodes a REST JSON value, reducing embedded objects to pointers.
///
/// # Errors
///
/// Returns an error for unknown `__type` tags or malformed tagged objects.
pub fn decode_json(json: &Json) -> CodecResult<Value> {
    decode_json_with(json, &PointerDecoder)
}

/// Decodes a REST JSON value using `objects` for embedded full objects.
///
/// # Errors
///
/// Returns an error for unknown `__type` tags or malformed tagged objects.
pub fn decode_json_with(json: &Json, objects: &dyn ObjectDecoder) -> CodecResult<Value> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => Ok(match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        }),
        Json::String(s) => Ok(Value::Text(s.clone())),
        Json::Array(items) => items
            .iter()
            .map(|item| decode_json_with(item, objects))
            .collect::<CodecResult<Vec<_>>>()
            .map(Value::Array),
        Json::Object(map) => match map.get("__type").and_then(Json::as_str) {
            Some(type_name) => decode_tagged(type_name, map, objects),
            None => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), decode_json_with(v, objects)?)))
                .collect::<CodecResult<_>>()
                .map(Value::Map),
        },
    }
}

fn decode_tagged(
    type_name: &str,
    map: &Map<String, Json>,
    objects: &dyn ObjectDecoder,
) -> CodecResult<Value> {
    match type_name {
        "Pointer" => {
            let class_name = required_str(map, "className")?;
            pointer_from_json(class_name, map).map(Value::Pointer)
        }
        "Object" => {
            let class_name = required_str(map, "className")?;
            objects.decode_object(class_name, map).map(Value::Pointer)
        }
        "Date" => decode_date(required_str(map, "iso")?).map(Value::Date),
        "Bytes" => BASE64
            .decode(required_str(map, "base64")?)
            .map(Value::Bytes)
            .map_err(|e| CodecError::decoding_failed(format!("invalid base64: {e}"))),
        "GeoPoint" => {
            let latitude = required_f64(map, "latitude")?;
            let longitude = required_f64(map, "longitude")?;
            GeoPoint::new(latitude, longitude).map(Value::GeoPoint)
        }
        "Polygon" => {
            let coordinates = map
                .get("coordinates")
                .and_then(Json::as_array)
                .ok_or_else(|| CodecError::invalid_structure("Polygon requires coordinates"))?;
            let points = coordinates
                .iter()
                .map(|pair| {
                    let pair = pair.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                        CodecError::invalid_structure("polygon coordinate must be [lat, lng]")
                    })?;
                    let lat = pair[0].as_f64();
                    let lng = pair[1].as_f64();
                    match (lat, lng) {
                        (Some(lat), Some(lng)) => GeoPoint::new(lat, lng),
                        _ => Err(CodecError::invalid_structure(
                            "polygon coordinate must be numeric",
                        )),
                    }
                })
                .collect::<CodecResult<Vec<_>>>()?;
            Polygon::new(points).map(Value::Polygon)
        }
        "File" => Ok(Value::File(FileRef {
            name: required_str(map, "name")?.to_string(),
            url: map.get("url").and_then(Json::as_str).map(str::to_string),
        })),
        "Relation" => {
            let known = match map.get("objects").and_then(Json::as_array) {
                Some(items) => items
                    .iter()
                    .map(|item| match decode_json_with(item, objects)? {
                        Value::Pointer(p) => Ok(p),
                        other => Err(CodecError::invalid_structure(format!(
                            "relation member must be a pointer, got {}",
                            other.type_name()
                        ))),
                    })
                    .collect::<CodecResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            Ok(Value::Relation(RelationRef {
                target_class: map
                    .get("className")
                    .and_then(Json::as_str)
                    .map(str::to_string),
                known,
            }))
        }
        other => Err(CodecError::unsupported_type(other)),
    }
}

/// Builds a pointer from a JSON object carrying `objectId` or `localId`.
fn pointer_from_json(class_name: &str, map: &Map<String, Json>) -> CodecResult<Pointer> {
    if let Some(id) = map.get("objectId").and_then(Json::as_str) {
        return Ok(Pointer::new(class_name, id));
    }
    if let Some(id) = map.get("localId").and_then(Json::as_str) {
        return Ok(Pointer::local(class_name, id));
    }
    Err(CodecError::invalid_structure(
        "pointer requires objectId or localId",
    ))
}

fn tagged<const N: usize>(type_name: &str, fields: [(&str, Json); N]) -> Json {
    let mut map = Map::new();
    map.insert("__type".into(), Json::from(type_name));
    for (k, v) in fields {
        map.insert(k.to_string(), v);
    }
    Json::Object(map)
}

fn encode_f64(f: f64) -> Json {
    JsonNumber::from_f64(f).map_or(Json::Null, Json::Number)
}

fn required_str<'a>(map: &'a Map<String, Json>, key: &str) -> CodecResult<&'a str> {
    map.get(key)
        .and_then(Json::as_str)
        .ok_or_else(|| CodecError::invalid_structure(format!("missing string field {key:?}")))
}

fn required_f64(map: &Map<String, Json>, key: &str) -> CodecResult<f64> {
    map.get(key)
        .and_then(Json::as_f64)
        .ok_or_else(|| CodecError::invalid_structure(format!("missing numeric field {key:?}")))
}
