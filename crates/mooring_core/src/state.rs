//! Immutable snapshots of an object's server-known data.

use crate::class::validate_class_name;
use crate::error::{MooringError, MooringResult};
use crate::operation_set::OperationSet;
use chrono::{DateTime, Utc};
use mooring_codec::{decode_date, decode_json_with, encode_date, encode_json, ObjectDecoder, Value};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet};

/// Keys the REST layer reserves for object metadata.
pub const RESERVED_KEYS: [&str; 4] = ["objectId", "createdAt", "updatedAt", "className"];

/// An immutable snapshot of one object as the server last described it.
///
/// States are values: every change goes through an [`ObjectStateBuilder`]
/// and produces a new state.
///
/// A state is either *complete* (it holds every field the server would
/// return) or a projection restricted to `available_keys`, as produced by a
/// selected-keys query.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState {
    class_name: String,
    object_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    server_data: BTreeMap<String, Value>,
    is_complete: bool,
    available_keys: BTreeSet<String>,
}

impl ObjectState {
    /// Starts building a state for `class_name`.
    pub fn builder(class_name: impl Into<String>) -> ObjectStateBuilder {
        ObjectStateBuilder {
            class_name: class_name.into(),
            object_id: None,
            created_at: None,
            updated_at: None,
            server_data: BTreeMap::new(),
            is_complete: false,
            available_keys: BTreeSet::new(),
        }
    }

    /// Returns a builder seeded with a copy of this state.
    pub fn to_builder(&self) -> ObjectStateBuilder {
        ObjectStateBuilder {
            class_name: self.class_name.clone(),
            object_id: self.object_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            server_data: self.server_data.clone(),
            is_complete: self.is_complete,
            available_keys: self.available_keys.clone(),
        }
    }

    /// Class name of the object.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Server-assigned id, if any.
    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    /// Creation timestamp reported by the server.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Last update timestamp reported by the server.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Whether the state holds every field.
    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// Keys readable on an incomplete state.
    pub fn available_keys(&self) -> &BTreeSet<String> {
        &self.available_keys
    }

    /// All server fields, regardless of readability.
    pub fn server_data(&self) -> &BTreeMap<String, Value> {
        &self.server_data
    }

    /// Returns whether `key` may be read from this state.
    pub fn is_readable(&self, key: &str) -> bool {
        self.is_complete || self.available_keys.contains(key)
    }

    /// Reads a field.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] when the state is incomplete
    /// and `key` was not among the fetched keys.
    pub fn get(&self, key: &str) -> MooringResult<Option<&Value>> {
        if !self.is_readable(key) {
            return Err(MooringError::illegal_state(format!(
                "{} has no data for {key:?}; fetch it first.",
                self.class_name
            )));
        }
        Ok(self.server_data.get(key))
    }

    /// Field names present in the server data.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.server_data.keys()
    }

    /// Decodes a REST object (`objectId`, `createdAt`, `updatedAt` and
    /// fields) into a state.
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be decoded or the resulting state
    /// is invalid.
    pub fn decode(
        class_name: &str,
        json: &Map<String, Json>,
        objects: &dyn ObjectDecoder,
        is_complete: bool,
    ) -> MooringResult<ObjectState> {
        let mut builder = ObjectState::builder(class_name).is_complete(is_complete);
        for (key, value) in json {
            match key.as_str() {
                "__type" | "className" => {}
                "objectId" => {
                    builder = builder.object_id(value.as_str().map(str::to_string));
                }
                "createdAt" => builder = builder.created_at(decode_timestamp(value)?),
                "updatedAt" => builder = builder.updated_at(decode_timestamp(value)?),
                _ => {
                    let decoded = decode_json_with(value, objects)?;
                    builder = builder.put(key.clone(), decoded);
                }
            }
        }
        if !is_complete {
            let keys: Vec<String> = json
                .keys()
                .filter(|k| !RESERVED_KEYS.contains(&k.as_str()) && k.as_str() != "__type")
                .cloned()
                .collect();
            builder = builder.available_keys(keys);
        }
        builder.build()
    }

    /// Encodes metadata and fields to REST form.
    pub fn encode(&self) -> Map<String, Json> {
        let mut map: Map<String, Json> = self
            .server_data
            .iter()
            .map(|(k, v)| (k.clone(), encode_json(v)))
            .collect();
        map.insert("className".into(), Json::from(self.class_name.clone()));
        if let Some(id) = &self.object_id {
            map.insert("objectId".into(), Json::from(id.clone()));
        }
        if let Some(created) = &self.created_at {
            map.insert("createdAt".into(), Json::from(encode_date(created)));
        }
        if let Some(updated) = &self.updated_at {
            map.insert("updatedAt".into(), Json::from(encode_date(updated)));
        }
        map
    }
}

pub(crate) fn decode_timestamp(value: &Json) -> MooringResult<Option<DateTime<Utc>>> {
    match value {
        Json::Null => Ok(None),
        Json::String(iso) => Ok(Some(decode_date(iso)?)),
        Json::Object(map) => match map.get("iso").and_then(Json::as_str) {
            Some(iso) => Ok(Some(decode_date(iso)?)),
            None => Err(MooringError::illegal_argument("date object without iso")),
        },
        other => Err(MooringError::illegal_argument(format!(
            "timestamp must be a string, got {other}"
        ))),
    }
}

/// Builder for [`ObjectState`].
///
/// `build` copies the builder's data, so a built state never observes later
/// builder mutations.
#[derive(Debug, Clone)]
pub struct ObjectStateBuilder {
    class_name: String,
    object_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    server_data: BTreeMap<String, Value>,
    is_complete: bool,
    available_keys: BTreeSet<String>,
}

impl ObjectStateBuilder {
    /// Sets the server id.
    #[must_use]
    pub fn object_id(mut self, object_id: Option<String>) -> Self {
        self.object_id = object_id;
        self
    }

    /// Sets the creation timestamp.
    #[must_use]
    pub fn created_at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sets the update timestamp.
    #[must_use]
    pub fn updated_at(mut self, updated_at: Option<DateTime<Utc>>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Sets a field.
    #[must_use]
    pub fn put(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.server_data.insert(key.into(), value.into());
        self
    }

    /// Removes a field.
    #[must_use]
    pub fn remove(mut self, key: &str) -> Self {
        self.server_data.remove(key);
        self
    }

    /// Clears the id, timestamps, fields and readability information.
    #[must_use]
    pub fn clear(mut self) -> Self {
        self.object_id = None;
        self.created_at = None;
        self.updated_at = None;
        self.server_data.clear();
        self.is_complete = false;
        self.available_keys.clear();
        self
    }

    /// Marks the state complete or partial.
    #[must_use]
    pub fn is_complete(mut self, is_complete: bool) -> Self {
        self.is_complete = is_complete;
        self
    }

    /// Adds readable keys for a partial state.
    #[must_use]
    pub fn available_keys(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.available_keys.extend(keys);
        self
    }

    /// Returns the current value of a field in the builder.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.server_data.get(key)
    }

    /// Applies every operation in `operations` to the fields.
    ///
    /// # Errors
    ///
    /// Returns an error if an operation does not fit the current value.
    pub fn apply_operations(mut self, operations: &OperationSet) -> MooringResult<Self> {
        for (key, op) in operations.iter() {
            match op.apply(self.server_data.get(key), key)? {
                Some(value) => {
                    self.server_data.insert(key.clone(), value);
                }
                None => {
                    self.server_data.remove(key);
                }
            }
        }
        Ok(self)
    }

    /// Merges another state into this one. Metadata present in `other`
    /// wins, fields are overlaid, and completeness is the union of both.
    #[must_use]
    pub fn merge(mut self, other: &ObjectState) -> Self {
        if other.object_id.is_some() {
            self.object_id = other.object_id.clone();
        }
        if other.created_at.is_some() {
            self.created_at = other.created_at;
        }
        if other.updated_at.is_some() {
            self.updated_at = other.updated_at;
        }
        for (key, value) in &other.server_data {
            self.server_data.insert(key.clone(), value.clone());
        }
        self.is_complete = self.is_complete || other.is_complete;
        if self.is_complete {
            self.available_keys.clear();
        } else {
            self.available_keys
                .extend(other.available_keys.iter().cloned());
        }
        self
    }

    /// Validates and produces the state.
    ///
    /// # Errors
    ///
    /// - [`MooringError::IllegalArgument`] for an empty or invalid class name
    /// - [`MooringError::IllegalState`] for a complete state that also lists
    ///   available keys, or an update time before the creation time
    pub fn build(&self) -> MooringResult<ObjectState> {
        validate_class_name(&self.class_name)?;
        if self.is_complete && !self.available_keys.is_empty() {
            return Err(MooringError::illegal_state(
                "a complete state cannot restrict its available keys",
            ));
        }
        if let (Some(created), Some(updated)) = (self.created_at, self.updated_at) {
            if updated < created {
                return Err(MooringError::illegal_state(format!(
                    "updatedAt {} precedes createdAt {}",
                    encode_date(&updated),
                    encode_date(&created)
                )));
            }
        }
        Ok(ObjectState {
            class_name: self.class_name.clone(),
            object_id: self.object_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            server_data: self.server_data.clone(),
            is_complete: self.is_complete,
            available_keys: self.available_keys.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::operation::FieldOperation;
    use chrono::TimeZone;
    use mooring_codec::{Number, PointerDecoder};
    use serde_json::json;

    #[test]
    fn build_copies_builder_data() {
        let builder = ObjectState::builder("GameScore")
            .is_complete(true)
            .put("tags", Value::Array(vec!["a".into()]));
        let first = builder.build().unwrap();
        let second = builder.put("tags", Value::Array(vec![])).build().unwrap();

        assert_eq!(
            first.get("tags").unwrap(),
            Some(&Value::Array(vec!["a".into()]))
        );
        assert_eq!(second.get("tags").unwrap(), Some(&Value::Array(vec![])));
    }

    #[test]
    fn empty_class_name_is_illegal_argument() {
        let err = ObjectState::builder("").build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[test]
    fn complete_with_available_keys_is_illegal_state() {
        let err = ObjectState::builder("Item")
            .is_complete(true)
            .available_keys(["name".to_string()])
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn updated_before_created_is_illegal_state() {
        let created = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let updated = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let err = ObjectState::builder("Item")
            .created_at(Some(created))
            .updated_at(Some(updated))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn partial_state_guards_unfetched_keys() {
        let state = ObjectState::builder("Item")
            .put("name", "lamp")
            .available_keys(["name".to_string()])
            .build()
            .unwrap();
        assert_eq!(state.get("name").unwrap(), Some(&Value::from("lamp")));
        assert_eq!(
            state.get("price").unwrap_err().kind(),
            ErrorKind::IllegalState
        );
    }

    #[test]
    fn apply_operations_is_pure() {
        let original = ObjectState::builder("Item")
            .is_complete(true)
            .put("count", 1)
            .build()
            .unwrap();
        let mut ops = OperationSet::new();
        ops.apply("count", FieldOperation::Increment(Number::Int(2)))
            .unwrap();

        let updated = original
            .to_builder()
            .apply_operations(&ops)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(original.get("count").unwrap(), Some(&Value::Integer(1)));
        assert_eq!(updated.get("count").unwrap(), Some(&Value::Integer(3)));
    }

    #[test]
    fn merge_unions_completeness() {
        let partial = ObjectState::builder("Item")
            .object_id(Some("abc".into()))
            .put("name", "lamp")
            .available_keys(["name".to_string()])
            .build()
            .unwrap();
        let complete = ObjectState::builder("Item")
            .is_complete(true)
            .put("price", 3)
            .build()
            .unwrap();
        let merged = partial.to_builder().merge(&complete).build().unwrap();
        assert!(merged.is_complete());
        assert_eq!(merged.object_id(), Some("abc"));
        assert_eq!(merged.keys().count(), 2);
    }

    #[test]
    fn decode_rest_object() {
        let json = json!({
            "objectId": "xyz",
            "createdAt": "2024-01-01T00:00:00.000Z",
            "updatedAt": {"__type": "Date", "iso": "2024-01-02T00:00:00.000Z"},
            "score": 5
        });
        let state =
            ObjectState::decode("Item", json.as_object().unwrap(), &PointerDecoder, false).unwrap();
        assert_eq!(state.object_id(), Some("xyz"));
        assert!(state.updated_at() > state.created_at());
        assert!(state.is_readable("score"));
        assert!(!state.is_readable("other"));
        assert_eq!(state.encode()["score"], json!(5));
    }
}
