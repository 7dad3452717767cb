//! Coalesced groups of field operations queued for one save.

use crate::error::{MooringError, MooringResult};
use crate::operation::FieldOperation;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use uuid::Uuid;

const UUID_KEY: &str = "__uuid";
const SAVE_EVENTUALLY_KEY: &str = "__isSaveEventually";

/// The field operations accumulated between two saves of one object.
///
/// At most one operation is kept per field; queuing a second operation on
/// the same field coalesces it with the first via
/// [`FieldOperation::merge_with_previous`].
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSet {
    uuid: Uuid,
    is_save_eventually: bool,
    ops: BTreeMap<String, FieldOperation>,
}

impl Default for OperationSet {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationSet {
    /// Creates an empty operation set with a fresh id.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            is_save_eventually: false,
            ops: BTreeMap::new(),
        }
    }

    /// Unique id of this set.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether this set belongs to a save-eventually entry.
    pub fn is_save_eventually(&self) -> bool {
        self.is_save_eventually
    }

    /// Marks this set as owned by a save-eventually entry.
    pub fn set_save_eventually(&mut self, value: bool) {
        self.is_save_eventually = value;
    }

    /// Returns the operation queued for `key`.
    pub fn get(&self, key: &str) -> Option<&FieldOperation> {
        self.ops.get(key)
    }

    /// Returns whether an operation is queued for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.ops.contains_key(key)
    }

    /// Iterates over queued operations in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldOperation)> {
        self.ops.iter()
    }

    /// Names of fields with queued operations.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.ops.keys()
    }

    /// Number of fields with queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns whether no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queues `op` on `key`, coalescing with any operation already queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the operations cannot be composed; the set is
    /// left unchanged.
    pub fn apply(&mut self, key: &str, op: FieldOperation) -> MooringResult<()> {
        let merged = match self.ops.get(key) {
            Some(previous) => op.merge_with_previous(previous)?,
            None => op,
        };
        self.ops.insert(key.to_string(), merged);
        Ok(())
    }

    /// Drops the operation queued for `key`.
    pub fn remove(&mut self, key: &str) -> Option<FieldOperation> {
        self.ops.remove(key)
    }

    /// Drops every queued operation.
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Folds an older set into this one. Operations in `self` are newer and
    /// are merged on top of the older ones.
    ///
    /// # Errors
    ///
    /// Returns an error if any pair of operations cannot be composed; the
    /// set is left unchanged.
    pub fn merge_from(&mut self, older: &OperationSet) -> MooringResult<()> {
        let mut merged = self.ops.clone();
        for (key, old_op) in &older.ops {
            let combined = match self.ops.get(key) {
                Some(newer) => newer.merge_with_previous(old_op)?,
                None => old_op.clone(),
            };
            merged.insert(key.clone(), combined);
        }
        self.ops = merged;
        Ok(())
    }

    /// Encodes the operations as a REST request body.
    pub fn encode_ops(&self) -> Map<String, Json> {
        self.ops
            .iter()
            .map(|(key, op)| (key.clone(), op.encode()))
            .collect()
    }

    /// Encodes the set, including its id and flags, for local persistence.
    pub fn encode(&self) -> Json {
        let mut map = self.encode_ops();
        map.insert(UUID_KEY.into(), Json::from(self.uuid.to_string()));
        map.insert(SAVE_EVENTUALLY_KEY.into(), Json::Bool(self.is_save_eventually));
        Json::Object(map)
    }

    /// Decodes a set produced by [`OperationSet::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is not an object or holds malformed
    /// operations.
    pub fn decode(json: &Json) -> MooringResult<OperationSet> {
        let map = json
            .as_object()
            .ok_or_else(|| MooringError::illegal_argument("operation set must be an object"))?;
        let uuid = match map.get(UUID_KEY).and_then(Json::as_str) {
            Some(text) => Uuid::parse_str(text)
                .map_err(|e| MooringError::illegal_argument(format!("bad operation set id: {e}")))?,
            None => Uuid::new_v4(),
        };
        let is_save_eventually = map
            .get(SAVE_EVENTUALLY_KEY)
            .and_then(Json::as_bool)
            .unwrap_or(false);
        let ops = map
            .iter()
            .filter(|(key, _)| key.as_str() != UUID_KEY && key.as_str() != SAVE_EVENTUALLY_KEY)
            .map(|(key, op)| Ok((key.clone(), FieldOperation::decode(op)?)))
            .collect::<MooringResult<_>>()?;
        Ok(OperationSet {
            uuid,
            is_save_eventually,
            ops,
        })
    }
}
