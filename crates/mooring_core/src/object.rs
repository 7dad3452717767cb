//! The live, mutable handle for one synchronizable object.
//!
//! A [`SyncObject`] layers queued [`OperationSet`]s on top of the immutable
//! [`ObjectState`] the server last reported:
//!
//! ```text
//! estimated = server data
//!           + queued sets (dispatch order)
//!           + current set (not yet dispatched)
//! ```
//!
//! Every save takes the current set, stamps it with a monotonically
//! increasing dispatch sequence and queues it. Responses may arrive in any
//! order; a confirmed save with sequence `s` never overwrites a field that a
//! save with a higher sequence already confirmed.

use crate::acl::{Acl, ACL_KEY};
use crate::class::ClassKind;
use crate::error::{MooringError, MooringResult};
use crate::operation::FieldOperation;
use crate::operation_set::OperationSet;
use crate::relation::Relation;
use crate::state::{decode_timestamp, ObjectState};
use chrono::{DateTime, Utc};
use mooring_codec::{
    decode_json_with, encode_date, encode_json, ObjectDecoder, ObjectKey, Pointer, Value,
};
use parking_lot::Mutex;
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// A save taken from an object, ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSave {
    /// Dispatch sequence; pass it back to [`SyncObject::handle_save_result`].
    pub seq: u64,
    /// The operations being saved.
    pub operations: OperationSet,
    /// Server id at dispatch time (`None` for a create).
    pub object_id: Option<String>,
    /// Local id at dispatch time, if assigned.
    pub local_id: Option<String>,
}

#[derive(Debug, Clone)]
struct QueuedOperations {
    /// `None` for sets restored from disk that have not been dispatched in
    /// this session.
    seq: Option<u64>,
    ops: OperationSet,
}

#[derive(Debug)]
struct ObjectInner {
    state: ObjectState,
    queue: VecDeque<QueuedOperations>,
    current: OperationSet,
    next_seq: u64,
    field_versions: HashMap<String, u64>,
    settled: HashSet<Uuid>,
    estimated: BTreeMap<String, Value>,
    local_id: Option<String>,
    deleting_eventually: u32,
    is_deleted: bool,
}

impl ObjectInner {
    /// Whether a save dispatched after `seq` already overwrote `key`.
    fn confirmed_later(&self, key: &str, seq: u64) -> bool {
        self.field_versions.get(key).is_some_and(|v| *v > seq)
    }

    fn rebuild_estimated(&mut self) {
        let mut data = self.state.server_data().clone();
        let layers = self
            .queue
            .iter()
            .map(|q| (q.seq, &q.ops))
            .chain(std::iter::once((None, &self.current)));
        for (seq, ops) in layers {
            for (key, op) in ops.iter() {
                if seq.is_some_and(|s| self.confirmed_later(key, s)) {
                    continue;
                }
                match op.apply(data.get(key), key) {
                    Ok(Some(value)) => {
                        data.insert(key.clone(), value);
                    }
                    Ok(None) => {
                        data.remove(key);
                    }
                    Err(e) => tracing::trace!(key = %key, error = %e, "skipping stale operation"),
                }
            }
        }
        self.estimated = data;
    }

    fn is_available(&self, key: &str) -> bool {
        self.state.is_readable(key) || self.estimated.contains_key(key)
    }

    fn knows_set(&self, uuid: Uuid) -> bool {
        self.current.uuid() == uuid
            || self.settled.contains(&uuid)
            || self.queue.iter().any(|q| q.ops.uuid() == uuid)
    }

    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// A live object. One `Arc<SyncObject>` exists per identity per session,
/// enforced by the [`crate::ObjectRegistry`].
pub struct SyncObject {
    this: Weak<SyncObject>,
    class_name: String,
    kind: ClassKind,
    inner: Mutex<ObjectInner>,
}

impl std::fmt::Debug for SyncObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SyncObject")
            .field("class_name", &self.class_name)
            .field("object_id", &inner.state.object_id())
            .field("local_id", &inner.local_id)
            .finish_non_exhaustive()
    }
}

impl SyncObject {
    /// Creates a new, unsaved object.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] for an invalid class name.
    pub fn new(class_name: &str) -> MooringResult<Arc<Self>> {
        let state = ObjectState::builder(class_name).is_complete(true).build()?;
        Ok(Self::from_state(state))
    }

    /// Creates a handle for a saved object whose data has not been fetched.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] for an invalid class name.
    pub fn without_data(class_name: &str, object_id: &str) -> MooringResult<Arc<Self>> {
        let state = ObjectState::builder(class_name)
            .object_id(Some(object_id.to_string()))
            .build()?;
        Ok(Self::from_state(state))
    }

    /// Wraps an existing state.
    pub fn from_state(state: ObjectState) -> Arc<Self> {
        let class_name = state.class_name().to_string();
        let kind = ClassKind::of(&class_name);
        let estimated = state.server_data().clone();
        Arc::new_cyclic(|this| SyncObject {
            this: this.clone(),
            class_name,
            kind,
            inner: Mutex::new(ObjectInner {
                state,
                queue: VecDeque::new(),
                current: OperationSet::new(),
                next_seq: 0,
                field_versions: HashMap::new(),
                settled: HashSet::new(),
                estimated,
                local_id: None,
                deleting_eventually: 0,
                is_deleted: false,
            }),
        })
    }

    /// Class name.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Behavior variant selected by the class name.
    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// Server id, once assigned.
    pub fn object_id(&self) -> Option<String> {
        self.inner.lock().state.object_id().map(str::to_string)
    }

    /// Local id, once assigned.
    pub fn local_id(&self) -> Option<String> {
        self.inner.lock().local_id.clone()
    }

    /// Assigns the local id used to reference this object before it is saved.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] if a different local id is
    /// already assigned.
    pub fn set_local_id(&self, local_id: &str) -> MooringResult<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = &inner.local_id {
            if existing != local_id {
                return Err(MooringError::illegal_state(format!(
                    "object already has local id {existing}"
                )));
            }
            return Ok(());
        }
        inner.local_id = Some(local_id.to_string());
        Ok(())
    }

    /// Identity key: the server id when known, else the local id.
    pub fn key(&self) -> Option<ObjectKey> {
        let inner = self.inner.lock();
        match (inner.state.object_id(), &inner.local_id) {
            (Some(id), _) => Some(ObjectKey::ObjectId(id.to_string())),
            (None, Some(local)) => Some(ObjectKey::LocalId(local.clone())),
            (None, None) => None,
        }
    }

    /// Pointer to this object, if it has any identity yet.
    pub fn pointer(&self) -> Option<Pointer> {
        self.key().map(|key| Pointer {
            class_name: self.class_name.clone(),
            key,
        })
    }

    /// Creation time reported by the server.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().state.created_at()
    }

    /// Last update time reported by the server.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().state.updated_at()
    }

    /// Copy of the server state.
    pub fn state(&self) -> ObjectState {
        self.inner.lock().state.clone()
    }

    /// Whether every field has been fetched.
    pub fn is_data_available(&self) -> bool {
        self.inner.lock().state.is_complete()
    }

    /// Whether `key` may be read.
    pub fn is_data_available_for_key(&self, key: &str) -> bool {
        self.inner.lock().is_available(key)
    }

    /// Reads a field, including unsaved local changes.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] if `key` was not fetched.
    pub fn get(&self, key: &str) -> MooringResult<Option<Value>> {
        let inner = self.inner.lock();
        if !inner.is_available(key) {
            return Err(MooringError::illegal_state(format!(
                "{} has no data for {key:?}; fetch it first.",
                self.class_name
            )));
        }
        Ok(inner.estimated.get(key).cloned())
    }

    /// Reads a field without the availability guard. Used by the offline
    /// query engine, which treats unfetched keys as missing.
    pub fn estimated(&self, key: &str) -> Option<Value> {
        self.inner.lock().estimated.get(key).cloned()
    }

    /// Copy of every known field, including unsaved changes.
    pub fn estimated_data(&self) -> BTreeMap<String, Value> {
        self.inner.lock().estimated.clone()
    }

    /// Whether `key` holds a value.
    pub fn has(&self, key: &str) -> bool {
        self.inner.lock().estimated.contains_key(key)
    }

    /// Names of the known fields.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().estimated.keys().cloned().collect()
    }

    /// Queues an operation on `key` without class validation.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if the operation does not fit
    /// the field's current value; the object is unchanged.
    pub fn perform_operation(&self, key: &str, op: FieldOperation) -> MooringResult<()> {
        let mut inner = self.inner.lock();
        let new_value = op.apply(inner.estimated.get(key), key)?;
        inner.current.apply(key, op)?;
        match new_value {
            Some(value) => {
                inner.estimated.insert(key.to_string(), value);
            }
            None => {
                inner.estimated.remove(key);
            }
        }
        Ok(())
    }

    /// Sets a field.
    ///
    /// # Errors
    ///
    /// Returns an error if the class forbids setting `key`.
    pub fn put(&self, key: &str, value: impl Into<Value>) -> MooringResult<()> {
        let value = value.into();
        self.kind
            .validate_put(key, &value, self.object_id().is_some())?;
        self.perform_operation(key, FieldOperation::Set(value))
    }

    /// Sets a field, bypassing the class's protected keys. For SDK
    /// controllers that own those keys (installation ids, session tokens).
    ///
    /// # Errors
    ///
    /// Returns an error if the key is empty.
    pub fn put_internal(&self, key: &str, value: impl Into<Value>) -> MooringResult<()> {
        if key.is_empty() {
            return Err(MooringError::illegal_argument("field name must not be empty"));
        }
        self.perform_operation(key, FieldOperation::Set(value.into()))
    }

    /// Removes a field.
    ///
    /// # Errors
    ///
    /// Returns an error if the class forbids removing `key`.
    pub fn remove(&self, key: &str) -> MooringResult<()> {
        self.kind.validate_remove(key)?;
        self.perform_operation(key, FieldOperation::Delete)
    }

    /// Adds `amount` to a numeric field.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if `amount` or the field is
    /// not numeric.
    pub fn increment(&self, key: &str, amount: impl Into<Value>) -> MooringResult<()> {
        let amount = amount
            .into()
            .as_number()
            .ok_or_else(|| MooringError::illegal_argument("increment amount must be a number"))?;
        self.perform_operation(key, FieldOperation::Increment(amount))
    }

    /// Appends a value to an array field.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if the field is not an array.
    pub fn add(&self, key: &str, value: impl Into<Value>) -> MooringResult<()> {
        self.add_all(key, vec![value.into()])
    }

    /// Appends values to an array field.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if the field is not an array.
    pub fn add_all(&self, key: &str, values: Vec<Value>) -> MooringResult<()> {
        self.perform_operation(key, FieldOperation::Add(values))
    }

    /// Appends a value to an array field unless already present.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if the field is not an array.
    pub fn add_unique(&self, key: &str, value: impl Into<Value>) -> MooringResult<()> {
        self.add_all_unique(key, vec![value.into()])
    }

    /// Appends values to an array field, skipping ones already present.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if the field is not an array.
    pub fn add_all_unique(&self, key: &str, values: Vec<Value>) -> MooringResult<()> {
        self.perform_operation(key, FieldOperation::AddUnique(values))
    }

    /// Removes every occurrence of `values` from an array field.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if the field is not an array.
    pub fn remove_all(&self, key: &str, values: Vec<Value>) -> MooringResult<()> {
        self.perform_operation(key, FieldOperation::Remove(values))
    }

    /// Returns the relation stored under `key`, bound to this object.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if `key` holds something
    /// other than a relation.
    pub fn relation(&self, key: &str) -> MooringResult<Relation> {
        let target_class = match self.inner.lock().estimated.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Relation(rel)) => rel.target_class.clone(),
            Some(other) => {
                return Err(MooringError::illegal_argument(format!(
                    "{key:?} holds a {}, not a relation",
                    other.type_name()
                )))
            }
        };
        let relation = Relation::new(target_class);
        relation.bind(self.this.clone(), key);
        Ok(relation)
    }

    /// The object's ACL, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if the ACL field is malformed.
    pub fn acl(&self) -> MooringResult<Option<Acl>> {
        match self.estimated(ACL_KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Acl::from_value(&value).map(Some),
        }
    }

    /// Replaces the object's ACL.
    ///
    /// # Errors
    ///
    /// Propagates operation errors.
    pub fn set_acl(&self, acl: &Acl) -> MooringResult<()> {
        self.perform_operation(ACL_KEY, FieldOperation::Set(acl.to_value()))
    }

    /// Whether the object has unsaved changes or has never been saved.
    pub fn is_dirty(&self) -> bool {
        let inner = self.inner.lock();
        inner.state.object_id().is_none() || !inner.current.is_empty()
    }

    /// Whether `key` has an unsaved change.
    pub fn is_dirty_key(&self, key: &str) -> bool {
        self.inner.lock().current.contains_key(key)
    }

    /// Whether any operations are queued or in flight.
    pub fn has_pending_operations(&self) -> bool {
        let inner = self.inner.lock();
        !inner.queue.is_empty() || !inner.current.is_empty()
    }

    /// Copy of the operations not yet dispatched.
    pub fn current_operations(&self) -> OperationSet {
        self.inner.lock().current.clone()
    }

    /// Discards every undispatched change.
    pub fn revert(&self) {
        let mut inner = self.inner.lock();
        inner.current.clear();
        inner.rebuild_estimated();
    }

    /// Discards the undispatched change to `key`.
    pub fn revert_key(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.current.remove(key).is_some() {
            inner.rebuild_estimated();
        }
    }

    /// Dispatches the current operations: they are stamped with the next
    /// sequence and queued until [`SyncObject::handle_save_result`].
    pub fn start_save(&self) -> PendingSave {
        let mut inner = self.inner.lock();
        let seq = inner.take_seq();
        let operations = std::mem::take(&mut inner.current);
        inner.queue.push_back(QueuedOperations {
            seq: Some(seq),
            ops: operations.clone(),
        });
        PendingSave {
            seq,
            operations,
            object_id: inner.state.object_id().map(str::to_string),
            local_id: inner.local_id.clone(),
        }
    }

    /// Dispatches the queued set with id `uuid`, e.g. one restored from disk
    /// by a save-eventually replay. Returns `None` when the set is no longer
    /// pending.
    pub fn dispatch(&self, uuid: Uuid) -> Option<PendingSave> {
        let mut inner = self.inner.lock();
        if inner.current.uuid() == uuid {
            drop(inner);
            return Some(self.start_save());
        }
        let index = inner.queue.iter().position(|q| q.ops.uuid() == uuid)?;
        let seq = match inner.queue[index].seq {
            Some(seq) => seq,
            None => {
                let seq = inner.take_seq();
                inner.queue[index].seq = Some(seq);
                seq
            }
        };
        Some(PendingSave {
            seq,
            operations: inner.queue[index].ops.clone(),
            object_id: inner.state.object_id().map(str::to_string),
            local_id: inner.local_id.clone(),
        })
    }

    /// Settles the save dispatched with `seq`.
    ///
    /// On success (`Some(response)`) the operations and response fields are
    /// folded into the server state, except fields a later-dispatched save
    /// already overwrote. Composable operations (increments, array and
    /// relation edits) still apply on top of later confirmed ones. On failure
    /// (`None`) the operations are merged into the undispatched set so they
    /// stay visible and dirty until reverted.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] for an unknown sequence, or a
    /// decoding error for a malformed response; the object is unchanged.
    pub fn handle_save_result(
        &self,
        seq: u64,
        response: Option<&Map<String, Json>>,
        objects: &dyn ObjectDecoder,
    ) -> MooringResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let index = inner
            .queue
            .iter()
            .position(|q| q.seq == Some(seq))
            .ok_or_else(|| {
                MooringError::illegal_state(format!("no save dispatched with sequence {seq}"))
            })?;

        let Some(response) = response else {
            let Some(failed) = inner.queue.remove(index) else {
                return Ok(());
            };
            // Later sets may already be in flight; only the undispatched set
            // can carry the failed operations to the next save.
            let merged = inner.current.merge_from(&failed.ops);
            match merged {
                Ok(()) => {
                    inner.settled.insert(failed.ops.uuid());
                }
                Err(e) => {
                    tracing::warn!(error = %e, seq, "failed save kept as its own queued set");
                    inner.queue.insert(
                        index,
                        QueuedOperations {
                            seq: None,
                            ops: failed.ops,
                        },
                    );
                }
            }
            inner.rebuild_estimated();
            return Ok(());
        };

        let mut builder = inner.state.to_builder();
        let mut written = Vec::new();
        for (key, op) in inner.queue[index].ops.iter() {
            if inner.confirmed_later(key, seq) {
                continue;
            }
            builder = match op.apply(builder.get(key), key)? {
                Some(value) => builder.put(key.clone(), value),
                None => builder.remove(key),
            };
            if op.overwrites() {
                written.push(key.clone());
            }
        }

        let mut created_at = None;
        let mut updated_at = None;
        for (key, value) in response {
            match key.as_str() {
                "__type" | "className" => {}
                "objectId" => {
                    builder = builder.object_id(value.as_str().map(str::to_string));
                }
                "createdAt" => created_at = decode_timestamp(value)?,
                "updatedAt" => updated_at = decode_timestamp(value)?,
                _ => {
                    if inner.confirmed_later(key, seq) {
                        continue;
                    }
                    builder = builder.put(key.clone(), decode_json_with(value, objects)?);
                    written.push(key.clone());
                }
            }
        }
        if created_at.is_some() {
            builder = builder.created_at(created_at);
        }
        if let Some(updated) = updated_at.or(created_at) {
            builder = builder.updated_at(Some(updated));
        }
        let state = builder.build()?;

        if let Some(done) = inner.queue.remove(index) {
            inner.settled.insert(done.ops.uuid());
        }
        for key in written {
            let version = inner.field_versions.entry(key).or_insert(0);
            *version = (*version).max(seq);
        }
        inner.state = state;
        inner.rebuild_estimated();
        Ok(())
    }

    /// Merges a fetch response. A complete response replaces the server
    /// fields; a partial one is overlaid.
    ///
    /// # Errors
    ///
    /// Returns a decoding error; the object is unchanged.
    pub fn handle_fetch_result(
        &self,
        response: &Map<String, Json>,
        objects: &dyn ObjectDecoder,
        complete: bool,
    ) -> MooringResult<()> {
        let fetched = ObjectState::decode(&self.class_name, response, objects, complete)?;
        let mut inner = self.inner.lock();
        let base = if complete {
            let object_id = inner.state.object_id().map(str::to_string);
            inner.state.to_builder().clear().object_id(object_id)
        } else {
            inner.state.to_builder()
        };
        let state = base.merge(&fetched).build()?;
        inner.state = state;
        inner.rebuild_estimated();
        Ok(())
    }

    /// Overlays a state received from the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged state is invalid or of another class.
    pub fn merge_from_server(&self, state: &ObjectState) -> MooringResult<()> {
        if state.class_name() != self.class_name {
            return Err(MooringError::illegal_argument(format!(
                "cannot merge {} data into a {} object",
                state.class_name(),
                self.class_name
            )));
        }
        let mut inner = self.inner.lock();
        let merged = inner.state.to_builder().merge(state).build()?;
        inner.state = merged;
        inner.rebuild_estimated();
        Ok(())
    }

    /// Records the outcome of a delete.
    pub fn handle_delete_result(&self, success: bool) {
        let mut inner = self.inner.lock();
        if success {
            inner.is_deleted = true;
        }
    }

    /// Whether a delete of this object succeeded.
    pub fn is_deleted(&self) -> bool {
        self.inner.lock().is_deleted
    }

    /// Number of queued delete-eventually commands.
    pub fn deleting_eventually_count(&self) -> u32 {
        self.inner.lock().deleting_eventually
    }

    /// Counts one more queued delete-eventually command.
    pub fn begin_delete_eventually(&self) {
        self.inner.lock().deleting_eventually += 1;
    }

    /// Counts one fewer queued delete-eventually command.
    pub fn finish_delete_eventually(&self) {
        let mut inner = self.inner.lock();
        inner.deleting_eventually = inner.deleting_eventually.saturating_sub(1);
    }

    /// Encodes server data, identity and every pending operation set for
    /// local persistence.
    pub fn to_snapshot(&self) -> Json {
        let inner = self.inner.lock();
        let state = &inner.state;
        let mut map = Map::new();
        map.insert("className".into(), Json::from(self.class_name.clone()));
        if let Some(id) = state.object_id() {
            map.insert("objectId".into(), Json::from(id));
        }
        if let Some(created) = state.created_at() {
            map.insert("createdAt".into(), Json::from(encode_date(&created)));
        }
        if let Some(updated) = state.updated_at() {
            map.insert("updatedAt".into(), Json::from(encode_date(&updated)));
        }
        if let Some(local) = &inner.local_id {
            map.insert("__localId".into(), Json::from(local.clone()));
        }
        map.insert("__complete".into(), Json::Bool(state.is_complete()));
        if !state.is_complete() {
            let keys = state.available_keys().iter().cloned().map(Json::from).collect();
            map.insert("__selectedKeys".into(), Json::Array(keys));
        }
        let fields = state
            .server_data()
            .iter()
            .map(|(k, v)| (k.clone(), encode_json(v)))
            .collect();
        map.insert("fields".into(), Json::Object(fields));
        let operations = inner
            .queue
            .iter()
            .map(|q| &q.ops)
            .chain(std::iter::once(&inner.current))
            .filter(|ops| !ops.is_empty())
            .map(OperationSet::encode)
            .collect();
        map.insert("__operations".into(), Json::Array(operations));
        map.insert(
            "__deletingEventually".into(),
            Json::from(inner.deleting_eventually),
        );
        Json::Object(map)
    }

    /// Merges a snapshot produced by [`SyncObject::to_snapshot`] into this
    /// object. Operation sets already known to this object are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed snapshot, a snapshot of another
    /// class, or a conflicting local id; the object is unchanged.
    pub fn merge_snapshot(
        &self,
        snapshot: &Json,
        objects: &dyn ObjectDecoder,
    ) -> MooringResult<()> {
        let map = snapshot
            .as_object()
            .ok_or_else(|| MooringError::illegal_argument("snapshot must be an object"))?;
        let class_name = map
            .get("className")
            .and_then(Json::as_str)
            .ok_or_else(|| MooringError::illegal_argument("snapshot without className"))?;
        if class_name != self.class_name {
            return Err(MooringError::illegal_argument(format!(
                "cannot merge a {class_name} snapshot into a {} object",
                self.class_name
            )));
        }

        let complete = map.get("__complete").and_then(Json::as_bool).unwrap_or(false);
        let mut builder = ObjectState::builder(class_name)
            .object_id(map.get("objectId").and_then(Json::as_str).map(str::to_string))
            .created_at(map.get("createdAt").map(decode_timestamp).transpose()?.flatten())
            .updated_at(map.get("updatedAt").map(decode_timestamp).transpose()?.flatten())
            .is_complete(complete);
        if !complete {
            let keys = map
                .get("__selectedKeys")
                .and_then(Json::as_array)
                .map(|keys| {
                    keys.iter()
                        .filter_map(Json::as_str)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            builder = builder.available_keys(keys);
        }
        if let Some(fields) = map.get("fields").and_then(Json::as_object) {
            for (key, value) in fields {
                builder = builder.put(key.clone(), decode_json_with(value, objects)?);
            }
        }
        let disk_state = builder.build()?;
        let disk_sets = match map.get("__operations").and_then(Json::as_array) {
            Some(sets) => sets
                .iter()
                .map(OperationSet::decode)
                .collect::<MooringResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        let local_id = map.get("__localId").and_then(Json::as_str);
        let deleting = map
            .get("__deletingEventually")
            .and_then(Json::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);

        let mut inner = self.inner.lock();
        if let (Some(existing), Some(local)) = (&inner.local_id, local_id) {
            if existing != local {
                return Err(MooringError::illegal_state(format!(
                    "snapshot local id {local} conflicts with {existing}"
                )));
            }
        }
        let state = inner.state.to_builder().merge(&disk_state).build()?;

        inner.state = state;
        if inner.local_id.is_none() {
            inner.local_id = local_id.map(str::to_string);
        }
        for set in disk_sets {
            if !inner.knows_set(set.uuid()) {
                inner.queue.push_back(QueuedOperations { seq: None, ops: set });
            }
        }
        inner.deleting_eventually = inner.deleting_eventually.max(deleting);
        inner.rebuild_estimated();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use mooring_codec::PointerDecoder;
    use serde_json::json;

    fn object() -> Arc<SyncObject> {
        SyncObject::new("GameScore").unwrap()
    }

    fn response(json: Json) -> Map<String, Json> {
        json.as_object().cloned().unwrap()
    }

    #[test]
    fn put_is_visible_before_save() {
        let obj = object();
        obj.put("score", 10).unwrap();
        assert_eq!(obj.get("score").unwrap(), Some(Value::Integer(10)));
        assert!(obj.is_dirty_key("score"));
        assert!(obj.is_dirty());
    }

    #[test]
    fn array_operations_compose_and_revert_per_key() {
        let obj = object();
        obj.put("tags", Value::Array(vec!["a".into(), "b".into()])).unwrap();
        obj.add_unique("tags", "b").unwrap();
        obj.add_unique("tags", "c").unwrap();
        obj.remove_all("tags", vec!["a".into()]).unwrap();
        assert_eq!(
            obj.get("tags").unwrap(),
            Some(Value::Array(vec!["b".into(), "c".into()]))
        );

        obj.put("score", 1).unwrap();
        obj.revert_key("tags");
        assert_eq!(obj.get("tags").unwrap(), None);
        assert!(!obj.is_dirty_key("tags"));
        assert_eq!(obj.get("score").unwrap(), Some(Value::Integer(1)));
    }

    #[test]
    fn unfetched_keys_are_illegal_state() {
        let obj = SyncObject::without_data("GameScore", "abc").unwrap();
        assert!(!obj.is_data_available_for_key("score"));
        assert_eq!(obj.get("score").unwrap_err().kind(), ErrorKind::IllegalState);
        obj.put("score", 1).unwrap();
        assert_eq!(obj.get("score").unwrap(), Some(Value::Integer(1)));
    }

    #[test]
    fn failed_operation_leaves_object_unchanged() {
        let obj = object();
        obj.put("name", "text").unwrap();
        assert!(obj.increment("name", 1).is_err());
        assert_eq!(obj.get("name").unwrap(), Some(Value::from("text")));
        assert_eq!(
            obj.current_operations().get("name"),
            Some(&FieldOperation::Set("text".into()))
        );
    }

    #[test]
    fn successful_save_updates_server_state() {
        let obj = object();
        obj.put("score", 1).unwrap();
        let save = obj.start_save();
        assert!(save.object_id.is_none());
        assert!(!obj.is_dirty_key("score"));

        obj.handle_save_result(
            save.seq,
            Some(&response(json!({
                "objectId": "s1",
                "createdAt": "2024-01-01T00:00:00.000Z"
            }))),
            &PointerDecoder,
        )
        .unwrap();

        assert_eq!(obj.object_id().as_deref(), Some("s1"));
        assert_eq!(obj.state().server_data().get("score"), Some(&Value::Integer(1)));
        assert_eq!(obj.updated_at(), obj.created_at());
        assert!(!obj.has_pending_operations());
    }

    #[test]
    fn later_dispatch_wins_when_responses_arrive_out_of_order() {
        let obj = object();
        obj.put("x", 1).unwrap();
        let a = obj.start_save();
        obj.put("x", 2).unwrap();
        let b = obj.start_save();

        obj.handle_save_result(b.seq, Some(&Map::new()), &PointerDecoder)
            .unwrap();
        assert_eq!(obj.get("x").unwrap(), Some(Value::Integer(2)));

        obj.handle_save_result(a.seq, Some(&Map::new()), &PointerDecoder)
            .unwrap();
        assert_eq!(obj.get("x").unwrap(), Some(Value::Integer(2)));
        assert_eq!(obj.state().server_data().get("x"), Some(&Value::Integer(2)));
    }

    #[test]
    fn increments_compose_when_responses_arrive_out_of_order() {
        let obj = object();
        obj.increment("count", 1).unwrap();
        let a = obj.start_save();
        obj.increment("count", 2).unwrap();
        let b = obj.start_save();

        obj.handle_save_result(b.seq, Some(&Map::new()), &PointerDecoder)
            .unwrap();
        assert_eq!(obj.get("count").unwrap(), Some(Value::Integer(3)));

        obj.handle_save_result(a.seq, Some(&Map::new()), &PointerDecoder)
            .unwrap();
        assert_eq!(obj.get("count").unwrap(), Some(Value::Integer(3)));
        assert_eq!(obj.state().server_data().get("count"), Some(&Value::Integer(3)));
    }

    #[test]
    fn later_set_still_beats_earlier_increment() {
        let obj = object();
        obj.increment("count", 1).unwrap();
        let a = obj.start_save();
        obj.put("count", 10).unwrap();
        let b = obj.start_save();

        obj.handle_save_result(b.seq, Some(&Map::new()), &PointerDecoder)
            .unwrap();
        obj.handle_save_result(a.seq, Some(&Map::new()), &PointerDecoder)
            .unwrap();
        assert_eq!(obj.get("count").unwrap(), Some(Value::Integer(10)));
    }

    #[test]
    fn failure_behind_an_in_flight_save_stays_dirty() {
        let obj = object();
        obj.put("a", 1).unwrap();
        let first = obj.start_save();
        obj.put("b", 2).unwrap();
        let second = obj.start_save();

        obj.handle_save_result(first.seq, None, &PointerDecoder).unwrap();
        obj.handle_save_result(second.seq, Some(&Map::new()), &PointerDecoder)
            .unwrap();

        assert_eq!(obj.state().server_data().get("a"), None);
        assert_eq!(obj.state().server_data().get("b"), Some(&Value::Integer(2)));
        assert!(obj.is_dirty_key("a"));
        assert!(obj.has_pending_operations());
        assert_eq!(obj.get("a").unwrap(), Some(Value::Integer(1)));

        obj.revert();
        assert_eq!(obj.get("a").unwrap(), None);
        assert_eq!(obj.get("b").unwrap(), Some(Value::Integer(2)));
    }

    #[test]
    fn later_dispatch_wins_for_response_fields() {
        let obj = object();
        obj.put("x", 1).unwrap();
        let a = obj.start_save();
        obj.put("x", 2).unwrap();
        let b = obj.start_save();

        obj.handle_save_result(b.seq, Some(&response(json!({"x": 2}))), &PointerDecoder)
            .unwrap();
        obj.handle_save_result(a.seq, Some(&response(json!({"x": 1}))), &PointerDecoder)
            .unwrap();
        assert_eq!(obj.get("x").unwrap(), Some(Value::Integer(2)));
    }

    #[test]
    fn failed_save_stays_visible_until_revert() {
        let obj = object();
        obj.increment("count", 1).unwrap();
        let save = obj.start_save();
        obj.increment("count", 2).unwrap();

        obj.handle_save_result(save.seq, None, &PointerDecoder).unwrap();
        assert_eq!(obj.get("count").unwrap(), Some(Value::Integer(3)));
        assert_eq!(
            obj.current_operations().get("count"),
            Some(&FieldOperation::Increment(mooring_codec::Number::Int(3)))
        );

        obj.revert();
        assert_eq!(obj.get("count").unwrap(), None);
    }

    #[test]
    fn unknown_sequence_is_illegal_state() {
        let obj = object();
        let err = obj
            .handle_save_result(42, Some(&Map::new()), &PointerDecoder)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn complete_fetch_replaces_fields() {
        let obj = SyncObject::without_data("GameScore", "abc").unwrap();
        obj.handle_fetch_result(&response(json!({"a": 1, "b": 2})), &PointerDecoder, true)
            .unwrap();
        obj.handle_fetch_result(&response(json!({"a": 5})), &PointerDecoder, true)
            .unwrap();
        assert_eq!(obj.get("a").unwrap(), Some(Value::Integer(5)));
        assert_eq!(obj.get("b").unwrap(), None);
        assert_eq!(obj.object_id().as_deref(), Some("abc"));
    }

    #[test]
    fn snapshot_restores_pending_operations_once() {
        let obj = object();
        obj.set_local_id("local_00000000000000ab").unwrap();
        obj.put("title", "draft").unwrap();
        obj.increment("views", 1).unwrap();
        let snapshot = obj.to_snapshot();

        let restored = object();
        restored.merge_snapshot(&snapshot, &PointerDecoder).unwrap();
        restored.merge_snapshot(&snapshot, &PointerDecoder).unwrap();
        assert_eq!(restored.local_id().as_deref(), Some("local_00000000000000ab"));
        assert_eq!(restored.get("views").unwrap(), Some(Value::Integer(1)));
        assert_eq!(restored.get("title").unwrap(), Some(Value::from("draft")));
        assert!(restored.has_pending_operations());
    }

    #[test]
    fn restored_sets_can_be_dispatched() {
        let obj = object();
        obj.put("title", "draft").unwrap();
        let uuid = obj.current_operations().uuid();
        let restored = object();
        restored
            .merge_snapshot(&obj.to_snapshot(), &PointerDecoder)
            .unwrap();

        let save = restored.dispatch(uuid).unwrap();
        restored
            .handle_save_result(
                save.seq,
                Some(&response(json!({"objectId": "n1"}))),
                &PointerDecoder,
            )
            .unwrap();
        assert!(!restored.has_pending_operations());
        assert_eq!(restored.object_id().as_deref(), Some("n1"));
        assert!(restored.dispatch(uuid).is_none());
    }

    #[test]
    fn acl_round_trips_through_field() {
        let obj = object();
        let mut acl = Acl::new();
        acl.set_public_read_access(true);
        obj.set_acl(&acl).unwrap();
        assert_eq!(obj.acl().unwrap(), Some(acl));
    }
}
