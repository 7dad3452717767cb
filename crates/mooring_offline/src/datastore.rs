//! Rows, pins and the pin dependency graph.
//!
//! Every locally stored object is one row, `objects/<uuid>`, holding the
//! object's snapshot (server data plus pending operation sets). A pin is a
//! row of class `_Pin` listing its objects under `_objects`. Pinning saves
//! the whole graph reachable from the pin and records the row uuids it
//! reached under `dependencies/<pin uuid>`:
//!
//! ```text
//! pin "_default" ──► dependencies/<pin> = { pin, a, b, c }
//!      _objects: [a]      a.author ──► b      b.team ──► c ──► a (cycle)
//! ```
//!
//! A row is removed once no dependency set lists it and no in-flight
//! operation retains it.

use crate::decode::live_for_snapshot;
use mooring_codec::{
    decode_date, from_cbor_record, to_cbor_record, ObjectKey, Pointer, PointerDecoder, Value,
};
use mooring_core::{
    LocalIdManager, MooringError, MooringResult, ObjectRegistry, ObjectState, SyncObject, PIN_CLASS,
};
use mooring_storage::ByteStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

const OBJECTS_PREFIX: &str = "objects/";
const DEPENDENCIES_PREFIX: &str = "dependencies/";
const PIN_NAME_KEY: &str = "_name";
const PIN_OBJECTS_KEY: &str = "_objects";

/// Pin used when no name is given.
pub const DEFAULT_PIN: &str = "_default";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RowRecord {
    class_name: String,
    object_id: Option<String>,
    local_id: Option<String>,
    snapshot: Json,
}

/// Identity and location of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSummary {
    /// Row uuid.
    pub uuid: String,
    /// Class of the stored object.
    pub class_name: String,
    /// Server id, if known.
    pub object_id: Option<String>,
    /// Local id, if assigned.
    pub local_id: Option<String>,
}

impl RowSummary {
    fn identities(&self) -> Vec<(String, ObjectKey)> {
        let mut keys = Vec::new();
        if let Some(id) = &self.object_id {
            keys.push((self.class_name.clone(), ObjectKey::ObjectId(id.clone())));
        }
        if let Some(id) = &self.local_id {
            keys.push((self.class_name.clone(), ObjectKey::LocalId(id.clone())));
        }
        keys
    }
}

#[derive(Debug, Default)]
struct RowIndex {
    uuid_by_identity: HashMap<(String, ObjectKey), String>,
    rows: BTreeMap<String, RowSummary>,
    dependencies: HashMap<String, BTreeSet<String>>,
    pins: BTreeMap<String, String>,
    in_flight: HashMap<String, u64>,
    pending_gc: HashSet<String>,
}

impl RowIndex {
    fn insert_row(&mut self, summary: RowSummary) {
        for identity in summary.identities() {
            self.uuid_by_identity.insert(identity, summary.uuid.clone());
        }
        self.rows.insert(summary.uuid.clone(), summary);
    }

    fn remove_row(&mut self, uuid: &str) -> Option<RowSummary> {
        let summary = self.rows.remove(uuid)?;
        for identity in summary.identities() {
            if self.uuid_by_identity.get(&identity).map(String::as_str) == Some(uuid) {
                self.uuid_by_identity.remove(&identity);
            }
        }
        self.in_flight.remove(uuid);
        self.pending_gc.remove(uuid);
        self.pins.retain(|_, pin_uuid| pin_uuid != uuid);
        Some(summary)
    }

    fn is_referenced(&self, uuid: &str) -> bool {
        self.in_flight.get(uuid).is_some_and(|n| *n > 0)
            || self.dependencies.values().any(|deps| deps.contains(uuid))
    }

    /// The row uuid for `object`, claiming a new one under every identity
    /// of the object when it has no row yet. Returns the uuid and whether
    /// it was newly claimed.
    fn reserve(&mut self, object: &SyncObject) -> (String, bool) {
        if let Some(uuid) = self.uuid_for_object(object) {
            return (uuid, false);
        }
        let uuid = Uuid::new_v4().to_string();
        let class_name = object.class_name().to_string();
        let keys = object
            .object_id()
            .map(ObjectKey::ObjectId)
            .into_iter()
            .chain(object.local_id().map(ObjectKey::LocalId));
        for key in keys {
            self.uuid_by_identity.insert((class_name.clone(), key), uuid.clone());
        }
        (uuid, true)
    }

    /// Drops a claim made by [`RowIndex::reserve`] whose row never landed.
    fn release_reservation(&mut self, uuid: &str) {
        if !self.rows.contains_key(uuid) {
            self.uuid_by_identity.retain(|_, claimed| claimed != uuid);
        }
    }

    fn uuid_for_object(&self, object: &SyncObject) -> Option<String> {
        let class_name = object.class_name().to_string();
        object
            .object_id()
            .map(ObjectKey::ObjectId)
            .into_iter()
            .chain(object.local_id().map(ObjectKey::LocalId))
            .find_map(|key| self.uuid_by_identity.get(&(class_name.clone(), key)).cloned())
    }
}

fn objects_key(uuid: &str) -> String {
    format!("{OBJECTS_PREFIX}{uuid}")
}

fn dependencies_key(uuid: &str) -> String {
    format!("{DEPENDENCIES_PREFIX}{uuid}")
}

fn snapshot_updated_at(snapshot: &Json) -> Option<chrono::DateTime<chrono::Utc>> {
    snapshot
        .get("updatedAt")
        .and_then(Json::as_str)
        .and_then(|iso| decode_date(iso).ok())
}

fn refers_to(pointer: &Pointer, object: &SyncObject) -> bool {
    pointer.class_name == object.class_name()
        && match &pointer.key {
            ObjectKey::ObjectId(id) => object.object_id().as_deref() == Some(id.as_str()),
            ObjectKey::LocalId(id) => object.local_id().as_deref() == Some(id.as_str()),
        }
}

fn not_cached() -> MooringError {
    MooringError::not_found("This object is not available in the offline cache.")
}

/// The synchronous local datastore. All methods perform blocking byte-store
/// I/O; async callers go through [`crate::OfflineStore`].
pub struct LocalDatastore {
    bytes: Arc<dyn ByteStore>,
    registry: Arc<ObjectRegistry>,
    ids: Arc<LocalIdManager>,
    index: Mutex<RowIndex>,
}

impl std::fmt::Debug for LocalDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.lock();
        f.debug_struct("LocalDatastore")
            .field("rows", &index.rows.len())
            .field("pins", &index.pins.len())
            .finish_non_exhaustive()
    }
}

impl LocalDatastore {
    /// Opens the datastore kept in `bytes`, rebuilding its indexes from the
    /// stored rows and dependency sets.
    ///
    /// # Errors
    ///
    /// Returns an error if a row or dependency record cannot be read or
    /// decoded.
    pub fn open(
        bytes: Arc<dyn ByteStore>,
        registry: Arc<ObjectRegistry>,
        ids: Arc<LocalIdManager>,
    ) -> MooringResult<Self> {
        let mut index = RowIndex::default();
        for key in bytes.list(OBJECTS_PREFIX)? {
            let uuid = key[OBJECTS_PREFIX.len()..].to_string();
            let Some(data) = bytes.read(&key)? else {
                continue;
            };
            let record: RowRecord = from_cbor_record(&data)?;
            if record.class_name == PIN_CLASS {
                let name = record
                    .snapshot
                    .pointer(&format!("/fields/{PIN_NAME_KEY}"))
                    .and_then(Json::as_str);
                if let Some(name) = name {
                    index.pins.insert(name.to_string(), uuid.clone());
                }
            }
            index.insert_row(RowSummary {
                uuid,
                class_name: record.class_name,
                object_id: record.object_id,
                local_id: record.local_id,
            });
        }
        for key in bytes.list(DEPENDENCIES_PREFIX)? {
            let uuid = key[DEPENDENCIES_PREFIX.len()..].to_string();
            if let Some(data) = bytes.read(&key)? {
                let deps: BTreeSet<String> = from_cbor_record(&data)?;
                index.dependencies.insert(uuid, deps);
            }
        }
        tracing::debug!(
            rows = index.rows.len(),
            pins = index.pins.len(),
            "local datastore opened"
        );
        Ok(Self {
            bytes,
            registry,
            ids,
            index: Mutex::new(index),
        })
    }

    /// The identity map objects are materialized into.
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// The local identity manager.
    pub fn local_ids(&self) -> &Arc<LocalIdManager> {
        &self.ids
    }

    fn read_record(&self, uuid: &str) -> MooringResult<Option<RowRecord>> {
        match self.bytes.read(&objects_key(uuid))? {
            Some(data) => Ok(Some(from_cbor_record(&data)?)),
            None => Ok(None),
        }
    }

    fn uuid_for_pointer(&self, pointer: &Pointer) -> MooringResult<Option<String>> {
        let found = self
            .index
            .lock()
            .uuid_by_identity
            .get(&(pointer.class_name.clone(), pointer.key.clone()))
            .cloned();
        if found.is_some() {
            return Ok(found);
        }
        // A local id that resolved after the row was written.
        if let ObjectKey::LocalId(local) = &pointer.key {
            if let Some(object_id) = self.ids.get_object_id(local)? {
                return Ok(self
                    .index
                    .lock()
                    .uuid_by_identity
                    .get(&(pointer.class_name.clone(), ObjectKey::ObjectId(object_id)))
                    .cloned());
            }
        }
        Ok(None)
    }

    /// Writes `object`'s row, issuing a local id first if it has no
    /// identity. Returns the row uuid.
    fn write_object(&self, object: &Arc<SyncObject>) -> MooringResult<String> {
        self.registry.assign_local_id(object, &self.ids)?;
        let (uuid, claimed) = self.index.lock().reserve(object);
        let summary = RowSummary {
            uuid: uuid.clone(),
            class_name: object.class_name().to_string(),
            object_id: object.object_id(),
            local_id: object.local_id(),
        };
        let record = RowRecord {
            class_name: summary.class_name.clone(),
            object_id: summary.object_id.clone(),
            local_id: summary.local_id.clone(),
            snapshot: object.to_snapshot(),
        };
        let write = || -> MooringResult<()> {
            self.bytes.write(&objects_key(&uuid), &to_cbor_record(&record)?)?;
            Ok(())
        };
        if let Err(e) = write() {
            if claimed {
                self.index.lock().release_reservation(&uuid);
            }
            return Err(e);
        }
        self.index.lock().insert_row(summary);
        tracing::trace!(row = %uuid, class = object.class_name(), "row written");
        Ok(uuid)
    }

    fn load_into(&self, uuid: &str, object: &Arc<SyncObject>) -> MooringResult<()> {
        let record = self.read_record(uuid)?.ok_or_else(not_cached)?;
        let fresh_in_memory = object.is_data_available()
            && snapshot_updated_at(&record.snapshot) <= object.updated_at();
        if !fresh_in_memory {
            object.merge_snapshot(&record.snapshot, &PointerDecoder)?;
        }
        Ok(())
    }

    fn materialize(&self, uuid: &str) -> MooringResult<Arc<SyncObject>> {
        let record = self.read_record(uuid)?.ok_or_else(not_cached)?;
        let (object, existed) = live_for_snapshot(&self.registry, &record.snapshot)?;
        let fresh_in_memory = existed
            && object.is_data_available()
            && snapshot_updated_at(&record.snapshot) <= object.updated_at();
        if !fresh_in_memory {
            object.merge_snapshot(&record.snapshot, &PointerDecoder)?;
        }
        Ok(self.registry.register(&object))
    }

    /// Resolves a pointer to a live object, loading its row if needed.
    /// Returns `None` for a pointer with neither a live object nor a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be read or decoded.
    pub fn resolve(&self, pointer: &Pointer) -> MooringResult<Option<Arc<SyncObject>>> {
        let live = self.registry.get(pointer);
        if let Some(live) = &live {
            if live.is_data_available() {
                return Ok(Some(Arc::clone(live)));
            }
        }
        match self.uuid_for_pointer(pointer)? {
            Some(uuid) => self.materialize(&uuid).map(Some),
            None => Ok(live),
        }
    }

    /// Loads `object`'s row into the same in-memory handle.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::NotFound`] if the object has no row.
    pub fn fetch_locally(&self, object: &Arc<SyncObject>) -> MooringResult<()> {
        let uuid = self.index.lock().uuid_for_object(object).ok_or_else(not_cached)?;
        self.load_into(&uuid, object)
    }

    /// Objects reachable from `roots` through pointers and relations, each
    /// listed once.
    fn collect_graph(&self, roots: &[Arc<SyncObject>]) -> MooringResult<Vec<Arc<SyncObject>>> {
        let mut stack: Vec<Arc<SyncObject>> = roots.iter().rev().cloned().collect();
        let mut visited = HashSet::new();
        let mut graph = Vec::new();
        while let Some(object) = stack.pop() {
            if !visited.insert(Arc::as_ptr(&object) as usize) {
                continue;
            }
            let mut pointers = Vec::new();
            for value in object.estimated_data().values() {
                value.for_each_pointer(&mut |p| pointers.push(p.clone()));
            }
            graph.push(object);
            for pointer in pointers {
                if let Some(child) = self.resolve(&pointer)? {
                    stack.push(child);
                }
            }
        }
        Ok(graph)
    }

    fn pin_object(&self, name: &str) -> MooringResult<Arc<SyncObject>> {
        let existing = self.index.lock().pins.get(name).cloned();
        match existing {
            Some(uuid) => self.materialize(&uuid),
            None => {
                let pin = SyncObject::new(PIN_CLASS)?;
                self.set_pin_objects(&pin, name, Vec::new())?;
                Ok(pin)
            }
        }
    }

    fn set_pin_objects(
        &self,
        pin: &SyncObject,
        name: &str,
        pointers: Vec<Pointer>,
    ) -> MooringResult<()> {
        let state = ObjectState::builder(PIN_CLASS)
            .is_complete(true)
            .put(PIN_NAME_KEY, name)
            .put(
                PIN_OBJECTS_KEY,
                Value::Array(pointers.into_iter().map(Value::Pointer).collect()),
            )
            .build()?;
        pin.merge_from_server(&state)
    }

    fn pin_pointers(pin: &SyncObject) -> Vec<Pointer> {
        match pin.estimated(PIN_OBJECTS_KEY) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Pointer(p) => Some(p),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Saves the graph reachable from `pin` (and `roots`) and records it as
    /// the pin's dependency set.
    fn save_pin_graph(
        &self,
        name: &str,
        pin: &Arc<SyncObject>,
        roots: &[Arc<SyncObject>],
    ) -> MooringResult<()> {
        let mut start = vec![Arc::clone(pin)];
        start.extend(roots.iter().cloned());
        let graph = self.collect_graph(&start)?;
        let mut deps = BTreeSet::new();
        for object in &graph {
            deps.insert(self.write_object(object)?);
        }
        let pin_uuid = self
            .index
            .lock()
            .uuid_for_object(pin)
            .ok_or_else(|| MooringError::illegal_state("pin row was not written"))?;
        self.bytes
            .write(&dependencies_key(&pin_uuid), &to_cbor_record(&deps)?)?;
        let dropped: Vec<String> = {
            let mut index = self.index.lock();
            index.pins.insert(name.to_string(), pin_uuid.clone());
            let old = index.dependencies.insert(pin_uuid, deps.clone());
            old.unwrap_or_default().difference(&deps).cloned().collect()
        };
        tracing::debug!(pin = name, rows = deps.len(), "pin saved");
        self.collect_garbage(dropped)
    }

    /// Deletes the rows in `candidates` that nothing references any more.
    fn collect_garbage(&self, candidates: impl IntoIterator<Item = String>) -> MooringResult<()> {
        let doomed: Vec<String> = {
            let mut index = self.index.lock();
            let mut doomed = Vec::new();
            for uuid in candidates {
                if index.in_flight.get(&uuid).is_some_and(|n| *n > 0) {
                    index.pending_gc.insert(uuid);
                } else if !index.is_referenced(&uuid) && index.remove_row(&uuid).is_some() {
                    doomed.push(uuid);
                }
            }
            doomed
        };
        for uuid in &doomed {
            self.bytes.delete(&objects_key(uuid))?;
        }
        if !doomed.is_empty() {
            tracing::debug!(rows = doomed.len(), "unreferenced rows removed");
        }
        Ok(())
    }

    /// Pins `objects` under `name`, saving everything reachable from them.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be written; rows written before the
    /// failure stay until the next successful pin or unpin.
    pub fn pin_objects(&self, name: &str, objects: &[Arc<SyncObject>]) -> MooringResult<()> {
        let pin = self.pin_object(name)?;
        let mut pointers = Self::pin_pointers(&pin);
        for object in objects {
            let pointer = self.registry.assign_local_id(object, &self.ids)?;
            if !pointers.iter().any(|p| refers_to(p, object)) {
                pointers.push(pointer);
            }
        }
        self.set_pin_objects(&pin, name, pointers)?;
        self.save_pin_graph(name, &pin, objects)
    }

    /// Removes `objects` from the pin `name`. Rows no longer reachable from
    /// any pin are deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin cannot be rewritten.
    pub fn unpin_objects(&self, name: &str, objects: &[Arc<SyncObject>]) -> MooringResult<()> {
        if !self.index.lock().pins.contains_key(name) {
            return Ok(());
        }
        let pin = self.pin_object(name)?;
        let mut pointers = Self::pin_pointers(&pin);
        pointers.retain(|p| !objects.iter().any(|o| refers_to(p, o)));
        if pointers.is_empty() {
            return self.unpin_all(name);
        }
        self.set_pin_objects(&pin, name, pointers)?;
        self.save_pin_graph(name, &pin, &[])
    }

    /// Removes the pin `name` entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the dependency record cannot be deleted.
    pub fn unpin_all(&self, name: &str) -> MooringResult<()> {
        let (pin_uuid, deps) = {
            let mut index = self.index.lock();
            let Some(pin_uuid) = index.pins.remove(name) else {
                return Ok(());
            };
            let deps = index.dependencies.remove(&pin_uuid).unwrap_or_default();
            (pin_uuid, deps)
        };
        self.bytes.delete(&dependencies_key(&pin_uuid))?;
        tracing::debug!(pin = name, rows = deps.len(), "pin removed");
        self.collect_garbage(deps.into_iter().chain(std::iter::once(pin_uuid)))
    }

    /// Pointers listed by the pin `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin row cannot be read.
    pub fn pinned_keys(&self, name: &str) -> MooringResult<Vec<Pointer>> {
        let uuid = self.index.lock().pins.get(name).cloned();
        match uuid {
            Some(uuid) => Ok(Self::pin_pointers(&*self.materialize(&uuid)?)),
            None => Ok(Vec::new()),
        }
    }

    /// Names of every pin.
    pub fn pin_names(&self) -> Vec<String> {
        self.index.lock().pins.keys().cloned().collect()
    }

    /// Saves `object` and everything reachable from it without pinning.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be written.
    pub fn save_locally(&self, object: &Arc<SyncObject>) -> MooringResult<()> {
        for reached in self.collect_graph(std::slice::from_ref(object))? {
            self.write_object(&reached)?;
        }
        Ok(())
    }

    /// Deletes `object`'s row and drops it from every dependency set.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be rewritten or deleted.
    pub fn delete_locally(&self, object: &SyncObject) -> MooringResult<()> {
        let (uuid, touched) = {
            let mut index = self.index.lock();
            let Some(uuid) = index.uuid_for_object(object) else {
                return Ok(());
            };
            let mut touched = Vec::new();
            for (pin_uuid, deps) in index.dependencies.iter_mut() {
                if deps.remove(&uuid) {
                    touched.push((pin_uuid.clone(), deps.clone()));
                }
            }
            index.remove_row(&uuid);
            (uuid, touched)
        };
        for (pin_uuid, deps) in touched {
            self.bytes
                .write(&dependencies_key(&pin_uuid), &to_cbor_record(&deps)?)?;
        }
        self.bytes.delete(&objects_key(&uuid))?;
        tracing::debug!(row = %uuid, "row deleted");
        Ok(())
    }

    /// Records that `object` received the server id `new_id`.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] when the object already had a
    /// different server id, or another live object holds `new_id`.
    pub fn update_object_id(
        &self,
        object: &Arc<SyncObject>,
        old_id: Option<&str>,
        new_id: &str,
    ) -> MooringResult<()> {
        if let Some(old_id) = old_id {
            if old_id == new_id {
                return Ok(());
            }
            return Err(MooringError::illegal_state(
                "objectIds cannot be changed in offline mode.",
            ));
        }
        if object.object_id().as_deref() != Some(new_id) {
            return Err(MooringError::illegal_state(format!(
                "object does not carry the server id {new_id}"
            )));
        }
        self.registry.update_object_id(object)?;
        self.refresh(object)?;
        Ok(())
    }

    /// Rewrites `object`'s row if it has one. Returns whether it did.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be written.
    pub fn refresh(&self, object: &Arc<SyncObject>) -> MooringResult<bool> {
        let has_row = self.index.lock().uuid_for_object(object).is_some();
        if has_row {
            self.write_object(object)?;
        }
        Ok(has_row)
    }

    /// Marks `object` as in flight, writing a row if it has none. The row
    /// survives unpinning until the matching [`LocalDatastore::release`].
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be written.
    pub fn retain(&self, object: &Arc<SyncObject>) -> MooringResult<()> {
        let existing = self.index.lock().uuid_for_object(object);
        let uuid = match existing {
            Some(uuid) => uuid,
            None => {
                let uuid = self.write_object(object)?;
                self.index.lock().pending_gc.insert(uuid.clone());
                uuid
            }
        };
        *self.index.lock().in_flight.entry(uuid).or_insert(0) += 1;
        Ok(())
    }

    /// Ends one in-flight retain of `object`. The last release removes a
    /// row that was unpinned, or only written for the retain, meanwhile.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be deleted.
    pub fn release(&self, object: &SyncObject) -> MooringResult<()> {
        let candidate = {
            let mut index = self.index.lock();
            let Some(uuid) = index.uuid_for_object(object) else {
                return Ok(());
            };
            let count = index.in_flight.entry(uuid.clone()).or_insert(0);
            *count = count.saturating_sub(1);
            if *count > 0 {
                return Ok(());
            }
            index.in_flight.remove(&uuid);
            index.pending_gc.remove(&uuid).then_some(uuid)
        };
        self.collect_garbage(candidate)
    }

    /// Number of stored rows, pins included.
    pub fn row_count(&self) -> usize {
        self.index.lock().rows.len()
    }

    /// Every stored row.
    pub fn rows(&self) -> Vec<RowSummary> {
        self.index.lock().rows.values().cloned().collect()
    }

    /// Live objects of `class_name` stored locally, restricted to the
    /// dependency set of `pin` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be read or decoded.
    pub fn objects_of_class(
        &self,
        class_name: &str,
        pin: Option<&str>,
    ) -> MooringResult<Vec<Arc<SyncObject>>> {
        let uuids: Vec<String> = {
            let index = self.index.lock();
            let in_class = |uuid: &String| {
                index
                    .rows
                    .get(uuid)
                    .is_some_and(|row| row.class_name == class_name)
            };
            match pin {
                Some(name) => index
                    .pins
                    .get(name)
                    .and_then(|pin_uuid| index.dependencies.get(pin_uuid))
                    .map(|deps| deps.iter().filter(|u| in_class(u)).cloned().collect())
                    .unwrap_or_default(),
                None => index.rows.keys().filter(|u| in_class(u)).cloned().collect(),
            }
        };
        uuids.iter().map(|uuid| self.materialize(uuid)).collect()
    }

    /// Deletes every row and dependency set.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be deleted.
    pub fn clear_all(&self) -> MooringResult<()> {
        for key in self.bytes.list(OBJECTS_PREFIX)? {
            self.bytes.delete(&key)?;
        }
        for key in self.bytes.list(DEPENDENCIES_PREFIX)? {
            self.bytes.delete(&key)?;
        }
        *self.index.lock() = RowIndex::default();
        tracing::debug!("local datastore cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_storage::{InMemoryStore, StorageResult};

    fn datastore() -> LocalDatastore {
        let bytes: Arc<dyn ByteStore> = Arc::new(InMemoryStore::new());
        let ids = Arc::new(LocalIdManager::new(Arc::clone(&bytes)));
        LocalDatastore::open(bytes, Arc::new(ObjectRegistry::new()), ids).unwrap()
    }

    #[test]
    fn pin_saves_reachable_graph() {
        let store = datastore();
        let author = SyncObject::new("Author").unwrap();
        let post = SyncObject::new("Post").unwrap();
        let author_ptr = store.registry().assign_local_id(&author, store.local_ids()).unwrap();
        post.put("author", author_ptr).unwrap();

        store.pin_objects(DEFAULT_PIN, &[post.clone()]).unwrap();
        // pin + post + author
        assert_eq!(store.row_count(), 3);
        assert_eq!(store.pinned_keys(DEFAULT_PIN).unwrap(), vec![post.pointer().unwrap()]);
    }

    /// Sleeps on every write, like a store that syncs to disk.
    #[derive(Debug, Default)]
    struct SlowStore {
        inner: InMemoryStore,
    }

    impl ByteStore for SlowStore {
        fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.read(key)
        }
        fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
            std::thread::sleep(std::time::Duration::from_millis(1));
            self.inner.write(key, data)
        }
        fn exists(&self, key: &str) -> StorageResult<bool> {
            self.inner.exists(key)
        }
        fn delete(&self, key: &str) -> StorageResult<bool> {
            self.inner.delete(key)
        }
        fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    #[test]
    fn concurrent_pins_share_one_row_per_child() {
        for _ in 0..10 {
            let bytes: Arc<dyn ByteStore> = Arc::new(SlowStore::default());
            let ids = Arc::new(LocalIdManager::new(Arc::clone(&bytes)));
            let store = LocalDatastore::open(bytes, Arc::new(ObjectRegistry::new()), ids).unwrap();

            let child = SyncObject::new("Child").unwrap();
            let child_ptr = store.registry().assign_local_id(&child, store.local_ids()).unwrap();
            let first = SyncObject::new("Parent").unwrap();
            first.put("c", child_ptr.clone()).unwrap();
            let second = SyncObject::new("Parent").unwrap();
            second.put("c", child_ptr).unwrap();

            std::thread::scope(|scope| {
                scope.spawn(|| store.pin_objects("a", &[first.clone()]).unwrap());
                scope.spawn(|| store.pin_objects("b", &[second.clone()]).unwrap());
            });

            let children = store.rows().into_iter().filter(|r| r.class_name == "Child").count();
            assert_eq!(children, 1);
            store.unpin_all("a").unwrap();
            assert_eq!(store.objects_of_class("Child", None).unwrap().len(), 1);
        }
    }

    #[test]
    fn unpin_removes_unreferenced_rows() {
        let store = datastore();
        let a = SyncObject::new("Post").unwrap();
        let b = SyncObject::new("Post").unwrap();
        store.pin_objects("one", &[a.clone(), b.clone()]).unwrap();
        store.pin_objects("two", &[b.clone()]).unwrap();
        assert_eq!(store.row_count(), 4);

        store.unpin_all("one").unwrap();
        // pin "two" + b
        assert_eq!(store.row_count(), 2);
        assert!(store.fetch_locally(&a).is_err());
        store.fetch_locally(&b).unwrap();
    }

    #[test]
    fn retained_rows_survive_unpin_until_release() {
        let store = datastore();
        let a = SyncObject::new("Post").unwrap();
        store.pin_objects(DEFAULT_PIN, &[a.clone()]).unwrap();
        store.retain(&a).unwrap();
        store.unpin_all(DEFAULT_PIN).unwrap();
        assert_eq!(store.row_count(), 1);
        store.release(&a).unwrap();
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn delete_locally_drops_row_and_dependency() {
        let store = datastore();
        let a = SyncObject::new("Post").unwrap();
        store.pin_objects(DEFAULT_PIN, &[a.clone()]).unwrap();
        store.delete_locally(&a).unwrap();
        assert_eq!(store.row_count(), 1);
        assert!(store.objects_of_class("Post", Some(DEFAULT_PIN)).unwrap().is_empty());
    }

    #[test]
    fn changing_object_id_is_illegal_state() {
        let store = datastore();
        let a = SyncObject::without_data("Post", "p1").unwrap();
        let err = store.update_object_id(&a, Some("p1"), "p2").unwrap_err();
        assert_eq!(err.kind(), mooring_core::ErrorKind::IllegalState);
        store.update_object_id(&a, Some("p1"), "p1").unwrap();
    }
}
