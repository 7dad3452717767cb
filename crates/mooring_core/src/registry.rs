//! Session-wide identity map.

use crate::error::{MooringError, MooringResult};
use crate::local_id::LocalIdManager;
use crate::object::SyncObject;
use mooring_codec::{ObjectKey, Pointer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

type IdentityKey = (String, ObjectKey);

/// Maps `(class, id)` to the one live [`SyncObject`] for that identity.
///
/// Entries hold weak handles, so the registry never keeps an object alive.
/// An object saved after receiving a local id stays reachable under both
/// keys.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: Mutex<HashMap<IdentityKey, Weak<SyncObject>>>,
}

impl ObjectRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The live object `pointer` refers to, if any.
    pub fn get(&self, pointer: &Pointer) -> Option<Arc<SyncObject>> {
        self.objects
            .lock()
            .get(&(pointer.class_name.clone(), pointer.key.clone()))
            .and_then(Weak::upgrade)
    }

    /// The live object for `class_name`/`object_id`, created without data
    /// and registered if absent.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] for an invalid class name.
    pub fn get_or_create(
        &self,
        class_name: &str,
        object_id: &str,
    ) -> MooringResult<Arc<SyncObject>> {
        let key = (class_name.to_string(), ObjectKey::ObjectId(object_id.to_string()));
        let mut objects = self.objects.lock();
        if let Some(existing) = objects.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let object = SyncObject::without_data(class_name, object_id)?;
        objects.insert(key, Arc::downgrade(&object));
        Ok(object)
    }

    /// Registers `object` under its server id and its local id and returns
    /// the canonical handle: an already-registered live object wins.
    pub fn register(&self, object: &Arc<SyncObject>) -> Arc<SyncObject> {
        let class_name = object.class_name().to_string();
        let mut keys = Vec::new();
        if let Some(id) = object.object_id() {
            keys.push((class_name.clone(), ObjectKey::ObjectId(id)));
        }
        if let Some(id) = object.local_id() {
            keys.push((class_name, ObjectKey::LocalId(id)));
        }
        let mut objects = self.objects.lock();
        let canonical = keys
            .iter()
            .find_map(|key| objects.get(key).and_then(Weak::upgrade))
            .unwrap_or_else(|| Arc::clone(object));
        for key in keys {
            let live = objects.get(&key).and_then(Weak::upgrade);
            if live.is_none() {
                objects.insert(key, Arc::downgrade(&canonical));
            }
        }
        canonical
    }

    /// Returns a pointer to `object`, issuing a local id first if it has no
    /// identity yet.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn assign_local_id(
        &self,
        object: &Arc<SyncObject>,
        ids: &LocalIdManager,
    ) -> MooringResult<Pointer> {
        if let Some(pointer) = object.pointer() {
            self.register(object);
            return Ok(pointer);
        }
        let local_id = ids.create_local_id()?;
        object.set_local_id(&local_id)?;
        self.objects.lock().insert(
            (object.class_name().to_string(), ObjectKey::LocalId(local_id.clone())),
            Arc::downgrade(object),
        );
        Ok(Pointer::local(object.class_name(), local_id))
    }

    /// Re-registers `object` under the server id it just received.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] if another live object already
    /// holds that id, or if `object` has no server id.
    pub fn update_object_id(&self, object: &Arc<SyncObject>) -> MooringResult<()> {
        let object_id = object
            .object_id()
            .ok_or_else(|| MooringError::illegal_state("object has no server id"))?;
        let key = (object.class_name().to_string(), ObjectKey::ObjectId(object_id));
        let mut objects = self.objects.lock();
        if let Some(existing) = objects.get(&key).and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&existing, object) {
                return Err(MooringError::illegal_state(
                    "Attempted to change an objectId to one that's already known to the registry.",
                ));
            }
            return Ok(());
        }
        objects.insert(key, Arc::downgrade(object));
        Ok(())
    }

    /// Drops entries whose objects have been released.
    pub fn prune(&self) -> usize {
        let mut objects = self.objects.lock();
        let before = objects.len();
        objects.retain(|_, weak| weak.strong_count() > 0);
        before - objects.len()
    }

    /// Number of entries, live or not yet pruned.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_storage::InMemoryStore;

    #[test]
    fn one_object_per_identity() {
        let registry = ObjectRegistry::new();
        let a = registry.get_or_create("Post", "p1").unwrap();
        let b = registry.get_or_create("Post", "p1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let stray = SyncObject::without_data("Post", "p1").unwrap();
        assert!(Arc::ptr_eq(&registry.register(&stray), &a));
    }

    #[test]
    fn released_objects_are_pruned() {
        let registry = ObjectRegistry::new();
        let a = registry.get_or_create("Post", "p1").unwrap();
        drop(a);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&Pointer::new("Post", "p1")).is_none());
        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn local_ids_resolve_to_same_object() {
        let registry = ObjectRegistry::new();
        let ids = LocalIdManager::new(Arc::new(InMemoryStore::new()));
        let object = SyncObject::new("Post").unwrap();

        let pointer = registry.assign_local_id(&object, &ids).unwrap();
        assert!(pointer.key.local_id().is_some());
        assert!(Arc::ptr_eq(&registry.get(&pointer).unwrap(), &object));

        let again = registry.assign_local_id(&object, &ids).unwrap();
        assert_eq!(again, pointer);
    }

    #[test]
    fn update_requires_server_id() {
        let registry = ObjectRegistry::new();
        let object = SyncObject::new("Post").unwrap();
        assert!(registry.update_object_id(&object).is_err());
    }
}
