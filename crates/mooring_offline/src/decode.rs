//! Materializing live objects from network responses and disk snapshots.

use mooring_codec::{CodecError, CodecResult, ObjectDecoder, ObjectKey, Pointer, PointerDecoder};
use mooring_core::{MooringError, MooringResult, ObjectRegistry, ObjectState, SyncObject};
use serde_json::{Map, Value as Json};
use std::sync::Arc;

/// Decodes embedded full objects into registry objects, merging their
/// fields so every handle on the identity sees them.
pub struct RegistryDecoder<'a> {
    registry: &'a ObjectRegistry,
}

impl<'a> RegistryDecoder<'a> {
    /// Creates a decoder resolving identities through `registry`.
    pub fn new(registry: &'a ObjectRegistry) -> Self {
        Self { registry }
    }

    /// Decodes one full object from a query or fetch response.
    ///
    /// # Errors
    ///
    /// Returns an error if the object lacks an id or its fields fail to
    /// decode.
    pub fn decode_full(
        &self,
        class_name: &str,
        json: &Map<String, Json>,
        complete: bool,
    ) -> MooringResult<Arc<SyncObject>> {
        let object_id = json
            .get("objectId")
            .and_then(Json::as_str)
            .ok_or_else(|| MooringError::illegal_argument("server object without objectId"))?;
        let object = self.registry.get_or_create(class_name, object_id)?;
        object.handle_fetch_result(json, self, complete)?;
        Ok(object)
    }
}

impl ObjectDecoder for RegistryDecoder<'_> {
    fn decode_object(&self, class_name: &str, json: &Map<String, Json>) -> CodecResult<Pointer> {
        let pointer = PointerDecoder.decode_object(class_name, json)?;
        if pointer.key.object_id().is_some() {
            self.decode_full(class_name, json, false)
                .map_err(|e| CodecError::decoding_failed(e.to_string()))?;
        }
        Ok(pointer)
    }
}

/// Identity recorded in a snapshot produced by `SyncObject::to_snapshot`.
pub(crate) fn snapshot_identity(snapshot: &Json) -> MooringResult<(String, Vec<ObjectKey>)> {
    let class_name = snapshot
        .get("className")
        .and_then(Json::as_str)
        .ok_or_else(|| MooringError::illegal_argument("snapshot without className"))?;
    let mut keys = Vec::new();
    if let Some(id) = snapshot.get("objectId").and_then(Json::as_str) {
        keys.push(ObjectKey::ObjectId(id.to_string()));
    }
    if let Some(id) = snapshot.get("__localId").and_then(Json::as_str) {
        keys.push(ObjectKey::LocalId(id.to_string()));
    }
    if keys.is_empty() {
        return Err(MooringError::illegal_argument(
            "snapshot has neither objectId nor local id",
        ));
    }
    Ok((class_name.to_string(), keys))
}

/// Returns the live object for a snapshot's identity, creating and
/// registering an empty one if none is live. The flag is `true` when the
/// object already existed.
pub(crate) fn live_for_snapshot(
    registry: &ObjectRegistry,
    snapshot: &Json,
) -> MooringResult<(Arc<SyncObject>, bool)> {
    let (class_name, keys) = snapshot_identity(snapshot)?;
    for key in &keys {
        let pointer = Pointer {
            class_name: class_name.clone(),
            key: key.clone(),
        };
        if let Some(live) = registry.get(&pointer) {
            return Ok((live, true));
        }
    }
    let object = match keys.iter().find_map(ObjectKey::object_id) {
        Some(id) => registry.get_or_create(&class_name, id)?,
        None => SyncObject::from_state(ObjectState::builder(class_name).build()?),
    };
    Ok((object, false))
}

/// Loads a snapshot into a live object and registers it under every
/// identity the snapshot carries.
pub(crate) fn object_from_snapshot(
    registry: &ObjectRegistry,
    snapshot: &Json,
) -> MooringResult<Arc<SyncObject>> {
    let (object, _) = live_for_snapshot(registry, snapshot)?;
    object.merge_snapshot(snapshot, &PointerDecoder)?;
    Ok(registry.register(&object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_codec::Value;
    use serde_json::json;

    #[test]
    fn embedded_objects_merge_into_registry() {
        let registry = ObjectRegistry::new();
        let decoder = RegistryDecoder::new(&registry);
        let post = decoder
            .decode_full(
                "Post",
                json!({
                    "objectId": "p1",
                    "author": {
                        "__type": "Object",
                        "className": "_User",
                        "objectId": "u1",
                        "name": "ann",
                    },
                })
                .as_object()
                .unwrap(),
                true,
            )
            .unwrap();

        assert_eq!(
            post.get("author").unwrap(),
            Some(Value::Pointer(Pointer::new("_User", "u1")))
        );
        let author = registry.get(&Pointer::new("_User", "u1")).unwrap();
        assert_eq!(author.get("name").unwrap(), Some(Value::from("ann")));
    }

    #[test]
    fn snapshots_restore_identity() {
        let registry = ObjectRegistry::new();
        let original = SyncObject::new("Post").unwrap();
        original.set_local_id("local_00000000000000ab").unwrap();
        original.put("title", "draft").unwrap();
        let snapshot = original.to_snapshot();
        drop(original);

        let restored = object_from_snapshot(&registry, &snapshot).unwrap();
        assert_eq!(restored.local_id().as_deref(), Some("local_00000000000000ab"));
        assert_eq!(restored.get("title").unwrap(), Some(Value::from("draft")));
        assert!(Arc::ptr_eq(
            &registry.get(&Pointer::local("Post", "local_00000000000000ab")).unwrap(),
            &restored
        ));
    }
}
