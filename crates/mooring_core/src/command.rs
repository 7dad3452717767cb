//! REST commands and the executor seam.
//!
//! The HTTP layer is not part of this crate. Commands are plain data that a
//! [`CommandExecutor`] turns into a parsed JSON response. A command may
//! still reference objects by local id; those references are retained in
//! the [`LocalIdManager`] while the command waits in a queue and resolved to
//! server ids right before execution.

use crate::error::{MooringError, MooringResult};
use crate::local_id::{is_local_id, LocalIdManager};
use crate::object::PendingSave;
use crate::operation_set::OperationSet;
use crate::query::QueryState;
use async_trait::async_trait;
use mooring_codec::{ObjectKey, Pointer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Read.
    Get,
    /// Create.
    Post,
    /// Update.
    Put,
    /// Remove.
    Delete,
}

/// One request to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestCommand {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the API root, e.g. `classes/Post/abc`.
    pub path: String,
    /// JSON body or query parameters.
    pub body: Option<Json>,
    /// Session token to authenticate with.
    pub session_token: Option<String>,
    /// Local id of the target object while its server id is unknown. The
    /// path then lacks the trailing object id.
    pub local_id: Option<String>,
}

fn class_path(class_name: &str) -> String {
    format!("classes/{class_name}")
}

impl RestCommand {
    fn new(method: Method, path: String, body: Option<Json>, session_token: Option<&str>) -> Self {
        Self {
            method,
            path,
            body,
            session_token: session_token.map(str::to_string),
            local_id: None,
        }
    }

    fn targeting(method: Method, pointer: &Pointer, session_token: Option<&str>) -> Self {
        match &pointer.key {
            ObjectKey::ObjectId(id) => Self::new(
                method,
                format!("{}/{id}", class_path(&pointer.class_name)),
                None,
                session_token,
            ),
            ObjectKey::LocalId(id) => {
                let mut command = Self::new(
                    method,
                    class_path(&pointer.class_name),
                    None,
                    session_token,
                );
                command.local_id = Some(id.clone());
                command
            }
        }
    }

    /// Saves a dispatched operation set: an update when the object has a
    /// server id, otherwise a create.
    pub fn save_object(class_name: &str, save: &PendingSave, session_token: Option<&str>) -> Self {
        match &save.object_id {
            Some(id) => Self::new(
                Method::Put,
                format!("{}/{id}", class_path(class_name)),
                Some(Json::Object(save.operations.encode_ops())),
                session_token,
            ),
            None => Self::create_object(
                class_name,
                &save.operations,
                save.local_id.as_deref(),
                session_token,
            ),
        }
    }

    /// Creates an object from `operations`. `local_id` names the object
    /// being created so a replay can turn into an update once it resolves.
    pub fn create_object(
        class_name: &str,
        operations: &OperationSet,
        local_id: Option<&str>,
        session_token: Option<&str>,
    ) -> Self {
        let mut command = Self::new(
            Method::Post,
            class_path(class_name),
            Some(Json::Object(operations.encode_ops())),
            session_token,
        );
        command.local_id = local_id.map(str::to_string);
        command
    }

    /// Deletes the object `pointer` refers to.
    pub fn delete_object(pointer: &Pointer, session_token: Option<&str>) -> Self {
        Self::targeting(Method::Delete, pointer, session_token)
    }

    /// Fetches the object `pointer` refers to.
    pub fn fetch_object(pointer: &Pointer, session_token: Option<&str>) -> Self {
        Self::targeting(Method::Get, pointer, session_token)
    }

    /// Runs `query` on the backend.
    pub fn find(query: &QueryState, session_token: Option<&str>) -> Self {
        let mut params = query.to_rest();
        if let Some(map) = params.as_object_mut() {
            map.remove("className");
        }
        Self::new(Method::Get, class_path(query.class_name()), Some(params), session_token)
    }

    /// Counts the results of `query` on the backend.
    pub fn count(query: &QueryState, session_token: Option<&str>) -> Self {
        let mut command = Self::find(query, session_token);
        if let Some(Json::Object(map)) = &mut command.body {
            map.insert("count".into(), Json::from(1));
            map.insert("limit".into(), Json::from(0));
            map.remove("skip");
        }
        command
    }

    /// Ends the session identified by `session_token`.
    pub fn log_out(session_token: &str) -> Self {
        Self::new(Method::Post, "logout".to_string(), None, Some(session_token))
    }

    /// Every local id the command references: its target and any pointer
    /// or ACL entry in the body.
    pub fn local_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        if let Some(id) = &self.local_id {
            ids.insert(id.clone());
        }
        if let Some(body) = &self.body {
            collect_local_ids(body, &mut ids);
        }
        ids
    }

    /// Retains every referenced local id on disk.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn retain_local_ids(&self, ids: &LocalIdManager) -> MooringResult<()> {
        for id in self.local_ids() {
            ids.retain_local_id_on_disk(&id)?;
        }
        Ok(())
    }

    /// Releases every referenced local id on disk.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn release_local_ids(&self, ids: &LocalIdManager) -> MooringResult<()> {
        for id in self.local_ids() {
            ids.release_local_id_on_disk(&id)?;
        }
        Ok(())
    }

    /// Replaces local ids with the server ids they resolved to.
    ///
    /// A create whose own local id has resolved becomes an update of that
    /// id. A create whose own id is still unresolved stays a create.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] if the body references an
    /// unresolved local id, or a non-create targets one. The command is
    /// unchanged on error.
    pub fn resolve_local_ids(&mut self, ids: &LocalIdManager) -> MooringResult<()> {
        let mut resolved = self.clone();
        if let Some(local) = &self.local_id {
            match ids.get_object_id(local)? {
                Some(object_id) => {
                    if resolved.method == Method::Post {
                        resolved.method = Method::Put;
                    }
                    resolved.path = format!("{}/{object_id}", self.path);
                    resolved.local_id = None;
                }
                None if self.method == Method::Post => {}
                None => {
                    return Err(MooringError::illegal_state(format!(
                        "Tried to {:?} an object that was never saved (local id {local}).",
                        self.method
                    )))
                }
            }
        }
        if let Some(body) = &mut resolved.body {
            resolve_in(body, ids)?;
        }
        *self = resolved;
        Ok(())
    }
}

fn pointer_local_id(map: &Map<String, Json>) -> Option<&str> {
    if map.get("__type").and_then(Json::as_str) != Some("Pointer") {
        return None;
    }
    map.get("localId").and_then(Json::as_str)
}

fn collect_local_ids(json: &Json, ids: &mut BTreeSet<String>) {
    match json {
        Json::Array(items) => items.iter().for_each(|item| collect_local_ids(item, ids)),
        Json::Object(map) => {
            if let Some(id) = pointer_local_id(map) {
                ids.insert(id.to_string());
            }
            for (key, value) in map {
                if is_local_id(key) {
                    ids.insert(key.clone());
                }
                collect_local_ids(value, ids);
            }
        }
        _ => {}
    }
}

fn unresolved(id: &str) -> MooringError {
    MooringError::illegal_state(format!(
        "Tried to save an object with a pointer to a new, unsaved object (local id {id})."
    ))
}

fn resolve_in(json: &mut Json, ids: &LocalIdManager) -> MooringResult<()> {
    match json {
        Json::Array(items) => {
            for item in items {
                resolve_in(item, ids)?;
            }
        }
        Json::Object(map) => {
            if let Some(local) = pointer_local_id(map).map(str::to_string) {
                let object_id = ids.get_object_id(&local)?.ok_or_else(|| unresolved(&local))?;
                map.remove("localId");
                map.insert("objectId".into(), Json::from(object_id));
            }
            let local_keys: Vec<String> = map.keys().filter(|k| is_local_id(k)).cloned().collect();
            for local in local_keys {
                let object_id = ids.get_object_id(&local)?.ok_or_else(|| unresolved(&local))?;
                if let Some(value) = map.remove(&local) {
                    map.insert(object_id, value);
                }
            }
            for value in map.values_mut() {
                resolve_in(value, ids)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Executes commands against the backend.
///
/// Implementations check `cancel` before any network I/O and settle into
/// [`MooringError::Cancelled`]. A transport failure maps to
/// [`MooringError::ConnectionFailed`]; an error response maps through
/// [`MooringError::from_server`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Executes `command`, returning the parsed response body.
    async fn execute(
        &self,
        command: &RestCommand,
        cancel: &CancellationToken,
    ) -> MooringResult<Json>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::operation::FieldOperation;
    use mooring_codec::{encode_pointer, Value};
    use mooring_storage::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn manager() -> LocalIdManager {
        LocalIdManager::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn save_chooses_create_or_update() {
        let mut ops = OperationSet::new();
        ops.apply("title", FieldOperation::Set(Value::from("hi"))).unwrap();
        let create = PendingSave {
            seq: 1,
            operations: ops.clone(),
            object_id: None,
            local_id: None,
        };
        let cmd = RestCommand::save_object("Post", &create, Some("r:tok"));
        assert_eq!(cmd.method, Method::Post);
        assert_eq!(cmd.path, "classes/Post");
        assert_eq!(cmd.body, Some(json!({"title": "hi"})));
        assert_eq!(cmd.session_token.as_deref(), Some("r:tok"));

        let update = PendingSave {
            object_id: Some("p1".into()),
            ..create
        };
        let cmd = RestCommand::save_object("Post", &update, None);
        assert_eq!(cmd.method, Method::Put);
        assert_eq!(cmd.path, "classes/Post/p1");
    }

    #[test]
    fn local_ids_are_found_in_pointers_and_acl_keys() {
        let ids = manager();
        let author = ids.create_local_id().unwrap();
        let owner = ids.create_local_id().unwrap();
        let mut ops = OperationSet::new();
        ops.apply("author", FieldOperation::Set(Pointer::local("_User", author.clone()).into()))
            .unwrap();
        let cmd = RestCommand {
            body: Some(json!({
                "author": encode_pointer(&Pointer::local("_User", author.clone())),
                "ACL": { owner.clone(): {"read": true} },
            })),
            ..RestCommand::create_object("Post", &ops, None, None)
        };
        let found = cmd.local_ids();
        assert!(found.contains(&author));
        assert!(found.contains(&owner));

        cmd.retain_local_ids(&ids).unwrap();
        assert_eq!(ids.retain_count(&author).unwrap(), 1);
        cmd.release_local_ids(&ids).unwrap();
        assert_eq!(ids.retain_count(&owner).unwrap(), 0);
    }

    #[test]
    fn resolving_rewrites_pointers_and_target() {
        let ids = manager();
        let me = ids.create_local_id().unwrap();
        let author = ids.create_local_id().unwrap();
        ids.retain_local_id_on_disk(&me).unwrap();
        ids.retain_local_id_on_disk(&author).unwrap();
        ids.set_object_id(&me, "post1").unwrap();
        ids.set_object_id(&author, "user1").unwrap();

        let mut cmd = RestCommand {
            body: Some(json!({
                "author": {"__type": "Pointer", "className": "_User", "localId": author.clone()},
                "ACL": { author.clone(): {"write": true} },
            })),
            ..RestCommand::create_object("Post", &OperationSet::new(), Some(&me), None)
        };
        cmd.resolve_local_ids(&ids).unwrap();
        assert_eq!(cmd.method, Method::Put);
        assert_eq!(cmd.path, "classes/Post/post1");
        assert_eq!(cmd.local_id, None);
        assert_eq!(
            cmd.body,
            Some(json!({
                "author": {"__type": "Pointer", "className": "_User", "objectId": "user1"},
                "ACL": { "user1": {"write": true} },
            }))
        );
    }

    #[test]
    fn unresolved_pointer_is_illegal_state() {
        let ids = manager();
        let author = ids.create_local_id().unwrap();
        ids.retain_local_id_on_disk(&author).unwrap();
        let original = RestCommand {
            body: Some(json!({
                "author": {"__type": "Pointer", "className": "_User", "localId": author},
            })),
            ..RestCommand::create_object("Post", &OperationSet::new(), None, None)
        };
        let mut cmd = original.clone();
        let err = cmd.resolve_local_ids(&ids).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(cmd, original);
    }

    #[test]
    fn unresolved_create_stays_a_create() {
        let ids = manager();
        let me = ids.create_local_id().unwrap();
        let mut cmd = RestCommand::create_object("Post", &OperationSet::new(), Some(&me), None);
        cmd.resolve_local_ids(&ids).unwrap();
        assert_eq!(cmd.method, Method::Post);
        assert_eq!(cmd.path, "classes/Post");

        let mut delete = RestCommand::delete_object(&Pointer::local("Post", me), None);
        assert!(delete.resolve_local_ids(&ids).is_err());
    }

    #[test]
    fn find_encodes_query_parameters() {
        let query = QueryState::builder("Post").where_equal_to("a", 1).limit(3).build();
        let cmd = RestCommand::find(&query, None);
        assert_eq!(cmd.method, Method::Get);
        assert_eq!(cmd.path, "classes/Post");
        assert_eq!(cmd.body, Some(json!({"where": {"a": 1}, "limit": 3})));

        let count = RestCommand::count(&query, None);
        assert_eq!(count.body, Some(json!({"where": {"a": 1}, "limit": 0, "count": 1})));
    }

    #[test]
    fn commands_survive_serde() {
        let cmd = RestCommand::log_out("r:tok");
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(serde_json::from_value::<RestCommand>(json).unwrap(), cmd);
    }
}
