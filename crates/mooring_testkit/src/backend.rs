//! In-memory fake of the REST backend.
//!
//! The fake understands enough of the object API to exercise offline
//! paths: creates assign ids, updates apply `Increment` and `Delete`
//! operations, finds filter on top-level equality. Other operations are
//! stored verbatim.

use async_trait::async_trait;
use chrono::Utc;
use mooring_codec::encode_date;
use mooring_core::{codes, CommandExecutor, Method, MooringError, MooringResult, RestCommand};
use parking_lot::Mutex;
use serde_json::{json, Map, Value as Json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

type Fields = Map<String, Json>;

#[derive(Debug, Default)]
struct BackendState {
    next_id: u64,
    objects: BTreeMap<(String, String), Fields>,
    log: Vec<RestCommand>,
    failures: VecDeque<MooringError>,
}

/// A fake backend implementing [`CommandExecutor`].
#[derive(Debug, Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
    offline: AtomicBool,
}

impl FakeBackend {
    /// Creates an empty, online backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every command fail with a connection error while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fails the next command with `error`.
    pub fn fail_next(&self, error: MooringError) {
        self.state.lock().failures.push_back(error);
    }

    /// Seeds an object.
    pub fn insert(&self, class_name: &str, object_id: &str, fields: Json) {
        let fields = fields.as_object().cloned().unwrap_or_default();
        self.state
            .lock()
            .objects
            .insert((class_name.to_string(), object_id.to_string()), fields);
    }

    /// Stored fields of an object.
    pub fn object(&self, class_name: &str, object_id: &str) -> Option<Json> {
        self.state
            .lock()
            .objects
            .get(&(class_name.to_string(), object_id.to_string()))
            .cloned()
            .map(Json::Object)
    }

    /// Number of stored objects of `class_name`.
    pub fn count(&self, class_name: &str) -> usize {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(class, _)| class == class_name)
            .count()
    }

    /// Every command received, including failed ones.
    pub fn commands(&self) -> Vec<RestCommand> {
        self.state.lock().log.clone()
    }

    /// Number of commands received.
    pub fn command_count(&self) -> usize {
        self.state.lock().log.len()
    }

    fn handle(state: &mut BackendState, command: &RestCommand) -> MooringResult<Json> {
        let segments: Vec<&str> = command.path.split('/').collect();
        let now = encode_date(&Utc::now());
        match (command.method, segments.as_slice()) {
            (Method::Post, ["logout"]) => Ok(json!({})),
            (Method::Post, ["classes", class]) => {
                state.next_id += 1;
                let id = format!("obj{:04}", state.next_id);
                let mut fields = Fields::new();
                apply_body(&mut fields, command.body.as_ref());
                fields.insert("createdAt".into(), Json::from(now.clone()));
                fields.insert("updatedAt".into(), Json::from(now.clone()));
                state.objects.insert((class.to_string(), id.clone()), fields);
                Ok(json!({ "objectId": id, "createdAt": now }))
            }
            (Method::Put, ["classes", class, id]) => {
                let fields = state
                    .objects
                    .get_mut(&(class.to_string(), id.to_string()))
                    .ok_or_else(|| not_found(class, id))?;
                apply_body(fields, command.body.as_ref());
                fields.insert("updatedAt".into(), Json::from(now.clone()));
                Ok(json!({ "updatedAt": now }))
            }
            (Method::Get, ["classes", class, id]) => {
                let fields = state
                    .objects
                    .get(&(class.to_string(), id.to_string()))
                    .ok_or_else(|| not_found(class, id))?;
                Ok(Json::Object(with_identity(class, id, fields)))
            }
            (Method::Delete, ["classes", class, id]) => state
                .objects
                .remove(&(class.to_string(), id.to_string()))
                .map(|_| json!({}))
                .ok_or_else(|| not_found(class, id)),
            (Method::Get, ["classes", class]) => {
                let params = command.body.as_ref().and_then(Json::as_object);
                let filter = params
                    .and_then(|p| p.get("where"))
                    .and_then(Json::as_object)
                    .cloned()
                    .unwrap_or_default();
                let results: Vec<Json> = state
                    .objects
                    .iter()
                    .filter(|((c, _), fields)| c == class && matches_filter(fields, &filter))
                    .map(|((c, id), fields)| Json::Object(with_identity(c, id, fields)))
                    .collect();
                if params.is_some_and(|p| p.contains_key("count")) {
                    Ok(json!({ "count": results.len(), "results": [] }))
                } else {
                    Ok(json!({ "results": results }))
                }
            }
            _ => Err(MooringError::from_server(
                codes::OTHER_CAUSE,
                format!("unsupported command {:?} {}", command.method, command.path),
            )),
        }
    }
}

fn not_found(class: &str, id: &str) -> MooringError {
    MooringError::from_server(codes::OBJECT_NOT_FOUND, format!("{class} {id} not found"))
}

fn with_identity(class: &str, id: &str, fields: &Fields) -> Fields {
    let mut map = fields.clone();
    map.insert("className".into(), Json::from(class));
    map.insert("objectId".into(), Json::from(id));
    map
}

fn apply_body(fields: &mut Fields, body: Option<&Json>) {
    let Some(body) = body.and_then(Json::as_object) else {
        return;
    };
    for (key, value) in body {
        match value.get("__op").and_then(Json::as_str) {
            Some("Delete") => {
                fields.remove(key);
            }
            Some("Increment") => {
                let amount = value.get("amount").and_then(Json::as_f64).unwrap_or(0.0);
                let base = fields.get(key).and_then(Json::as_f64).unwrap_or(0.0);
                let sum = base + amount;
                let number = if sum.fract() == 0.0 && sum.abs() < 9.0e15 {
                    Json::from(sum as i64)
                } else {
                    Json::from(sum)
                };
                fields.insert(key.clone(), number);
            }
            _ => {
                fields.insert(key.clone(), value.clone());
            }
        }
    }
}

fn matches_filter(fields: &Fields, filter: &Fields) -> bool {
    filter.iter().all(|(key, expected)| match expected {
        Json::Object(_) => true,
        _ => fields.get(key) == Some(expected),
    })
}

#[async_trait]
impl CommandExecutor for FakeBackend {
    async fn execute(
        &self,
        command: &RestCommand,
        cancel: &CancellationToken,
    ) -> MooringResult<Json> {
        if cancel.is_cancelled() {
            return Err(MooringError::Cancelled);
        }
        let mut state = self.state.lock();
        state.log.push(command.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(MooringError::connection_failed("the backend is offline"));
        }
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        Self::handle(&mut state, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_codec::Pointer;
    use mooring_core::{ErrorKind, OperationSet, QueryState};

    fn run(backend: &FakeBackend, command: &RestCommand) -> MooringResult<Json> {
        let token = CancellationToken::new();
        block_on(backend.execute(command, &token))
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn create_update_fetch() {
        let backend = FakeBackend::new();
        let create = RestCommand {
            body: Some(json!({"score": 1})),
            ..RestCommand::create_object("GameScore", &OperationSet::new(), None, None)
        };
        let created = run(&backend, &create).unwrap();
        let id = created["objectId"].as_str().unwrap().to_string();

        let update = RestCommand {
            method: Method::Put,
            path: format!("classes/GameScore/{id}"),
            body: Some(json!({"score": {"__op": "Increment", "amount": 2}})),
            session_token: None,
            local_id: None,
        };
        run(&backend, &update).unwrap();

        let fetched = run(
            &backend,
            &RestCommand::fetch_object(&Pointer::new("GameScore", id.clone()), None),
        )
        .unwrap();
        assert_eq!(fetched["score"], 3);
        assert_eq!(fetched["objectId"], Json::from(id));
        assert_eq!(backend.command_count(), 3);
    }

    #[test]
    fn offline_fails_with_connection_error() {
        let backend = FakeBackend::new();
        backend.set_offline(true);
        let query = QueryState::builder("GameScore").build();
        let err = run(&backend, &RestCommand::find(&query, None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(backend.command_count(), 1);
    }

    #[test]
    fn find_filters_on_equality() {
        let backend = FakeBackend::new();
        backend.insert("GameScore", "a", json!({"player": "ann"}));
        backend.insert("GameScore", "b", json!({"player": "bob"}));
        let query = QueryState::builder("GameScore").where_equal_to("player", "bob").build();
        let found = run(&backend, &RestCommand::find(&query, None)).unwrap();
        assert_eq!(found["results"].as_array().unwrap().len(), 1);
        assert_eq!(found["results"][0]["objectId"], "b");
    }
}
