//! Query execution: local datastore, network and cache.

use crate::cache::QueryCache;
use crate::decode::RegistryDecoder;
use crate::store::OfflineStore;
use mooring_core::{
    codes, AccessContext, CachePolicy, CommandExecutor, ErrorKind, MooringError, MooringResult,
    QueryState, RestCommand, SyncObject,
};
use serde_json::Value as Json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs queries where their [`QueryState`] says: the local datastore, or
/// the backend with the query's cache policy.
pub struct QueryController {
    executor: Arc<dyn CommandExecutor>,
    store: Arc<OfflineStore>,
    cache: QueryCache,
    default_max_age: Duration,
}

impl std::fmt::Debug for QueryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryController")
            .field("default_max_age", &self.default_max_age)
            .finish_non_exhaustive()
    }
}

fn cache_miss() -> MooringError {
    MooringError::from_server(codes::CACHE_MISS, "results not cached")
}

impl QueryController {
    /// Creates a controller. `default_max_age` applies to queries that set
    /// no maximum cache age of their own.
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        store: Arc<OfflineStore>,
        cache: QueryCache,
        default_max_age: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            cache,
            default_max_age,
        }
    }

    /// The query cache.
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    async fn cached(
        &self,
        command: &RestCommand,
        max_age: Duration,
        cancel: &CancellationToken,
    ) -> MooringResult<Option<Json>> {
        if cancel.is_cancelled() {
            return Err(MooringError::Cancelled);
        }
        let cache = self.cache.clone();
        let command = command.clone();
        tokio::task::spawn_blocking(move || cache.get(&command, max_age))
            .await
            .map_err(|e| MooringError::persist_failed(format!("cache task failed: {e}")))?
    }

    async fn remember(&self, command: &RestCommand, response: &Json) {
        let cache = self.cache.clone();
        let command = command.clone();
        let response = response.clone();
        let stored = tokio::task::spawn_blocking(move || cache.put(&command, &response)).await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "query result not cached"),
            Err(e) => tracing::warn!(error = %e, "query cache task failed"),
        }
    }

    /// Executes `command` according to `query`'s cache policy, returning the
    /// raw response.
    async fn run_with_policy(
        &self,
        query: &QueryState,
        command: &RestCommand,
        cancel: &CancellationToken,
    ) -> MooringResult<Json> {
        let max_age = query.max_cache_age().unwrap_or(self.default_max_age);
        match query.cache_policy() {
            CachePolicy::IgnoreCache => self.executor.execute(command, cancel).await,
            CachePolicy::CacheOnly => self
                .cached(command, max_age, cancel)
                .await?
                .ok_or_else(cache_miss),
            CachePolicy::CacheElseNetwork => {
                if let Some(hit) = self.cached(command, max_age, cancel).await? {
                    tracing::debug!(class = query.class_name(), "query answered from cache");
                    return Ok(hit);
                }
                let response = self.executor.execute(command, cancel).await?;
                self.remember(command, &response).await;
                Ok(response)
            }
            CachePolicy::NetworkElseCache => match self.executor.execute(command, cancel).await {
                Ok(response) => {
                    self.remember(command, &response).await;
                    Ok(response)
                }
                Err(e) if e.kind() == ErrorKind::ConnectionFailed => {
                    tracing::debug!(
                        class = query.class_name(),
                        error = %e,
                        "network failed; trying cache",
                    );
                    match self.cached(command, max_age, cancel).await? {
                        Some(hit) => Ok(hit),
                        None => Err(e),
                    }
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Objects matching `query`. Network results are merged into the live
    /// objects for their identities.
    ///
    /// # Errors
    ///
    /// - [`MooringError::Cancelled`] if `cancel` fired first
    /// - [`MooringError::Server`] with code 120 on a `CacheOnly` miss
    /// - offline evaluation errors for local queries, backend errors
    ///   otherwise
    pub async fn find(
        &self,
        query: &QueryState,
        session_token: Option<&str>,
        access: &AccessContext,
        cancel: &CancellationToken,
    ) -> MooringResult<Vec<Arc<SyncObject>>> {
        if query.is_from_local_datastore() {
            return self.store.find(query, access, cancel).await;
        }
        let command = RestCommand::find(query, session_token);
        let response = self.run_with_policy(query, &command, cancel).await?;
        let results = response
            .get("results")
            .and_then(Json::as_array)
            .ok_or_else(|| {
                MooringError::from_server(codes::OTHER_CAUSE, "query response without results")
            })?;
        let decoder = RegistryDecoder::new(self.store.datastore().registry());
        let complete = query.selected_keys().is_none();
        let mut objects = Vec::with_capacity(results.len());
        for result in results {
            let map = result
                .as_object()
                .ok_or_else(|| {
                    MooringError::from_server(codes::OTHER_CAUSE, "query result is not an object")
                })?;
            let class_name = map
                .get("className")
                .and_then(Json::as_str)
                .unwrap_or(query.class_name());
            objects.push(decoder.decode_full(class_name, map, complete)?);
        }
        tracing::debug!(
            class = query.class_name(),
            results = objects.len(),
            "network query finished",
        );
        Ok(objects)
    }

    /// Number of objects matching `query`, ignoring skip and limit.
    ///
    /// # Errors
    ///
    /// As [`QueryController::find`].
    pub async fn count(
        &self,
        query: &QueryState,
        session_token: Option<&str>,
        access: &AccessContext,
        cancel: &CancellationToken,
    ) -> MooringResult<usize> {
        if query.is_from_local_datastore() {
            return self.store.count(query, access, cancel).await;
        }
        let command = RestCommand::count(query, session_token);
        let response = self.run_with_policy(query, &command, cancel).await?;
        response
            .get("count")
            .and_then(Json::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                MooringError::from_server(codes::OTHER_CAUSE, "count response without count")
            })
    }

    /// The first object matching `query`.
    ///
    /// # Errors
    ///
    /// [`MooringError::NotFound`] when nothing matches, otherwise as
    /// [`QueryController::find`].
    pub async fn get_first(
        &self,
        query: &QueryState,
        session_token: Option<&str>,
        access: &AccessContext,
        cancel: &CancellationToken,
    ) -> MooringResult<Arc<SyncObject>> {
        let first = query.to_builder().limit(1).build();
        self.find(&first, session_token, access, cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MooringError::not_found("no results found for query"))
    }
}
