//! Cached network query results.

use chrono::{DateTime, Utc};
use mooring_codec::{from_cbor_record, to_cbor_record};
use mooring_core::{MooringError, MooringResult, RestCommand};
use mooring_storage::ByteStore;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

const CACHE_PREFIX: &str = "query_cache/";

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    saved_at: DateTime<Utc>,
    /// Raw response, as JSON text.
    response: String,
}

/// Fingerprint of everything that changes a query command's results: the
/// class path, the encoded constraints, limit, skip, order, includes and
/// selected keys, and the session.
pub fn command_fingerprint(command: &RestCommand) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.path.as_bytes());
    hasher.update([0]);
    if let Some(body) = &command.body {
        hasher.update(body.to_string().as_bytes());
    }
    hasher.update([0]);
    hasher.update(command.session_token.as_deref().unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// Raw network query responses keyed by [`command_fingerprint`].
#[derive(Clone)]
pub struct QueryCache {
    bytes: Arc<dyn ByteStore>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache").finish_non_exhaustive()
    }
}

impl QueryCache {
    /// Creates a cache stored in `bytes`.
    pub fn new(bytes: Arc<dyn ByteStore>) -> Self {
        Self { bytes }
    }

    fn key(command: &RestCommand) -> String {
        format!("{CACHE_PREFIX}{}", command_fingerprint(command))
    }

    /// The cached response to `command`, if one younger than `max_age`
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be read or decoded.
    pub fn get(&self, command: &RestCommand, max_age: Duration) -> MooringResult<Option<Json>> {
        let key = Self::key(command);
        let Some(data) = self.bytes.read(&key)? else {
            return Ok(None);
        };
        let entry: CacheEntry = from_cbor_record(&data)?;
        let age = (Utc::now() - entry.saved_at).to_std().unwrap_or_default();
        if age > max_age {
            tracing::trace!(%key, ?age, "cached query result expired");
            return Ok(None);
        }
        let response = serde_json::from_str(&entry.response)
            .map_err(|e| {
                MooringError::persist_failed(format!("corrupt cached query result: {e}"))
            })?;
        Ok(Some(response))
    }

    /// Stores `response` as the result of `command`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn put(&self, command: &RestCommand, response: &Json) -> MooringResult<()> {
        let entry = CacheEntry {
            saved_at: Utc::now(),
            response: response.to_string(),
        };
        self.bytes
            .write(&Self::key(command), &to_cbor_record(&entry)?)?;
        Ok(())
    }

    /// Removes every cached result.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be deleted.
    pub fn clear(&self) -> MooringResult<usize> {
        let keys = self.bytes.list(CACHE_PREFIX)?;
        for key in &keys {
            self.bytes.delete(key)?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_core::QueryState;
    use mooring_storage::InMemoryStore;
    use serde_json::json;

    #[test]
    fn fingerprint_covers_session_and_constraints() {
        let query = QueryState::builder("Post").where_equal_to("a", 1).build();
        let other = QueryState::builder("Post").where_equal_to("a", 2).build();
        let find = RestCommand::find(&query, None);
        assert_eq!(
            command_fingerprint(&find),
            command_fingerprint(&RestCommand::find(&query, None)),
        );
        assert_ne!(
            command_fingerprint(&find),
            command_fingerprint(&RestCommand::find(&other, None)),
        );
        assert_ne!(
            command_fingerprint(&find),
            command_fingerprint(&RestCommand::find(&query, Some("r:1"))),
        );
        assert_ne!(
            command_fingerprint(&find),
            command_fingerprint(&RestCommand::count(&query, None)),
        );
        assert_eq!(command_fingerprint(&find).len(), 64);
    }

    #[test]
    fn cleared_entries_miss() {
        let cache = QueryCache::new(Arc::new(InMemoryStore::new()));
        let command = RestCommand::find(&QueryState::builder("Post").build(), None);
        cache.put(&command, &json!({"results": []})).unwrap();
        assert!(cache.get(&command, Duration::from_secs(60)).unwrap().is_some());
        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.get(&command, Duration::from_secs(60)).unwrap().is_none());
    }
}
