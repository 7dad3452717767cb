//! Async access to the local datastore.
//!
//! Every operation checks its cancellation token, then runs the blocking
//! datastore work on tokio's blocking pool. Work on one identity is
//! serialized through a per-identity async lock; unrelated identities run
//! concurrently.

use crate::datastore::{LocalDatastore, RowSummary};
use crate::query::OfflineQueryEngine;
use mooring_codec::Pointer;
use mooring_core::{AccessContext, MooringError, MooringResult, QueryState, SyncObject};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

/// Async locks keyed by object identity.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentityLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks every key in `keys`, in sorted order so overlapping callers
    /// cannot deadlock.
    pub async fn lock_all(&self, keys: BTreeSet<String>) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = {
                let mut locks = self.locks.lock();
                // Entries nobody holds or waits on can go.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
                Arc::clone(locks.entry(key).or_default())
            };
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Number of identities currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no identity is locked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn identity_key(object: &SyncObject) -> String {
    match object.pointer() {
        Some(pointer) => format!("{}/{}", pointer.class_name, pointer.key.as_str()),
        // Not yet identified: only this handle can name it.
        None => format!("{}/@{:p}", object.class_name(), object),
    }
}

fn check(cancel: &CancellationToken) -> MooringResult<()> {
    if cancel.is_cancelled() {
        Err(MooringError::Cancelled)
    } else {
        Ok(())
    }
}

/// The async facade over a [`LocalDatastore`].
#[derive(Debug)]
pub struct OfflineStore {
    datastore: Arc<LocalDatastore>,
    locks: IdentityLocks,
}

impl OfflineStore {
    /// Wraps `datastore`.
    pub fn new(datastore: Arc<LocalDatastore>) -> Self {
        Self {
            datastore,
            locks: IdentityLocks::new(),
        }
    }

    /// The synchronous datastore underneath.
    pub fn datastore(&self) -> &Arc<LocalDatastore> {
        &self.datastore
    }

    async fn run<T, F>(&self, cancel: &CancellationToken, work: F) -> MooringResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&LocalDatastore) -> MooringResult<T> + Send + 'static,
    {
        check(cancel)?;
        let datastore = Arc::clone(&self.datastore);
        tokio::task::spawn_blocking(move || work(&datastore))
            .await
            .map_err(|e| MooringError::persist_failed(format!("datastore task failed: {e}")))?
    }

    async fn locked<T, F>(
        &self,
        keys: BTreeSet<String>,
        cancel: &CancellationToken,
        work: F,
    ) -> MooringResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&LocalDatastore) -> MooringResult<T> + Send + 'static,
    {
        check(cancel)?;
        let _guards = self.locks.lock_all(keys).await;
        self.run(cancel, work).await
    }

    /// Loads `object`'s stored state into the same handle.
    ///
    /// # Errors
    ///
    /// - [`MooringError::Cancelled`] if `cancel` fired first
    /// - [`MooringError::NotFound`] if the object has no row
    pub async fn fetch_locally(
        &self,
        object: &Arc<SyncObject>,
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        let keys = BTreeSet::from([identity_key(object)]);
        let object = Arc::clone(object);
        self.locked(keys, cancel, move |store| store.fetch_locally(&object))
            .await
    }

    /// Loads the object `pointer` names from its row.
    ///
    /// # Errors
    ///
    /// As [`OfflineStore::fetch_locally`].
    pub async fn fetch_pointer(
        &self,
        pointer: &Pointer,
        cancel: &CancellationToken,
    ) -> MooringResult<Arc<SyncObject>> {
        let keys = BTreeSet::from([format!("{}/{}", pointer.class_name, pointer.key.as_str())]);
        let pointer = pointer.clone();
        self.locked(keys, cancel, move |store| {
            let object = store
                .resolve(&pointer)?
                .ok_or_else(|| {
                    MooringError::not_found("This object is not available in the offline cache.")
                })?;
            if !object.is_data_available() {
                store.fetch_locally(&object)?;
            }
            Ok(object)
        })
        .await
    }

    /// Pins `objects` under `name` with their reachable graph.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn pin_objects(
        &self,
        name: &str,
        objects: &[Arc<SyncObject>],
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        let mut keys: BTreeSet<String> = objects.iter().map(|o| identity_key(o)).collect();
        keys.insert(format!("_Pin/{name}"));
        let name = name.to_string();
        let objects = objects.to_vec();
        self.locked(keys, cancel, move |store| store.pin_objects(&name, &objects))
            .await
    }

    /// Removes `objects` from the pin `name`.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn unpin_objects(
        &self,
        name: &str,
        objects: &[Arc<SyncObject>],
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        let mut keys: BTreeSet<String> = objects.iter().map(|o| identity_key(o)).collect();
        keys.insert(format!("_Pin/{name}"));
        let name = name.to_string();
        let objects = objects.to_vec();
        self.locked(keys, cancel, move |store| store.unpin_objects(&name, &objects))
            .await
    }

    /// Removes the pin `name`.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn unpin_all(&self, name: &str, cancel: &CancellationToken) -> MooringResult<()> {
        let keys = BTreeSet::from([format!("_Pin/{name}")]);
        let name = name.to_string();
        self.locked(keys, cancel, move |store| store.unpin_all(&name))
            .await
    }

    /// Saves `object` and its reachable graph without pinning.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn save_locally(
        &self,
        object: &Arc<SyncObject>,
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        let keys = BTreeSet::from([identity_key(object)]);
        let object = Arc::clone(object);
        self.locked(keys, cancel, move |store| store.save_locally(&object))
            .await
    }

    /// Rewrites `object`'s row, if it has one, from its in-memory state.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn refresh(
        &self,
        object: &Arc<SyncObject>,
        cancel: &CancellationToken,
    ) -> MooringResult<bool> {
        let keys = BTreeSet::from([identity_key(object)]);
        let object = Arc::clone(object);
        self.locked(keys, cancel, move |store| store.refresh(&object))
            .await
    }

    /// Deletes `object`'s row.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn delete_locally(
        &self,
        object: &Arc<SyncObject>,
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        let keys = BTreeSet::from([identity_key(object)]);
        let object = Arc::clone(object);
        self.locked(keys, cancel, move |store| store.delete_locally(&object))
            .await
    }

    /// Records the server id `new_id` that `object` just received.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] for a changed id.
    pub async fn update_object_id(
        &self,
        object: &Arc<SyncObject>,
        old_id: Option<String>,
        new_id: &str,
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        let mut keys = BTreeSet::from([identity_key(object)]);
        if let Some(local) = object.local_id() {
            keys.insert(format!("{}/{local}", object.class_name()));
        }
        let object = Arc::clone(object);
        let new_id = new_id.to_string();
        self.locked(keys, cancel, move |store| {
            store.update_object_id(&object, old_id.as_deref(), &new_id)
        })
        .await
    }

    /// Runs `query` against the local datastore as `access`.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a query evaluation error.
    pub async fn find(
        &self,
        query: &QueryState,
        access: &AccessContext,
        cancel: &CancellationToken,
    ) -> MooringResult<Vec<Arc<SyncObject>>> {
        let query = query.clone();
        let access = access.clone();
        self.run(cancel, move |store| OfflineQueryEngine::new(store, &access).find(&query))
            .await
    }

    /// Counts matches of `query` in the local datastore.
    ///
    /// # Errors
    ///
    /// As [`OfflineStore::find`].
    pub async fn count(
        &self,
        query: &QueryState,
        access: &AccessContext,
        cancel: &CancellationToken,
    ) -> MooringResult<usize> {
        let query = query.clone();
        let access = access.clone();
        self.run(cancel, move |store| OfflineQueryEngine::new(store, &access).count(&query))
            .await
    }

    /// Every stored row.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`].
    pub async fn rows(&self, cancel: &CancellationToken) -> MooringResult<Vec<RowSummary>> {
        self.run(cancel, |store| Ok(store.rows())).await
    }

    /// Deletes every row.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn clear_all(&self, cancel: &CancellationToken) -> MooringResult<()> {
        self.run(cancel, LocalDatastore::clear_all).await
    }
}
