//! The application context: every controller, built once.

use crate::cache::QueryCache;
use crate::controller::QueryController;
use crate::current::{CurrentInstallationController, CurrentUserController};
use crate::datastore::{LocalDatastore, DEFAULT_PIN};
use crate::default_acl::DefaultAclController;
use crate::eventually::{EventuallyQueue, FlushSummary};
use crate::store::OfflineStore;
use mooring_core::{
    AccessContext, CommandExecutor, LocalIdManager, MooringConfig, MooringError, MooringResult,
    ObjectRegistry, QueryState, SyncObject,
};
use mooring_storage::{ByteStore, FileStore, InMemoryStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything an application needs, wired to one byte store and one
/// backend.
///
/// # Example
///
/// ```rust,ignore
/// use mooring_offline::MooringContext;
/// use mooring_core::{MooringConfig, QueryState};
///
/// let config = MooringConfig::new()
///     .storage_root("app-data")
///     .local_datastore_enabled(true);
/// let context = MooringContext::open(config, executor)?;
///
/// let query = QueryState::builder("GameScore").from_local_datastore().build();
/// let scores = context.find(&query, &cancel).await?;
/// ```
pub struct MooringContext {
    config: MooringConfig,
    bytes: Arc<dyn ByteStore>,
    registry: Arc<ObjectRegistry>,
    local_ids: Arc<LocalIdManager>,
    store: Arc<OfflineStore>,
    eventually: EventuallyQueue,
    queries: QueryController,
    current_user: CurrentUserController,
    current_installation: CurrentInstallationController,
    default_acl: DefaultAclController,
}

impl std::fmt::Debug for MooringContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MooringContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MooringContext {
    /// Opens the context. State lives under `config.storage_root`, or in
    /// memory when no root is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be opened or persisted
    /// state cannot be loaded.
    pub fn open(config: MooringConfig, executor: Arc<dyn CommandExecutor>) -> MooringResult<Self> {
        let bytes: Arc<dyn ByteStore> = match &config.storage_root {
            Some(root) => Arc::new(FileStore::open(root)?),
            None => Arc::new(InMemoryStore::new()),
        };
        Self::with_store(config, bytes, executor)
    }

    /// Opens the context over an existing byte store.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be loaded.
    pub fn with_store(
        config: MooringConfig,
        bytes: Arc<dyn ByteStore>,
        executor: Arc<dyn CommandExecutor>,
    ) -> MooringResult<Self> {
        let registry = Arc::new(ObjectRegistry::new());
        let local_ids = Arc::new(LocalIdManager::new(Arc::clone(&bytes)));
        let datastore = LocalDatastore::open(
            Arc::clone(&bytes),
            Arc::clone(&registry),
            Arc::clone(&local_ids),
        )?;
        let store = Arc::new(OfflineStore::new(Arc::new(datastore)));
        let eventually = EventuallyQueue::open(
            Arc::clone(&bytes),
            Arc::clone(&store),
            Arc::clone(&local_ids),
            Arc::clone(&executor),
        )?;
        let queries = QueryController::new(
            Arc::clone(&executor),
            Arc::clone(&store),
            QueryCache::new(Arc::clone(&bytes)),
            config.query_cache_max_age,
        );
        let current_user = CurrentUserController::new(
            Arc::clone(&bytes),
            Arc::clone(&registry),
            Arc::clone(&executor),
            &config,
        );
        let current_installation = CurrentInstallationController::new(
            Arc::clone(&bytes),
            Arc::clone(&registry),
            executor,
            &config,
        );
        tracing::debug!(
            persistent = config.storage_root.is_some(),
            local_datastore = config.local_datastore_enabled,
            "context opened"
        );
        Ok(Self {
            config,
            bytes,
            registry,
            local_ids,
            store,
            eventually,
            queries,
            current_user,
            current_installation,
            default_acl: DefaultAclController::new(),
        })
    }

    /// The configuration the context was opened with.
    pub fn config(&self) -> &MooringConfig {
        &self.config
    }

    /// The byte store holding persisted state.
    pub fn bytes(&self) -> &Arc<dyn ByteStore> {
        &self.bytes
    }

    /// Live objects by identity.
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// The local identity ledger.
    pub fn local_ids(&self) -> &Arc<LocalIdManager> {
        &self.local_ids
    }

    /// The local datastore.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] when the local datastore is
    /// disabled.
    pub fn offline_store(&self) -> MooringResult<&Arc<OfflineStore>> {
        if self.config.local_datastore_enabled {
            Ok(&self.store)
        } else {
            Err(MooringError::illegal_state("Method requires Local Datastore."))
        }
    }

    /// The queue of offline saves and deletes.
    pub fn eventually(&self) -> &EventuallyQueue {
        &self.eventually
    }

    /// The query controller.
    pub fn queries(&self) -> &QueryController {
        &self.queries
    }

    /// The current user.
    pub fn current_user(&self) -> &CurrentUserController {
        &self.current_user
    }

    /// The current installation.
    pub fn current_installation(&self) -> &CurrentInstallationController {
        &self.current_installation
    }

    /// The default ACL for new objects.
    pub fn default_acl(&self) -> &DefaultAclController {
        &self.default_acl
    }

    async fn user(&self, cancel: &CancellationToken) -> MooringResult<Option<Arc<SyncObject>>> {
        self.current_user
            .get_async_auto_create(self.config.auto_create_anonymous_user, cancel)
            .await
    }

    /// Who local queries evaluate ACLs as: the current user, if any.
    ///
    /// # Errors
    ///
    /// As [`CurrentUserController::get_async`].
    pub async fn access_context(&self, cancel: &CancellationToken) -> MooringResult<AccessContext> {
        Ok(match self.user(cancel).await?.and_then(|user| user.key()) {
            Some(key) => AccessContext::for_user(key),
            None => AccessContext::anonymous(),
        })
    }

    /// Creates an object of `class_name` carrying the default ACL.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid class name or if the current user
    /// cannot be read.
    pub async fn create_object(
        &self,
        class_name: &str,
        cancel: &CancellationToken,
    ) -> MooringResult<Arc<SyncObject>> {
        let object = SyncObject::new(class_name)?;
        let user = self.user(cancel).await?;
        if let Some(acl) = self.default_acl.get(user.as_ref()) {
            object.set_acl(&acl)?;
        }
        Ok(object)
    }

    /// Objects matching `query`, as the current user.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] for a local query with the
    /// local datastore disabled, otherwise as [`QueryController::find`].
    pub async fn find(
        &self,
        query: &QueryState,
        cancel: &CancellationToken,
    ) -> MooringResult<Vec<Arc<SyncObject>>> {
        self.require_local(query)?;
        let access = self.access_context(cancel).await?;
        let token = self.current_user.get_current_session_token(cancel).await?;
        self.queries.find(query, token.as_deref(), &access, cancel).await
    }

    /// Number of objects matching `query`.
    ///
    /// # Errors
    ///
    /// As [`MooringContext::find`].
    pub async fn count(
        &self,
        query: &QueryState,
        cancel: &CancellationToken,
    ) -> MooringResult<usize> {
        self.require_local(query)?;
        let access = self.access_context(cancel).await?;
        let token = self.current_user.get_current_session_token(cancel).await?;
        self.queries.count(query, token.as_deref(), &access, cancel).await
    }

    /// The first object matching `query`.
    ///
    /// # Errors
    ///
    /// As [`MooringContext::find`], or [`MooringError::NotFound`].
    pub async fn get_first(
        &self,
        query: &QueryState,
        cancel: &CancellationToken,
    ) -> MooringResult<Arc<SyncObject>> {
        self.require_local(query)?;
        let access = self.access_context(cancel).await?;
        let token = self.current_user.get_current_session_token(cancel).await?;
        self.queries.get_first(query, token.as_deref(), &access, cancel).await
    }

    fn require_local(&self, query: &QueryState) -> MooringResult<()> {
        if query.is_from_local_datastore() {
            self.offline_store()?;
        }
        Ok(())
    }

    /// Pins `objects` and everything they reach under `name`, or under the
    /// default pin.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] with the local datastore
    /// disabled, or a persistence error.
    pub async fn pin_all(
        &self,
        name: Option<&str>,
        objects: &[Arc<SyncObject>],
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        self.offline_store()?
            .pin_objects(name.unwrap_or(DEFAULT_PIN), objects, cancel)
            .await
    }

    /// Removes `objects` from the pin `name`, or from the default pin.
    ///
    /// # Errors
    ///
    /// As [`MooringContext::pin_all`].
    pub async fn unpin_all(
        &self,
        name: Option<&str>,
        objects: &[Arc<SyncObject>],
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        self.offline_store()?
            .unpin_objects(name.unwrap_or(DEFAULT_PIN), objects, cancel)
            .await
    }

    async fn require_write_access(
        &self,
        object: &SyncObject,
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        if self.access_context(cancel).await?.can_write(object) {
            Ok(())
        } else {
            Err(MooringError::illegal_state(format!(
                "the current user has no write access to this {} object",
                object.class_name()
            )))
        }
    }

    /// Queues a save of `object` to run when the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] if the object's ACL denies the
    /// current user write access, otherwise as
    /// [`EventuallyQueue::save_eventually`].
    pub async fn save_eventually(
        &self,
        object: &Arc<SyncObject>,
        cancel: &CancellationToken,
    ) -> MooringResult<String> {
        self.require_write_access(object, cancel).await?;
        let token = self.current_user.get_current_session_token(cancel).await?;
        self.eventually.save_eventually(object, token.as_deref(), cancel).await
    }

    /// Queues a delete of `object` to run when the backend is reachable.
    ///
    /// # Errors
    ///
    /// As [`MooringContext::save_eventually`], with
    /// [`EventuallyQueue::delete_eventually`].
    pub async fn delete_eventually(
        &self,
        object: &Arc<SyncObject>,
        cancel: &CancellationToken,
    ) -> MooringResult<String> {
        self.require_write_access(object, cancel).await?;
        let token = self.current_user.get_current_session_token(cancel).await?;
        self.eventually.delete_eventually(object, token.as_deref(), cancel).await
    }

    /// Sends queued saves and deletes.
    ///
    /// # Errors
    ///
    /// As [`EventuallyQueue::flush`].
    pub async fn flush_eventually(
        &self,
        cancel: &CancellationToken,
    ) -> MooringResult<FlushSummary> {
        self.eventually.flush(cancel).await
    }

    /// Drops cached query results. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be deleted.
    pub fn clear_query_cache(&self) -> MooringResult<usize> {
        self.queries.cache().clear()
    }
}
