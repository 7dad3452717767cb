//! The current user and current installation.
//!
//! Each is a process-wide singleton mirrored in one byte-store record.
//! Concurrent [`CurrentController::get_async`] calls share a single disk
//! read; [`CurrentController::set_async`] calls run one at a time.

use crate::decode::{object_from_snapshot, snapshot_identity};
use futures::future::{BoxFuture, FutureExt, Shared};
use mooring_codec::{from_cbor_record, to_cbor_record, PointerDecoder, Value};
use mooring_core::{
    CommandExecutor, MooringConfig, MooringError, MooringResult, ObjectRegistry, ObjectState,
    RestCommand, SyncObject, INSTALLATION_CLASS, USER_CLASS,
};
use mooring_storage::ByteStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Byte-store key of the persisted installation id.
pub const INSTALLATION_ID_KEY: &str = "installation_id";

/// Selects which singleton a [`CurrentController`] manages.
pub trait CurrentKind: Send + Sync + 'static {
    /// Class of the managed object.
    const CLASS_NAME: &'static str;
    /// Byte-store key of the persisted record.
    const STORAGE_KEY: &'static str;
    /// Whether replacing the current object logs the old one out.
    const LOGS_OUT: bool;
}

/// The current user.
#[derive(Debug)]
pub struct UserKind;

impl CurrentKind for UserKind {
    const CLASS_NAME: &'static str = USER_CLASS;
    const STORAGE_KEY: &'static str = "current_user";
    const LOGS_OUT: bool = true;
}

/// The current installation.
#[derive(Debug)]
pub struct InstallationKind;

impl CurrentKind for InstallationKind {
    const CLASS_NAME: &'static str = INSTALLATION_CLASS;
    const STORAGE_KEY: &'static str = "current_installation";
    const LOGS_OUT: bool = false;
}

/// Current-user controller.
pub type CurrentUserController = CurrentController<UserKind>;

/// Current-installation controller.
pub type CurrentInstallationController = CurrentController<InstallationKind>;

#[derive(Debug, Serialize, Deserialize)]
struct StoredCurrent {
    /// Object snapshot, as JSON text.
    snapshot: String,
    lazy: bool,
}

#[derive(Debug, Clone)]
struct Loaded {
    object: Arc<SyncObject>,
    lazy: bool,
}

type SharedLoad = Shared<BoxFuture<'static, MooringResult<Option<Loaded>>>>;

#[derive(Default)]
struct Slot {
    current: Option<Arc<SyncObject>>,
    loaded: bool,
    lazy: bool,
    matches_disk: bool,
    /// Bumped by every set or clear; a disk read that finishes under an
    /// older generation is discarded.
    generation: u64,
    in_flight: Option<(u64, SharedLoad)>,
}

fn check(cancel: &CancellationToken) -> MooringResult<()> {
    if cancel.is_cancelled() {
        Err(MooringError::Cancelled)
    } else {
        Ok(())
    }
}

fn task_failed(e: tokio::task::JoinError) -> MooringError {
    MooringError::persist_failed(format!("current object task failed: {e}"))
}

fn read_record(
    bytes: &dyn ByteStore,
    registry: &ObjectRegistry,
    key: &str,
    class_name: &str,
) -> MooringResult<Option<Loaded>> {
    let Some(data) = bytes.read(key)? else {
        return Ok(None);
    };
    let stored: StoredCurrent = from_cbor_record(&data)?;
    let snapshot: Json = serde_json::from_str(&stored.snapshot)
        .map_err(|e| MooringError::persist_failed(format!("corrupt {key} record: {e}")))?;
    let object = if snapshot_identity(&snapshot).is_ok() {
        object_from_snapshot(registry, &snapshot)?
    } else {
        // Never saved and never referenced: no identity to register.
        let object = SyncObject::from_state(ObjectState::builder(class_name).build()?);
        object.merge_snapshot(&snapshot, &PointerDecoder)?;
        object
    };
    if object.class_name() != class_name {
        return Err(MooringError::persist_failed(format!(
            "{key} holds a {} object",
            object.class_name()
        )));
    }
    Ok(Some(Loaded {
        object,
        lazy: stored.lazy,
    }))
}

fn session_token(object: &SyncObject) -> Option<String> {
    object
        .estimated("sessionToken")
        .and_then(|v| v.as_text().map(str::to_string))
}

/// Memory and disk cache of one singleton object.
pub struct CurrentController<K: CurrentKind> {
    bytes: Arc<dyn ByteStore>,
    registry: Arc<ObjectRegistry>,
    executor: Arc<dyn CommandExecutor>,
    slot: Mutex<Slot>,
    task_lock: tokio::sync::Mutex<()>,
    device_type: String,
    time_zone: String,
    installation_id: Arc<Mutex<Option<String>>>,
    _kind: PhantomData<K>,
}

impl<K: CurrentKind> std::fmt::Debug for CurrentController<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("CurrentController")
            .field("class", &K::CLASS_NAME)
            .field("loaded", &slot.loaded)
            .field("matches_disk", &slot.matches_disk)
            .finish_non_exhaustive()
    }
}

impl<K: CurrentKind> CurrentController<K> {
    /// Creates a controller persisting to `bytes`. New installations take
    /// their device type and time zone from `config`.
    pub fn new(
        bytes: Arc<dyn ByteStore>,
        registry: Arc<ObjectRegistry>,
        executor: Arc<dyn CommandExecutor>,
        config: &MooringConfig,
    ) -> Self {
        Self {
            bytes,
            registry,
            executor,
            slot: Mutex::new(Slot::default()),
            task_lock: tokio::sync::Mutex::new(()),
            device_type: config.device_type.clone(),
            time_zone: config.time_zone.clone(),
            installation_id: Arc::new(Mutex::new(None)),
            _kind: PhantomData,
        }
    }

    fn load_from_disk(&self) -> BoxFuture<'static, MooringResult<Option<Loaded>>> {
        let bytes = Arc::clone(&self.bytes);
        let registry = Arc::clone(&self.registry);
        async move {
            tokio::task::spawn_blocking(move || {
                read_record(bytes.as_ref(), &registry, K::STORAGE_KEY, K::CLASS_NAME)
            })
            .await
            .map_err(task_failed)?
        }
        .boxed()
    }

    /// The current object, reading it from disk on first use.
    ///
    /// # Errors
    ///
    /// - [`MooringError::Cancelled`] if `cancel` fired before the disk read
    /// - an error if the record cannot be read or decoded
    pub async fn get_async(
        &self,
        cancel: &CancellationToken,
    ) -> MooringResult<Option<Arc<SyncObject>>> {
        let (generation, load) = {
            let mut slot = self.slot.lock();
            if slot.loaded {
                return Ok(slot.current.clone());
            }
            check(cancel)?;
            match &slot.in_flight {
                Some((generation, load)) => (*generation, load.clone()),
                None => {
                    let load = self.load_from_disk().shared();
                    slot.in_flight = Some((slot.generation, load.clone()));
                    (slot.generation, load)
                }
            }
        };

        let result = load.await;
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            // Replaced while reading; the newer state wins.
            if slot.loaded {
                return Ok(slot.current.clone());
            }
            return result.map(|loaded| loaded.map(|l| l.object));
        }
        slot.in_flight = None;
        let loaded = result?;
        slot.loaded = true;
        slot.matches_disk = true;
        slot.lazy = loaded.as_ref().is_some_and(|l| l.lazy);
        slot.current = loaded.map(|l| l.object);
        tracing::debug!(
            class = K::CLASS_NAME,
            found = slot.current.is_some(),
            "current object loaded from disk",
        );
        Ok(slot.current.clone())
    }

    /// Makes `object` current and persists it. The previous current object
    /// is logged out first when this kind logs out; failures there are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] if `cancel` fired first. A
    /// persistence failure is not an error: the object stays current and
    /// [`CurrentController::matches_disk`] reports `false`.
    pub async fn set_async(
        &self,
        object: Arc<SyncObject>,
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        self.install(object, false, cancel).await
    }

    async fn install(
        &self,
        object: Arc<SyncObject>,
        lazy: bool,
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        check(cancel)?;
        if object.class_name() != K::CLASS_NAME {
            return Err(MooringError::illegal_argument(format!(
                "expected a {} object, got {}",
                K::CLASS_NAME,
                object.class_name()
            )));
        }
        let _task = self.task_lock.lock().await;
        if K::LOGS_OUT {
            match self.get_async(cancel).await {
                Ok(Some(previous)) if !Arc::ptr_eq(&previous, &object) => {
                    self.log_out_entity(&previous, cancel).await;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(
                    class = K::CLASS_NAME,
                    error = %e,
                    "previous current object unreadable",
                ),
            }
        }
        check(cancel)?;

        let generation = {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            slot.in_flight = None;
            slot.current = Some(Arc::clone(&object));
            slot.loaded = true;
            slot.lazy = lazy;
            slot.matches_disk = false;
            slot.generation
        };

        let stored = self.persist(&object, lazy).await;
        let mut slot = self.slot.lock();
        if slot.generation == generation {
            slot.matches_disk = stored;
        }
        Ok(())
    }

    async fn persist(&self, object: &SyncObject, lazy: bool) -> bool {
        let stored = StoredCurrent {
            snapshot: object.to_snapshot().to_string(),
            lazy,
        };
        let bytes = Arc::clone(&self.bytes);
        let written = tokio::task::spawn_blocking(move || -> MooringResult<()> {
            bytes.write(K::STORAGE_KEY, &to_cbor_record(&stored)?)?;
            Ok(())
        })
        .await
        .map_err(task_failed)
        .and_then(|r| r);
        match written {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(class = K::CLASS_NAME, error = %e, "current object not persisted");
                false
            }
        }
    }

    async fn log_out_entity(&self, object: &SyncObject, cancel: &CancellationToken) {
        let Some(token) = session_token(object) else {
            return;
        };
        if let Err(e) = self.executor.execute(&RestCommand::log_out(&token), cancel).await {
            tracing::debug!(
                class = K::CLASS_NAME,
                error = %e,
                "log out of previous current object failed",
            );
        }
    }

    /// Whether a current object exists in memory or on disk.
    ///
    /// # Errors
    ///
    /// As [`CurrentController::get_async`].
    pub async fn exists_async(&self, cancel: &CancellationToken) -> MooringResult<bool> {
        Ok(self.get_async(cancel).await?.is_some())
    }

    /// Whether `object` is the in-memory current object.
    pub fn is_current(&self, object: &SyncObject) -> bool {
        self.slot
            .lock()
            .current
            .as_ref()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), object))
    }

    /// Whether the in-memory current object was lazily created.
    pub fn is_lazy(&self) -> bool {
        self.slot.lock().lazy
    }

    /// Forgets the in-memory copy; the next read goes to disk.
    pub fn clear_from_memory(&self) {
        let mut slot = self.slot.lock();
        let generation = slot.generation + 1;
        *slot = Slot {
            generation,
            ..Slot::default()
        };
    }

    /// Forgets the in-memory copy and deletes the persisted record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be deleted.
    pub async fn clear_from_disk(&self, cancel: &CancellationToken) -> MooringResult<()> {
        check(cancel)?;
        let _task = self.task_lock.lock().await;
        self.clear_from_memory();
        let bytes = Arc::clone(&self.bytes);
        tokio::task::spawn_blocking(move || bytes.delete(K::STORAGE_KEY))
            .await
            .map_err(task_failed)??;
        Ok(())
    }

    /// Whether the in-memory object is known to match the persisted record.
    pub fn matches_disk(&self) -> bool {
        self.slot.lock().matches_disk
    }
}

impl CurrentController<UserKind> {
    /// Session token of the current user.
    ///
    /// # Errors
    ///
    /// As [`CurrentController::get_async`].
    pub async fn get_current_session_token(
        &self,
        cancel: &CancellationToken,
    ) -> MooringResult<Option<String>> {
        Ok(self
            .get_async(cancel)
            .await?
            .and_then(|user| session_token(&user)))
    }

    /// Creates a user carrying `auth_data` under `auth_type` and makes it
    /// current before the backend has seen it.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] if `cancel` fired first.
    pub async fn lazy_log_in(
        &self,
        auth_type: &str,
        auth_data: Value,
        cancel: &CancellationToken,
    ) -> MooringResult<Arc<SyncObject>> {
        let user = SyncObject::new(USER_CLASS)?;
        user.put_internal("authData", Value::map([(auth_type, auth_data)]))?;
        self.install(Arc::clone(&user), true, cancel).await?;
        tracing::debug!(auth_type, "lazy user installed");
        Ok(user)
    }

    /// Logs the current user out: revokes its session (errors ignored),
    /// clears memory and deletes the persisted record.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] if `cancel` fired first.
    pub async fn log_out_async(&self, cancel: &CancellationToken) -> MooringResult<()> {
        check(cancel)?;
        let _task = self.task_lock.lock().await;
        let previous = match self.get_async(cancel).await {
            Ok(previous) => previous,
            Err(MooringError::Cancelled) => return Err(MooringError::Cancelled),
            Err(e) => {
                tracing::debug!(error = %e, "current user unreadable during log out");
                None
            }
        };
        let generation = {
            let mut slot = self.slot.lock();
            let generation = slot.generation + 1;
            *slot = Slot {
                generation,
                loaded: true,
                ..Slot::default()
            };
            generation
        };
        if let Some(previous) = previous {
            self.log_out_entity(&previous, cancel).await;
        }

        let bytes = Arc::clone(&self.bytes);
        let deleted = tokio::task::spawn_blocking(move || bytes.delete(UserKind::STORAGE_KEY))
            .await
            .map_err(task_failed)
            .and_then(|r| r.map_err(MooringError::from));
        let mut slot = self.slot.lock();
        match deleted {
            Ok(_) if slot.generation == generation => slot.matches_disk = true,
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "current user record not deleted"),
        }
        Ok(())
    }

    /// The current user, creating an anonymous lazy user when none exists
    /// and `auto_create` is set.
    ///
    /// # Errors
    ///
    /// As [`CurrentController::get_async`].
    pub async fn get_async_auto_create(
        &self,
        auto_create: bool,
        cancel: &CancellationToken,
    ) -> MooringResult<Option<Arc<SyncObject>>> {
        if let Some(user) = self.get_async(cancel).await? {
            return Ok(Some(user));
        }
        if !auto_create {
            return Ok(None);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let user = self
            .lazy_log_in("anonymous", Value::map([("id", Value::from(id))]), cancel)
            .await?;
        Ok(Some(user))
    }
}

impl CurrentController<InstallationKind> {
    /// The installation id, generated and persisted on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the id cannot be read or written.
    pub async fn installation_id(&self, cancel: &CancellationToken) -> MooringResult<String> {
        if let Some(id) = self.installation_id.lock().clone() {
            return Ok(id);
        }
        check(cancel)?;
        let bytes = Arc::clone(&self.bytes);
        let cached = Arc::clone(&self.installation_id);
        tokio::task::spawn_blocking(move || -> MooringResult<String> {
            let mut cached = cached.lock();
            if let Some(id) = cached.clone() {
                return Ok(id);
            }
            let stored = bytes
                .read(INSTALLATION_ID_KEY)?
                .and_then(|data| String::from_utf8(data).ok())
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty());
            let id = match stored {
                Some(id) => id,
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    bytes.write(INSTALLATION_ID_KEY, id.as_bytes())?;
                    tracing::debug!(installation_id = %id, "installation id created");
                    id
                }
            };
            *cached = Some(id.clone());
            Ok(id)
        })
        .await
        .map_err(task_failed)?
    }

    /// The current installation, creating one for this device when none
    /// exists.
    ///
    /// # Errors
    ///
    /// As [`CurrentController::get_async`] and
    /// [`CurrentController::installation_id`].
    pub async fn get_or_create_async(
        &self,
        cancel: &CancellationToken,
    ) -> MooringResult<Arc<SyncObject>> {
        if let Some(installation) = self.get_async(cancel).await? {
            return Ok(installation);
        }
        let id = self.installation_id(cancel).await?;
        let installation = SyncObject::new(INSTALLATION_CLASS)?;
        installation.put_internal("installationId", id)?;
        installation.put_internal("deviceType", self.device_type.clone())?;
        installation.put_internal("timeZone", self.time_zone.clone())?;
        self.set_async(Arc::clone(&installation), cancel).await?;
        Ok(installation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_core::ErrorKind;
    use mooring_storage::{InMemoryStore, StorageResult};
    use mooring_testkit::{CountingStore, FakeBackend};

    fn controller<K: CurrentKind>(
        bytes: Arc<dyn ByteStore>,
        backend: &Arc<FakeBackend>,
    ) -> CurrentController<K> {
        CurrentController::new(
            bytes,
            Arc::new(ObjectRegistry::new()),
            Arc::clone(backend) as Arc<dyn CommandExecutor>,
            &MooringConfig::default(),
        )
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_disk_read() {
        let counting = Arc::new(CountingStore::in_memory());
        let bytes: Arc<dyn ByteStore> = Arc::clone(&counting) as Arc<dyn ByteStore>;
        let backend = Arc::new(FakeBackend::new());
        let cancel = CancellationToken::new();

        let writer: CurrentUserController = controller(Arc::clone(&bytes), &backend);
        let user = SyncObject::new(USER_CLASS).unwrap();
        user.put("nickname", "ann").unwrap();
        writer.set_async(user, &cancel).await.unwrap();

        let reader: CurrentUserController = controller(bytes, &backend);
        counting.reset();
        let (a, b) = tokio::join!(reader.get_async(&cancel), reader.get_async(&cancel));
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counting.reads_of(UserKind::STORAGE_KEY), 1);
        assert_eq!(a.get("nickname").unwrap(), Some(Value::from("ann")));
        assert!(reader.matches_disk());
    }

    #[tokio::test]
    async fn set_logs_out_previous_user() {
        let backend = Arc::new(FakeBackend::new());
        let cancel = CancellationToken::new();
        let users: CurrentUserController = controller(Arc::new(InMemoryStore::new()), &backend);

        let first = SyncObject::new(USER_CLASS).unwrap();
        first.put_internal("sessionToken", "r:first").unwrap();
        users.set_async(Arc::clone(&first), &cancel).await.unwrap();
        assert_eq!(backend.command_count(), 0);

        let second = SyncObject::new(USER_CLASS).unwrap();
        users.set_async(Arc::clone(&second), &cancel).await.unwrap();
        let commands = backend.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].session_token.as_deref(), Some("r:first"));
        assert!(users.is_current(&second));
        assert!(!users.is_current(&first));
    }

    #[tokio::test]
    async fn failed_log_out_is_ignored() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_offline(true);
        let cancel = CancellationToken::new();
        let users: CurrentUserController = controller(Arc::new(InMemoryStore::new()), &backend);
        let first = SyncObject::new(USER_CLASS).unwrap();
        first.put_internal("sessionToken", "r:first").unwrap();
        users.set_async(first, &cancel).await.unwrap();
        let second = SyncObject::new(USER_CLASS).unwrap();
        users.set_async(Arc::clone(&second), &cancel).await.unwrap();
        assert!(users.is_current(&second));
    }

    #[tokio::test]
    async fn lazy_user_survives_reload() {
        let bytes: Arc<dyn ByteStore> = Arc::new(InMemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let cancel = CancellationToken::new();
        let users: CurrentUserController = controller(Arc::clone(&bytes), &backend);

        let user = users.get_async_auto_create(true, &cancel).await.unwrap().unwrap();
        assert!(users.is_lazy());
        assert!(users.is_current(&user));
        assert!(user.estimated("authData").is_some());

        let reloaded: CurrentUserController = controller(bytes, &backend);
        assert!(reloaded.get_async(&cancel).await.unwrap().is_some());
        assert!(reloaded.is_lazy());
    }

    #[tokio::test]
    async fn log_out_clears_disk() {
        let bytes: Arc<dyn ByteStore> = Arc::new(InMemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let cancel = CancellationToken::new();
        let users: CurrentUserController = controller(Arc::clone(&bytes), &backend);
        let user = SyncObject::new(USER_CLASS).unwrap();
        user.put_internal("sessionToken", "r:abc").unwrap();
        users.set_async(user, &cancel).await.unwrap();

        users.log_out_async(&cancel).await.unwrap();
        assert!(!users.exists_async(&cancel).await.unwrap());
        assert!(!bytes.exists(UserKind::STORAGE_KEY).unwrap());
        assert_eq!(backend.command_count(), 1);
    }

    #[tokio::test]
    async fn memory_and_disk_clear_separately() {
        let bytes: Arc<dyn ByteStore> = Arc::new(InMemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let cancel = CancellationToken::new();
        let users: CurrentUserController = controller(Arc::clone(&bytes), &backend);
        let user = SyncObject::new(USER_CLASS).unwrap();
        user.put("nickname", "ann").unwrap();
        users.set_async(Arc::clone(&user), &cancel).await.unwrap();

        users.clear_from_memory();
        assert!(!users.is_current(&user));
        let reloaded = users.get_async(&cancel).await.unwrap().unwrap();
        assert_eq!(reloaded.get("nickname").unwrap(), Some(Value::from("ann")));

        users.clear_from_disk(&cancel).await.unwrap();
        assert!(!bytes.exists(UserKind::STORAGE_KEY).unwrap());
        assert!(users.get_async(&cancel).await.unwrap().is_none());
        assert_eq!(backend.command_count(), 0);
    }

    /// Reads nothing, refuses every write.
    #[derive(Debug)]
    struct ReadOnlyStore;

    impl ByteStore for ReadOnlyStore {
        fn read(&self, _key: &str) -> StorageResult<Option<Vec<u8>>> {
            Ok(None)
        }
        fn write(&self, _key: &str, _data: &[u8]) -> StorageResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }
        fn exists(&self, _key: &str) -> StorageResult<bool> {
            Ok(false)
        }
        fn delete(&self, _key: &str) -> StorageResult<bool> {
            Ok(false)
        }
        fn list(&self, _prefix: &str) -> StorageResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn persist_failure_marks_disk_stale() {
        let backend = Arc::new(FakeBackend::new());
        let cancel = CancellationToken::new();
        let users: CurrentUserController = controller(Arc::new(ReadOnlyStore), &backend);
        let user = SyncObject::new(USER_CLASS).unwrap();
        users.set_async(Arc::clone(&user), &cancel).await.unwrap();
        assert!(users.is_current(&user));
        assert!(!users.matches_disk());
    }

    #[tokio::test]
    async fn cancelled_read_touches_nothing() {
        let counting = Arc::new(CountingStore::in_memory());
        let backend = Arc::new(FakeBackend::new());
        let users: CurrentUserController = controller(
            Arc::clone(&counting) as Arc<dyn ByteStore>,
            &backend,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = users.get_async(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(counting.reads_of(""), 0);
    }

    #[tokio::test]
    async fn installation_created_once() {
        let bytes: Arc<dyn ByteStore> = Arc::new(InMemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let cancel = CancellationToken::new();
        let installations: CurrentInstallationController = controller(Arc::clone(&bytes), &backend);

        let installation = installations.get_or_create_async(&cancel).await.unwrap();
        let id = installations.installation_id(&cancel).await.unwrap();
        assert_eq!(installation.get("installationId").unwrap(), Some(Value::from(id.clone())));
        assert_eq!(installation.get("deviceType").unwrap(), Some(Value::from("embedded")));
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let reloaded: CurrentInstallationController = controller(bytes, &backend);
        assert_eq!(reloaded.installation_id(&cancel).await.unwrap(), id);
        let again = reloaded.get_or_create_async(&cancel).await.unwrap();
        assert_eq!(again.get("installationId").unwrap(), Some(Value::from(id)));
    }
}
