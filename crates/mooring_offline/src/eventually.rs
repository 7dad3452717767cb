//! Saves and deletes queued while offline and replayed later.
//!
//! Each queued command is one record at `eventually/<seq>-<uuid>`. While a
//! record waits, the object it targets is pinned under
//! `_eventuallyPin_<uuid>` and every local id its command references is
//! retained in the ledger, so a restart can still resolve and send it.

use crate::decode::RegistryDecoder;
use crate::store::OfflineStore;
use mooring_codec::{from_cbor_record, to_cbor_record, ObjectKey, Pointer, PointerDecoder};
use mooring_core::{
    CommandExecutor, ErrorKind, LocalIdManager, MooringError, MooringResult, RestCommand,
    SyncObject,
};
use mooring_storage::ByteStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENTUALLY_PREFIX: &str = "eventually/";
const PIN_PREFIX: &str = "_eventuallyPin_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EntryKind {
    Save,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventuallyRecord {
    uuid: String,
    kind: EntryKind,
    command: RestCommand,
    class_name: String,
    object_id: Option<String>,
    local_id: Option<String>,
    operation_set: Option<String>,
    attempts: u32,
}

impl EventuallyRecord {
    fn pin_name(&self) -> String {
        format!("{PIN_PREFIX}{}", self.uuid)
    }

    fn pointer(&self) -> Option<Pointer> {
        let key = match (&self.object_id, &self.local_id) {
            (Some(id), _) => ObjectKey::ObjectId(id.clone()),
            (None, Some(id)) => ObjectKey::LocalId(id.clone()),
            (None, None) => return None,
        };
        Some(Pointer {
            class_name: self.class_name.clone(),
            key,
        })
    }
}

/// Outcome of one [`EventuallyQueue::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Commands the backend accepted.
    pub succeeded: usize,
    /// Commands dropped after a permanent failure or too many retries.
    pub dropped: usize,
    /// Commands still queued.
    pub pending: usize,
}

enum Outcome {
    Succeeded,
    Dropped,
    Retry,
}

/// The persistent queue of eventually-sent commands.
pub struct EventuallyQueue {
    bytes: Arc<dyn ByteStore>,
    store: Arc<OfflineStore>,
    ids: Arc<LocalIdManager>,
    executor: Arc<dyn CommandExecutor>,
    entries: Mutex<BTreeMap<String, EventuallyRecord>>,
    next_seq: Mutex<u64>,
    flushing: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for EventuallyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventuallyQueue")
            .field("pending", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl EventuallyQueue {
    /// Opens the queue stored in `bytes`, reloading queued records.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be read or decoded.
    pub fn open(
        bytes: Arc<dyn ByteStore>,
        store: Arc<OfflineStore>,
        ids: Arc<LocalIdManager>,
        executor: Arc<dyn CommandExecutor>,
    ) -> MooringResult<Self> {
        let mut entries = BTreeMap::new();
        let mut next_seq = 0;
        for key in bytes.list(EVENTUALLY_PREFIX)? {
            let Some(data) = bytes.read(&key)? else {
                continue;
            };
            let record: EventuallyRecord = from_cbor_record(&data)?;
            let seq = key[EVENTUALLY_PREFIX.len()..]
                .split('-')
                .next()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            next_seq = next_seq.max(seq + 1);
            entries.insert(key, record);
        }
        if !entries.is_empty() {
            tracing::debug!(pending = entries.len(), "eventually queue reloaded");
        }
        Ok(Self {
            bytes,
            store,
            ids,
            executor,
            entries: Mutex::new(entries),
            next_seq: Mutex::new(next_seq),
            flushing: tokio::sync::Mutex::new(()),
        })
    }

    /// Number of queued commands.
    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }

    fn next_key(&self, uuid: &str) -> String {
        let mut next = self.next_seq.lock();
        let seq = *next;
        *next += 1;
        format!("{EVENTUALLY_PREFIX}{seq:020}-{uuid}")
    }

    async fn enqueue(
        &self,
        object: &Arc<SyncObject>,
        kind: EntryKind,
        command: RestCommand,
        operation_set: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> MooringResult<String> {
        let uuid = Uuid::new_v4().to_string();
        let record = EventuallyRecord {
            uuid: uuid.clone(),
            kind,
            command,
            class_name: object.class_name().to_string(),
            object_id: object.object_id(),
            local_id: object.local_id(),
            operation_set: operation_set.map(|u| u.to_string()),
            attempts: 0,
        };
        record.command.retain_local_ids(&self.ids)?;
        let queued = async {
            self.store
                .pin_objects(&record.pin_name(), std::slice::from_ref(object), cancel)
                .await?;
            let key = self.next_key(&uuid);
            self.bytes.write(&key, &to_cbor_record(&record)?)?;
            Ok::<_, MooringError>(key)
        }
        .await;
        match queued {
            Ok(key) => {
                tracing::debug!(
                    kind = ?record.kind,
                    class = %record.class_name,
                    entry = %uuid,
                    "command queued",
                );
                self.entries.lock().insert(key, record);
                Ok(uuid)
            }
            Err(e) => {
                record.command.release_local_ids(&self.ids)?;
                Err(e)
            }
        }
    }

    /// Starts a save of `object` and queues it. Returns the queue entry id.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error. On error
    /// the dispatched operations are merged back into the object.
    pub async fn save_eventually(
        &self,
        object: &Arc<SyncObject>,
        session_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> MooringResult<String> {
        let datastore = self.store.datastore();
        datastore.registry().assign_local_id(object, &self.ids)?;
        let save = object.start_save();
        let command = RestCommand::save_object(object.class_name(), &save, session_token);
        let result = self
            .enqueue(object, EntryKind::Save, command, Some(save.operations.uuid()), cancel)
            .await;
        if result.is_err() {
            object.handle_save_result(save.seq, None, &PointerDecoder)?;
        }
        result
    }

    /// Queues a delete of `object`. Returns the queue entry id.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn delete_eventually(
        &self,
        object: &Arc<SyncObject>,
        session_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> MooringResult<String> {
        let datastore = self.store.datastore();
        let pointer = datastore.registry().assign_local_id(object, &self.ids)?;
        let command = RestCommand::delete_object(&pointer, session_token);
        object.begin_delete_eventually();
        let result = self.enqueue(object, EntryKind::Delete, command, None, cancel).await;
        if result.is_err() {
            object.finish_delete_eventually();
        }
        result
    }

    /// Sends queued commands in enqueue order.
    ///
    /// A connection failure stops the flush and leaves the command queued,
    /// its operations still pending on the object, for the next flush. Any
    /// other failure drops the command; a dropped save's operations stay on
    /// the object.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn flush(&self, cancel: &CancellationToken) -> MooringResult<FlushSummary> {
        let _flushing = self.flushing.lock().await;
        let mut summary = FlushSummary::default();
        let queued: Vec<(String, EventuallyRecord)> = self
            .entries
            .lock()
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        for (key, record) in queued {
            if cancel.is_cancelled() {
                return Err(MooringError::Cancelled);
            }
            match self.replay(&key, record, cancel).await? {
                Outcome::Succeeded => summary.succeeded += 1,
                Outcome::Dropped => summary.dropped += 1,
                Outcome::Retry => break,
            }
        }
        summary.pending = self.pending_count();
        tracing::debug!(
            succeeded = summary.succeeded,
            dropped = summary.dropped,
            pending = summary.pending,
            "eventually queue flushed"
        );
        Ok(summary)
    }

    async fn replay(
        &self,
        key: &str,
        mut record: EventuallyRecord,
        cancel: &CancellationToken,
    ) -> MooringResult<Outcome> {
        let object = match record.pointer() {
            Some(pointer) => match self.store.fetch_pointer(&pointer, cancel).await {
                Ok(object) => Some(object),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        let Some(object) = object else {
            tracing::warn!(entry = %record.uuid, "queued object is gone; dropping command");
            self.finish(key, &record, None, cancel).await?;
            return Ok(Outcome::Dropped);
        };

        let mut pending = None;
        let mut command = match record.kind {
            EntryKind::Save => {
                let set = record
                    .operation_set
                    .as_deref()
                    .and_then(|u| Uuid::parse_str(u).ok());
                match set.and_then(|u| object.dispatch(u)) {
                    Some(save) => {
                        let command = RestCommand::save_object(
                            object.class_name(),
                            &save,
                            record.command.session_token.as_deref(),
                        );
                        pending = Some(save);
                        command
                    }
                    None => {
                        // Settled some other way, e.g. reverted.
                        self.finish(key, &record, Some(&object), cancel).await?;
                        return Ok(Outcome::Dropped);
                    }
                }
            }
            EntryKind::Delete => record.command.clone(),
        };

        let sent = match command.resolve_local_ids(&self.ids) {
            Ok(()) => self.executor.execute(&command, cancel).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(response) => {
                match (&record.kind, pending) {
                    (EntryKind::Save, Some(save)) => {
                        let decoder = RegistryDecoder::new(self.store.datastore().registry());
                        object.handle_save_result(save.seq, response.as_object(), &decoder)?;
                        if save.object_id.is_none() {
                            if let Some(new_id) = object.object_id() {
                                if let Some(local) = object.local_id() {
                                    self.ids.set_object_id(&local, &new_id)?;
                                }
                                self.store.update_object_id(&object, None, &new_id, cancel).await?;
                            }
                        }
                    }
                    _ => {
                        object.handle_delete_result(true);
                        object.finish_delete_eventually();
                        self.store.delete_locally(&object, cancel).await?;
                    }
                }
                self.finish(key, &record, Some(&object), cancel).await?;
                Ok(Outcome::Succeeded)
            }
            Err(e) if e.is_transient() => {
                record.attempts += 1;
                tracing::debug!(
                    entry = %record.uuid,
                    attempts = record.attempts,
                    error = %e,
                    "backend unreachable; keeping command",
                );
                self.bytes.write(key, &to_cbor_record(&record)?)?;
                self.entries.lock().insert(key.to_string(), record);
                Ok(Outcome::Retry)
            }
            Err(e) => {
                tracing::warn!(
                    entry = %record.uuid,
                    error = %e,
                    "queued command failed; dropping it",
                );
                match pending {
                    Some(save) => object.handle_save_result(save.seq, None, &PointerDecoder)?,
                    None => object.finish_delete_eventually(),
                }
                self.finish(key, &record, Some(&object), cancel).await?;
                Ok(Outcome::Dropped)
            }
        }
    }

    /// Releases a record's local ids and pin, and deletes the record.
    async fn finish(
        &self,
        key: &str,
        record: &EventuallyRecord,
        object: Option<&Arc<SyncObject>>,
        cancel: &CancellationToken,
    ) -> MooringResult<()> {
        if let Some(object) = object {
            self.store.refresh(object, cancel).await?;
        }
        self.store.unpin_all(&record.pin_name(), cancel).await?;
        record.command.release_local_ids(&self.ids)?;
        self.bytes.delete(key)?;
        self.entries.lock().remove(key);
        Ok(())
    }

    /// Drops every queued command without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::Cancelled`] or a persistence error.
    pub async fn clear(&self, cancel: &CancellationToken) -> MooringResult<()> {
        let _flushing = self.flushing.lock().await;
        let queued: Vec<(String, EventuallyRecord)> = self
            .entries
            .lock()
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        for (key, record) in &queued {
            self.finish(key, record, None, cancel).await?;
        }
        tracing::debug!(dropped = queued.len(), "eventually queue cleared");
        Ok(())
    }
}
