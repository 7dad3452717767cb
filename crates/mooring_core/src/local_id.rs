//! Temporary identities for objects created before the server knows them.
//!
//! The ledger is authoritative on disk: every mutating call rewrites the
//! entry for its id before returning, so a crash never loses the mapping a
//! queued command still depends on.

use crate::error::{MooringError, MooringResult};
use mooring_codec::{from_cbor_record, to_cbor_record};
use mooring_storage::ByteStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const LEDGER_PREFIX: &str = "local_ids/";
const LOCAL_ID_PREFIX: &str = "local_";

/// One ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdEntry {
    /// How many queued commands depend on the id.
    pub retain_count: u64,
    /// The server id, once resolved.
    pub object_id: Option<String>,
}

/// Returns whether `id` has the shape of a local id: `local_` followed by
/// 16 lowercase hex digits.
pub fn is_local_id(id: &str) -> bool {
    id.strip_prefix(LOCAL_ID_PREFIX).is_some_and(|hex| {
        hex.len() == 16 && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    })
}

/// Issues local ids and tracks their retain counts and resolutions.
pub struct LocalIdManager {
    store: Arc<dyn ByteStore>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for LocalIdManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdManager").finish_non_exhaustive()
    }
}

impl LocalIdManager {
    /// Creates a manager persisting its ledger in `store`.
    pub fn new(store: Arc<dyn ByteStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    fn ledger_key(id: &str) -> MooringResult<String> {
        if !is_local_id(id) {
            return Err(MooringError::illegal_argument(format!(
                "Tried to get invalid local id: \"{id}\"."
            )));
        }
        Ok(format!("{LEDGER_PREFIX}{id}"))
    }

    fn read_entry(&self, id: &str) -> MooringResult<Option<LocalIdEntry>> {
        let key = Self::ledger_key(id)?;
        match self.store.read(&key)? {
            Some(bytes) => Ok(Some(from_cbor_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_entry(&self, id: &str, entry: &LocalIdEntry) -> MooringResult<()> {
        let key = Self::ledger_key(id)?;
        self.store.write(&key, &to_cbor_record(entry)?)?;
        Ok(())
    }

    /// Allocates a new id and persists its zero-count entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be written.
    pub fn create_local_id(&self) -> MooringResult<String> {
        let _guard = self.lock.lock();
        loop {
            let id = format!("{LOCAL_ID_PREFIX}{:016x}", rand::random::<u64>());
            if self.read_entry(&id)?.is_none() {
                self.write_entry(&id, &LocalIdEntry::default())?;
                tracing::debug!(local_id = %id, "local id created");
                return Ok(id);
            }
        }
    }

    /// Increments the retain count of `id`, creating the entry if needed.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed id or a ledger write failure.
    pub fn retain_local_id_on_disk(&self, id: &str) -> MooringResult<()> {
        let _guard = self.lock.lock();
        let mut entry = self.read_entry(id)?.unwrap_or_default();
        entry.retain_count += 1;
        self.write_entry(id, &entry)
    }

    /// Decrements the retain count of `id`. The count never drops below
    /// zero; an entry with no dependents and no resolution is removed.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed id or a ledger write failure.
    pub fn release_local_id_on_disk(&self, id: &str) -> MooringResult<()> {
        let _guard = self.lock.lock();
        let mut entry = self.read_entry(id)?.unwrap_or_default();
        entry.retain_count = entry.retain_count.saturating_sub(1);
        if entry.retain_count == 0 && entry.object_id.is_none() {
            self.store.delete(&Self::ledger_key(id)?)?;
            tracing::debug!(local_id = %id, "local id released");
            Ok(())
        } else {
            self.write_entry(id, &entry)
        }
    }

    /// Records the server id for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalState`] if `id` already resolved to a
    /// different server id.
    pub fn set_object_id(&self, id: &str, object_id: &str) -> MooringResult<()> {
        let _guard = self.lock.lock();
        let mut entry = self.read_entry(id)?.unwrap_or_default();
        match &entry.object_id {
            Some(existing) if existing == object_id => return Ok(()),
            Some(existing) => {
                return Err(MooringError::illegal_state(format!(
                    "Tried to set objectId {object_id} for local id {id}, \
                     which already has {existing}."
                )))
            }
            None => entry.object_id = Some(object_id.to_string()),
        }
        self.write_entry(id, &entry)?;
        tracing::debug!(local_id = %id, object_id, "local id resolved");
        Ok(())
    }

    /// Returns the server id for `id`, if resolved.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed id or a ledger read failure.
    pub fn get_object_id(&self, id: &str) -> MooringResult<Option<String>> {
        Ok(self.read_entry(id)?.and_then(|entry| entry.object_id))
    }

    /// Returns the retain count of `id` (zero when unknown).
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed id or a ledger read failure.
    pub fn retain_count(&self, id: &str) -> MooringResult<u64> {
        Ok(self.read_entry(id)?.map_or(0, |entry| entry.retain_count))
    }

    /// Lists every ledger entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn entries(&self) -> MooringResult<Vec<(String, LocalIdEntry)>> {
        let _guard = self.lock.lock();
        let mut entries = Vec::new();
        for key in self.store.list(LEDGER_PREFIX)? {
            let id = &key[LEDGER_PREFIX.len()..];
            if let Some(entry) = self.read_entry(id)? {
                entries.push((id.to_string(), entry));
            }
        }
        Ok(entries)
    }

    /// Wipes the ledger. Returns `false`, deleting nothing, while any id is
    /// still retained.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or deleted.
    pub fn clear(&self) -> MooringResult<bool> {
        let _guard = self.lock.lock();
        let keys = self.store.list(LEDGER_PREFIX)?;
        for key in &keys {
            if let Some(bytes) = self.store.read(key)? {
                let entry: LocalIdEntry = from_cbor_record(&bytes)?;
                if entry.retain_count > 0 {
                    return Ok(false);
                }
            }
        }
        for key in &keys {
            self.store.delete(key)?;
        }
        Ok(true)
    }
}
