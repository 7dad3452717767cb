//! In-memory byte store for testing.

use crate::backend::{validate_key, ByteStore};
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory byte store.
///
/// This store keeps all records in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Sessions that don't need persistence
///
/// # Example
///
/// ```rust
/// use mooring_storage::{ByteStore, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// store.write("current_user", b"data").unwrap();
/// assert_eq!(store.read("current_user").unwrap(), Some(b"data".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Clears all records.
    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl ByteStore for InMemoryStore {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.records.read().get(key).cloned())
    }

    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.records.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.records.read().contains_key(key))
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.records.write().remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .records
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.read("missing").unwrap(), None);
    }

    #[test]
    fn memory_write_then_read() {
        let store = InMemoryStore::new();
        store.write("a", b"one").unwrap();
        store.write("a", b"two").unwrap();
        assert_eq!(store.read("a").unwrap(), Some(b"two".to_vec()));
        assert!(store.exists("a").unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn memory_delete() {
        let store = InMemoryStore::new();
        store.write("a", b"one").unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(!store.exists("a").unwrap());
    }

    #[test]
    fn memory_list_by_prefix() {
        let store = InMemoryStore::new();
        store.write("objects/b", b"").unwrap();
        store.write("objects/a", b"").unwrap();
        store.write("other", b"").unwrap();
        assert_eq!(store.list("objects/").unwrap(), vec!["objects/a", "objects/b"]);
        assert!(store.list("nothing/").unwrap().is_empty());
    }

    #[test]
    fn memory_rejects_invalid_keys() {
        let store = InMemoryStore::new();
        assert!(store.write("../escape", b"x").is_err());
        assert!(store.read("").is_err());
    }

    #[test]
    fn memory_clear() {
        let store = InMemoryStore::new();
        store.write("a", b"1").unwrap();
        store.clear();
        assert!(store.is_empty());
    }
}
