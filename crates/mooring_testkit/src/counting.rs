//! Byte store wrapper that counts traffic.

use mooring_storage::{ByteStore, InMemoryStore, StorageResult};
use parking_lot::Mutex;

/// Wraps a [`ByteStore`] and records every key read, written and deleted.
#[derive(Debug)]
pub struct CountingStore<S = InMemoryStore> {
    inner: S,
    reads: Mutex<Vec<String>>,
    writes: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
}

impl CountingStore<InMemoryStore> {
    /// Wraps a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(InMemoryStore::new())
    }
}

impl<S: ByteStore> CountingStore<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }

    /// Number of reads of keys starting with `prefix`.
    pub fn reads_of(&self, prefix: &str) -> usize {
        self.reads.lock().iter().filter(|k| k.starts_with(prefix)).count()
    }

    /// Number of writes of keys starting with `prefix`.
    pub fn writes_of(&self, prefix: &str) -> usize {
        self.writes.lock().iter().filter(|k| k.starts_with(prefix)).count()
    }

    /// Number of deletes of keys starting with `prefix`.
    pub fn deletes_of(&self, prefix: &str) -> usize {
        self.deletes.lock().iter().filter(|k| k.starts_with(prefix)).count()
    }

    /// Forgets every recorded access.
    pub fn reset(&self) {
        self.reads.lock().clear();
        self.writes.lock().clear();
        self.deletes.lock().clear();
    }
}

impl<S: ByteStore> ByteStore for CountingStore<S> {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.reads.lock().push(key.to_string());
        self.inner.read(key)
    }

    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        self.writes.lock().push(key.to_string());
        self.inner.write(key, data)
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key)
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        self.deletes.lock().push(key.to_string());
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_prefix() {
        let store = CountingStore::in_memory();
        store.write("objects/a", b"1").unwrap();
        store.write("local_ids/b", b"2").unwrap();
        store.read("objects/a").unwrap();
        store.read("objects/missing").unwrap();
        assert_eq!(store.writes_of("objects/"), 1);
        assert_eq!(store.reads_of("objects/"), 2);
        assert_eq!(store.reads_of("local_ids/"), 0);

        store.reset();
        assert_eq!(store.writes_of(""), 0);
    }
}
