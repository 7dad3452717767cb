//! Test fixtures.

use mooring_codec::Value;
use mooring_core::{ObjectState, SyncObject};
use mooring_storage::{ByteStore, FileStore, InMemoryStore};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A file store in a temporary directory, removed on drop.
pub struct TempFileStore {
    /// The store.
    pub store: Arc<FileStore>,
    dir: TempDir,
}

impl TempFileStore {
    /// Opens a store in a fresh temporary directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileStore::open(dir.path()).expect("Failed to open file store");
        Self {
            store: Arc::new(store),
            dir,
        }
    }

    /// Root directory of the store.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Closes the store and opens it again over the same directory.
    ///
    /// Panics if another handle on the store is still alive.
    pub fn reopen(self) -> Self {
        let Self { store, dir } = self;
        drop(Arc::try_unwrap(store).expect("file store still shared"));
        let store = FileStore::open(dir.path()).expect("Failed to reopen file store");
        Self {
            store: Arc::new(store),
            dir,
        }
    }

    /// The store as a trait object.
    pub fn bytes(&self) -> Arc<dyn ByteStore> {
        self.store.clone()
    }
}

impl Default for TempFileStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A fresh in-memory byte store.
pub fn memory_store() -> Arc<dyn ByteStore> {
    Arc::new(InMemoryStore::new())
}

/// A new, unsaved `GameScore` with `score` set.
pub fn game_score(score: i64) -> Arc<SyncObject> {
    let object = SyncObject::new("GameScore").expect("valid class");
    object.put("score", score).expect("score is settable");
    object
}

/// A complete object as if fetched from the server.
pub fn saved_object(
    class_name: &str,
    object_id: &str,
    fields: &[(&str, Value)],
) -> Arc<SyncObject> {
    let mut builder = ObjectState::builder(class_name)
        .object_id(Some(object_id.to_string()))
        .is_complete(true);
    for (key, value) in fields {
        builder = builder.put(*key, value.clone());
    }
    SyncObject::from_state(builder.build().expect("valid state"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_object_is_clean() {
        let object = saved_object("Post", "p1", &[("title", Value::from("hi"))]);
        assert!(!object.is_dirty());
        assert_eq!(object.get("title").unwrap(), Some(Value::from("hi")));
    }

    #[test]
    fn temp_store_reopens() {
        let temp = TempFileStore::new();
        temp.store.write("k", b"v").unwrap();
        let temp = temp.reopen();
        assert_eq!(temp.store.read("k").unwrap(), Some(b"v".to_vec()));
    }
}
