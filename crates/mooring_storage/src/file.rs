//! File-based byte store for persistent storage.

use crate::backend::{validate_key, ByteStore};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Name of the lock file kept in the store root.
const LOCK_FILE: &str = ".mooring.lock";

/// A file-based byte store.
///
/// Each key maps to one file below the root directory. Data survives
/// process restarts.
///
/// # Durability
///
/// Writes go to a temporary file in the destination directory, are synced,
/// and are then renamed over the destination. Readers observe either the
/// old record or the new one.
///
/// # Exclusivity
///
/// Opening a store takes an advisory exclusive lock on the root, so two
/// processes never write the same ledger concurrently. Inside a process,
/// writers are serialized by an internal lock.
///
/// # Example
///
/// ```no_run
/// use mooring_storage::{ByteStore, FileStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("app-data")).unwrap();
/// store.write("current_user", b"persistent data").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    _lock: File,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens or creates a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the store,
    /// or an I/O error if the directory cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|_| StorageError::Locked)?;

        Ok(Self {
            root: root.to_path_buf(),
            _lock: lock,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == LOCK_FILE || name.starts_with(".tmp") {
                continue;
            }
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect_keys(&entry.path(), &key, out)?;
            } else {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl ByteStore for FileStore {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();

        let _guard = self.write_lock.lock();
        fs::create_dir_all(&parent)?;
        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
        tracing::trace!(key, len = data.len(), "record written");
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(&dir.path().join("store")).unwrap();
        assert!(store.root().exists());
        assert!(store.list("").unwrap().is_empty());
    }

    #[test]
    fn file_write_and_read() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.write("local_ids/local_01", b"hello").unwrap();
        assert_eq!(
            store.read("local_ids/local_01").unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(store.read("local_ids/missing").unwrap(), None);
    }

    #[test]
    fn file_overwrite_is_whole_record() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.write("current_user", b"a much longer first record").unwrap();
        store.write("current_user", b"short").unwrap();
        assert_eq!(store.read("current_user").unwrap(), Some(b"short".to_vec()));
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).unwrap();
            store.write("objects/one", b"persistent data").unwrap();
        }

        {
            let store = FileStore::open(dir.path()).unwrap();
            assert_eq!(
                store.read("objects/one").unwrap(),
                Some(b"persistent data".to_vec())
            );
        }
    }

    #[test]
    fn file_delete_and_exists() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.write("a", b"x").unwrap();
        assert!(store.exists("a").unwrap());
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(!store.exists("a").unwrap());
    }

    #[test]
    fn file_list_nested_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.write("objects/b", b"").unwrap();
        store.write("objects/a", b"").unwrap();
        store.write("dependencies/p", b"").unwrap();

        assert_eq!(store.list("objects/").unwrap(), vec!["objects/a", "objects/b"]);
        assert_eq!(store.list("").unwrap().len(), 3);
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = FileStore::open(dir.path()).unwrap();
        let second = FileStore::open(dir.path());
        assert!(matches!(second, Err(StorageError::Locked)));
    }
}
