//! Byte store trait definition.

use crate::error::{StorageError, StorageResult};

/// A keyed byte store scoped to an app-private root.
///
/// Byte stores are **opaque**. They read and write whole records by key and
/// never interpret the bytes. Keys are relative paths made of segments
/// separated by `/` (e.g. `local_ids/local_00ff`).
///
/// # Invariants
///
/// - `write` is atomic: a reader sees either the previous record or the new
///   one, never a partial write
/// - `read` of a missing key returns `Ok(None)`
/// - `list(prefix)` returns every key starting with `prefix`, sorted
/// - Stores must be `Send + Sync`; callers share them behind `Arc`
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait ByteStore: Send + Sync {
    /// Reads the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replaces the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the write cannot be made
    /// durable.
    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Returns whether a record exists under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Deletes the record under `key`. Returns whether a record was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Lists keys that start with `prefix`, sorted ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Validates a storage key.
///
/// A key is one or more non-empty segments separated by `/`, each made of
/// ASCII alphanumerics, `_`, `-` or `.`, and never `.` or `..`.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] for anything else.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        });
    if valid {
        Ok(())
    } else {
        Err(StorageError::invalid_key(key))
    }
}
