//! CLI command implementations.

pub mod ledger;
pub mod pins;
pub mod query;
pub mod rows;

use mooring_core::{LocalIdManager, ObjectRegistry};
use mooring_offline::LocalDatastore;
use mooring_storage::{ByteStore, FileStore};
use std::path::Path;
use std::sync::Arc;

/// Opens the local datastore under `path`.
pub fn open_datastore(path: &Path) -> Result<LocalDatastore, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No storage root found at {:?}", path).into());
    }
    let bytes: Arc<dyn ByteStore> = Arc::new(FileStore::open(path)?);
    let ids = Arc::new(LocalIdManager::new(Arc::clone(&bytes)));
    Ok(LocalDatastore::open(bytes, Arc::new(ObjectRegistry::new()), ids)?)
}
