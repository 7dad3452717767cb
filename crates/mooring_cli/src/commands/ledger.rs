//! Ledger command implementation.

use mooring_core::LocalIdManager;
use mooring_storage::{ByteStore, FileStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// One local identity.
#[derive(Debug, Serialize)]
pub struct LedgerEntry {
    /// The local id.
    pub local_id: String,
    /// Queued commands depending on it.
    pub retain_count: u64,
    /// The server id it resolved to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

/// Runs the ledger command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No storage root found at {:?}", path).into());
    }
    let bytes: Arc<dyn ByteStore> = Arc::new(FileStore::open(path)?);
    let entries: Vec<LedgerEntry> = LocalIdManager::new(bytes)
        .entries()?
        .into_iter()
        .map(|(local_id, entry)| LedgerEntry {
            local_id,
            retain_count: entry.retain_count,
            object_id: entry.object_id,
        })
        .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => {
            println!("{} local ids", entries.len());
            for entry in &entries {
                println!(
                    "  {}  retained {}  -> {}",
                    entry.local_id,
                    entry.retain_count,
                    entry.object_id.as_deref().unwrap_or("(unresolved)")
                );
            }
        }
    }
    Ok(())
}
