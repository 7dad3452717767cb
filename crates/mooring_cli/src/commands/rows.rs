//! Rows command implementation.

use super::open_datastore;
use mooring_offline::RowSummary;
use serde::Serialize;
use std::path::Path;

/// One stored row.
#[derive(Debug, Serialize)]
pub struct RowInfo {
    /// Row uuid.
    pub uuid: String,
    /// Object class.
    pub class_name: String,
    /// Server id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// Local id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

impl From<RowSummary> for RowInfo {
    fn from(row: RowSummary) -> Self {
        Self {
            uuid: row.uuid,
            class_name: row.class_name,
            object_id: row.object_id,
            local_id: row.local_id,
        }
    }
}

/// Rows under `path`, optionally of one class, ordered by class then uuid.
pub fn collect(
    path: &Path,
    class: Option<&str>,
) -> Result<Vec<RowInfo>, Box<dyn std::error::Error>> {
    let datastore = open_datastore(path)?;
    let mut rows: Vec<RowInfo> = datastore
        .rows()
        .into_iter()
        .filter(|row| class.map_or(true, |c| row.class_name == c))
        .map(RowInfo::from)
        .collect();
    rows.sort_by(|a, b| (&a.class_name, &a.uuid).cmp(&(&b.class_name, &b.uuid)));
    Ok(rows)
}

/// Runs the rows command.
pub fn run(
    path: &Path,
    class: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows = collect(path, class)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            println!("{} rows", rows.len());
            for row in &rows {
                let id = row
                    .object_id
                    .as_deref()
                    .or(row.local_id.as_deref())
                    .unwrap_or("-");
                println!("  {}  {:<20} {}", row.uuid, row.class_name, id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_core::{LocalIdManager, ObjectRegistry, SyncObject};
    use mooring_offline::LocalDatastore;
    use mooring_storage::{ByteStore, FileStore};
    use std::sync::Arc;

    #[test]
    fn lists_pinned_rows_by_class() {
        let dir = tempfile::tempdir().unwrap();
        {
            let bytes: Arc<dyn ByteStore> = Arc::new(FileStore::open(dir.path()).unwrap());
            let ids = Arc::new(LocalIdManager::new(Arc::clone(&bytes)));
            let store = LocalDatastore::open(bytes, Arc::new(ObjectRegistry::new()), ids).unwrap();
            let score = SyncObject::new("GameScore").unwrap();
            score.put("score", 3).unwrap();
            store.pin_objects("scores", &[score]).unwrap();
        }

        let rows = collect(dir.path(), Some("GameScore")).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].local_id.is_some());
        assert_eq!(collect(dir.path(), None).unwrap().len(), 2);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect(&dir.path().join("absent"), None).is_err());
    }
}
