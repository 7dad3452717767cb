//! Query command implementation.

use super::open_datastore;
use mooring_codec::{decode_json, encode_json};
use mooring_core::{AccessContext, QueryBuilder, QueryState};
use mooring_offline::OfflineQueryEngine;
use serde_json::{Map, Value as Json};
use std::path::Path;

/// Options of the query command.
#[derive(Debug, Default)]
pub struct QueryOptions {
    /// Class to query.
    pub class: String,
    /// Equality constraints, as a JSON object.
    pub where_json: Option<String>,
    /// Pin to restrict to.
    pub pin: Option<String>,
    /// Comma separated sort keys.
    pub order: Option<String>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Skip ACL checks.
    pub ignore_acls: bool,
}

/// Builds the offline query described by `options`.
pub fn build_query(options: &QueryOptions) -> Result<QueryState, Box<dyn std::error::Error>> {
    let mut builder: QueryBuilder = QueryState::builder(options.class.as_str());
    builder = match &options.pin {
        Some(pin) => builder.from_pin(pin.as_str()),
        None => builder.from_local_datastore(),
    };
    if let Some(text) = &options.where_json {
        let json: Json = serde_json::from_str(text)?;
        let constraints = json.as_object().ok_or("--where must be a JSON object")?;
        for (key, value) in constraints {
            builder = builder.where_equal_to(key, decode_json(value)?);
        }
    }
    if let Some(order) = &options.order {
        for key in order.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            builder = match key.strip_prefix('-') {
                Some(key) => builder.add_descending_order(key),
                None => builder.add_ascending_order(key),
            };
        }
    }
    if let Some(limit) = options.limit {
        builder = builder.limit(limit);
    }
    if options.ignore_acls {
        builder = builder.ignore_acls();
    }
    Ok(builder.build())
}

/// Runs the query command, printing one JSON object per result.
pub fn run(path: &Path, options: &QueryOptions) -> Result<(), Box<dyn std::error::Error>> {
    let query = build_query(options)?;
    let datastore = open_datastore(path)?;
    let access = AccessContext::anonymous();
    let results = OfflineQueryEngine::new(&datastore, &access).find(&query)?;
    tracing::debug!(class = %options.class, results = results.len(), "offline query finished");

    for object in &results {
        let mut map = Map::new();
        map.insert("className".into(), Json::from(object.class_name()));
        if let Some(id) = object.object_id() {
            map.insert("objectId".into(), Json::from(id));
        }
        if let Some(local) = object.local_id() {
            map.insert("localId".into(), Json::from(local));
        }
        for (key, value) in object.estimated_data() {
            map.insert(key, encode_json(&value));
        }
        println!("{}", Json::Object(map));
    }
    Ok(())
}
