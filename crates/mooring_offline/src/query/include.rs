//! Loading the objects named by a query's include paths.

use crate::datastore::LocalDatastore;
use mooring_codec::Value;
use mooring_core::{MooringError, MooringResult, SyncObject};

/// Fetches, from the local datastore, every object reachable from `object`
/// along the dotted `path`. Arrays and maps along the way are descended
/// into; a null or missing value ends the walk.
///
/// # Errors
///
/// - [`MooringError::IllegalState`] when a value on the path is neither a
///   pointer nor a container
/// - [`MooringError::NotFound`] when a pointed-to object has no local row
pub(crate) fn fetch_include(
    store: &LocalDatastore,
    object: &SyncObject,
    path: &str,
) -> MooringResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    include_on_object(store, object, &segments, path)
}

fn include_on_object(
    store: &LocalDatastore,
    object: &SyncObject,
    segments: &[&str],
    path: &str,
) -> MooringResult<()> {
    let Some((first, rest)) = segments.split_first() else {
        return Ok(());
    };
    include_on_value(store, object.estimated(first).as_ref(), rest, path)
}

fn include_on_value(
    store: &LocalDatastore,
    value: Option<&Value>,
    rest: &[&str],
    path: &str,
) -> MooringResult<()> {
    match value {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(items)) => items
            .iter()
            .try_for_each(|item| include_on_value(store, Some(item), rest, path)),
        Some(Value::Map(map)) => match rest.split_first() {
            Some((key, deeper)) => include_on_value(store, map.get(*key), deeper, path),
            None => Err(not_a_pointer(path, "map")),
        },
        Some(Value::Pointer(pointer)) => {
            let target = store.resolve(pointer)?.ok_or_else(|| {
                MooringError::not_found(format!(
                    "included object {} at {path} is not available in the offline cache.",
                    pointer.key.as_str()
                ))
            })?;
            if !target.is_data_available() {
                store.fetch_locally(&target)?;
            }
            include_on_object(store, &target, rest, path)
        }
        Some(other) => Err(not_a_pointer(path, other.type_name())),
    }
}

fn not_a_pointer(path: &str, found: &str) -> MooringError {
    MooringError::illegal_state(format!(
        "include path {path} reaches a {found}, which is not a pointer"
    ))
}
