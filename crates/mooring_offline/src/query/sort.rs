//! Result ordering.

use super::matcher::{compare_values, Matcher};
use mooring_codec::{GeoPoint, Value};
use mooring_core::{Constraint, MooringError, MooringResult, Operand, QueryState, SyncObject};
use std::cmp::Ordering;
use std::sync::Arc;

fn is_valid_sort_key(key: &str) -> bool {
    key.split('.').enumerate().all(|(index, segment)| {
        let mut chars = segment.chars();
        let head_ok = chars.next().is_some_and(|c| {
            c.is_ascii_alphabetic() || (index > 0 && (c.is_ascii_digit() || c == '_'))
        });
        head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

struct SortKey {
    key: String,
    descending: bool,
}

fn parse_order(order: &[String]) -> MooringResult<Vec<SortKey>> {
    order
        .iter()
        .map(|raw| {
            let (key, descending) = match raw.strip_prefix('-') {
                Some(key) => (key, true),
                None => (raw.as_str(), false),
            };
            if !is_valid_sort_key(key) {
                return Err(MooringError::invalid_query(format!("Invalid key name: {raw}.")));
            }
            Ok(SortKey {
                key: key.to_string(),
                descending,
            })
        })
        .collect()
}

/// The key and point of the query's `$nearSphere` constraint, if any.
fn near_sphere(query: &QueryState) -> Option<(String, GeoPoint)> {
    query.constraints().keys.iter().find_map(|(key, constraint)| match constraint {
        Constraint::Operators(ops) => match ops.get("$nearSphere") {
            Some(Operand::Value(Value::GeoPoint(point))) => Some((key.clone(), *point)),
            _ => None,
        },
        Constraint::Equals(_) => None,
    })
}

/// Missing and null sort first.
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> MooringResult<Ordering> {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ok(Ordering::Equal),
        (None, Some(_)) => Ok(Ordering::Less),
        (Some(_), None) => Ok(Ordering::Greater),
        (Some(a), Some(b)) => compare_values(a, b),
    }
}

/// Sorts `objects` in place: by distance to the `$nearSphere` point first,
/// then by each order key. The sort is stable.
///
/// # Errors
///
/// - [`MooringError::InvalidQuery`] for an invalid sort key
/// - [`MooringError::IllegalArgument`] when a key holds incomparable values
pub(crate) fn sort_objects(
    matcher: &Matcher<'_>,
    query: &QueryState,
    objects: &mut [Arc<SyncObject>],
) -> MooringResult<()> {
    let keys = parse_order(query.order())?;
    let near = near_sphere(query);
    if keys.is_empty() && near.is_none() {
        return Ok(());
    }

    // Read every key once up front; the comparator only looks at rows.
    let mut rows = Vec::with_capacity(objects.len());
    for object in objects.iter() {
        let distance = match &near {
            Some((key, point)) => match matcher.value_for_key(object, key)? {
                Some(Value::GeoPoint(p)) => Some(p.distance_in_radians_to(point)),
                _ => None,
            },
            None => None,
        };
        let values = keys
            .iter()
            .map(|k| matcher.value_for_key(object, &k.key))
            .collect::<MooringResult<Vec<_>>>()?;
        rows.push((distance, values, Arc::clone(object)));
    }

    let mut failure = None;
    rows.sort_by(|(da, va, _), (db, vb, _)| {
        if failure.is_some() {
            return Ordering::Equal;
        }
        if let (Some(da), Some(db)) = (da, db) {
            let ordering = da.partial_cmp(db).unwrap_or(Ordering::Equal);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        for (index, key) in keys.iter().enumerate() {
            match compare_optional(va[index].as_ref(), vb[index].as_ref()) {
                Ok(Ordering::Equal) => continue,
                Ok(ordering) if key.descending => return ordering.reverse(),
                Ok(ordering) => return ordering,
                Err(e) => {
                    failure = Some(e);
                    return Ordering::Equal;
                }
            }
        }
        Ordering::Equal
    });
    if let Some(e) = failure {
        return Err(e);
    }
    for (slot, (_, _, object)) in objects.iter_mut().zip(rows) {
        *slot = object;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_core::ErrorKind;

    #[test]
    fn nulls_sort_first() {
        assert_eq!(
            compare_optional(None, Some(&Value::from("value"))).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare_optional(Some(&Value::Null), None).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn invalid_sort_keys_are_rejected() {
        let err = parse_order(&["-$score".to_string()]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
        let keys = parse_order(&["-score".to_string(), "player.name".to_string()]).unwrap();
        assert!(keys[0].descending);
        assert_eq!(keys[1].key, "player.name");
    }
}
