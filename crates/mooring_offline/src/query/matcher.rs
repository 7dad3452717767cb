//! Constraint validation and per-object matching.

use crate::datastore::LocalDatastore;
use mooring_codec::{GeoPoint, Pointer, Polygon, Value};
use mooring_core::{
    AccessContext, Constraint, KeyConstraints, MooringError, MooringResult, Operand,
    QueryConstraints, QueryState, RelatedTo, SyncObject,
};
use regex::Regex;
use std::cmp::Ordering;

const SUPPORTED_OPERATORS: [&str; 21] = [
    "$eq",
    "$ne",
    "$lt",
    "$lte",
    "$gt",
    "$gte",
    "$in",
    "$nin",
    "$all",
    "$exists",
    "$regex",
    "$options",
    "$nearSphere",
    "$maxDistance",
    "$within",
    "$geoWithin",
    "$geoIntersects",
    "$inQuery",
    "$notInQuery",
    "$select",
    "$dontSelect",
];

/// Checks a query before any candidate is looked at, so malformed queries
/// fail even against an empty store.
pub(crate) fn validate_query(query: &QueryState) -> MooringResult<()> {
    validate_constraints(query.constraints())
}

fn validate_constraints(constraints: &QueryConstraints) -> MooringResult<()> {
    for constraint in constraints.keys.values() {
        if let Constraint::Operators(ops) = constraint {
            validate_operators(ops)?;
        }
    }
    constraints.or.iter().try_for_each(validate_constraints)
}

fn validate_operators(ops: &KeyConstraints) -> MooringResult<()> {
    for (op, operand) in ops {
        if !SUPPORTED_OPERATORS.contains(&op.as_str()) {
            return Err(MooringError::invalid_query(format!(
                "The offline store does not support the {op} operator."
            )));
        }
        match (op.as_str(), operand) {
            ("$options", _) => {
                regex_options(operand)?;
            }
            ("$regex", _) => {
                compile_regex(operand, ops.get("$options"))?;
            }
            ("$all", Operand::List(items)) => {
                let prefixes = items
                    .iter()
                    .filter(|item| matches!(item, Operand::Constraints(_)))
                    .count();
                if prefixes > 0 && prefixes < items.len() {
                    return Err(MooringError::illegal_argument(
                        "An $all list cannot mix starts-with constraints with plain values.",
                    ));
                }
            }
            ("$within", Operand::Constraints(inner)) => {
                let corners = inner.get("$box").ok_or_else(|| {
                    MooringError::invalid_query("$within requires a $box of two points.")
                })?;
                let (southwest, northeast) = box_corners(corners)?;
                validate_geo_box(&southwest, &northeast)?;
            }
            ("$geoWithin", Operand::Constraints(inner)) => {
                let points = inner.get("$polygon").ok_or_else(|| {
                    MooringError::invalid_query("$geoWithin requires a $polygon.")
                })?;
                polygon_operand(points)?;
            }
            ("$geoIntersects", Operand::Constraints(inner)) => {
                match inner.get("$point") {
                    Some(Operand::Value(Value::GeoPoint(_))) => {}
                    _ => {
                        return Err(MooringError::invalid_query(
                            "$geoIntersects requires a $point geo point.",
                        ))
                    }
                }
            }
            ("$within" | "$geoWithin" | "$geoIntersects", _) => {
                return Err(MooringError::invalid_query(format!(
                    "{op} requires nested constraints."
                )));
            }
            ("$inQuery" | "$notInQuery", Operand::Query(query)) => validate_query(query)?,
            ("$select" | "$dontSelect", Operand::KeyInQuery { query, .. }) => {
                validate_query(query)?
            }
            ("$inQuery" | "$notInQuery" | "$select" | "$dontSelect", _) => {
                return Err(MooringError::invalid_query(format!(
                    "{op} requires a subquery."
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn box_corners(operand: &Operand) -> MooringResult<(GeoPoint, GeoPoint)> {
    let points: Vec<&GeoPoint> = match operand {
        Operand::Value(Value::Array(items)) => {
            items.iter().filter_map(Value::as_geo_point).collect()
        }
        Operand::List(items) => items
            .iter()
            .filter_map(|item| match item {
                Operand::Value(Value::GeoPoint(p)) => Some(p),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    match points.as_slice() {
        [southwest, northeast] => Ok((**southwest, **northeast)),
        _ => Err(MooringError::invalid_query(
            "Geo box queries require two points: southwest and northeast.",
        )),
    }
}

/// Rejects boxes whose corners are out of order or that wrap the globe.
pub(crate) fn validate_geo_box(southwest: &GeoPoint, northeast: &GeoPoint) -> MooringResult<()> {
    if southwest.latitude() > northeast.latitude() {
        return Err(MooringError::invalid_query(
            "The southwest corner of a geo box must be south of the northeast corner.",
        ));
    }
    if southwest.longitude() > northeast.longitude() {
        return Err(MooringError::invalid_query(
            "Geo box queries that cross the international date line are not supported; \
             the southwest corner must be west of the northeast corner.",
        ));
    }
    if northeast.longitude() - southwest.longitude() > 180.0 {
        return Err(MooringError::invalid_query(
            "Geo box queries larger than 180 degrees in longitude are not supported. \
             Please check point order.",
        ));
    }
    Ok(())
}

fn polygon_operand(operand: &Operand) -> MooringResult<Polygon> {
    let points: Vec<GeoPoint> = match operand {
        Operand::Value(Value::Array(items)) => {
            items.iter().filter_map(Value::as_geo_point).copied().collect()
        }
        Operand::Value(Value::Polygon(polygon)) => return Ok(polygon.clone()),
        _ => Vec::new(),
    };
    Polygon::new(points)
        .map_err(|_| MooringError::invalid_query("Polygon must have at least 3 GeoPoints."))
}

fn regex_options(operand: &Operand) -> MooringResult<String> {
    let Operand::Value(Value::Text(options)) = operand else {
        return Err(MooringError::invalid_query("$options must be a string."));
    };
    if let Some(bad) = options.chars().find(|c| !matches!(c, 'i' | 'm' | 'x' | 's')) {
        return Err(MooringError::invalid_query(format!(
            "Invalid regex option {bad:?}; only i, m, x and s are supported."
        )));
    }
    Ok(options.clone())
}

fn compile_regex(pattern: &Operand, options: Option<&Operand>) -> MooringResult<Regex> {
    let Operand::Value(Value::Text(pattern)) = pattern else {
        return Err(MooringError::invalid_query("$regex must be a string."));
    };
    let flags = options.map(regex_options).transpose()?.unwrap_or_default();
    let source = if flags.is_empty() {
        pattern.clone()
    } else {
        format!("(?{flags}){pattern}")
    };
    Regex::new(&source).map_err(|e| MooringError::invalid_query(format!("invalid $regex: {e}")))
}

/// Equality as the backend computes it: numbers compare by value across
/// representations, containers element by element.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x.compare(y) == Ordering::Equal;
    }
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, l)| y.get(key).is_some_and(|r| values_equal(l, r)))
        }
        _ => a == b,
    }
}

/// Orders two present values.
///
/// # Errors
///
/// Returns [`MooringError::IllegalArgument`] for values of incomparable types.
pub(crate) fn compare_values(a: &Value, b: &Value) -> MooringResult<Ordering> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Ok(x.compare(y));
    }
    match (a, b) {
        (Value::Text(x), Value::Text(y)) => Ok(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => Err(MooringError::illegal_argument(format!(
            "Unable to compare {} and {}.",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Equality where `null` also matches a missing key and an array field
/// matches when any element does.
pub(crate) fn matches_equal(field: Option<&Value>, expected: &Value) -> bool {
    if expected.is_null() {
        return field.map_or(true, Value::is_null);
    }
    let Some(field) = field.filter(|v| !v.is_null()) else {
        return false;
    };
    if values_equal(field, expected) {
        return true;
    }
    match (field, expected) {
        (Value::Array(items), expected) if !matches!(expected, Value::Array(_)) => {
            items.iter().any(|item| values_equal(item, expected))
        }
        _ => false,
    }
}

fn operand_values(operand: &Operand) -> Vec<&Value> {
    match operand {
        Operand::Value(Value::Array(items)) => items.iter().collect(),
        Operand::Value(value) => vec![value],
        Operand::List(items) => items
            .iter()
            .filter_map(|item| match item {
                Operand::Value(value) => Some(value),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn operand_value(operand: &Operand) -> Option<&Value> {
    match operand {
        Operand::Value(value) => Some(value),
        _ => None,
    }
}

/// Decides whether objects satisfy a query's constraints and visibility.
pub(crate) struct Matcher<'a> {
    store: &'a LocalDatastore,
    access: &'a AccessContext,
}

impl<'a> Matcher<'a> {
    pub(crate) fn new(store: &'a LocalDatastore, access: &'a AccessContext) -> Self {
        Self { store, access }
    }

    /// Rewrites local-id pointers that have since been resolved, so both
    /// spellings of one identity compare equal.
    fn canonical(&self, value: &Value) -> Value {
        let mut value = value.clone();
        let ids = self.store.local_ids();
        value.resolve_local_ids(&|local| ids.get_object_id(local).ok().flatten());
        value
    }

    /// Reads a possibly dotted key, following nested maps and pointers.
    pub(crate) fn value_for_key(
        &self,
        object: &SyncObject,
        key: &str,
    ) -> MooringResult<Option<Value>> {
        let mut segments = key.split('.');
        let Some(first) = segments.next() else {
            return Ok(None);
        };
        let mut current = match first {
            "objectId" => object.object_id().map(Value::Text),
            "createdAt" => object.created_at().map(Value::Date),
            "updatedAt" => object.updated_at().map(Value::Date),
            _ => object.estimated(first),
        };
        for segment in segments {
            current = match current {
                Some(Value::Map(map)) => map.get(segment).cloned(),
                Some(Value::Pointer(pointer)) => match self.store.resolve(&pointer)? {
                    Some(target) => self.value_for_key(&target, segment)?,
                    None => None,
                },
                _ => None,
            };
        }
        Ok(current.map(|value| self.canonical(&value)))
    }

    /// Whether `object` is visible and satisfies `query`.
    pub(crate) fn matches_query(
        &self,
        query: &QueryState,
        object: &SyncObject,
    ) -> MooringResult<bool> {
        if object.class_name() != query.class_name() {
            return Ok(false);
        }
        if !query.ignore_acls() && !self.access.can_read(object) {
            return Ok(false);
        }
        self.matches_constraints(query.constraints(), object)
    }

    fn matches_constraints(
        &self,
        constraints: &QueryConstraints,
        object: &SyncObject,
    ) -> MooringResult<bool> {
        for (key, constraint) in &constraints.keys {
            let field = self.value_for_key(object, key)?;
            let matched = match constraint {
                Constraint::Equals(expected) => {
                    matches_equal(field.as_ref(), &self.canonical(expected))
                }
                Constraint::Operators(ops) => self.matches_operators(field.as_ref(), ops)?,
            };
            if !matched {
                return Ok(false);
            }
        }
        if let Some(related) = &constraints.related_to {
            if !self.matches_related_to(related, object)? {
                return Ok(false);
            }
        }
        if constraints.or.is_empty() {
            return Ok(true);
        }
        for alternative in &constraints.or {
            if self.matches_constraints(alternative, object)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn matches_related_to(&self, related: &RelatedTo, object: &SyncObject) -> MooringResult<bool> {
        let Some(parent) = self.store.resolve(&related.object)? else {
            return Ok(false);
        };
        let Some(Value::Relation(relation)) = parent.estimated(&related.key) else {
            return Ok(false);
        };
        let Some(pointer) = object.pointer() else {
            return Ok(false);
        };
        let candidate = self.canonical(&Value::Pointer(pointer));
        Ok(relation
            .known
            .iter()
            .any(|member| self.canonical(&Value::Pointer(member.clone())) == candidate))
    }

    fn matches_operators(
        &self,
        field: Option<&Value>,
        ops: &KeyConstraints,
    ) -> MooringResult<bool> {
        for (op, operand) in ops {
            if !self.matches_operator(field, op, operand, ops)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn matches_operator(
        &self,
        field: Option<&Value>,
        op: &str,
        operand: &Operand,
        siblings: &KeyConstraints,
    ) -> MooringResult<bool> {
        let present = field.filter(|v| !v.is_null());
        match op {
            "$eq" => Ok(operand_value(operand)
                .is_some_and(|expected| matches_equal(field, &self.canonical(expected)))),
            "$ne" => Ok(!operand_value(operand)
                .is_some_and(|expected| matches_equal(field, &self.canonical(expected)))),
            "$lt" | "$lte" | "$gt" | "$gte" => {
                let (Some(value), Some(bound)) = (present, operand_value(operand)) else {
                    return Ok(false);
                };
                if bound.is_null() {
                    return Ok(false);
                }
                let ordering = compare_values(value, bound)?;
                Ok(match op {
                    "$lt" => ordering == Ordering::Less,
                    "$lte" => ordering != Ordering::Greater,
                    "$gt" => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }
            "$in" => Ok(operand_values(operand)
                .into_iter()
                .any(|expected| matches_equal(field, &self.canonical(expected)))),
            "$nin" => Ok(!operand_values(operand)
                .into_iter()
                .any(|expected| matches_equal(field, &self.canonical(expected)))),
            "$all" => self.matches_all(present, operand),
            "$exists" => {
                let wanted = operand_value(operand).and_then(Value::as_bool).unwrap_or(true);
                Ok(present.is_some() == wanted)
            }
            "$regex" => {
                let regex = compile_regex(operand, siblings.get("$options"))?;
                Ok(present.and_then(Value::as_text).is_some_and(|text| regex.is_match(text)))
            }
            "$nearSphere" => {
                let (Some(Value::GeoPoint(point)), Some(Value::GeoPoint(near))) =
                    (present, operand_value(operand))
                else {
                    return Ok(false);
                };
                let max = siblings
                    .get("$maxDistance")
                    .and_then(operand_value)
                    .and_then(Value::as_f64);
                Ok(max.map_or(true, |max| point.distance_in_radians_to(near) <= max))
            }
            "$within" => {
                let Some(Value::GeoPoint(point)) = present else {
                    return Ok(false);
                };
                let Operand::Constraints(inner) = operand else {
                    return Ok(false);
                };
                let Some(corners) = inner.get("$box") else {
                    return Ok(false);
                };
                let (southwest, northeast) = box_corners(corners)?;
                validate_geo_box(&southwest, &northeast)?;
                Ok(point.latitude() >= southwest.latitude()
                    && point.latitude() <= northeast.latitude()
                    && point.longitude() >= southwest.longitude()
                    && point.longitude() <= northeast.longitude())
            }
            "$geoWithin" => {
                let Some(Value::GeoPoint(point)) = present else {
                    return Ok(false);
                };
                let Operand::Constraints(inner) = operand else {
                    return Ok(false);
                };
                let Some(points) = inner.get("$polygon") else {
                    return Ok(false);
                };
                Ok(polygon_operand(points)?.contains_point(point))
            }
            "$geoIntersects" => {
                let Some(Value::Polygon(polygon)) = present else {
                    return Ok(false);
                };
                let Operand::Constraints(inner) = operand else {
                    return Ok(false);
                };
                match inner.get("$point") {
                    Some(Operand::Value(Value::GeoPoint(point))) => {
                        Ok(polygon.contains_point(point))
                    }
                    _ => Ok(false),
                }
            }
            "$inQuery" | "$notInQuery" => {
                let Operand::Query(query) = operand else {
                    return Ok(false);
                };
                let found = match present {
                    Some(Value::Pointer(pointer)) => self.pointer_matches(pointer, query)?,
                    _ => false,
                };
                Ok(found == (op == "$inQuery"))
            }
            "$select" | "$dontSelect" => {
                let Operand::KeyInQuery { key, query } = operand else {
                    return Ok(false);
                };
                let mut found = false;
                for result in self.store.objects_of_class(query.class_name(), query.pin_name())? {
                    if result.is_deleted() || !self.matches_query(query, &result)? {
                        continue;
                    }
                    if let Some(selected) = self.value_for_key(&result, key)? {
                        if matches_equal(field, &selected) {
                            found = true;
                            break;
                        }
                    }
                }
                Ok(found == (op == "$select"))
            }
            // Read together with $regex and $nearSphere.
            "$options" | "$maxDistance" => Ok(true),
            _ => Err(MooringError::invalid_query(format!(
                "The offline store does not support the {op} operator."
            ))),
        }
    }

    fn pointer_matches(&self, pointer: &Pointer, query: &QueryState) -> MooringResult<bool> {
        match self.store.resolve(pointer)? {
            Some(target) => self.matches_query(query, &target),
            None => Ok(false),
        }
    }

    fn matches_all(&self, field: Option<&Value>, operand: &Operand) -> MooringResult<bool> {
        let Some(Value::Array(items)) = field else {
            return Ok(false);
        };
        let Operand::List(wanted) = operand else {
            return Ok(operand_values(operand)
                .into_iter()
                .all(|value| items.iter().any(|item| values_equal(item, value))));
        };
        let prefixes = wanted
            .iter()
            .filter(|item| matches!(item, Operand::Constraints(_)))
            .count();
        if prefixes == 0 {
            return Ok(operand_values(operand)
                .into_iter()
                .all(|value| items.iter().any(|item| values_equal(item, &self.canonical(value)))));
        }
        if prefixes != wanted.len() {
            return Err(MooringError::illegal_argument(
                "An $all list cannot mix starts-with constraints with plain values.",
            ));
        }
        for entry in wanted {
            let Operand::Constraints(inner) = entry else {
                return Ok(false);
            };
            let Some(pattern) = inner.get("$regex") else {
                return Err(MooringError::invalid_query(
                    "Entries of an $all list must be values or $regex constraints.",
                ));
            };
            let regex = compile_regex(pattern, inner.get("$options"))?;
            if !items
                .iter()
                .filter_map(Value::as_text)
                .any(|text| regex.is_match(text))
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooring_core::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn null_matches_missing_and_explicit_null() {
        assert!(matches_equal(None, &Value::Null));
        assert!(matches_equal(Some(&Value::Null), &Value::Null));
        assert!(!matches_equal(None, &Value::from("value")));
        assert!(!matches_equal(Some(&Value::Null), &Value::from("value")));
    }

    #[test]
    fn array_fields_match_any_element() {
        let field = Value::Array(vec![Value::from("a"), Value::from(2)]);
        assert!(matches_equal(Some(&field), &Value::Float(2.0)));
        assert!(!matches_equal(Some(&field), &Value::from("c")));
    }

    #[test]
    fn incomparable_types_are_illegal() {
        let err = compare_values(&Value::from("5"), &Value::from(5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[test]
    fn geo_box_rules_are_named() {
        let sw = GeoPoint::new(10.0, 10.0).unwrap();
        let ne = GeoPoint::new(20.0, 20.0).unwrap();
        assert!(validate_geo_box(&sw, &ne).is_ok());

        let swapped = validate_geo_box(&ne, &sw).unwrap_err();
        assert_eq!(swapped.kind(), ErrorKind::InvalidQuery);
        assert!(swapped.to_string().contains("south of"));

        let wrapped = validate_geo_box(
            &GeoPoint::new(0.0, 170.0).unwrap(),
            &GeoPoint::new(10.0, -170.0).unwrap(),
        )
        .unwrap_err();
        assert!(wrapped.to_string().contains("date line"));

        let wide = validate_geo_box(
            &GeoPoint::new(0.0, -100.0).unwrap(),
            &GeoPoint::new(10.0, 100.0).unwrap(),
        )
        .unwrap_err();
        assert!(wide.to_string().contains("180 degrees"));
    }

    #[test]
    fn unknown_regex_options_are_rejected() {
        let query = QueryState::builder("Post")
            .where_matches("title", "^a", Some("iq"))
            .build();
        assert_eq!(validate_query(&query).unwrap_err().kind(), ErrorKind::InvalidQuery);
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let query = QueryState::builder("Post")
            .add_condition("title", "$text", Value::from("a"))
            .build();
        assert_eq!(validate_query(&query).unwrap_err().kind(), ErrorKind::InvalidQuery);
    }

    #[test]
    fn mixed_all_lists_are_illegal() {
        let query = QueryState::builder("Post")
            .add_condition(
                "tags",
                "$all",
                Operand::List(vec![Operand::starts_with("a"), Operand::Value(Value::from("b"))]),
            )
            .build();
        assert_eq!(validate_query(&query).unwrap_err().kind(), ErrorKind::IllegalArgument);
    }

    proptest! {
        #[test]
        fn integer_and_float_spellings_are_equal(n in -1_000_000i64..1_000_000) {
            #[allow(clippy::cast_precision_loss)]
            let float = Value::Float(n as f64);
            let int = Value::Integer(n);
            prop_assert!(matches_equal(Some(&int), &float));
            prop_assert!(matches_equal(Some(&float), &int));
            prop_assert_eq!(compare_values(&int, &float).unwrap(), Ordering::Equal);
        }

        #[test]
        fn numeric_order_ignores_representation(a in -1_000i64..1_000, b in -1_000i64..1_000) {
            #[allow(clippy::cast_precision_loss)]
            let float_b = Value::Float(b as f64);
            prop_assert_eq!(
                compare_values(&Value::Integer(a), &float_b).unwrap(),
                a.cmp(&b)
            );
        }
    }
}
