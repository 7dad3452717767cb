//! Property-based test generators using proptest.

use mooring_codec::{GeoPoint, Value};
use proptest::prelude::*;

/// Strategy for valid class names.
pub fn class_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][A-Za-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for valid field names.
pub fn key_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][A-Za-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for integers exactly representable as `f64`.
pub fn exact_integer_strategy() -> impl Strategy<Value = i64> {
    -(1i64 << 53)..(1i64 << 53)
}

/// Strategy for the same integer in both numeric representations.
pub fn same_number_strategy() -> impl Strategy<Value = (Value, Value)> {
    exact_integer_strategy().prop_map(|n| (Value::Integer(n), Value::Float(n as f64)))
}

/// Strategy for numbers in either representation.
pub fn number_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        exact_integer_strategy().prop_map(Value::Integer),
        (-1.0e12f64..1.0e12).prop_map(Value::Float),
    ]
}

/// Strategy for scalar values: numbers, text, booleans and null.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        number_value_strategy(),
        "[a-z]{0,8}".prop_map(Value::Text),
        any::<bool>().prop_map(Value::Bool),
        Just(Value::Null),
    ]
}

/// Strategy for valid geo points.
pub fn geo_point_strategy() -> impl Strategy<Value = GeoPoint> {
    (-90.0f64..=90.0, -180.0f64..=180.0)
        .prop_map(|(lat, lng)| GeoPoint::new(lat, lng).expect("in range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn same_numbers_are_numerically_equal((int, float) in same_number_strategy()) {
            prop_assert_eq!(int.as_f64(), float.as_f64());
        }

        #[test]
        fn class_names_start_uppercase(name in class_name_strategy()) {
            prop_assert!(name.chars().next().is_some_and(|c| c.is_ascii_uppercase()));
        }
    }
}
