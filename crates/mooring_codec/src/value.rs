//! Dynamic value type stored in object fields.

use crate::geo::{GeoPoint, Polygon};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// How an object is identified: by its server id or by a temporary local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKey {
    /// Server-assigned object id.
    ObjectId(String),
    /// Process-assigned temporary id (`local_…`).
    LocalId(String),
}

impl ObjectKey {
    /// Returns the raw id string.
    pub fn as_str(&self) -> &str {
        match self {
            ObjectKey::ObjectId(id) | ObjectKey::LocalId(id) => id,
        }
    }

    /// Returns the server id if this is one.
    pub fn object_id(&self) -> Option<&str> {
        match self {
            ObjectKey::ObjectId(id) => Some(id),
            ObjectKey::LocalId(_) => None,
        }
    }

    /// Returns the local id if this is one.
    pub fn local_id(&self) -> Option<&str> {
        match self {
            ObjectKey::LocalId(id) => Some(id),
            ObjectKey::ObjectId(_) => None,
        }
    }
}

/// A reference to another object by class and identity.
///
/// Pointers never own the object they reference, so object graphs may
/// contain cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pointer {
    /// Class of the referenced object.
    pub class_name: String,
    /// Identity of the referenced object.
    pub key: ObjectKey,
}

impl Pointer {
    /// Creates a pointer to a saved object.
    pub fn new(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            key: ObjectKey::ObjectId(object_id.into()),
        }
    }

    /// Creates a pointer to an unsaved object known by its local id.
    pub fn local(class_name: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            key: ObjectKey::LocalId(local_id.into()),
        }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_name, self.key.as_str())
    }
}

/// A reference to a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// Server-side file name.
    pub name: String,
    /// Download URL, once uploaded.
    pub url: Option<String>,
}

/// A relation field: a many-to-many association with objects of one class.
///
/// `known` holds the members this client has seen or added.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelationRef {
    /// Class of the related objects, if known yet.
    pub target_class: Option<String>,
    /// Members known locally.
    pub known: Vec<Pointer>,
}

/// A dynamic field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// Text string.
    Text(String),
    /// Byte blob.
    Bytes(Vec<u8>),
    /// Timestamp.
    Date(DateTime<Utc>),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested mapping.
    Map(BTreeMap<String, Value>),
    /// Reference to another object.
    Pointer(Pointer),
    /// Geographic point.
    GeoPoint(GeoPoint),
    /// Geographic polygon.
    Polygon(Polygon),
    /// Binary file reference.
    File(FileRef),
    /// Relation to a set of objects.
    Relation(RelationRef),
}

/// A number extracted from a [`Value`], independent of representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Integer representation.
    Int(i64),
    /// Floating representation.
    Float(f64),
}

impl Number {
    /// The value as `f64`.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Float(f) => f,
        }
    }

    /// Compares by numeric value regardless of representation.
    pub fn compare(self, other: Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(&b),
            (a, b) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
        }
    }

    /// Adds two numbers, staying integral when both are integers and the sum fits.
    pub fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_add(b) {
                Some(sum) => Number::Int(sum),
                None => Number::Float(Number::Int(a).as_f64() + Number::Int(b).as_f64()),
            },
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        match n {
            Number::Int(i) => Value::Integer(i),
            Number::Float(f) => Value::Float(f),
        }
    }
}

impl Value {
    /// Creates a map value from key/value pairs.
    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Creates a byte blob value.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Pointer(_) => "pointer",
            Value::GeoPoint(_) => "geopoint",
            Value::Polygon(_) => "polygon",
            Value::File(_) => "file",
            Value::Relation(_) => "relation",
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a number of either representation.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Integer(n) => Some(Number::Int(*n)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    /// Get this value as `f64` if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().map(Number::as_f64)
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a date, if it is one.
    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(d),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Get this value as a pointer, if it is one.
    pub fn as_pointer(&self) -> Option<&Pointer> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }

    /// Get this value as a geo point, if it is one.
    pub fn as_geo_point(&self) -> Option<&GeoPoint> {
        match self {
            Value::GeoPoint(p) => Some(p),
            _ => None,
        }
    }

    /// Get this value as a polygon, if it is one.
    pub fn as_polygon(&self) -> Option<&Polygon> {
        match self {
            Value::Polygon(p) => Some(p),
            _ => None,
        }
    }

    /// Get this value as a relation, if it is one.
    pub fn as_relation(&self) -> Option<&RelationRef> {
        match self {
            Value::Relation(r) => Some(r),
            _ => None,
        }
    }

    /// Look up a key in this map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Visits every pointer reachable inside this value (arrays, maps and
    /// relation members included).
    pub fn for_each_pointer(&self, f: &mut dyn FnMut(&Pointer)) {
        match self {
            Value::Pointer(p) => f(p),
            Value::Array(items) => {
                for item in items {
                    item.for_each_pointer(f);
                }
            }
            Value::Map(map) => {
                for item in map.values() {
                    item.for_each_pointer(f);
                }
            }
            Value::Relation(rel) => {
                for p in &rel.known {
                    f(p);
                }
            }
            _ => {}
        }
    }

    /// Rewrites every local-id pointer whose id `resolve` knows into a
    /// server-id pointer. Returns whether anything changed.
    pub fn resolve_local_ids(&mut self, resolve: &dyn Fn(&str) -> Option<String>) -> bool {
        match self {
            Value::Pointer(p) => resolve_pointer(p, resolve),
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |changed, item| item.resolve_local_ids(resolve) | changed),
            Value::Map(map) => map
                .values_mut()
                .fold(false, |changed, item| item.resolve_local_ids(resolve) | changed),
            Value::Relation(rel) => rel
                .known
                .iter_mut()
                .fold(false, |changed, p| resolve_pointer(p, resolve) | changed),
            _ => false,
        }
    }
}

fn resolve_pointer(pointer: &mut Pointer, resolve: &dyn Fn(&str) -> Option<String>) -> bool {
    if let ObjectKey::LocalId(local) = &pointer.key {
        if let Some(object_id) = resolve(local) {
            pointer.key = ObjectKey::ObjectId(object_id);
            return true;
        }
    }
    false
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f64::from(f))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<Pointer> for Value {
    fn from(p: Pointer) -> Self {
        Value::Pointer(p)
    }
}

impl From<GeoPoint> for Value {
    fn from(p: GeoPoint) -> Self {
        Value::GeoPoint(p)
    }
}

impl From<Polygon> for Value {
    fn from(p: Polygon) -> Self {
        Value::Polygon(p)
    }
}

impl From<FileRef> for Value {
    fn from(f: FileRef) -> Self {
        Value::File(f)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}
