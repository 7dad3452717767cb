//! Declarative query descriptions and their REST encoding.
//!
//! A [`QueryState`] is evaluated either by the backend (encoded with
//! [`QueryState::to_rest`]) or by the offline query engine against the local
//! datastore. Both read the same constraint tree:
//!
//! ```text
//! where = { key: Equals(value) | Operators({ "$op": Operand }) }
//!         + $or: [where, ...]
//!         + $relatedTo: { object, key }
//! ```

use crate::error::{MooringError, MooringResult};
use mooring_codec::{
    encode_json, encode_pointer, GeoPoint, Pointer, Value, EARTH_MEAN_RADIUS_KM,
    EARTH_MEAN_RADIUS_MILE,
};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Operators applied to one key, e.g. `{"$gt": 5, "$lt": 10}`.
pub type KeyConstraints = BTreeMap<String, Operand>;

/// The argument of a query operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A plain value.
    Value(Value),
    /// A list of operands (`$in`, `$nin`, `$all`).
    List(Vec<Operand>),
    /// Nested operators (`$within: {$box: …}`, starts-with entries of `$all`).
    Constraints(KeyConstraints),
    /// A subquery (`$inQuery`, `$notInQuery`).
    Query(Box<QueryState>),
    /// A key of a subquery's results (`$select`, `$dontSelect`).
    KeyInQuery {
        /// Key read from each subquery result.
        key: String,
        /// The subquery.
        query: Box<QueryState>,
    },
}

impl Operand {
    /// A list of plain values.
    pub fn values(values: impl IntoIterator<Item = Value>) -> Operand {
        Operand::List(values.into_iter().map(Operand::Value).collect())
    }

    /// A starts-with constraint, `{"$regex": "^<quoted prefix>"}`.
    pub fn starts_with(prefix: &str) -> Operand {
        let mut constraints = KeyConstraints::new();
        constraints.insert(
            "$regex".to_string(),
            Operand::Value(Value::Text(format!("^{}", regex::escape(prefix)))),
        );
        Operand::Constraints(constraints)
    }

    fn encode(&self) -> Json {
        match self {
            Operand::Value(value) => encode_json(value),
            Operand::List(items) => Json::Array(items.iter().map(Operand::encode).collect()),
            Operand::Constraints(constraints) => Json::Object(
                constraints
                    .iter()
                    .map(|(op, operand)| (op.clone(), operand.encode()))
                    .collect(),
            ),
            Operand::Query(query) => query.to_rest(),
            Operand::KeyInQuery { key, query } => {
                let mut map = Map::new();
                map.insert("key".into(), Json::from(key.clone()));
                map.insert("query".into(), query.to_rest());
                Json::Object(map)
            }
        }
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Value(value)
    }
}

/// The constraint on one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Implicit equality.
    Equals(Value),
    /// Explicit operators.
    Operators(KeyConstraints),
}

/// `$relatedTo`: members of `object`'s relation `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedTo {
    /// The relation's owner.
    pub object: Pointer,
    /// The relation field.
    pub key: String,
}

/// The `where` clause of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryConstraints {
    /// Per-key constraints, all of which must hold.
    pub keys: BTreeMap<String, Constraint>,
    /// Alternatives, at least one of which must hold.
    pub or: Vec<QueryConstraints>,
    /// Relation membership.
    pub related_to: Option<RelatedTo>,
}

impl QueryConstraints {
    /// Encodes the clause to its REST form.
    pub fn encode(&self) -> Json {
        let mut map: Map<String, Json> = self
            .keys
            .iter()
            .map(|(key, constraint)| {
                let encoded = match constraint {
                    Constraint::Equals(value) => encode_json(value),
                    Constraint::Operators(ops) => Operand::Constraints(ops.clone()).encode(),
                };
                (key.clone(), encoded)
            })
            .collect();
        if !self.or.is_empty() {
            map.insert(
                "$or".into(),
                Json::Array(self.or.iter().map(QueryConstraints::encode).collect()),
            );
        }
        if let Some(related) = &self.related_to {
            let mut rel = Map::new();
            rel.insert("object".into(), encode_pointer(&related.object));
            rel.insert("key".into(), Json::from(related.key.clone()));
            map.insert("$relatedTo".into(), Json::Object(rel));
        }
        Json::Object(map)
    }
}

/// Where cached network results may be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CachePolicy {
    /// Always ask the network and never touch the cache.
    #[default]
    IgnoreCache,
    /// Only read the cache.
    CacheOnly,
    /// Read the cache, falling back to the network on a miss.
    CacheElseNetwork,
    /// Ask the network, falling back to the cache on a connection failure.
    NetworkElseCache,
}

/// An immutable query description.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    class_name: String,
    constraints: QueryConstraints,
    include: BTreeSet<String>,
    selected_keys: Option<BTreeSet<String>>,
    limit: Option<usize>,
    skip: usize,
    order: Vec<String>,
    ignore_acls: bool,
    from_local_datastore: bool,
    pin_name: Option<String>,
    cache_policy: CachePolicy,
    max_cache_age: Option<Duration>,
}

impl QueryState {
    /// Starts a query over `class_name`.
    pub fn builder(class_name: impl Into<String>) -> QueryBuilder {
        QueryBuilder {
            state: QueryState {
                class_name: class_name.into(),
                constraints: QueryConstraints::default(),
                include: BTreeSet::new(),
                selected_keys: None,
                limit: None,
                skip: 0,
                order: Vec::new(),
                ignore_acls: false,
                from_local_datastore: false,
                pin_name: None,
                cache_policy: CachePolicy::default(),
                max_cache_age: None,
            },
        }
    }

    /// Builds a query matching any of `queries`.
    ///
    /// # Errors
    ///
    /// Returns [`MooringError::IllegalArgument`] if `queries` is empty or
    /// spans several classes.
    pub fn or(queries: &[QueryState]) -> MooringResult<QueryBuilder> {
        let first = queries
            .first()
            .ok_or_else(|| {
                MooringError::illegal_argument("Can't take an or of an empty list of queries")
            })?;
        if queries.iter().any(|q| q.class_name != first.class_name) {
            return Err(MooringError::illegal_argument(
                "All of the queries in an or query must be on the same class",
            ));
        }
        let mut builder = QueryState::builder(first.class_name.clone());
        builder.state.constraints.or = queries.iter().map(|q| q.constraints.clone()).collect();
        Ok(builder)
    }

    /// Returns a builder seeded with this query.
    pub fn to_builder(&self) -> QueryBuilder {
        QueryBuilder {
            state: self.clone(),
        }
    }

    /// Class being queried.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The `where` clause.
    pub fn constraints(&self) -> &QueryConstraints {
        &self.constraints
    }

    /// Dotted paths of pointers to resolve in results.
    pub fn include(&self) -> &BTreeSet<String> {
        &self.include
    }

    /// Keys to return, or `None` for all.
    pub fn selected_keys(&self) -> Option<&BTreeSet<String>> {
        self.selected_keys.as_ref()
    }

    /// Maximum number of results.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Number of results to skip.
    pub fn skip(&self) -> usize {
        self.skip
    }

    /// Sort keys, `-` prefixed for descending.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Whether ACL visibility is ignored.
    pub fn ignore_acls(&self) -> bool {
        self.ignore_acls
    }

    /// Whether the query runs against the local datastore.
    pub fn is_from_local_datastore(&self) -> bool {
        self.from_local_datastore
    }

    /// Pin restricting a local query.
    pub fn pin_name(&self) -> Option<&str> {
        self.pin_name.as_deref()
    }

    /// Cache policy for network queries.
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Maximum age of a usable cached result.
    pub fn max_cache_age(&self) -> Option<Duration> {
        self.max_cache_age
    }

    /// Encodes the query as REST parameters: `className`, `where`, `order`,
    /// `include`, `keys`, `limit` and `skip`.
    pub fn to_rest(&self) -> Json {
        let mut map = Map::new();
        map.insert("className".into(), Json::from(self.class_name.clone()));
        map.insert("where".into(), self.constraints.encode());
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Json::from(limit));
        }
        if self.skip > 0 {
            map.insert("skip".into(), Json::from(self.skip));
        }
        if !self.order.is_empty() {
            map.insert("order".into(), Json::from(self.order.join(",")));
        }
        if !self.include.is_empty() {
            let include: Vec<&str> = self.include.iter().map(String::as_str).collect();
            map.insert("include".into(), Json::from(include.join(",")));
        }
        if let Some(keys) = &self.selected_keys {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            map.insert("keys".into(), Json::from(keys.join(",")));
        }
        Json::Object(map)
    }
}

/// Builder for [`QueryState`].
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    state: QueryState,
}

impl QueryBuilder {
    /// Adds an operator constraint on `key`. An earlier equality constraint
    /// on the same key is replaced.
    #[must_use]
    pub fn add_condition(mut self, key: &str, op: &str, operand: impl Into<Operand>) -> Self {
        let operand = operand.into();
        let keys = &mut self.state.constraints.keys;
        match keys.get_mut(key) {
            Some(Constraint::Operators(ops)) => {
                ops.insert(op.to_string(), operand);
            }
            _ => {
                let mut ops = KeyConstraints::new();
                ops.insert(op.to_string(), operand);
                keys.insert(key.to_string(), Constraint::Operators(ops));
            }
        }
        self
    }

    /// `key == value`. Equality to null also matches a missing key.
    #[must_use]
    pub fn where_equal_to(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.state
            .constraints
            .keys
            .insert(key.to_string(), Constraint::Equals(value.into()));
        self
    }

    /// `key != value`.
    #[must_use]
    pub fn where_not_equal_to(self, key: &str, value: impl Into<Value>) -> Self {
        self.add_condition(key, "$ne", value.into())
    }

    /// `key < value`.
    #[must_use]
    pub fn where_less_than(self, key: &str, value: impl Into<Value>) -> Self {
        self.add_condition(key, "$lt", value.into())
    }

    /// `key <= value`.
    #[must_use]
    pub fn where_less_than_or_equal_to(self, key: &str, value: impl Into<Value>) -> Self {
        self.add_condition(key, "$lte", value.into())
    }

    /// `key > value`.
    #[must_use]
    pub fn where_greater_than(self, key: &str, value: impl Into<Value>) -> Self {
        self.add_condition(key, "$gt", value.into())
    }

    /// `key >= value`.
    #[must_use]
    pub fn where_greater_than_or_equal_to(self, key: &str, value: impl Into<Value>) -> Self {
        self.add_condition(key, "$gte", value.into())
    }

    /// `key` equals one of `values`.
    #[must_use]
    pub fn where_contained_in(self, key: &str, values: impl IntoIterator<Item = Value>) -> Self {
        self.add_condition(key, "$in", Operand::values(values))
    }

    /// `key` equals none of `values`.
    #[must_use]
    pub fn where_not_contained_in(
        self,
        key: &str,
        values: impl IntoIterator<Item = Value>,
    ) -> Self {
        self.add_condition(key, "$nin", Operand::values(values))
    }

    /// Array `key` contains every one of `values`.
    #[must_use]
    pub fn where_contains_all(self, key: &str, values: impl IntoIterator<Item = Value>) -> Self {
        self.add_condition(key, "$all", Operand::values(values))
    }

    /// Array `key` has, for every prefix, an element starting with it.
    #[must_use]
    pub fn where_contains_all_starts_with<S: AsRef<str>>(
        self,
        key: &str,
        prefixes: impl IntoIterator<Item = S>,
    ) -> Self {
        let list = prefixes
            .into_iter()
            .map(|p| Operand::starts_with(p.as_ref()))
            .collect();
        self.add_condition(key, "$all", Operand::List(list))
    }

    /// `key` is present.
    #[must_use]
    pub fn where_exists(self, key: &str) -> Self {
        self.add_condition(key, "$exists", Value::Bool(true))
    }

    /// `key` is absent.
    #[must_use]
    pub fn where_does_not_exist(self, key: &str) -> Self {
        self.add_condition(key, "$exists", Value::Bool(false))
    }

    /// String `key` matches `pattern` with optional `modifiers`
    /// (`i`, `m`, `x`, `s`).
    #[must_use]
    pub fn where_matches(self, key: &str, pattern: &str, modifiers: Option<&str>) -> Self {
        let builder = self.add_condition(key, "$regex", Value::from(pattern));
        match modifiers.filter(|m| !m.is_empty()) {
            Some(modifiers) => builder.add_condition(key, "$options", Value::from(modifiers)),
            None => builder,
        }
    }

    /// String `key` starts with `prefix`, taken literally.
    #[must_use]
    pub fn where_starts_with(self, key: &str, prefix: &str) -> Self {
        self.where_matches(key, &format!("^{}", regex::escape(prefix)), None)
    }

    /// String `key` ends with `suffix`, taken literally.
    #[must_use]
    pub fn where_ends_with(self, key: &str, suffix: &str) -> Self {
        self.where_matches(key, &format!("{}$", regex::escape(suffix)), None)
    }

    /// String `key` contains `substring`, taken literally.
    #[must_use]
    pub fn where_contains(self, key: &str, substring: &str) -> Self {
        self.where_matches(key, &regex::escape(substring), None)
    }

    /// Geo point `key` near `point`; results sort by distance.
    #[must_use]
    pub fn where_near(self, key: &str, point: GeoPoint) -> Self {
        self.add_condition(key, "$nearSphere", Value::GeoPoint(point))
    }

    /// Geo point `key` within `max_distance` radians of `point`.
    #[must_use]
    pub fn where_within_radians(self, key: &str, point: GeoPoint, max_distance: f64) -> Self {
        self.where_near(key, point)
            .add_condition(key, "$maxDistance", Value::Float(max_distance))
    }

    /// Geo point `key` within `max_distance` kilometers of `point`.
    #[must_use]
    pub fn where_within_kilometers(self, key: &str, point: GeoPoint, max_distance: f64) -> Self {
        self.where_within_radians(key, point, max_distance / EARTH_MEAN_RADIUS_KM)
    }

    /// Geo point `key` within `max_distance` miles of `point`.
    #[must_use]
    pub fn where_within_miles(self, key: &str, point: GeoPoint, max_distance: f64) -> Self {
        self.where_within_radians(key, point, max_distance / EARTH_MEAN_RADIUS_MILE)
    }

    /// Geo point `key` inside the box spanned by `southwest` and `northeast`.
    #[must_use]
    pub fn where_within_geo_box(self, key: &str, southwest: GeoPoint, northeast: GeoPoint) -> Self {
        let mut inner = KeyConstraints::new();
        inner.insert(
            "$box".to_string(),
            Operand::Value(Value::Array(vec![southwest.into(), northeast.into()])),
        );
        self.add_condition(key, "$within", Operand::Constraints(inner))
    }

    /// Geo point `key` inside the polygon with vertices `points`.
    #[must_use]
    pub fn where_within_polygon(self, key: &str, points: Vec<GeoPoint>) -> Self {
        let mut inner = KeyConstraints::new();
        inner.insert(
            "$polygon".to_string(),
            Operand::Value(Value::Array(points.into_iter().map(Value::from).collect())),
        );
        self.add_condition(key, "$geoWithin", Operand::Constraints(inner))
    }

    /// Polygon `key` contains `point`.
    #[must_use]
    pub fn where_polygon_contains(self, key: &str, point: GeoPoint) -> Self {
        let mut inner = KeyConstraints::new();
        inner.insert("$point".to_string(), Operand::Value(Value::GeoPoint(point)));
        self.add_condition(key, "$geoIntersects", Operand::Constraints(inner))
    }

    /// Pointer `key` references an object matching `query`.
    #[must_use]
    pub fn where_matches_query(self, key: &str, query: &QueryState) -> Self {
        self.add_condition(key, "$inQuery", Operand::Query(Box::new(query.clone())))
    }

    /// Pointer `key` references no object matching `query`.
    #[must_use]
    pub fn where_does_not_match_query(self, key: &str, query: &QueryState) -> Self {
        self.add_condition(key, "$notInQuery", Operand::Query(Box::new(query.clone())))
    }

    /// `key` equals `key_in_query` of some result of `query`.
    #[must_use]
    pub fn where_matches_key_in_query(
        self,
        key: &str,
        key_in_query: &str,
        query: &QueryState,
    ) -> Self {
        self.add_condition(
            key,
            "$select",
            Operand::KeyInQuery {
                key: key_in_query.to_string(),
                query: Box::new(query.clone()),
            },
        )
    }

    /// `key` equals `key_in_query` of no result of `query`.
    #[must_use]
    pub fn where_does_not_match_key_in_query(
        self,
        key: &str,
        key_in_query: &str,
        query: &QueryState,
    ) -> Self {
        self.add_condition(
            key,
            "$dontSelect",
            Operand::KeyInQuery {
                key: key_in_query.to_string(),
                query: Box::new(query.clone()),
            },
        )
    }

    /// Members of `object`'s relation `key`.
    #[must_use]
    pub fn where_related_to(mut self, object: Pointer, key: &str) -> Self {
        self.state.constraints.related_to = Some(RelatedTo {
            object,
            key: key.to_string(),
        });
        self
    }

    /// Sorts ascending by `key`, replacing earlier sort keys.
    #[must_use]
    pub fn order_by_ascending(mut self, key: &str) -> Self {
        self.state.order = vec![key.to_string()];
        self
    }

    /// Sorts descending by `key`, replacing earlier sort keys.
    #[must_use]
    pub fn order_by_descending(mut self, key: &str) -> Self {
        self.state.order = vec![format!("-{key}")];
        self
    }

    /// Adds an ascending sort key.
    #[must_use]
    pub fn add_ascending_order(mut self, key: &str) -> Self {
        self.state.order.push(key.to_string());
        self
    }

    /// Adds a descending sort key.
    #[must_use]
    pub fn add_descending_order(mut self, key: &str) -> Self {
        self.state.order.push(format!("-{key}"));
        self
    }

    /// Resolves pointers along the dotted path `key` in results.
    #[must_use]
    pub fn include(mut self, key: &str) -> Self {
        self.state.include.insert(key.to_string());
        self
    }

    /// Restricts returned fields to `keys`.
    #[must_use]
    pub fn select_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.state
            .selected_keys
            .get_or_insert_with(BTreeSet::new)
            .extend(keys.into_iter().map(Into::into));
        self
    }

    /// Returns at most `limit` results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.state.limit = Some(limit);
        self
    }

    /// Skips the first `skip` results.
    #[must_use]
    pub fn skip(mut self, skip: usize) -> Self {
        self.state.skip = skip;
        self
    }

    /// Ignores ACL visibility.
    #[must_use]
    pub fn ignore_acls(mut self) -> Self {
        self.state.ignore_acls = true;
        self
    }

    /// Runs against every object in the local datastore.
    #[must_use]
    pub fn from_local_datastore(mut self) -> Self {
        self.state.from_local_datastore = true;
        self.state.pin_name = None;
        self
    }

    /// Runs against the objects pinned under `pin_name`.
    #[must_use]
    pub fn from_pin(mut self, pin_name: impl Into<String>) -> Self {
        self.state.from_local_datastore = true;
        self.state.pin_name = Some(pin_name.into());
        self
    }

    /// Sets the cache policy for network queries.
    #[must_use]
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.state.cache_policy = policy;
        self
    }

    /// Sets the maximum age of a usable cached result.
    #[must_use]
    pub fn max_cache_age(mut self, age: Duration) -> Self {
        self.state.max_cache_age = Some(age);
        self
    }

    /// Produces the query.
    pub fn build(&self) -> QueryState {
        self.state.clone()
    }
}
