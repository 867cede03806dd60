//! Queries over collection records.
//!
//! A [`Query`] is evaluated locally against cached entities and encoded as
//! request parameters for the network. The two evaluations agree on which
//! records match, so a full-sync reconciliation can treat "matched by the
//! query" as the same set on both sides.

use crate::entity::{lookup_path, Entity, ID_KEY};
use crate::error::{DataStoreError, DataStoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// A filter predicate over dotted field paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Field equals value.
    Eq(String, Value),
    /// Field differs from value (or is missing).
    Ne(String, Value),
    /// Field is greater than value.
    Gt(String, Value),
    /// Field is greater than or equal to value.
    Gte(String, Value),
    /// Field is less than value.
    Lt(String, Value),
    /// Field is less than or equal to value.
    Lte(String, Value),
    /// Field equals one of the values.
    In(String, Vec<Value>),
    /// Field presence matches the flag.
    Exists(String, bool),
    /// All sub-filters match.
    And(Vec<Filter>),
    /// At least one sub-filter matches.
    Or(Vec<Filter>),
    /// The sub-filter does not match.
    Not(Box<Filter>),
}

impl Filter {
    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    /// `field != value`
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    /// `field >= value`
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    /// `field <= value`
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte(field.into(), value.into())
    }

    /// `field IN values`
    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// Matches entities whose id is one of `ids`.
    pub fn ids_in<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::In(
            ID_KEY.to_string(),
            ids.into_iter().map(|id| Value::String(id.into())).collect(),
        )
    }

    /// Evaluates the filter against a JSON object.
    pub fn matches(&self, object: &Map<String, Value>) -> bool {
        match self {
            Filter::Eq(field, value) => lookup_path(object, field) == Some(value),
            Filter::Ne(field, value) => lookup_path(object, field) != Some(value),
            Filter::Gt(field, value) => compare_field(object, field, value) == Some(Ordering::Greater),
            Filter::Gte(field, value) => matches!(
                compare_field(object, field, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt(field, value) => compare_field(object, field, value) == Some(Ordering::Less),
            Filter::Lte(field, value) => matches!(
                compare_field(object, field, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::In(field, values) => {
                lookup_path(object, field).is_some_and(|actual| values.contains(actual))
            }
            Filter::Exists(field, expected) => lookup_path(object, field).is_some() == *expected,
            Filter::And(filters) => filters.iter().all(|f| f.matches(object)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(object)),
            Filter::Not(filter) => !filter.matches(object),
        }
    }

    /// Encodes the filter as a Mongo-style JSON document.
    pub fn to_wire(&self) -> Value {
        fn op(field: &str, name: &str, value: Value) -> Value {
            let mut inner = Map::new();
            inner.insert(name.to_string(), value);
            let mut outer = Map::new();
            outer.insert(field.to_string(), Value::Object(inner));
            Value::Object(outer)
        }

        match self {
            Filter::Eq(field, value) => {
                let mut outer = Map::new();
                outer.insert(field.clone(), value.clone());
                Value::Object(outer)
            }
            Filter::Ne(field, value) => op(field, "$ne", value.clone()),
            Filter::Gt(field, value) => op(field, "$gt", value.clone()),
            Filter::Gte(field, value) => op(field, "$gte", value.clone()),
            Filter::Lt(field, value) => op(field, "$lt", value.clone()),
            Filter::Lte(field, value) => op(field, "$lte", value.clone()),
            Filter::In(field, values) => op(field, "$in", Value::Array(values.clone())),
            Filter::Exists(field, flag) => op(field, "$exists", Value::Bool(*flag)),
            Filter::And(filters) => {
                let mut outer = Map::new();
                outer.insert(
                    "$and".into(),
                    Value::Array(filters.iter().map(Filter::to_wire).collect()),
                );
                Value::Object(outer)
            }
            Filter::Or(filters) => {
                let mut outer = Map::new();
                outer.insert(
                    "$or".into(),
                    Value::Array(filters.iter().map(Filter::to_wire).collect()),
                );
                Value::Object(outer)
            }
            Filter::Not(filter) => {
                let mut outer = Map::new();
                outer.insert("$nor".into(), Value::Array(vec![filter.to_wire()]));
                Value::Object(outer)
            }
        }
    }
}

impl Filter {
    /// Decodes a Mongo-style JSON document produced by [`Filter::to_wire`].
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the document uses an unknown operator or
    /// has the wrong shape.
    pub fn from_wire(value: &Value) -> DataStoreResult<Self> {
        let Value::Object(clauses) = value else {
            return Err(bad_filter(value));
        };

        let mut filters = Vec::with_capacity(clauses.len());
        for (key, operand) in clauses {
            let filter = match key.as_str() {
                "$and" => Filter::And(Self::from_wire_list(operand)?),
                "$or" => Filter::Or(Self::from_wire_list(operand)?),
                "$nor" => {
                    let mut negated = Self::from_wire_list(operand)?;
                    let inner = if negated.len() == 1 {
                        negated.remove(0)
                    } else {
                        Filter::Or(negated)
                    };
                    Filter::Not(Box::new(inner))
                }
                field => Self::from_wire_field(field, operand)?,
            };
            filters.push(filter);
        }

        Ok(if filters.len() == 1 {
            filters.remove(0)
        } else {
            Filter::And(filters)
        })
    }

    fn from_wire_list(value: &Value) -> DataStoreResult<Vec<Self>> {
        value
            .as_array()
            .ok_or_else(|| bad_filter(value))?
            .iter()
            .map(Self::from_wire)
            .collect()
    }

    fn from_wire_field(field: &str, operand: &Value) -> DataStoreResult<Self> {
        let operators = match operand {
            Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
            other => return Ok(Filter::Eq(field.to_string(), other.clone())),
        };

        let mut filters = Vec::with_capacity(operators.len());
        for (name, value) in operators {
            let field = field.to_string();
            let filter = match name.as_str() {
                "$ne" => Filter::Ne(field, value.clone()),
                "$gt" => Filter::Gt(field, value.clone()),
                "$gte" => Filter::Gte(field, value.clone()),
                "$lt" => Filter::Lt(field, value.clone()),
                "$lte" => Filter::Lte(field, value.clone()),
                "$in" => Filter::In(
                    field,
                    value.as_array().ok_or_else(|| bad_filter(value))?.clone(),
                ),
                "$exists" => Filter::Exists(field, value.as_bool().ok_or_else(|| bad_filter(value))?),
                _ => return Err(bad_filter(operand)),
            };
            filters.push(filter);
        }

        Ok(if filters.len() == 1 {
            filters.remove(0)
        } else {
            Filter::And(filters)
        })
    }
}

fn bad_filter(value: &Value) -> DataStoreError {
    DataStoreError::Serialization(format!("unsupported filter: {value}"))
}

fn compare_field(object: &Map<String, Value>, field: &str, value: &Value) -> Option<Ordering> {
    let actual = lookup_path(object, field)?;
    match (actual, value) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Orders values of mixed types: missing/null, booleans, numbers, strings, others.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    /// Dotted field path.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
}

/// A query over one collection.
///
/// An unconstrained query (no filter, no skip, no limit) denotes the entire
/// collection; fetches with such a query may delete cached records the
/// server no longer returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Filter predicate.
    pub filter: Option<Filter>,
    /// Sort keys, most significant first.
    pub sort: Vec<Sort>,
    /// Number of records to skip.
    pub skip: Option<usize>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
    /// Field projection; `None` returns every field.
    pub fields: Option<BTreeSet<String>>,
}

impl Query {
    /// Creates a query matching the whole collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query with a filter.
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }

    /// Creates a query matching the given ids.
    pub fn ids_in<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::filtered(Filter::ids_in(ids))
    }

    /// Sets the filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Appends a sort key.
    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(Sort {
            field: field.into(),
            direction,
        });
        self
    }

    /// Sets the skip.
    #[must_use]
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sets the limit.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the field projection.
    #[must_use]
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Returns a copy with skip and limit removed.
    #[must_use]
    pub fn without_paging(&self) -> Self {
        Self {
            skip: None,
            limit: None,
            ..self.clone()
        }
    }

    /// Returns a copy without sort, paging or projection: the bare scope.
    #[must_use]
    pub fn scope(&self) -> Self {
        Self::from(self.filter.clone())
    }

    /// Returns true if the query denotes the entire collection.
    pub fn is_unconstrained(&self) -> bool {
        self.filter.is_none() && !self.is_paged()
    }

    /// Returns true if the query selects a page of its scope.
    pub fn is_paged(&self) -> bool {
        self.skip.is_some() || self.limit.is_some()
    }

    /// Returns true if the entity matches the filter.
    pub fn matches(&self, entity: &Entity) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.matches(entity.as_map()))
    }

    /// Filters, sorts, pages and projects the given entities.
    pub fn apply<I>(&self, entities: I) -> Vec<Entity>
    where
        I: IntoIterator<Item = Entity>,
    {
        let mut matched: Vec<Entity> = entities.into_iter().filter(|e| self.matches(e)).collect();

        if !self.sort.is_empty() {
            matched.sort_by(|a, b| {
                for key in &self.sort {
                    let ordering = compare_values(a.get(&key.field), b.get(&key.field));
                    let ordering = match key.direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = self.skip.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        let paged = matched.into_iter().skip(skip).take(limit);

        match &self.fields {
            Some(fields) => paged.map(|entity| project(&entity, fields)).collect(),
            None => paged.collect(),
        }
    }

    /// Encodes the query as request parameters.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(filter) = &self.filter {
            params.push(("query".to_string(), filter.to_wire().to_string()));
        }
        if !self.sort.is_empty() {
            // Built by hand: key order is significant for sorting.
            let keys: Vec<String> = self
                .sort
                .iter()
                .map(|key| {
                    let direction = match key.direction {
                        SortDirection::Ascending => 1,
                        SortDirection::Descending => -1,
                    };
                    format!("{}:{direction}", Value::String(key.field.clone()))
                })
                .collect();
            params.push(("sort".to_string(), format!("{{{}}}", keys.join(","))));
        }
        if let Some(skip) = self.skip {
            params.push(("skip".to_string(), skip.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(fields) = &self.fields {
            let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
            params.push(("fields".to_string(), fields.join(",")));
        }
        params
    }
}

impl Query {
    /// Decodes request parameters produced by [`Query::to_params`].
    ///
    /// Unknown parameters are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if a known parameter cannot be decoded.
    pub fn from_params(params: &[(String, String)]) -> DataStoreResult<Self> {
        let mut query = Query::new();
        for (name, value) in params {
            match name.as_str() {
                "query" => {
                    let document: Value = serde_json::from_str(value)?;
                    query.filter = Some(Filter::from_wire(&document)?);
                }
                "sort" => query.sort = parse_sort(value)?,
                "skip" => query.skip = Some(parse_count(name, value)?),
                "limit" => query.limit = Some(parse_count(name, value)?),
                "fields" => {
                    query.fields = Some(
                        value
                            .split(',')
                            .filter(|field| !field.is_empty())
                            .map(str::to_string)
                            .collect(),
                    );
                }
                _ => {}
            }
        }
        Ok(query)
    }
}

fn parse_count(name: &str, value: &str) -> DataStoreResult<usize> {
    value
        .parse()
        .map_err(|_| DataStoreError::Serialization(format!("invalid {name}: {value}")))
}

// Decoded by hand: a JSON map would lose the key order.
fn parse_sort(value: &str) -> DataStoreResult<Vec<Sort>> {
    let invalid = || DataStoreError::Serialization(format!("invalid sort: {value}"));
    let body = value
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(invalid)?;

    body.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (field, direction) = pair.rsplit_once(':').ok_or_else(invalid)?;
            let field: String = serde_json::from_str(field.trim())?;
            let direction = match direction.trim() {
                "1" => SortDirection::Ascending,
                "-1" => SortDirection::Descending,
                _ => return Err(invalid()),
            };
            Ok(Sort { field, direction })
        })
        .collect()
}

impl From<Option<Filter>> for Query {
    fn from(filter: Option<Filter>) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

/// Keeps only the projected fields (and the id) of an entity.
pub fn project(entity: &Entity, fields: &BTreeSet<String>) -> Entity {
    let mut out = Map::new();
    if let Some(id) = entity.as_map().get(ID_KEY) {
        out.insert(ID_KEY.to_string(), id.clone());
    }
    for path in fields {
        let Some(value) = entity.get(path) else {
            continue;
        };
        let mut segments: Vec<&str> = path.split('.').collect();
        let Some(last) = segments.pop() else {
            continue;
        };
        let mut target = &mut out;
        for segment in segments {
            let slot = target
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            target = match slot {
                Value::Object(map) => map,
                _ => unreachable!("slot was just made an object"),
            };
        }
        target.insert(last.to_string(), value.clone());
    }
    Entity::from_map(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn person(id: &str, name: &str, age: i64) -> Entity {
        Entity::from_value(json!({
            "_id": id,
            "name": name,
            "age": age,
            "_kmd": {"lmt": "2016-01-01T00:00:00Z"}
        }))
        .unwrap()
    }

    #[test]
    fn unconstrained_detection() {
        assert!(Query::new().is_unconstrained());
        assert!(Query::new()
            .sort_by("name", SortDirection::Ascending)
            .is_unconstrained());
        assert!(!Query::new().with_limit(10).is_unconstrained());
        assert!(!Query::new().with_skip(1).is_unconstrained());
        assert!(!Query::filtered(Filter::eq("a", 1)).is_unconstrained());

        assert!(Query::new().with_skip(0).is_paged());
        assert!(!Query::filtered(Filter::eq("a", 1)).is_paged());
    }

    #[test]
    fn filter_sort_page() {
        let people = vec![
            person("a", "Ana", 30),
            person("b", "Bob", 20),
            person("c", "Cid", 40),
            person("d", "Dee", 10),
        ];

        let query = Query::filtered(Filter::gte("age", 20))
            .sort_by("age", SortDirection::Descending)
            .with_skip(1)
            .with_limit(1);
        let result = query.apply(people);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id(), Some("a"));
    }

    #[test]
    fn ids_in_matches_only_listed() {
        let query = Query::ids_in(["a", "c"]);
        assert!(query.matches(&person("a", "Ana", 1)));
        assert!(!query.matches(&person("b", "Bob", 1)));
    }

    #[test]
    fn compound_filters() {
        let filter = Filter::Or(vec![
            Filter::eq("name", "Ana"),
            Filter::And(vec![Filter::lt("age", 25), Filter::Not(Box::new(Filter::eq("name", "Dee")))]),
        ]);
        let query = Query::filtered(filter);
        assert!(query.matches(&person("a", "Ana", 99)));
        assert!(query.matches(&person("b", "Bob", 20)));
        assert!(!query.matches(&person("d", "Dee", 10)));
        assert!(!query.matches(&person("c", "Cid", 40)));
    }

    #[test]
    fn projection_keeps_id_and_nested_paths() {
        let query = Query::new().with_fields(["_kmd.lmt"]);
        let result = query.apply(vec![person("a", "Ana", 1)]);
        assert_eq!(
            result[0].to_value(),
            json!({"_id": "a", "_kmd": {"lmt": "2016-01-01T00:00:00Z"}})
        );
    }

    #[test]
    fn wire_params() {
        let query = Query::filtered(Filter::ids_in(["a"]))
            .sort_by("b", SortDirection::Descending)
            .sort_by("a", SortDirection::Ascending)
            .with_skip(10)
            .with_limit(5)
            .with_fields(["_id", "_kmd.lmt"]);
        let params = query.to_params();
        assert_eq!(params[0], ("query".into(), r#"{"_id":{"$in":["a"]}}"#.into()));
        assert_eq!(params[1], ("sort".into(), r#"{"b":-1,"a":1}"#.into()));
        assert_eq!(params[2], ("skip".into(), "10".into()));
        assert_eq!(params[3], ("limit".into(), "5".into()));
        assert_eq!(params[4], ("fields".into(), "_id,_kmd.lmt".into()));
    }

    #[test]
    fn params_decode_back() {
        let query = Query::filtered(Filter::Or(vec![
            Filter::ids_in(["a", "b"]),
            Filter::And(vec![Filter::gte("age", 3), Filter::lt("age", 9)]),
            Filter::Not(Box::new(Filter::Exists("gone".into(), true))),
        ]))
        .sort_by("name", SortDirection::Descending)
        .sort_by("age", SortDirection::Ascending)
        .with_skip(4)
        .with_limit(2)
        .with_fields(["name"]);

        let decoded = Query::from_params(&query.to_params()).unwrap();
        assert_eq!(decoded, query);
    }

    #[test]
    fn range_on_one_field_decodes_as_and() {
        let filter = Filter::from_wire(&json!({"age": {"$gte": 1, "$lt": 5}})).unwrap();
        assert!(filter.matches(person("a", "Ana", 3).as_map()));
        assert!(!filter.matches(person("a", "Ana", 5).as_map()));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let result = Filter::from_wire(&json!({"age": {"$regex": "x"}}));
        assert!(matches!(result, Err(DataStoreError::Serialization(_))));
    }

    proptest! {
        #[test]
        fn paging_never_exceeds_limit(count in 0usize..50, skip in 0usize..60, limit in 0usize..60) {
            let people: Vec<Entity> = (0..count)
                .map(|i| person(&format!("id{i}"), "x", i as i64))
                .collect();
            let query = Query::new().with_skip(skip).with_limit(limit);
            let result = query.apply(people);
            prop_assert_eq!(result.len(), count.saturating_sub(skip).min(limit));
        }
    }
}
