//! Static field mapping between domain types and wire records.
//!
//! A type implementing [`Persistable`] declares, at compile time, which of
//! its properties map to which wire keys and whether a value transform
//! applies. Properties not listed in the table keep their names.
//!
//! ```
//! use offsync_core::{FieldMapping, Persistable};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Book {
//!     id: Option<String>,
//!     title: String,
//!     updated: Option<String>,
//! }
//!
//! impl Persistable for Book {
//!     const COLLECTION: &'static str = "books";
//!     const FIELDS: &'static [FieldMapping] = &[
//!         FieldMapping::new("id", "_id"),
//!         FieldMapping::new("updated", "_kmd.lmt"),
//!     ];
//! }
//! ```

use crate::entity::Entity;
use crate::error::{DataStoreError, DataStoreResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// A pair of value conversions applied when crossing the wire boundary.
#[derive(Debug, Clone, Copy)]
pub struct Transform {
    /// Converts a property value into its wire representation.
    pub to_wire: fn(Value) -> Value,
    /// Converts a wire value back into the property representation.
    pub from_wire: fn(Value) -> Value,
}

impl Transform {
    /// Stores epoch milliseconds as RFC 3339 strings on the wire.
    pub const EPOCH_MILLIS_AS_RFC3339: Transform = Transform {
        to_wire: millis_to_rfc3339,
        from_wire: rfc3339_to_millis,
    };
}

fn millis_to_rfc3339(value: Value) -> Value {
    value
        .as_i64()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|time| Value::String(time.to_rfc3339_opts(SecondsFormat::Millis, true)))
        .unwrap_or(value)
}

fn rfc3339_to_millis(value: Value) -> Value {
    value
        .as_str()
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|time| Value::from(time.timestamp_millis()))
        .unwrap_or(value)
}

/// One row of a field-mapping table.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapping {
    /// Property name in the domain type.
    pub property: &'static str,
    /// Wire key; dots address nested objects (`"_kmd.lmt"`).
    pub wire_key: &'static str,
    /// Optional value transform.
    pub transform: Option<Transform>,
}

impl FieldMapping {
    /// Maps a property to a wire key.
    pub const fn new(property: &'static str, wire_key: &'static str) -> Self {
        Self {
            property,
            wire_key,
            transform: None,
        }
    }

    /// Adds a value transform.
    pub const fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// A domain type stored in a collection.
pub trait Persistable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection name.
    const COLLECTION: &'static str;

    /// Field-mapping table.
    const FIELDS: &'static [FieldMapping];

    /// Converts the value into a wire record.
    fn to_entity(&self) -> DataStoreResult<Entity> {
        let Value::Object(mut properties) = serde_json::to_value(self)? else {
            return Err(DataStoreError::Serialization(format!(
                "{} does not serialize to an object",
                Self::COLLECTION
            )));
        };

        let mut wire = Map::new();
        for mapping in Self::FIELDS {
            let Some(value) = properties.remove(mapping.property) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let value = match mapping.transform {
                Some(transform) => (transform.to_wire)(value),
                None => value,
            };
            insert_path(&mut wire, mapping.wire_key, value);
        }
        for (key, value) in properties {
            wire.entry(key).or_insert(value);
        }
        Ok(Entity::from_map(wire))
    }

    /// Converts a wire record back into the value.
    fn from_entity(entity: Entity) -> DataStoreResult<Self> {
        let mut wire = entity.into_map();
        let mut properties = Map::new();
        for mapping in Self::FIELDS {
            if let Some(value) = remove_path(&mut wire, mapping.wire_key) {
                let value = match mapping.transform {
                    Some(transform) => (transform.from_wire)(value),
                    None => value,
                };
                properties.insert(mapping.property.to_string(), value);
            }
        }
        for (key, value) in wire {
            properties.entry(key).or_insert(value);
        }
        Ok(serde_json::from_value(Value::Object(properties))?)
    }
}

fn insert_path(object: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            object.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = object
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                insert_path(inner, rest, value);
            }
        }
    }
}

fn remove_path(object: &mut Map<String, Value>, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => object.remove(path),
        Some((head, rest)) => {
            let inner = object.get_mut(head)?.as_object_mut()?;
            let value = remove_path(inner, rest);
            if inner.is_empty() {
                object.remove(head);
            }
            value
        }
    }
}
