//! Collection records.
//!
//! An [`Entity`] is a JSON object carrying a small set of well-known keys:
//!
//! - `_id`: immutable identifier assigned by the server, or a temporary
//!   placeholder (prefixed with [`TEMP_ID_PREFIX`]) until the server
//!   acknowledges the record
//! - `_kmd.lmt` / `_kmd.ect`: last-modified and creation timestamps
//! - `_acl`: access-control descriptor
//!
//! Every other key is a domain field and is carried through untouched.

use crate::error::{DataStoreError, DataStoreResult};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Wire key of the entity identifier.
pub const ID_KEY: &str = "_id";
/// Wire key of the metadata object.
pub const METADATA_KEY: &str = "_kmd";
/// Wire key of the access-control object.
pub const ACL_KEY: &str = "_acl";
/// Dotted path of the last-modified timestamp.
pub const LMT_PATH: &str = "_kmd.lmt";
/// Dotted path of the creation timestamp.
pub const ECT_PATH: &str = "_kmd.ect";
/// Prefix marking an id that the server has never acknowledged.
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Generates a new temporary id.
pub fn new_temporary_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

/// Returns true if `id` is a temporary placeholder.
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Compares two last-modified timestamps.
///
/// Timestamps are parsed as RFC 3339; if either side does not parse the
/// raw strings are compared instead.
pub fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (
        DateTime::<FixedOffset>::parse_from_rfc3339(a),
        DateTime::<FixedOffset>::parse_from_rfc3339(b),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Looks up a dotted path (`"_kmd.lmt"`) inside a JSON object.
pub fn lookup_path<'a>(object: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = object.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Server-maintained metadata of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Last-modified time.
    #[serde(rename = "lmt", skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<String>,
    /// Entity creation time.
    #[serde(rename = "ect", skip_serializing_if = "Option::is_none")]
    pub entity_creation_time: Option<String>,
}

/// Access-control descriptor of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// User id of the creator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    /// Whether every user may read the entity.
    #[serde(rename = "gr", skip_serializing_if = "Option::is_none")]
    pub global_read: Option<bool>,
    /// Whether every user may write the entity.
    #[serde(rename = "gw", skip_serializing_if = "Option::is_none")]
    pub global_write: Option<bool>,
    /// Users allowed to read.
    #[serde(rename = "r", default, skip_serializing_if = "Vec::is_empty")]
    pub readers: Vec<String>,
    /// Users allowed to write.
    #[serde(rename = "w", default, skip_serializing_if = "Vec::is_empty")]
    pub writers: Vec<String>,
}

/// A collection record.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
    /// Creates an empty entity with no id.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Creates an entity with the given id.
    pub fn with_id(id: impl Into<String>) -> Self {
        let mut entity = Self::new();
        entity.set_id(id);
        entity
    }

    /// Wraps a JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Converts a JSON value into an entity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidResponse` if the value is not an object.
    pub fn from_value(value: Value) -> DataStoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DataStoreError::invalid_response(
                200,
                format!("expected a JSON object, got {other}"),
            )),
        }
    }

    /// Converts a server record into an entity.
    ///
    /// # Errors
    ///
    /// Returns `ObjectIdMissing` if the record has no string `_id`.
    pub fn from_server_record(value: Value) -> DataStoreResult<Self> {
        let entity = Self::from_value(value)?;
        if entity.id().is_none() {
            return Err(DataStoreError::ObjectIdMissing);
        }
        Ok(entity)
    }

    /// Returns the entity id.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_KEY).and_then(Value::as_str)
    }

    /// Sets the entity id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(ID_KEY.to_string(), Value::String(id.into()));
    }

    /// Assigns a temporary id if the entity has none and returns the id.
    pub fn ensure_id(&mut self) -> String {
        match self.id() {
            Some(id) => id.to_string(),
            None => {
                let id = new_temporary_id();
                self.set_id(id.clone());
                id
            }
        }
    }

    /// Returns true if the entity has never been acknowledged by the server.
    pub fn is_temporary(&self) -> bool {
        self.id().is_some_and(is_temporary_id)
    }

    /// Returns the last-modified timestamp.
    pub fn last_modified_time(&self) -> Option<&str> {
        self.get(LMT_PATH).and_then(Value::as_str)
    }

    /// Returns the creation timestamp.
    pub fn entity_creation_time(&self) -> Option<&str> {
        self.get(ECT_PATH).and_then(Value::as_str)
    }

    /// Returns the metadata object, if present and well-formed.
    pub fn metadata(&self) -> Option<Metadata> {
        self.0
            .get(METADATA_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Replaces the metadata object.
    pub fn set_metadata(&mut self, metadata: &Metadata) -> DataStoreResult<()> {
        self.0
            .insert(METADATA_KEY.to_string(), serde_json::to_value(metadata)?);
        Ok(())
    }

    /// Returns the access-control descriptor, if present and well-formed.
    pub fn acl(&self) -> Option<Acl> {
        self.0
            .get(ACL_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Replaces the access-control descriptor.
    pub fn set_acl(&mut self, acl: &Acl) -> DataStoreResult<()> {
        self.0.insert(ACL_KEY.to_string(), serde_json::to_value(acl)?);
        Ok(())
    }

    /// Looks up a field by dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.0, path)
    }

    /// Sets a top-level field.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Removes a top-level field.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Returns the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consumes the entity and returns the JSON object.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Converts the entity into a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", Value::Object(self.0.clone()))
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        Value::Object(entity.0)
    }
}
