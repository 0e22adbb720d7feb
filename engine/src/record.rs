//! Record types for synchronized collection data.

use crate::{RemoteId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field names the engine owns; they never appear among content fields.
pub const RESERVED_FIELDS: [&str; 3] = ["localId", "remoteId", "updatedAt"];

/// Client-assigned record identifier, unique within one collection on one
/// device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LocalId(pub u64);

impl LocalId {
    /// Whether this identifier was derived from a remote identifier rather
    /// than assigned on this device.
    pub fn is_derived(&self) -> bool {
        self.0 >= crate::DERIVED_ID_BASE
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LocalId {
    fn from(value: u64) -> Self {
        LocalId(value)
    }
}

/// One user-data item within a collection.
///
/// Nested child lists (cards, questions, messages) are ordinary content
/// fields holding a JSON array; they are always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Identifier assigned on the device that created the record
    pub local_id: LocalId,
    /// Identifier assigned by the remote store, once it accepted the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    /// Last content write, milliseconds since epoch
    #[serde(default)]
    pub updated_at: Timestamp,
    /// Collection-specific content
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a record that has not reached the remote store yet.
    ///
    /// Non-object payloads yield a record without content fields.
    pub fn new(local_id: LocalId, updated_at: Timestamp, fields: Value) -> Self {
        let mut fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for reserved in RESERVED_FIELDS {
            fields.remove(reserved);
        }
        Self {
            local_id,
            remote_id: None,
            updated_at,
            fields,
        }
    }

    /// Builder-style setter for the remote identifier.
    pub fn with_remote_id(mut self, remote_id: impl Into<RemoteId>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    /// Whether the remote store has accepted this record at least once.
    pub fn is_synced(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Get a content field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get a content field as a string slice.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Compare content fields only, ignoring identifiers and timestamps.
    pub fn same_content(&self, other: &Record) -> bool {
        self.fields == other.fields
    }

    /// Take over another record's content and timestamp, keeping this
    /// record's identifiers.
    pub fn replace_content(&mut self, other: &Record) {
        self.fields = other.fields.clone();
        self.updated_at = other.updated_at;
    }
}
