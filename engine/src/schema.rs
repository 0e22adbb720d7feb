//! Collection descriptors and validation.
//!
//! A descriptor tells the engine everything collection-specific: the local
//! store key, the remote table, how content fields map onto remote columns,
//! the optional nested child list, and how to recognize duplicate content
//! during merge. One generic merge and one generic remote client serve every
//! collection through these descriptors.

use crate::{error::Result, CollectionName, Error, Record};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Field types supported in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a content field and its remote column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name in local records
    pub name: String,
    /// Column name on the remote side
    pub column: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            column: snake_case(&name),
            name,
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            column: snake_case(&name),
            name,
            field_type,
            required: false,
        }
    }

    /// Override the remote column name (defaults to the snake_case name).
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else if ch == '-' {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    out
}

/// Map the listed fields of an object onto their remote columns.
fn fields_to_columns(defs: &[FieldDef], fields: &Map<String, Value>) -> Map<String, Value> {
    defs.iter()
        .filter_map(|def| {
            fields
                .get(&def.name)
                .map(|value| (def.column.clone(), value.clone()))
        })
        .collect()
}

/// Map remote columns back onto local field names.
fn columns_to_fields(defs: &[FieldDef], row: &Map<String, Value>) -> Map<String, Value> {
    defs.iter()
        .filter_map(|def| {
            row.get(&def.column)
                .filter(|value| !value.is_null())
                .map(|value| (def.name.clone(), value.clone()))
        })
        .collect()
}

/// A nested child list stored in its own remote table.
///
/// Children are never diffed: every remote write deletes the parent's child
/// rows and inserts the current list again, with a `position` column to
/// keep the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildSpec {
    /// Local field holding the child array (e.g. `cards`)
    pub field: String,
    /// Remote child table
    pub table: String,
    /// Child column referencing the parent's remote id
    pub parent_column: String,
    /// Child field definitions
    pub fields: Vec<FieldDef>,
}

impl ChildSpec {
    /// Column carrying the child's index within its parent.
    pub const POSITION_COLUMN: &'static str = "position";

    /// Create a new child list specification.
    pub fn new(
        field: impl Into<String>,
        table: impl Into<String>,
        parent_column: impl Into<String>,
        fields: Vec<FieldDef>,
    ) -> Self {
        Self {
            field: field.into(),
            table: table.into(),
            parent_column: parent_column.into(),
            fields,
        }
    }

    /// Children of a record, empty when the field is absent.
    pub fn children<'a>(&self, record: &'a Record) -> &'a [Value] {
        record
            .field(&self.field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Build the remote rows for a record's children.
    pub fn to_rows(&self, record: &Record, parent_id: &str) -> Vec<Value> {
        self.children(record)
            .iter()
            .enumerate()
            .map(|(position, child)| {
                let mut row = child
                    .as_object()
                    .map(|obj| fields_to_columns(&self.fields, obj))
                    .unwrap_or_default();
                row.insert(self.parent_column.clone(), Value::from(parent_id));
                row.insert(Self::POSITION_COLUMN.to_string(), Value::from(position));
                Value::Object(row)
            })
            .collect()
    }

    /// Rebuild the local child array from remote rows, ordered by position.
    pub fn from_rows(&self, rows: &[Value]) -> Value {
        let mut ordered: Vec<&Map<String, Value>> =
            rows.iter().filter_map(Value::as_object).collect();
        ordered.sort_by_key(|row| {
            row.get(Self::POSITION_COLUMN)
                .and_then(Value::as_u64)
                .unwrap_or(u64::MAX)
        });
        Value::Array(
            ordered
                .into_iter()
                .map(|row| Value::Object(columns_to_fields(&self.fields, row)))
                .collect(),
        )
    }

    fn validate(&self, record: &Record) -> Result<()> {
        match record.field(&self.field) {
            None | Some(Value::Null) | Some(Value::Array(_)) => {}
            Some(_) => {
                return Err(Error::InvalidPayload(format!(
                    "'{}' must be an array",
                    self.field
                )))
            }
        }
        for child in self.children(record) {
            let obj = child.as_object().ok_or_else(|| {
                Error::InvalidPayload(format!("entries of '{}' must be objects", self.field))
            })?;
            for def in &self.fields {
                def.validate(obj.get(&def.name))?;
            }
        }
        Ok(())
    }
}

/// Best-effort rule for recognizing the same content under two identities.
///
/// Two records match when every listed field is a non-empty string on both
/// sides and their first `prefix_len` characters agree. An empty field list
/// never matches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRule {
    pub fields: Vec<String>,
    pub prefix_len: usize,
}

impl IdentityRule {
    /// A rule comparing the given fields on a prefix of `prefix_len` characters.
    pub fn prefix(fields: &[&str], prefix_len: usize) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            prefix_len,
        }
    }

    /// A rule that never matches.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether two records look like the same content.
    pub fn matches(&self, a: &Record, b: &Record) -> bool {
        if self.fields.is_empty() || self.prefix_len == 0 {
            return false;
        }
        self.fields.iter().all(|field| {
            match (a.str_field(field), b.str_field(field)) {
                (Some(x), Some(y)) if !x.trim().is_empty() && !y.trim().is_empty() => {
                    x.chars().take(self.prefix_len).eq(y.chars().take(self.prefix_len))
                }
                _ => false,
            }
        })
    }
}

/// Everything the engine needs to know about one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDescriptor {
    /// Collection name, also the local store key
    pub name: CollectionName,
    /// Remote table name
    pub table: String,
    /// Remote column scoping rows to a principal
    pub owner_column: String,
    /// Content field definitions
    pub fields: Vec<FieldDef>,
    /// Nested child list, if any
    pub children: Option<ChildSpec>,
    /// Duplicate detection used by merge
    pub identity: IdentityRule,
}

impl CollectionDescriptor {
    /// Default owner column on the remote side.
    pub const DEFAULT_OWNER_COLUMN: &'static str = "user_id";

    /// Create a descriptor; the remote table defaults to the snake_case name.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        let name = name.into();
        Self {
            table: snake_case(&name),
            name,
            owner_column: Self::DEFAULT_OWNER_COLUMN.to_string(),
            fields,
            children: None,
            identity: IdentityRule::none(),
        }
    }

    /// Builder-style remote table override.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Builder-style owner column override.
    pub fn with_owner_column(mut self, column: impl Into<String>) -> Self {
        self.owner_column = column.into();
        self
    }

    /// Builder-style nested child list.
    pub fn with_children(mut self, children: ChildSpec) -> Self {
        self.children = Some(children);
        self
    }

    /// Builder-style duplicate detection rule.
    pub fn with_identity(mut self, identity: IdentityRule) -> Self {
        self.identity = identity;
        self
    }

    /// Validate a record's content before it is sent to the remote store.
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        for field in &self.fields {
            field.validate(record.field(&field.name))?;
        }
        if let Some(children) = &self.children {
            children.validate(record)?;
        }
        Ok(())
    }

    /// Remote columns for a record's own content (children excluded).
    pub fn to_columns(&self, record: &Record) -> Map<String, Value> {
        let mut columns = fields_to_columns(&self.fields, &record.fields);
        if let Some(children) = &self.children {
            columns.remove(&children.field);
        }
        columns
    }

    /// Local content fields from a remote row (children excluded).
    pub fn from_columns(&self, row: &Map<String, Value>) -> Map<String, Value> {
        columns_to_fields(&self.fields, row)
    }
}

/// The set of collections the engine synchronizes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Collection descriptors by name
    pub collections: BTreeMap<CollectionName, CollectionDescriptor>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionDescriptor) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionDescriptor) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection descriptor by name.
    pub fn get_collection(&self, name: &str) -> Option<&CollectionDescriptor> {
        self.collections.get(name)
    }

    /// Get a collection descriptor, failing for unknown names.
    pub fn require(&self, name: &str) -> Result<&CollectionDescriptor> {
        self.get_collection(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// Collection names in deterministic order.
    pub fn names(&self) -> impl Iterator<Item = &CollectionName> {
        self.collections.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalId;
    use serde_json::json;

    fn deck_descriptor() -> CollectionDescriptor {
        CollectionDescriptor::new(
            "flashcard-decks",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("description", FieldType::String),
            ],
        )
        .with_children(ChildSpec::new(
            "cards",
            "flashcards",
            "deck_id",
            vec![
                FieldDef::required("front", FieldType::String),
                FieldDef::required("back", FieldType::String),
                FieldDef::optional("lastReviewed", FieldType::Timestamp),
            ],
        ))
        .with_identity(IdentityRule::prefix(&["title"], 64))
    }

    #[test]
    fn defaults_follow_name() {
        let desc = deck_descriptor();
        assert_eq!(desc.table, "flashcard_decks");
        assert_eq!(desc.owner_column, "user_id");
        assert_eq!(
            FieldDef::optional("lastReviewed", FieldType::Timestamp).column,
            "last_reviewed"
        );
        assert_eq!(FieldDef::optional("x", FieldType::Int).column("y").column, "y");
    }

    #[test]
    fn validate_required_field() {
        let desc = deck_descriptor();
        let ok = Record::new(LocalId(1), 1000, json!({"title": "Spanish"}));
        assert!(desc.validate_record(&ok).is_ok());

        let missing = Record::new(LocalId(2), 1000, json!({"description": "no title"}));
        assert_eq!(
            desc.validate_record(&missing),
            Err(Error::MissingRequiredField("title".into()))
        );

        let null = Record::new(LocalId(3), 1000, json!({"title": null}));
        assert!(desc.validate_record(&null).is_err());
    }

    #[test]
    fn validate_type_mismatch() {
        let desc = deck_descriptor();
        let bad = Record::new(LocalId(1), 1000, json!({"title": 12}));
        assert_eq!(
            desc.validate_record(&bad),
            Err(Error::TypeMismatch {
                field: "title".into(),
                expected: "String".into(),
                got: "Int".into(),
            })
        );
    }

    #[test]
    fn validate_children() {
        let desc = deck_descriptor();
        let good = Record::new(
            LocalId(1),
            1000,
            json!({"title": "t", "cards": [{"front": "hola", "back": "hello"}]}),
        );
        assert!(desc.validate_record(&good).is_ok());

        let bad_child = Record::new(LocalId(2), 1000, json!({"title": "t", "cards": [{"front": "hola"}]}));
        assert_eq!(
            desc.validate_record(&bad_child),
            Err(Error::MissingRequiredField("back".into()))
        );

        let not_array = Record::new(LocalId(3), 1000, json!({"title": "t", "cards": "oops"}));
        assert!(matches!(
            desc.validate_record(&not_array),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn column_mapping() {
        let desc = CollectionDescriptor::new(
            "notes",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("folderName", FieldType::String),
            ],
        );
        let record = Record::new(LocalId(1), 1000, json!({"title": "t", "folderName": "inbox", "ui": 1}));

        let columns = desc.to_columns(&record);
        assert_eq!(columns.get("folder_name"), Some(&json!("inbox")));
        assert!(!columns.contains_key("ui"));

        let back = desc.from_columns(&columns);
        assert_eq!(back.get("folderName"), Some(&json!("inbox")));
        assert_eq!(back.get("title"), Some(&json!("t")));
    }

    #[test]
    fn child_rows_keep_order() {
        let desc = deck_descriptor();
        let children = desc.children.as_ref().unwrap();
        let record = Record::new(
            LocalId(1),
            1000,
            json!({"title": "t", "cards": [
                {"front": "a", "back": "1"},
                {"front": "b", "back": "2", "lastReviewed": 5}
            ]}),
        );

        let rows = children.to_rows(&record, "parent-1");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["deck_id"], "parent-1");
        assert_eq!(rows[1]["position"], 1);
        assert_eq!(rows[1]["last_reviewed"], 5);

        let reversed: Vec<Value> = rows.into_iter().rev().collect();
        let rebuilt = children.from_rows(&reversed);
        assert_eq!(
            rebuilt,
            json!([{"front": "a", "back": "1"}, {"front": "b", "back": "2", "lastReviewed": 5}])
        );
    }

    #[test]
    fn identity_rule_prefix_match() {
        let rule = IdentityRule::prefix(&["title", "content"], 5);
        let a = Record::new(LocalId(1), 1, json!({"title": "Groceries", "content": "eggs and milk"}));
        let b = Record::new(LocalId(2), 2, json!({"title": "Groceries", "content": "eggs and bread"}));
        let c = Record::new(LocalId(3), 3, json!({"title": "Gym", "content": "eggs and milk"}));
        let empty = Record::new(LocalId(4), 4, json!({"title": "", "content": ""}));

        assert!(rule.matches(&a, &b));
        assert!(!rule.matches(&a, &c));
        assert!(!rule.matches(&empty, &empty));
        assert!(!IdentityRule::none().matches(&a, &a));
    }

    #[test]
    fn schema_lookup() {
        let schema = Schema::new().with_collection(deck_descriptor());
        assert!(schema.get_collection("flashcard-decks").is_some());
        assert_eq!(
            schema.require("quizzes").unwrap_err(),
            Error::UnknownCollection("quizzes".into())
        );
        assert_eq!(schema.names().count(), 1);
    }
}
