//! Collection schema descriptors and the schema registry.
//!
//! A schema describes the shape of one tenant collection. Accessors are only
//! ever handed out for registered schemas, and every document written through
//! them is checked against the descriptor first.

use crate::error::{TenantError, TenantResult};
use crate::models::query::QueryParam;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A JSON object as read from or written to a collection.
pub type Document = serde_json::Map<String, JsonValue>;

/// Columns every collection carries in addition to its declared fields.
pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "created_at";
pub const UPDATED_AT_FIELD: &str = "updated_at";
pub const RESERVED_FIELDS: &[&str] = &[ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD];

/// Storage type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    /// RFC 3339, normalised to UTC
    Timestamp,
    /// Arbitrary JSON, stored serialized
    Json,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Applied on insert when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    #[serde(default)]
    pub unique: bool,
    /// Allowed values for text fields. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    /// Text is stored lowercased, so unique checks are case-insensitive.
    #[serde(default)]
    pub lowercase: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            unique: false,
            choices: Vec::new(),
            lowercase: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn lowercase(mut self) -> Self {
        self.lowercase = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<JsonValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Convert a JSON value into a bind parameter for this field.
    pub fn to_param(&self, value: &JsonValue) -> TenantResult<QueryParam> {
        if value.is_null() {
            if self.required {
                return Err(TenantError::invalid_input(format!(
                    "Field '{}' is required and cannot be null",
                    self.name
                )));
            }
            return Ok(QueryParam::Null);
        }

        let param = match (self.kind, value) {
            (FieldType::Text, JsonValue::String(s)) => {
                let s = self.normalize_text(s);
                if self.required && s.is_empty() {
                    return Err(TenantError::invalid_input(format!(
                        "Field '{}' is required and cannot be blank",
                        self.name
                    )));
                }
                if !self.choices.is_empty() && !self.choices.iter().any(|c| *c == s) {
                    return Err(TenantError::invalid_input(format!(
                        "Field '{}' must be one of: {}",
                        self.name,
                        self.choices.join(", ")
                    )));
                }
                QueryParam::String(s)
            }
            (FieldType::Integer, JsonValue::Number(n)) => match n.as_i64() {
                Some(v) => QueryParam::Int(v),
                None => return Err(self.type_mismatch(value)),
            },
            (FieldType::Float, JsonValue::Number(n)) => match n.as_f64() {
                Some(v) => QueryParam::Float(v),
                None => return Err(self.type_mismatch(value)),
            },
            (FieldType::Boolean, JsonValue::Bool(b)) => QueryParam::Bool(*b),
            (FieldType::Timestamp, JsonValue::String(s)) => {
                QueryParam::String(self.normalize_timestamp(s)?)
            }
            (FieldType::Json, other) => QueryParam::String(other.to_string()),
            _ => return Err(self.type_mismatch(value)),
        };
        Ok(param)
    }

    /// Coerce a raw query-string value into a bind parameter for this field.
    pub fn parse_param(&self, raw: &str) -> TenantResult<QueryParam> {
        let invalid = || {
            TenantError::invalid_input(format!(
                "Filter value '{}' is not a valid {} for '{}'",
                raw, self.kind, self.name
            ))
        };
        match self.kind {
            FieldType::Text => Ok(QueryParam::String(self.normalize_text(raw))),
            FieldType::Integer => raw.trim().parse().map(QueryParam::Int).map_err(|_| invalid()),
            FieldType::Float => raw.trim().parse().map(QueryParam::Float).map_err(|_| invalid()),
            FieldType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(QueryParam::Bool(true)),
                "false" => Ok(QueryParam::Bool(false)),
                _ => Err(invalid()),
            },
            FieldType::Timestamp => self.normalize_timestamp(raw).map(QueryParam::String),
            FieldType::Json => Err(TenantError::invalid_input(format!(
                "Field '{}' holds JSON and cannot be filtered on",
                self.name
            ))),
        }
    }

    fn normalize_text(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if self.lowercase {
            trimmed.to_lowercase()
        } else {
            trimmed.to_string()
        }
    }

    fn normalize_timestamp(&self, raw: &str) -> TenantResult<String> {
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|ts| format_timestamp(ts.with_timezone(&Utc)))
            .map_err(|e| {
                TenantError::invalid_input(format!(
                    "Field '{}' must be an RFC 3339 timestamp: {}",
                    self.name, e
                ))
            })
    }

    fn type_mismatch(&self, value: &JsonValue) -> TenantError {
        TenantError::invalid_input(format!(
            "Field '{}' expects {}, got {}",
            self.name,
            self.kind,
            json_type_name(value)
        ))
    }
}

/// Timestamps are stored as fixed-width UTC strings so they sort lexically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Check that a name is safe to splice into SQL as an identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Registry key, e.g. "lead".
    pub name: String,
    /// Table the documents live in, e.g. "leads".
    pub collection: String,
    pub fields: Vec<FieldDescriptor>,
}

impl SchemaDescriptor {
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        fields: Vec<FieldDescriptor>,
    ) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Structural checks run when a schema is registered.
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_identifier(&self.name) {
            return Err(format!("Invalid schema name '{}'", self.name));
        }
        if !is_valid_identifier(&self.collection) {
            return Err(format!(
                "Invalid collection name '{}' in schema '{}'",
                self.collection, self.name
            ));
        }
        if self.fields.is_empty() {
            return Err(format!("Schema '{}' declares no fields", self.name));
        }

        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !is_valid_identifier(&field.name) {
                return Err(format!(
                    "Invalid field name '{}' in schema '{}'",
                    field.name, self.name
                ));
            }
            if RESERVED_FIELDS.contains(&field.name.as_str()) {
                return Err(format!(
                    "Field '{}' in schema '{}' is reserved",
                    field.name, self.name
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(format!(
                    "Field '{}' is declared twice in schema '{}'",
                    field.name, self.name
                ));
            }
            if !field.choices.is_empty() && field.kind != FieldType::Text {
                return Err(format!(
                    "Field '{}' in schema '{}' has choices but is not text",
                    field.name, self.name
                ));
            }
            if let Some(default) = &field.default {
                field.to_param(default).map_err(|e| {
                    format!("Bad default for '{}' in '{}': {}", field.name, self.name, e)
                })?;
            }
        }
        Ok(())
    }

    /// Validate a full document for insertion.
    ///
    /// Rejects unknown and reserved fields, applies defaults and fails on
    /// missing required fields. Returns one bind value per declared field, in
    /// declaration order.
    pub fn prepare_insert(&self, document: &Document) -> TenantResult<Vec<QueryParam>> {
        self.reject_unknown(document)?;

        self.fields
            .iter()
            .map(|field| match document.get(&field.name).or(field.default.as_ref()) {
                Some(value) => field.to_param(value),
                None if field.required => Err(TenantError::invalid_input(format!(
                    "Missing required field '{}'",
                    field.name
                ))),
                None => Ok(QueryParam::Null),
            })
            .collect()
    }

    /// Validate a partial document for update.
    ///
    /// Returns the touched fields and their bind values, in declaration order.
    pub fn prepare_update<'a>(
        &'a self,
        document: &Document,
    ) -> TenantResult<Vec<(&'a FieldDescriptor, QueryParam)>> {
        self.reject_unknown(document)?;

        let changes = self
            .fields
            .iter()
            .filter_map(|field| document.get(&field.name).map(|value| (field, value)))
            .map(|(field, value)| field.to_param(value).map(|param| (field, param)))
            .collect::<TenantResult<Vec<_>>>()?;

        if changes.is_empty() {
            return Err(TenantError::invalid_input("Update document has no fields"));
        }
        Ok(changes)
    }

    fn reject_unknown(&self, document: &Document) -> TenantResult<()> {
        for key in document.keys() {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                return Err(TenantError::invalid_input(format!(
                    "Field '{}' is managed by the server and cannot be written",
                    key
                )));
            }
            if self.field(key).is_none() {
                return Err(TenantError::invalid_input(format!(
                    "Unknown field '{}' for schema '{}'",
                    key, self.name
                )));
            }
        }
        Ok(())
    }

    /// The `lead` collection of the CRM.
    pub fn lead() -> Self {
        Self::new(
            "lead",
            "leads",
            vec![
                FieldDescriptor::new("first_name", FieldType::Text).required(),
                FieldDescriptor::new("last_name", FieldType::Text).required(),
                FieldDescriptor::new("email", FieldType::Text)
                    .required()
                    .unique()
                    .lowercase(),
                FieldDescriptor::new("mobile_no", FieldType::Text)
                    .required()
                    .unique(),
                FieldDescriptor::new("landline_no", FieldType::Text).with_default(""),
                FieldDescriptor::new("province", FieldType::Text).required(),
                FieldDescriptor::new("city", FieldType::Text).required(),
                FieldDescriptor::new("lead_type", FieldType::Text)
                    .required()
                    .with_default("Support")
                    .with_choices(&["Support", "Sales", "Consultation"]),
                FieldDescriptor::new("lead_status", FieldType::Text)
                    .required()
                    .with_default("Open")
                    .with_choices(&["Open", "Converted", "Rejected", "Discarded"]),
                FieldDescriptor::new("lead_progress", FieldType::Text)
                    .required()
                    .with_default("New Lead Entry")
                    .with_choices(&[
                        "New Lead Entry",
                        "Contacted",
                        "Qualified",
                        "Proposal Sent",
                        "Negotiation",
                        "Closed Won",
                        "Closed Lost",
                    ]),
                FieldDescriptor::new("allocator_remarks", FieldType::Text).with_default(""),
                FieldDescriptor::new("user_remarks", FieldType::Text).with_default(""),
                FieldDescriptor::new("appointment_date", FieldType::Timestamp),
            ],
        )
    }

    /// The `product` collection.
    pub fn product() -> Self {
        Self::new(
            "product",
            "products",
            vec![
                FieldDescriptor::new("name", FieldType::Text).required(),
                FieldDescriptor::new("description", FieldType::Text).with_default(""),
                FieldDescriptor::new("price", FieldType::Float).required(),
                FieldDescriptor::new("sku", FieldType::Text).required().unique(),
            ],
        )
    }
}

/// Explicit registry of the schemas accessors may be bound to.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<SchemaDescriptor>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `lead` and `product` schemas.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for schema in [SchemaDescriptor::lead(), SchemaDescriptor::product()] {
            // Built-in descriptors are static; a failure here is a programming error
            // surfaced by the unit tests below.
            if let Err(e) = registry.register(schema) {
                tracing::error!(error = %e, "Invalid built-in schema");
            }
        }
        registry
    }

    /// Load a registry from a JSON array of schema descriptors.
    pub fn from_json_file(path: &Path) -> TenantResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TenantError::invalid_input(format!(
                "Failed to read schema file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> TenantResult<Self> {
        let descriptors: Vec<SchemaDescriptor> = serde_json::from_str(raw)
            .map_err(|e| TenantError::invalid_input(format!("Invalid schema JSON: {}", e)))?;

        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, schema: SchemaDescriptor) -> TenantResult<()> {
        schema.validate().map_err(TenantError::invalid_input)?;
        if self.schemas.contains_key(&schema.name) {
            return Err(TenantError::invalid_input(format!(
                "Schema '{}' is already registered",
                schema.name
            )));
        }
        self.schemas.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, name: &str) -> TenantResult<Arc<SchemaDescriptor>> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| TenantError::schema_not_found(name))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_builtin_schemas_are_valid() {
        assert!(SchemaDescriptor::lead().validate().is_ok());
        assert!(SchemaDescriptor::product().validate().is_ok());

        let registry = SchemaRegistry::builtin();
        assert_eq!(registry.names(), vec!["lead", "product"]);
    }

    #[test]
    fn test_registry_unknown_schema() {
        let registry = SchemaRegistry::builtin();
        assert!(matches!(
            registry.get("invoice"),
            Err(TenantError::SchemaNotFound { .. })
        ));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = SchemaRegistry::builtin();
        let err = registry.register(SchemaDescriptor::product()).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("leads"));
        assert!(is_valid_identifier("_tmp_2"));
        assert!(!is_valid_identifier("Leads"));
        assert!(!is_valid_identifier("2leads"));
        assert!(!is_valid_identifier("leads; DROP TABLE x"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn test_schema_rejects_reserved_field() {
        let schema = SchemaDescriptor::new(
            "note",
            "notes",
            vec![FieldDescriptor::new("created_at", FieldType::Timestamp)],
        );
        assert!(schema.validate().unwrap_err().contains("reserved"));
    }

    #[test]
    fn test_schema_rejects_bad_default() {
        let schema = SchemaDescriptor::new(
            "note",
            "notes",
            vec![FieldDescriptor::new("pinned", FieldType::Boolean).with_default("yes")],
        );
        assert!(schema.validate().unwrap_err().contains("Bad default"));
    }

    #[test]
    fn test_prepare_insert_applies_defaults() {
        let schema = SchemaDescriptor::lead();
        let params = schema
            .prepare_insert(&doc(json!({
                "first_name": "  Ada ",
                "last_name": "Lovelace",
                "email": "ada@example.com",
                "mobile_no": "0300",
                "province": "Punjab",
                "city": "Lahore"
            })))
            .unwrap();

        assert_eq!(params.len(), schema.fields.len());
        assert!(matches!(&params[0], QueryParam::String(s) if s == "Ada"));
        let lead_status = schema
            .fields
            .iter()
            .position(|f| f.name == "lead_status")
            .unwrap();
        assert!(matches!(&params[lead_status], QueryParam::String(s) if s == "Open"));
        assert!(matches!(params.last(), Some(QueryParam::Null)));
    }

    #[test]
    fn test_prepare_insert_missing_required() {
        let err = SchemaDescriptor::product()
            .prepare_insert(&doc(json!({"name": "Widget", "sku": "W-1"})))
            .unwrap_err();
        assert!(err.to_string().contains("price"));
    }

    #[test]
    fn test_prepare_insert_rejects_unknown_and_reserved() {
        let schema = SchemaDescriptor::product();
        let err = schema
            .prepare_insert(&doc(json!({"name": "W", "price": 1.0, "sku": "W", "colour": "red"})))
            .unwrap_err();
        assert!(err.to_string().contains("Unknown field 'colour'"));

        let err = schema
            .prepare_insert(&doc(json!({"id": "x", "name": "W", "price": 1.0, "sku": "W"})))
            .unwrap_err();
        assert!(err.to_string().contains("managed by the server"));
    }

    #[test]
    fn test_type_mismatch() {
        let err = SchemaDescriptor::product()
            .prepare_insert(&doc(json!({"name": "W", "price": "cheap", "sku": "W"})))
            .unwrap_err();
        assert!(err.to_string().contains("expects float, got string"));
    }

    #[test]
    fn test_choices_enforced() {
        let schema = SchemaDescriptor::lead();
        let err = schema
            .prepare_update(&doc(json!({"lead_status": "Lost"})))
            .unwrap_err();
        assert!(err.to_string().contains("must be one of"));
    }

    #[test]
    fn test_required_text_rejects_blank() {
        let schema = SchemaDescriptor::product();
        let err = schema
            .prepare_insert(&doc(json!({"name": "   ", "price": 1.0, "sku": "W-1"})))
            .unwrap_err();
        assert!(err.to_string().contains("cannot be blank"));

        // Optional text may still be empty
        let description = schema.field("description").unwrap();
        assert!(matches!(description.to_param(&json!("  ")), Ok(QueryParam::String(s)) if s.is_empty()));
    }

    #[test]
    fn test_lowercase_text_normalized() {
        let email = SchemaDescriptor::lead().field("email").unwrap().clone();
        assert!(matches!(
            email.to_param(&json!(" Ada@Example.COM ")),
            Ok(QueryParam::String(s)) if s == "ada@example.com"
        ));
        assert!(matches!(
            email.parse_param("ADA@example.com"),
            Ok(QueryParam::String(s)) if s == "ada@example.com"
        ));
    }

    #[test]
    fn test_prepare_update_partial() {
        let schema = SchemaDescriptor::product();
        let changes = schema
            .prepare_update(&doc(json!({"sku": "W-2", "price": 12})))
            .unwrap();
        let names: Vec<&str> = changes.iter().map(|(f, _)| f.name.as_str()).collect();
        assert_eq!(names, vec!["price", "sku"]);
        assert!(matches!(changes[0].1, QueryParam::Float(v) if v == 12.0));
    }

    #[test]
    fn test_prepare_update_rejects_empty_and_required_null() {
        let schema = SchemaDescriptor::product();
        assert!(schema.prepare_update(&Document::new()).is_err());
        let err = schema
            .prepare_update(&doc(json!({"name": null})))
            .unwrap_err();
        assert!(err.to_string().contains("cannot be null"));
    }

    #[test]
    fn test_timestamp_normalized_to_utc() {
        let field = FieldDescriptor::new("appointment_date", FieldType::Timestamp);
        let param = field.to_param(&json!("2024-05-01T10:00:00+05:00")).unwrap();
        assert!(matches!(param, QueryParam::String(s) if s == "2024-05-01T05:00:00.000Z"));
    }

    #[test]
    fn test_parse_param_coercion() {
        let int = FieldDescriptor::new("qty", FieldType::Integer);
        assert!(matches!(int.parse_param("42"), Ok(QueryParam::Int(42))));
        assert!(int.parse_param("forty").is_err());

        let flag = FieldDescriptor::new("active", FieldType::Boolean);
        assert!(matches!(flag.parse_param("TRUE"), Ok(QueryParam::Bool(true))));

        let meta = FieldDescriptor::new("meta", FieldType::Json);
        assert!(meta.parse_param("{}").is_err());
    }

    #[test]
    fn test_registry_from_json() {
        let registry = SchemaRegistry::from_json_str(
            r#"[{"name": "ticket", "collection": "tickets", "fields": [
                {"name": "title", "type": "text", "required": true},
                {"name": "priority", "type": "integer", "default": 3},
                {"name": "meta", "type": "json"}
            ]}]"#,
        )
        .unwrap();
        let ticket = registry.get("ticket").unwrap();
        assert_eq!(ticket.collection, "tickets");
        assert_eq!(ticket.fields[1].default, Some(json!(3)));
    }

    #[test]
    fn test_registry_from_json_rejects_invalid() {
        let err = SchemaRegistry::from_json_str(
            r#"[{"name": "Ticket", "collection": "tickets", "fields": []}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, TenantError::InvalidInput { .. }));
    }
}
