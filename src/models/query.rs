//! Filter and bind-parameter models used by accessors.

use crate::error::{TenantError, TenantResult};
use crate::models::schema::{CREATED_AT_FIELD, FieldDescriptor, FieldType, ID_FIELD, SchemaDescriptor};
use serde::{Deserialize, Serialize};

/// Default row limit for `find_many`.
pub const DEFAULT_ROW_LIMIT: u32 = 100;

/// Maximum allowed row limit.
pub const MAX_ROW_LIMIT: u32 = 1000;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
}

impl QueryParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gte,
    Lte,
}

impl Comparison {
    pub fn operator(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gte => ">=",
            Self::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: Comparison,
    pub value: QueryParam,
}

/// Conditions for `find_many`, combined with AND.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
    limit: u32,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            conditions: Vec::new(),
            limit: DEFAULT_ROW_LIMIT,
        }
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    pub fn eq(mut self, field: impl Into<String>, value: QueryParam) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op: Comparison::Eq,
            value,
        });
        self
    }

    /// Only documents created at or after `ts` (RFC 3339).
    pub fn created_from(mut self, ts: impl Into<String>) -> Self {
        self.conditions.push(Condition {
            field: CREATED_AT_FIELD.to_string(),
            op: Comparison::Gte,
            value: QueryParam::String(ts.into()),
        });
        self
    }

    /// Only documents created at or before `ts` (RFC 3339).
    pub fn created_to(mut self, ts: impl Into<String>) -> Self {
        self.conditions.push(Condition {
            field: CREATED_AT_FIELD.to_string(),
            op: Comparison::Lte,
            value: QueryParam::String(ts.into()),
        });
        self
    }

    /// Set the row limit, clamped to `1..=MAX_ROW_LIMIT`.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit.clamp(1, MAX_ROW_LIMIT);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn row_limit(&self) -> u32 {
        self.limit
    }

    /// Build a filter from string key/value pairs, typically a query string.
    ///
    /// `limit`, `created_from` and `created_to` are recognised; every other key
    /// must be a field of `schema` (or `id`) and is matched for equality after
    /// coercion to the field's type.
    pub fn from_pairs<'a, I>(schema: &SchemaDescriptor, pairs: I) -> TenantResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let timestamp = FieldDescriptor::new(CREATED_AT_FIELD, FieldType::Timestamp);
        let id = FieldDescriptor::new(ID_FIELD, FieldType::Text);

        let mut filter = Self::new();
        for (key, raw) in pairs {
            filter = match key {
                "limit" => {
                    let limit = raw.trim().parse::<u32>().map_err(|_| {
                        TenantError::invalid_input(format!("Invalid limit '{}'", raw))
                    })?;
                    filter.limit(limit)
                }
                "created_from" => match timestamp.parse_param(raw)? {
                    QueryParam::String(ts) => filter.created_from(ts),
                    _ => filter,
                },
                "created_to" => match timestamp.parse_param(raw)? {
                    QueryParam::String(ts) => filter.created_to(ts),
                    _ => filter,
                },
                ID_FIELD => filter.eq(ID_FIELD, id.parse_param(raw)?),
                name => {
                    let field = schema.field(name).ok_or_else(|| {
                        TenantError::invalid_input(format!(
                            "Cannot filter on unknown field '{}' of '{}'",
                            name, schema.name
                        ))
                    })?;
                    filter.eq(name, field.parse_param(raw)?)
                }
            };
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults() {
        let filter = Filter::new();
        assert!(filter.conditions().is_empty());
        assert_eq!(filter.row_limit(), DEFAULT_ROW_LIMIT);
    }

    #[test]
    fn test_limit_clamped() {
        assert_eq!(Filter::new().limit(0).row_limit(), 1);
        assert_eq!(Filter::new().limit(50_000).row_limit(), MAX_ROW_LIMIT);
    }

    #[test]
    fn test_from_pairs_coerces_by_field_type() {
        let schema = SchemaDescriptor::product();
        let filter =
            Filter::from_pairs(&schema, [("price", "9.5"), ("sku", "W-1"), ("limit", "5")])
                .unwrap();

        assert_eq!(filter.row_limit(), 5);
        assert_eq!(
            filter.conditions()[0],
            Condition {
                field: "price".to_string(),
                op: Comparison::Eq,
                value: QueryParam::Float(9.5),
            }
        );
        assert_eq!(filter.conditions()[1].value, QueryParam::String("W-1".into()));
    }

    #[test]
    fn test_from_pairs_date_range() {
        let schema = SchemaDescriptor::lead();
        let filter = Filter::from_pairs(
            &schema,
            [
                ("created_from", "2024-01-01T00:00:00Z"),
                ("created_to", "2024-12-31T23:59:59Z"),
            ],
        )
        .unwrap();
        let ops: Vec<Comparison> = filter.conditions().iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![Comparison::Gte, Comparison::Lte]);
        assert_eq!(
            filter.conditions()[0].value,
            QueryParam::String("2024-01-01T00:00:00.000Z".into())
        );
    }

    #[test]
    fn test_from_pairs_rejects_unknown_field() {
        let schema = SchemaDescriptor::product();
        let err = Filter::from_pairs(&schema, [("colour", "red")]).unwrap_err();
        assert!(matches!(err, TenantError::InvalidInput { .. }));
    }

    #[test]
    fn test_from_pairs_rejects_bad_limit() {
        let schema = SchemaDescriptor::product();
        assert!(Filter::from_pairs(&schema, [("limit", "-3")]).is_err());
    }

    #[test]
    fn test_query_param_type_name() {
        assert_eq!(QueryParam::Null.type_name(), "null");
        assert_eq!(QueryParam::Int(1).type_name(), "int");
        assert!(QueryParam::Null.is_null());
    }
}
