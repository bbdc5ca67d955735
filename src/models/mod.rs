//! Data models for the tenant gateway.
//!
//! This module re-exports all model types used throughout the application.

pub mod query;
pub mod schema;
pub mod tenant;

// Re-export commonly used types
pub use query::{
    Comparison, Condition, DEFAULT_ROW_LIMIT, Filter, MAX_ROW_LIMIT, QueryParam,
};
pub use schema::{
    CREATED_AT_FIELD, Document, FieldDescriptor, FieldType, ID_FIELD, RESERVED_FIELDS,
    SchemaDescriptor, SchemaRegistry, UPDATED_AT_FIELD,
};
pub use tenant::{ConnectionDescriptor, DatabaseType, DescriptorError, Tenant};
