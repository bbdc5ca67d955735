//! Tenant Mux Library
//!
//! Resolves the tenant behind each request and multiplexes per-tenant database
//! connections (SQLite, PostgreSQL, MySQL) behind a schema-bound data API.

pub mod config;
pub mod context;
pub mod db;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod models;
pub mod transport;

pub use config::Config;
pub use context::{RequestContext, TenantResolver};
pub use error::{TenantError, TenantResult};
pub use gateway::TenantGateway;
