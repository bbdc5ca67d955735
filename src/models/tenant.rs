//! Tenant and connection descriptor models.

use crate::config::PoolOptions;
use serde::{Deserialize, Serialize};
use url::Url;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Errors that can occur when parsing a connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Connection location cannot be empty")]
    Empty,

    #[error("Unknown database type in connection string")]
    UnknownDatabaseType,

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid pool options: {0}")]
    InvalidPoolOptions(String),
}

/// Everything needed to open a connection for one tenant. Immutable once issued.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Driver URL with pool options stripped. Contains credentials - never log.
    #[serde(skip_serializing)]
    location: String,
    db_type: DatabaseType,
    #[serde(default)]
    pool_options: PoolOptions,
}

impl ConnectionDescriptor {
    /// Parse a descriptor from a connection URL, pulling pool tuning out of the
    /// query string.
    pub fn parse(connection_string: &str) -> Result<Self, DescriptorError> {
        let connection_string = connection_string.trim();
        if connection_string.is_empty() {
            return Err(DescriptorError::Empty);
        }

        let db_type = DatabaseType::from_connection_string(connection_string)
            .ok_or(DescriptorError::UnknownDatabaseType)?;

        let mut url =
            Url::parse(connection_string).map_err(|e| DescriptorError::InvalidUrl(e.to_string()))?;
        let pool_options =
            PoolOptions::extract_from_url(&mut url).map_err(DescriptorError::InvalidPoolOptions)?;

        Ok(Self {
            location: url.to_string(),
            db_type,
            pool_options,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn pool_options(&self) -> &PoolOptions {
        &self.pool_options
    }

    /// Get a display-safe version of the location (credentials masked).
    pub fn masked_location(&self) -> String {
        match Url::parse(&self.location) {
            Ok(mut url) if url.password().is_some() => {
                // set_password only fails for cannot-be-a-base URLs, which carry no password
                let _ = url.set_password(Some("****"));
                url.to_string()
            }
            _ => self.location.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("location", &self.masked_location())
            .field("db_type", &self.db_type)
            .field("pool_options", &self.pool_options)
            .finish()
    }
}

/// A provisioned tenant as seen by the core. Read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub display_name: String,
    #[serde(skip)]
    pub descriptor: ConnectionDescriptor,
}

impl Tenant {
    pub fn new(
        tenant_id: impl Into<String>,
        display_name: impl Into<String>,
        descriptor: ConnectionDescriptor,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            display_name: display_name.into(),
            descriptor,
        }
    }
}
