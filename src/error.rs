//! Error types for tenant resolution and connection multiplexing.
//!
//! Every failure in the core is scoped to one tenant or one request. Variants
//! carry enough context to produce an actionable HTTP response, and the type is
//! `Clone` so a single connection-open outcome can be handed to every waiter.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TenantError {
    #[error("Missing tenant identifier")]
    MissingTenantIdentifier,

    #[error("Unknown tenant: {tenant_id}")]
    UnknownTenant { tenant_id: String },

    #[error("Tenant directory unavailable: {message}")]
    DirectoryUnavailable { message: String },

    #[error("Failed to open connection for tenant '{tenant_id}': {message}")]
    ConnectionOpenFailure {
        tenant_id: String,
        message: String,
        suggestion: String,
    },

    #[error("Connection capacity exhausted ({max_open} open handles, waited {waited_ms}ms)")]
    PoolExhausted { max_open: usize, waited_ms: u64 },

    #[error("Connection for tenant '{tenant_id}' is no longer usable: {message}")]
    StaleHandle { tenant_id: String, message: String },

    #[error("Schema not found: {schema}")]
    SchemaNotFound { schema: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Record '{id}' not found in {schema}")]
    RecordNotFound { schema: String, id: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Connection multiplexer is shutting down")]
    ShuttingDown,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TenantError {
    pub fn unknown_tenant(tenant_id: impl Into<String>) -> Self {
        Self::UnknownTenant {
            tenant_id: tenant_id.into(),
        }
    }

    pub fn directory_unavailable(message: impl Into<String>) -> Self {
        Self::DirectoryUnavailable {
            message: message.into(),
        }
    }

    /// Create a connection-open error with a helpful suggestion.
    pub fn connection_open(
        tenant_id: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::ConnectionOpenFailure {
            tenant_id: tenant_id.into(),
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn pool_exhausted(max_open: usize, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            max_open,
            waited_ms,
        }
    }

    pub fn stale_handle(tenant_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StaleHandle {
            tenant_id: tenant_id.into(),
            message: message.into(),
        }
    }

    pub fn schema_not_found(schema: impl Into<String>) -> Self {
        Self::SchemaNotFound {
            schema: schema.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn record_not_found(schema: impl Into<String>, id: impl Into<String>) -> Self {
        Self::RecordNotFound {
            schema: schema.into(),
            id: id.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingTenantIdentifier => "missing_tenant_identifier",
            Self::UnknownTenant { .. } => "unknown_tenant",
            Self::DirectoryUnavailable { .. } => "directory_unavailable",
            Self::ConnectionOpenFailure { .. } => "connection_open_failure",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::StaleHandle { .. } => "stale_handle",
            Self::SchemaNotFound { .. } => "schema_not_found",
            Self::InvalidInput { .. } => "invalid_input",
            Self::RecordNotFound { .. } => "record_not_found",
            Self::Database { .. } => "database_error",
            Self::Timeout { .. } => "timeout",
            Self::ShuttingDown => "shutting_down",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::MissingTenantIdentifier => {
                Some("Send the tenant identifier header with every request")
            }
            Self::ConnectionOpenFailure { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => Some("Retry the request after a short delay"),
            Self::StaleHandle { .. } => Some("Retry the request; a fresh connection will be opened"),
            _ => None,
        }
    }

    /// Check if the whole request may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DirectoryUnavailable { .. }
                | Self::ConnectionOpenFailure { .. }
                | Self::PoolExhausted { .. }
                | Self::StaleHandle { .. }
                | Self::Timeout { .. }
                | Self::ShuttingDown
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingTenantIdentifier | Self::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            Self::UnknownTenant { .. }
            | Self::SchemaNotFound { .. }
            | Self::RecordNotFound { .. } => StatusCode::NOT_FOUND,
            Self::DirectoryUnavailable { .. }
            | Self::ConnectionOpenFailure { .. }
            | Self::PoolExhausted { .. }
            | Self::StaleHandle { .. }
            | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Database {
                sql_state: Some(_),
                ..
            } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Database { .. } | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Check whether a driver error means the underlying connection is gone,
/// as opposed to a problem with the statement itself.
pub fn is_transport_fault(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Convert sqlx errors to TenantError.
impl From<sqlx::Error> for TenantError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let suggestion = if db_err.is_unique_violation() {
                    "A record with the same unique value already exists"
                } else {
                    "Check the document against the collection schema"
                };
                TenantError::database(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => TenantError::database(
                "No rows returned",
                None,
                "Verify the record identifier",
            ),
            sqlx::Error::PoolTimedOut => TenantError::timeout("connection pool acquire", 30),
            sqlx::Error::ColumnNotFound(col) => TenantError::database(
                format!("Column not found: {}", col),
                None,
                "The collection table does not match its schema descriptor",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                TenantError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                TenantError::internal(format!("Decode error: {}", source))
            }
            _ => TenantError::internal(format!("Unexpected database error: {}", err)),
        }
    }
}

/// Result type alias for tenant operations.
pub type TenantResult<T> = Result<T, TenantError>;

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

impl IntoResponse for TenantError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.kind(),
                message: self.to_string(),
                suggestion: self.suggestion(),
            },
        };
        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":{"code":"internal_error","message":"Failed to encode error"}}"#.to_string()
        });

        let mut response =
            (status, [(header::CONTENT_TYPE, "application/json")], json).into_response();
        if matches!(self, Self::PoolExhausted { .. }) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
