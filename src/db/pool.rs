//! Database-specific connection pools.
//!
//! Each tenant handle wraps one of these. Using the concrete pool types
//! (MySqlPool, PgPool, SqlitePool) rather than AnyPool keeps full type support.

use crate::models::DatabaseType;
use sqlx::{MySqlPool, PgPool, SqlitePool};
use tracing::{debug, warn};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    ///
    /// Waits for checked-out connections to be returned.
    pub async fn close(&self) {
        crate::impl_db_dispatch!(self, {
            MySql(pool) => pool.close().await,
            Postgres(pool) => pool.close().await,
            SQLite(pool) => pool.close().await,
        })
    }

    pub fn is_closed(&self) -> bool {
        crate::impl_db_dispatch!(self, {
            MySql(pool) => pool.is_closed(),
            Postgres(pool) => pool.is_closed(),
            SQLite(pool) => pool.is_closed(),
        })
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Get the server version, or None if the query fails.
    pub async fn server_version(&self) -> Option<String> {
        let result = crate::impl_db_dispatch!(self, {
            MySql(pool) => sqlx::query_scalar::<_, String>("SELECT version()").fetch_one(pool).await,
            Postgres(pool) => sqlx::query_scalar::<_, String>("SELECT version()").fetch_one(pool).await,
            SQLite(pool) => sqlx::query_scalar::<_, String>("SELECT sqlite_version()").fetch_one(pool).await,
        });

        match result {
            Ok(version) => {
                debug!(version = %version, "Got server version");
                Some(version)
            }
            Err(e) => {
                warn!(error = %e, "Failed to get server version");
                None
            }
        }
    }
}
