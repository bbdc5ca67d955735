//! Database dispatch macros for reducing code duplication.
//!
//! The pool, accessor and directory code all need the same three-way match over
//! `DbPool`; these macros keep those matches linear and readable.

/// Macro for generating database dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => do_mysql(p),
///     Postgres(p) => do_postgres(p),
///     SQLite(p) => do_sqlite(p),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;

#[cfg(test)]
mod tests {
    use crate::db::pool::DbPool;
    use sqlx::SqlitePool;

    fn backend_name(pool: &DbPool) -> &'static str {
        crate::impl_db_dispatch!(pool, {
            MySql(_p) => "mysql",
            Postgres(_p) => "postgres",
            SQLite(_p) => "sqlite",
        })
    }

    #[tokio::test]
    async fn test_dispatch_selects_variant() {
        let pool = DbPool::SQLite(SqlitePool::connect_lazy("sqlite::memory:").unwrap());
        assert_eq!(backend_name(&pool), "sqlite");
    }
}
