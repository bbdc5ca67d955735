//! Shared fixtures for integration tests.
//!
//! `FakeConnector` hands out lazily-connected in-memory SQLite pools, so opens
//! can be counted, slowed down or failed without a database server.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tenant_mux::db::{CapacityPolicy, Connector, DbPool, MultiplexerConfig, SqlxConnector};
use tenant_mux::directory::{DirectoryConfig, StaticTenantStore};
use tenant_mux::error::{TenantError, TenantResult};
use tenant_mux::gateway::TenantGateway;
use tenant_mux::models::{ConnectionDescriptor, DatabaseType, SchemaRegistry, Tenant};

#[derive(Default)]
pub struct FakeConnector {
    opens: AtomicUsize,
    closes: AtomicUsize,
    delay_ms: AtomicUsize,
    failing: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every open takes `delay` before completing.
    pub fn slow(delay: Duration) -> Arc<Self> {
        let connector = Self::default();
        connector
            .delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
        Arc::new(connector)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, tenant_id: &str, _descriptor: &ConnectionDescriptor) -> TenantResult<DbPool> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(TenantError::connection_open(
                tenant_id,
                "connection refused",
                "Check that the server is running",
            ));
        }
        Ok(DbPool::SQLite(
            SqlitePool::connect_lazy("sqlite::memory:").map_err(TenantError::from)?,
        ))
    }

    async fn close(&self, _tenant_id: &str, pool: DbPool) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        pool.close().await;
    }
}

pub fn tenant(id: &str) -> Tenant {
    Tenant::new(
        id,
        id.to_uppercase(),
        ConnectionDescriptor::parse("sqlite::memory:").unwrap(),
    )
}

pub fn mux_config(max_open: usize, capacity: CapacityPolicy, idle: Duration) -> MultiplexerConfig {
    MultiplexerConfig {
        max_open_handles: max_open,
        capacity,
        idle_timeout: idle,
        sweep_interval: Duration::ZERO,
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// A gateway over real SQLite files under `dir`, one per tenant, with the
/// built-in collections' tables already created.
pub async fn sqlite_gateway(dir: &Path, tenants: &[&str]) -> TenantGateway {
    let store = StaticTenantStore::new();
    let registry = SchemaRegistry::builtin();

    for id in tenants {
        let path = dir.join(format!("{}.db", id));
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true),
        )
        .await
        .unwrap();
        for name in registry.names() {
            for ddl in registry.get(name).unwrap().create_table_sql(DatabaseType::SQLite) {
                sqlx::query(&ddl).execute(&pool).await.unwrap();
            }
        }
        pool.close().await;

        let descriptor =
            ConnectionDescriptor::parse(&format!("sqlite:{}", path.display())).unwrap();
        store.insert(Tenant::new(*id, id.to_uppercase(), descriptor));
    }

    TenantGateway::new(
        Arc::new(store),
        Arc::new(SqlxConnector::new()),
        registry,
        DirectoryConfig::default(),
        MultiplexerConfig::default(),
        Duration::from_secs(5),
    )
}
