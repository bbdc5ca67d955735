//! Backing stores for the tenant directory.

use crate::config::TenantSeed;
use crate::db::pool::DbPool;
use crate::error::{TenantError, TenantResult};
use crate::models::{ConnectionDescriptor, Tenant};
use async_trait::async_trait;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Authoritative source of tenant records.
#[async_trait]
pub trait TenantStore: Send + Sync + 'static {
    /// `Ok(None)` means the tenant is not provisioned. Errors mean the store
    /// could not answer and should be `DirectoryUnavailable`.
    async fn get(&self, tenant_id: &str) -> TenantResult<Option<Tenant>>;
}

/// In-memory store, seeded at startup.
///
/// `insert` and `remove` let a provisioning process running in the same
/// binary change the set of tenants at runtime.
#[derive(Debug, Default)]
pub struct StaticTenantStore {
    /// Uses std::sync::RwLock; never held across an await.
    tenants: RwLock<HashMap<String, Tenant>>,
}

impl StaticTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        let store = Self::new();
        for tenant in tenants {
            store.insert(tenant);
        }
        store
    }

    /// Build a store from `tenant_id=connection_string` seeds.
    pub fn from_seeds(seeds: &[TenantSeed]) -> TenantResult<Self> {
        let tenants = seeds
            .iter()
            .map(|seed| {
                let descriptor = ConnectionDescriptor::parse(&seed.connection_string).map_err(
                    |e| {
                        TenantError::invalid_input(format!(
                            "Invalid connection string for tenant '{}': {}",
                            seed.tenant_id, e
                        ))
                    },
                )?;
                Ok(Tenant::new(&seed.tenant_id, &seed.tenant_id, descriptor))
            })
            .collect::<TenantResult<Vec<_>>>()?;
        Ok(Self::from_tenants(tenants))
    }

    pub fn insert(&self, tenant: Tenant) {
        self.tenants
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(tenant.tenant_id.clone(), tenant);
    }

    pub fn remove(&self, tenant_id: &str) -> Option<Tenant> {
        self.tenants
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(tenant_id)
    }

    pub fn len(&self) -> usize {
        self.tenants
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TenantStore for StaticTenantStore {
    async fn get(&self, tenant_id: &str) -> TenantResult<Option<Tenant>> {
        Ok(self
            .tenants
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(tenant_id)
            .cloned())
    }
}

/// Reads tenants from a control-plane table:
///
/// ```sql
/// CREATE TABLE tenants (
///     tenant_id VARCHAR(64) PRIMARY KEY,
///     display_name VARCHAR(255) NOT NULL,
///     connection_string TEXT NOT NULL
/// )
/// ```
#[derive(Debug, Clone)]
pub struct SqlTenantStore {
    pool: DbPool,
}

const TENANT_COLUMNS: &str = "tenant_id, display_name, connection_string";

impl SqlTenantStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl TenantStore for SqlTenantStore {
    async fn get(&self, tenant_id: &str) -> TenantResult<Option<Tenant>> {
        let unavailable = |e: sqlx::Error| {
            warn!(tenant_id = %tenant_id, error = %e, "Tenant directory query failed");
            TenantError::directory_unavailable(e.to_string())
        };

        let record: Option<(String, String, String)> = crate::impl_db_dispatch!(&self.pool, {
            MySql(pool) => sqlx::query(&format!("SELECT {} FROM tenants WHERE tenant_id = ?", TENANT_COLUMNS))
                .bind(tenant_id)
                .fetch_optional(pool)
                .await
                .map_err(unavailable)?
                .map(|row| Ok::<_, sqlx::Error>((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?)))
                .transpose()
                .map_err(unavailable)?,
            Postgres(pool) => sqlx::query(&format!("SELECT {} FROM tenants WHERE tenant_id = $1", TENANT_COLUMNS))
                .bind(tenant_id)
                .fetch_optional(pool)
                .await
                .map_err(unavailable)?
                .map(|row| Ok::<_, sqlx::Error>((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?)))
                .transpose()
                .map_err(unavailable)?,
            SQLite(pool) => sqlx::query(&format!("SELECT {} FROM tenants WHERE tenant_id = ?", TENANT_COLUMNS))
                .bind(tenant_id)
                .fetch_optional(pool)
                .await
                .map_err(unavailable)?
                .map(|row| Ok::<_, sqlx::Error>((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?)))
                .transpose()
                .map_err(unavailable)?,
        });

        let Some((id, display_name, connection_string)) = record else {
            debug!(tenant_id = %tenant_id, "Tenant not provisioned");
            return Ok(None);
        };

        // A bad row is a control-plane problem, not a client one
        let descriptor = ConnectionDescriptor::parse(&connection_string).map_err(|e| {
            TenantError::directory_unavailable(format!(
                "Tenant '{}' has an invalid connection string: {}",
                id, e
            ))
        })?;
        Ok(Some(Tenant::new(id, display_name, descriptor)))
    }
}
