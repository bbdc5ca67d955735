//! Tenant directory client.
//!
//! Wraps a [`TenantStore`] with a short-lived cache of positive lookups and a
//! per-lookup timeout. Misses are never cached, so a tenant provisioned a moment
//! ago is visible on the very next request.

pub mod store;

pub use store::{SqlTenantStore, StaticTenantStore, TenantStore};

use crate::error::{TenantError, TenantResult};
use crate::models::Tenant;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// How long a successful lookup is served from cache. Zero disables caching.
    pub cache_ttl: Duration,
    /// Upper bound on a single store lookup.
    pub lookup_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(crate::config::DEFAULT_DIRECTORY_CACHE_TTL_SECS),
            lookup_timeout: Duration::from_secs(crate::config::DEFAULT_DIRECTORY_TIMEOUT_SECS),
        }
    }
}

struct CachedTenant {
    tenant: Tenant,
    expires_at: Instant,
}

pub struct TenantDirectory {
    store: Arc<dyn TenantStore>,
    config: DirectoryConfig,
    cache: DashMap<String, CachedTenant>,
}

impl TenantDirectory {
    pub fn new(store: Arc<dyn TenantStore>, config: DirectoryConfig) -> Self {
        Self {
            store,
            config,
            cache: DashMap::new(),
        }
    }

    /// Look up a tenant.
    ///
    /// Fails with `UnknownTenant` if the store has no such tenant and
    /// `DirectoryUnavailable` if it cannot answer in time.
    pub async fn lookup(&self, tenant_id: &str) -> TenantResult<Tenant> {
        if let Some(cached) = self.cache.get(tenant_id) {
            if Instant::now() < cached.expires_at {
                return Ok(cached.tenant.clone());
            }
        }
        // Expired entries are dropped rather than served while refreshing
        self.cache
            .remove_if(tenant_id, |_, cached| Instant::now() >= cached.expires_at);

        let limit = self.config.lookup_timeout;
        let found = match tokio::time::timeout(limit, self.store.get(tenant_id)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    tenant_id = %tenant_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Tenant directory lookup timed out"
                );
                return Err(TenantError::directory_unavailable(format!(
                    "lookup for '{}' timed out after {}ms",
                    tenant_id,
                    limit.as_millis()
                )));
            }
        };

        let Some(tenant) = found else {
            debug!(tenant_id = %tenant_id, "Unknown tenant");
            return Err(TenantError::unknown_tenant(tenant_id));
        };

        if !self.config.cache_ttl.is_zero() {
            self.cache.insert(
                tenant_id.to_string(),
                CachedTenant {
                    tenant: tenant.clone(),
                    expires_at: Instant::now() + self.config.cache_ttl,
                },
            );
        }
        debug!(tenant_id = %tenant_id, db_type = %tenant.descriptor.db_type(), "Resolved tenant");
        Ok(tenant)
    }

    /// Forget a cached tenant, e.g. after it was deprovisioned.
    pub fn invalidate(&self, tenant_id: &str) -> bool {
        self.cache.remove(tenant_id).is_some()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }
}

impl std::fmt::Debug for TenantDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantDirectory")
            .field("config", &self.config)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
