//! Per-request tenant context.
//!
//! [`TenantResolver`] turns the raw tenant header into a [`RequestContext`]:
//! the resolved tenant plus a borrowed handle on its connection. The context is
//! immutable and gives its handle back when it is released or dropped.

use crate::db::{ConnectionHandle, ConnectionMultiplexer, HandleGuard};
use crate::directory::TenantDirectory;
use crate::error::{TenantError, TenantResult};
use crate::models::Tenant;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TenantResolver {
    directory: Arc<TenantDirectory>,
    mux: Arc<ConnectionMultiplexer>,
}

impl TenantResolver {
    pub fn new(directory: Arc<TenantDirectory>, mux: Arc<ConnectionMultiplexer>) -> Self {
        Self { directory, mux }
    }

    /// Resolve the tenant named by `raw_header` and borrow its handle.
    ///
    /// An absent or blank header fails with `MissingTenantIdentifier` before
    /// any directory or connection work. `correlation_id` is generated when the
    /// caller has none.
    pub async fn resolve(
        &self,
        raw_header: Option<&str>,
        correlation_id: Option<String>,
    ) -> TenantResult<RequestContext> {
        let tenant_id = match raw_header.map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => return Err(TenantError::MissingTenantIdentifier),
        };
        let correlation_id = correlation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let tenant = self.directory.lookup(tenant_id).await?;
        let guard = self.mux.acquire(&tenant).await?;

        debug!(
            tenant_id = %tenant.tenant_id,
            correlation_id = %correlation_id,
            generation = guard.handle().generation(),
            "Request context resolved"
        );
        Ok(RequestContext {
            tenant: Arc::new(tenant),
            correlation_id,
            guard,
        })
    }
}

/// The resolved tenant and its borrowed connection for one request.
#[derive(Debug)]
pub struct RequestContext {
    tenant: Arc<Tenant>,
    correlation_id: String,
    guard: HandleGuard,
}

impl RequestContext {
    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant.tenant_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        self.guard.handle()
    }

    /// Give the handle back now rather than at drop.
    pub fn release(self) {
        self.guard.release();
    }
}
