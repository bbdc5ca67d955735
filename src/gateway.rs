//! The assembled tenant core.
//!
//! [`TenantGateway`] owns one directory, one multiplexer, one binder and the
//! resolver over them. Front ends (the HTTP transport, tests) construct it once
//! and share it behind an `Arc`.

use crate::context::{RequestContext, TenantResolver};
use crate::db::{
    Accessor, ConnectionMultiplexer, Connector, HandleSummary, ModelBinder, MultiplexerConfig,
    MultiplexerStats,
};
use crate::directory::{DirectoryConfig, TenantDirectory, TenantStore};
use crate::error::TenantResult;
use crate::models::SchemaRegistry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

pub struct TenantGateway {
    directory: Arc<TenantDirectory>,
    mux: Arc<ConnectionMultiplexer>,
    binder: Arc<ModelBinder>,
    resolver: TenantResolver,
    /// Uses std::sync::Mutex for synchronous storage.
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TenantGateway {
    /// Wire the core together and start the accessor invalidation listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn TenantStore>,
        connector: Arc<dyn Connector>,
        registry: SchemaRegistry,
        directory_config: DirectoryConfig,
        mux_config: MultiplexerConfig,
        query_timeout: Duration,
    ) -> Self {
        let directory = Arc::new(TenantDirectory::new(store, directory_config));
        let mux = ConnectionMultiplexer::new(connector, mux_config);
        let binder = Arc::new(
            ModelBinder::new(Arc::clone(&mux), Arc::new(registry))
                .with_query_timeout(query_timeout),
        );
        let listener = binder.spawn_invalidation_listener();
        let resolver = TenantResolver::new(Arc::clone(&directory), Arc::clone(&mux));

        info!(
            schemas = ?binder.registry().names(),
            max_open_handles = mux.config().max_open_handles,
            "Tenant gateway ready"
        );

        Self {
            directory,
            mux,
            binder,
            resolver,
            listener: Mutex::new(Some(listener)),
        }
    }

    pub async fn resolve(
        &self,
        raw_header: Option<&str>,
        correlation_id: Option<String>,
    ) -> TenantResult<RequestContext> {
        self.resolver.resolve(raw_header, correlation_id).await
    }

    /// An accessor for `schema_name` bound to the context's tenant connection.
    pub fn with_tenant_context(
        &self,
        ctx: &RequestContext,
        schema_name: &str,
    ) -> TenantResult<Arc<dyn Accessor>> {
        self.binder.bind(ctx.handle(), schema_name)
    }

    pub fn registry(&self) -> &SchemaRegistry {
        self.binder.registry()
    }

    pub fn directory(&self) -> &Arc<TenantDirectory> {
        &self.directory
    }

    pub fn multiplexer(&self) -> &Arc<ConnectionMultiplexer> {
        &self.mux
    }

    pub fn binder(&self) -> &Arc<ModelBinder> {
        &self.binder
    }

    pub fn stats(&self) -> MultiplexerStats {
        self.mux.stats()
    }

    pub fn snapshot(&self) -> Vec<HandleSummary> {
        self.mux.snapshot()
    }

    /// Close every tenant connection and refuse new requests.
    pub async fn shutdown(&self) {
        self.mux.shutdown().await;
        self.binder.clear();
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = listener {
            handle.abort();
        }
        info!("Tenant gateway shut down");
    }
}

impl std::fmt::Debug for TenantGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantGateway")
            .field("directory", &self.directory)
            .field("multiplexer", &self.mux)
            .field("binder", &self.binder)
            .finish_non_exhaustive()
    }
}
