//! Cache of schema-bound accessors per (tenant, schema).
//!
//! Binding is cheap but not free, so the binder hands out the same accessor for
//! repeated requests against the same handle. An entry is only reused while the
//! handle it was built on is still the tenant's Open handle; when the
//! multiplexer retires a handle, the listener task drops its entries.

use crate::db::accessor::{Accessor, SqlAccessor};
use crate::db::handle::ConnectionHandle;
use crate::db::multiplexer::{ConnectionMultiplexer, HandleEvent};
use crate::error::{TenantError, TenantResult};
use crate::models::SchemaRegistry;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Bound {
    generation: u64,
    accessor: Arc<dyn Accessor>,
}

pub struct ModelBinder {
    mux: Arc<ConnectionMultiplexer>,
    registry: Arc<SchemaRegistry>,
    query_timeout: Duration,
    /// (tenant_id, schema name) → accessor
    cache: DashMap<(String, String), Bound>,
}

impl ModelBinder {
    pub fn new(mux: Arc<ConnectionMultiplexer>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            mux,
            registry,
            query_timeout: Duration::from_secs(crate::config::DEFAULT_REQUEST_TIMEOUT_SECS),
            cache: DashMap::new(),
        }
    }

    /// Per-statement timeout for the accessors this binder creates.
    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// The accessor for `schema_name` on `handle`, creating it on first use.
    ///
    /// Fails with `SchemaNotFound` for unregistered schemas and `StaleHandle`
    /// if the handle has already left Open.
    pub fn bind(
        &self,
        handle: &Arc<ConnectionHandle>,
        schema_name: &str,
    ) -> TenantResult<Arc<dyn Accessor>> {
        let schema = self.registry.get(schema_name)?;
        if !handle.is_open() {
            return Err(TenantError::stale_handle(
                handle.tenant_id(),
                format!("cannot bind '{}' to a {} handle", schema_name, handle.state()),
            ));
        }

        let key = (handle.tenant_id().to_string(), schema_name.to_string());
        let entry = match self.cache.entry(key) {
            Entry::Occupied(occupied) if occupied.get().generation == handle.generation() => {
                return Ok(Arc::clone(&occupied.get().accessor));
            }
            // Vacant, or built on an older handle for this tenant
            entry => entry,
        };

        debug!(
            tenant_id = %handle.tenant_id(),
            schema = %schema_name,
            generation = handle.generation(),
            "Binding accessor"
        );
        let accessor: Arc<dyn Accessor> = Arc::new(SqlAccessor::new(
            Arc::clone(handle),
            schema,
            Arc::clone(&self.mux),
            self.query_timeout,
        ));
        entry.insert(Bound {
            generation: handle.generation(),
            accessor: Arc::clone(&accessor),
        });
        Ok(accessor)
    }

    /// Drop every accessor bound to this tenant handle generation.
    pub fn invalidate(&self, tenant_id: &str, generation: u64) -> usize {
        let before = self.cache.len();
        self.cache
            .retain(|(tenant, _), bound| !(tenant == tenant_id && bound.generation == generation));
        let removed = before.saturating_sub(self.cache.len());
        if removed > 0 {
            debug!(tenant_id = %tenant_id, generation, removed, "Invalidated bound accessors");
        }
        removed
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Follow the multiplexer's retirement events until either side goes away.
    pub fn spawn_invalidation_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.mux.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            Self::listen(weak, events).await;
        })
    }

    async fn listen(weak: Weak<Self>, mut events: broadcast::Receiver<HandleEvent>) {
        loop {
            let event = events.recv().await;
            let Some(binder) = weak.upgrade() else {
                return;
            };
            match event {
                Ok(HandleEvent::Retired {
                    tenant_id,
                    generation,
                }) => {
                    binder.invalidate(&tenant_id, generation);
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Entries are also checked on bind, but stale handles would
                    // otherwise stay referenced until then
                    warn!(skipped, "Missed handle events, clearing accessor cache");
                    binder.clear();
                }
                Err(RecvError::Closed) => {
                    info!("Handle event channel closed, accessor listener exiting");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for ModelBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBinder")
            .field("schemas", &self.registry.names())
            .field("cached", &self.cache.len())
            .finish()
    }
}
