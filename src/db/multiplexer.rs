//! Per-tenant connection multiplexing.
//!
//! # Design Decisions
//!
//! - **Placeholder per tenant key**: the first `acquire` for a tenant installs a
//!   `Pending` slot in a `DashMap` before any I/O. Concurrent callers find the
//!   placeholder and wait on its `watch` channel, so exactly one open runs per
//!   transition into Pending and every waiter sees the same outcome.
//! - **Opens run in their own task**: a requester that is cancelled while waiting
//!   only drops its receiver. The open carries on for the other waiters.
//! - **Failures are not cached**: a failed open removes the placeholder before
//!   notifying waiters, so the next `acquire` starts from scratch.
//! - **Failed handles are evicted on access**: an `Open` slot whose handle has
//!   been marked Failed is replaced by a fresh placeholder on the next `acquire`.
//! - **Capacity is a semaphore**: each open handle holds one permit from a
//!   budget of `max_open_handles`. When the budget is spent, [`CapacityPolicy`]
//!   decides between failing fast and a bounded wait, both ending in
//!   `PoolExhausted`.
//!
//! # Concurrency Safety
//!
//! - All slot mutations for a tenant go through its `DashMap` shard lock; unrelated
//!   tenants on other shards proceed in parallel.
//! - Lock order is shard lock, then handle lock. Neither is held across an await.
//! - The idle sweep re-checks `ref_count == 0` under both locks before evicting,
//!   so a handle that was just retained is never closed. This holds for failed
//!   handles too; those still in use are evicted on the next `acquire` instead.
//! - The background sweep holds only a `Weak` reference and exits when the
//!   multiplexer is dropped.

use crate::db::connector::Connector;
use crate::db::handle::{ConnectionHandle, HandleGuard, HandleState, HandleSummary};
use crate::error::{TenantError, TenantResult};
use crate::models::Tenant;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Upper bound on how many times `acquire` chases a handle that went away
/// between being published and being retained.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What `acquire` does when every open-handle slot is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityPolicy {
    /// Fail immediately with `PoolExhausted`.
    FailFast,
    /// Wait up to the given duration for a slot, then fail with `PoolExhausted`.
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Maximum concurrently open handles across all tenants.
    pub max_open_handles: usize,
    pub capacity: CapacityPolicy,
    /// Unreferenced handles idle this long are closed by the sweep.
    pub idle_timeout: Duration,
    /// Interval between sweeps. Zero disables the background sweep.
    pub sweep_interval: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_open_handles: crate::config::DEFAULT_MAX_OPEN_HANDLES,
            capacity: CapacityPolicy::Wait(Duration::from_secs(
                crate::config::DEFAULT_CAPACITY_WAIT_SECS,
            )),
            idle_timeout: Duration::from_secs(crate::config::DEFAULT_HANDLE_IDLE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(crate::config::DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

/// Lifecycle notifications for handle consumers such as the model binder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    /// The handle left Open (failed, evicted or shut down) and must not be reused.
    Retired { tenant_id: String, generation: u64 },
}

type OpenOutcome = Option<TenantResult<Arc<ConnectionHandle>>>;

enum Slot {
    Pending {
        generation: u64,
        outcome: watch::Receiver<OpenOutcome>,
    },
    Open(Arc<ConnectionHandle>),
}

impl Slot {
    fn is_pending(&self, generation: u64) -> bool {
        matches!(self, Slot::Pending { generation: g, .. } if *g == generation)
    }
}

/// Work handed to the open task once the placeholder is in place.
struct OpenJob {
    tenant: Tenant,
    generation: u64,
    outcome: watch::Sender<OpenOutcome>,
}

#[derive(Debug, Default)]
struct Counters {
    opens_started: AtomicU64,
    opens_failed: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    pub open_handles: usize,
    pub pending_opens: usize,
    /// Sum of reference counts over open handles.
    pub active_refs: usize,
    pub max_open_handles: usize,
    pub available_capacity: usize,
    pub opens_started: u64,
    pub opens_failed: u64,
    pub evictions: u64,
    pub shutting_down: bool,
}

/// Owns the tenant → handle cache.
///
/// Construct one per process (or per test) with [`ConnectionMultiplexer::new`]
/// and pass it to whoever needs it; there is no global instance.
pub struct ConnectionMultiplexer {
    connector: Arc<dyn Connector>,
    config: MultiplexerConfig,
    slots: DashMap<String, Slot>,
    capacity: Arc<Semaphore>,
    next_generation: AtomicU64,
    events: broadcast::Sender<HandleEvent>,
    counters: Counters,
    shutting_down: AtomicBool,
    /// Uses std::sync::Mutex for synchronous storage.
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMultiplexer {
    /// Create a multiplexer and start its idle sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, config: MultiplexerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mux = Arc::new(Self {
            connector,
            capacity: Arc::new(Semaphore::new(config.max_open_handles)),
            config,
            slots: DashMap::new(),
            next_generation: AtomicU64::new(1),
            events,
            counters: Counters::default(),
            shutting_down: AtomicBool::new(false),
            sweep_handle: Mutex::new(None),
        });

        if !mux.config.sweep_interval.is_zero() {
            // Weak reference avoids a cycle that would keep the multiplexer alive
            let weak = Arc::downgrade(&mux);
            let interval = mux.config.sweep_interval;
            let handle = tokio::spawn(async move {
                Self::sweep_task(weak, interval).await;
            });
            *mux.sweep_handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        mux
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Borrow the tenant's handle, opening it if necessary.
    ///
    /// A cache hit on an Open handle takes a reference and returns without I/O.
    /// Otherwise the caller joins (or starts) the single in-flight open for the
    /// tenant. Dropping the returned future never changes any reference count
    /// and never cancels the open for other waiters.
    pub async fn acquire(self: &Arc<Self>, tenant: &Tenant) -> TenantResult<HandleGuard> {
        let tenant_id = tenant.tenant_id.as_str();

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(TenantError::ShuttingDown);
            }

            let mut job = None;
            let mut retired = None;

            // Shard lock held only for this block
            let (generation, mut outcome) = match self.slots.entry(tenant_id.to_string()) {
                Entry::Occupied(mut occupied) => {
                    let current = match occupied.get() {
                        Slot::Open(handle) => Ok(Arc::clone(handle)),
                        Slot::Pending {
                            generation,
                            outcome,
                        } => Err((*generation, outcome.clone())),
                    };
                    match current {
                        Ok(handle) => match HandleGuard::try_retain(Arc::clone(&handle)) {
                            Some(guard) => {
                                debug!(
                                    tenant_id = %tenant_id,
                                    generation = handle.generation(),
                                    "Reusing open tenant handle"
                                );
                                return Ok(guard);
                            }
                            None => {
                                // Failed (or closing) handle: evict on access
                                let (pending, receiver, new_job) = self.placeholder(tenant);
                                occupied.insert(pending);
                                retired = Some(handle);
                                let generation = new_job.generation;
                                job = Some(new_job);
                                (generation, receiver)
                            }
                        },
                        Err(waiting) => waiting,
                    }
                }
                Entry::Vacant(vacant) => {
                    let (pending, receiver, new_job) = self.placeholder(tenant);
                    vacant.insert(pending);
                    let generation = new_job.generation;
                    job = Some(new_job);
                    (generation, receiver)
                }
            };

            if let Some(handle) = retired {
                info!(
                    tenant_id = %tenant_id,
                    generation = handle.generation(),
                    state = %handle.state(),
                    "Evicting unusable tenant handle on access"
                );
                self.retire_in_background(handle);
            }
            if let Some(job) = job {
                self.spawn_open(job);
            }

            let outcome = match outcome.wait_for(|o| o.is_some()).await {
                Ok(value) => value.clone(),
                Err(_) => None,
            };

            match outcome {
                Some(Ok(handle)) => {
                    if let Some(guard) = HandleGuard::try_retain(handle) {
                        return Ok(guard);
                    }
                    debug!(
                        tenant_id = %tenant_id,
                        generation,
                        "Handle retired before it could be borrowed, retrying"
                    );
                }
                Some(Err(e)) => return Err(e),
                None => {
                    // The open task went away without reporting (panicked)
                    self.slots
                        .remove_if(tenant_id, |_, slot| slot.is_pending(generation));
                    return Err(TenantError::internal(format!(
                        "Connection open for tenant '{}' was aborted",
                        tenant_id
                    )));
                }
            }
        }

        Err(TenantError::stale_handle(
            tenant_id,
            "Handle kept failing before it could be used",
        ))
    }

    /// Give back a borrowed handle. Equivalent to dropping the guard.
    pub fn release(&self, guard: HandleGuard) {
        guard.release();
    }

    /// Report that `handle`'s connection is broken.
    ///
    /// The handle is not handed out again; the next `acquire` for the tenant
    /// evicts it and opens a fresh one.
    pub fn mark_failed(&self, handle: &ConnectionHandle) {
        if handle.mark_failed() {
            warn!(
                tenant_id = %handle.tenant_id(),
                generation = handle.generation(),
                ref_count = handle.ref_count(),
                "Tenant handle marked failed"
            );
            self.notify_retired(handle);
        }
    }

    /// Close every unreferenced handle that is failed or idle past the threshold.
    ///
    /// Returns the number of handles evicted. Runs periodically in the
    /// background; exposed for callers that want to sweep on demand.
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let now = Instant::now();

        // Phase 1: collect candidates
        let candidates: Vec<String> = self
            .slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Open(handle) if handle.is_evictable(idle_timeout, now) => {
                    Some(entry.key().clone())
                }
                _ => None,
            })
            .collect();

        // Phase 2: re-check and remove under the shard lock
        let mut evicted = Vec::new();
        for tenant_id in candidates {
            let removed = self.slots.remove_if(&tenant_id, |_, slot| match slot {
                // A failed handle can no longer gain references, so the
                // evictability check holds once made
                Slot::Open(handle) => {
                    handle.is_evictable(idle_timeout, now)
                        && (handle.state() == HandleState::Failed
                            || handle.try_begin_close(idle_timeout, now))
                }
                Slot::Pending { .. } => false,
            });
            match removed {
                Some((_, Slot::Open(handle))) => evicted.push(handle),
                _ => debug!(tenant_id = %tenant_id, "Handle became active during sweep, skipping"),
            }
        }

        // Phase 3: close outside of all locks
        let count = evicted.len();
        for handle in evicted {
            if handle.state() == HandleState::Failed {
                info!(
                    tenant_id = %handle.tenant_id(),
                    generation = handle.generation(),
                    "Evicting failed tenant handle"
                );
                self.retire_in_background(handle);
            } else {
                info!(
                    tenant_id = %handle.tenant_id(),
                    generation = handle.generation(),
                    "Closing idle tenant handle"
                );
                self.retire(&handle);
                close_handle(&self.connector, handle).await;
            }
        }
        count
    }

    /// The open handle for a tenant, without taking a reference.
    pub fn peek(&self, tenant_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.slots.get(tenant_id).and_then(|slot| match slot.value() {
            Slot::Open(handle) => Some(Arc::clone(handle)),
            Slot::Pending { .. } => None,
        })
    }

    /// Per-tenant summaries, sorted by tenant id.
    pub fn snapshot(&self) -> Vec<HandleSummary> {
        let mut summaries: Vec<HandleSummary> = self
            .slots
            .iter()
            .map(|entry| match entry.value() {
                Slot::Open(handle) => handle.summary(),
                Slot::Pending { generation, .. } => HandleSummary {
                    tenant_id: entry.key().clone(),
                    generation: *generation,
                    state: HandleState::Pending,
                    ref_count: 0,
                    idle_ms: 0,
                },
            })
            .collect();
        summaries.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        summaries
    }

    pub fn stats(&self) -> MultiplexerStats {
        let mut open_handles = 0;
        let mut pending_opens = 0;
        let mut active_refs = 0;
        for entry in self.slots.iter() {
            match entry.value() {
                Slot::Open(handle) => {
                    open_handles += 1;
                    active_refs += handle.ref_count();
                }
                Slot::Pending { .. } => pending_opens += 1,
            }
        }

        MultiplexerStats {
            open_handles,
            pending_opens,
            active_refs,
            max_open_handles: self.config.max_open_handles,
            available_capacity: self.capacity.available_permits(),
            opens_started: self.counters.opens_started.load(Ordering::Relaxed),
            opens_failed: self.counters.opens_failed.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            shutting_down: self.shutting_down.load(Ordering::Acquire),
        }
    }

    /// Receive [`HandleEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop the sweep, refuse further acquires and close every handle.
    ///
    /// Closing waits for connections still checked out by in-flight requests.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down connection multiplexer");

        let sweep = self
            .sweep_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweep {
            handle.abort();
        }

        // Opens still waiting for capacity fail with ShuttingDown
        self.capacity.close();

        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut to_close = Vec::new();
        for key in keys {
            if let Some((_, Slot::Open(handle))) = self.slots.remove(&key) {
                handle.force_begin_close();
                self.retire(&handle);
                to_close.push(handle);
            }
        }

        for handle in to_close {
            close_handle(&self.connector, handle).await;
        }
        info!("Connection multiplexer shut down");
    }

    fn placeholder(&self, tenant: &Tenant) -> (Slot, watch::Receiver<OpenOutcome>, OpenJob) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        debug!(
            tenant_id = %tenant.tenant_id,
            generation,
            "Installed pending placeholder"
        );
        (
            Slot::Pending {
                generation,
                outcome: receiver.clone(),
            },
            receiver,
            OpenJob {
                tenant: tenant.clone(),
                generation,
                outcome: sender,
            },
        )
    }

    fn spawn_open(self: &Arc<Self>, job: OpenJob) {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            mux.run_open(job).await;
        });
    }

    async fn run_open(&self, job: OpenJob) {
        let OpenJob {
            tenant,
            generation,
            outcome,
        } = job;
        let tenant_id = tenant.tenant_id.as_str();
        self.counters.opens_started.fetch_add(1, Ordering::Relaxed);

        let opened = async {
            let permit = self.reserve_capacity(tenant_id).await?;
            let pool = self.connector.open(tenant_id, &tenant.descriptor).await?;
            Ok::<_, TenantError>(Arc::new(ConnectionHandle::new(
                tenant_id,
                generation,
                pool,
                Some(permit),
            )))
        }
        .await;

        match opened {
            Ok(handle) => {
                let promoted = match self.slots.get_mut(tenant_id) {
                    Some(mut slot) if slot.is_pending(generation) => {
                        *slot = Slot::Open(Arc::clone(&handle));
                        true
                    }
                    _ => false,
                };

                if promoted {
                    info!(tenant_id = %tenant_id, generation, "Tenant handle open");
                    let _ = outcome.send(Some(Ok(handle)));
                } else {
                    // Placeholder was cleared by shutdown while we were opening
                    debug!(tenant_id = %tenant_id, generation, "Discarding orphaned handle");
                    let _ = outcome.send(Some(Err(TenantError::ShuttingDown)));
                    handle.force_begin_close();
                    handle.release_capacity();
                    close_handle(&self.connector, handle).await;
                }
            }
            Err(e) => {
                // Remove first so a woken waiter that retries starts a fresh open
                self.slots
                    .remove_if(tenant_id, |_, slot| slot.is_pending(generation));
                self.counters.opens_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    tenant_id = %tenant_id,
                    generation,
                    error = %e,
                    "Tenant connection open failed"
                );
                let _ = outcome.send(Some(Err(e)));
            }
        }
    }

    async fn reserve_capacity(&self, tenant_id: &str) -> TenantResult<OwnedSemaphorePermit> {
        let max_open = self.config.max_open_handles;
        match self.config.capacity {
            CapacityPolicy::FailFast => {
                Arc::clone(&self.capacity)
                    .try_acquire_owned()
                    .map_err(|e| match e {
                        TryAcquireError::Closed => TenantError::ShuttingDown,
                        TryAcquireError::NoPermits => {
                            warn!(tenant_id = %tenant_id, max_open, "Open-handle capacity exhausted");
                            TenantError::pool_exhausted(max_open, 0)
                        }
                    })
            }
            CapacityPolicy::Wait(limit) => {
                let started = Instant::now();
                let acquire = Arc::clone(&self.capacity).acquire_owned();
                match tokio::time::timeout(limit, acquire).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_closed)) => Err(TenantError::ShuttingDown),
                    Err(_elapsed) => {
                        let waited_ms = started.elapsed().as_millis() as u64;
                        warn!(
                            tenant_id = %tenant_id,
                            max_open,
                            waited_ms,
                            "Timed out waiting for open-handle capacity"
                        );
                        Err(TenantError::pool_exhausted(max_open, waited_ms))
                    }
                }
            }
        }
    }

    /// Bookkeeping for a handle that has just left the map.
    fn retire(&self, handle: &ConnectionHandle) {
        handle.release_capacity();
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        self.notify_retired(handle);
    }

    /// Retire now, close later. Used for failed handles whose pool may still
    /// have connections checked out by in-flight requests.
    fn retire_in_background(&self, handle: Arc<ConnectionHandle>) {
        self.retire(&handle);
        let connector = Arc::clone(&self.connector);
        tokio::spawn(async move {
            close_handle(&connector, handle).await;
        });
    }

    fn notify_retired(&self, handle: &ConnectionHandle) {
        // No receivers is fine
        let _ = self.events.send(HandleEvent::Retired {
            tenant_id: handle.tenant_id().to_string(),
            generation: handle.generation(),
        });
    }

    /// Background task to evict idle handles.
    ///
    /// Uses a Weak reference to the multiplexer and exits once it is dropped.
    async fn sweep_task(weak: Weak<Self>, sweep_interval: Duration) {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(mux) = weak.upgrade() else {
                debug!("Connection multiplexer dropped, sweep task exiting");
                return;
            };

            let evicted = mux.evict_idle().await;
            if evicted > 0 {
                debug!(evicted, "Idle sweep finished");
            }

            // Drop strong reference before sleeping to allow deallocation
            drop(mux);
        }
    }
}

async fn close_handle(connector: &Arc<dyn Connector>, handle: Arc<ConnectionHandle>) {
    connector
        .close(handle.tenant_id(), handle.pool().clone())
        .await;
    handle.finish_close();
}

impl std::fmt::Debug for ConnectionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMultiplexer")
            .field("config", &self.config)
            .field("tenants", &self.slots.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
