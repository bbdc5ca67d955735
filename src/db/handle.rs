//! Per-tenant connection handles and the RAII guard requests borrow them through.
//!
//! # Concurrency
//!
//! State, reference count and last-use time live behind one `std::sync::Mutex`
//! so that "is it open?" and "take a reference" happen atomically with respect to
//! the idle sweeper's "is it unreferenced?" and "begin closing". The lock is never
//! held across an await point. When the multiplexer's map shard lock is also
//! needed, the shard lock is always taken first.

use crate::db::pool::DbPool;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::warn;

/// Lifecycle of a tenant entry: `Pending → Open → {Closing → Closed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    /// Placeholder installed, open in flight
    Pending,
    Open,
    /// Chosen for eviction, connection being released
    Closing,
    Closed,
    /// Transport fault observed; never handed out again
    Failed,
}

impl HandleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct HandleInner {
    state: HandleState,
    ref_count: usize,
    last_used: Instant,
    /// Slot in the multiplexer's open-handle budget. Dropped on retirement.
    permit: Option<OwnedSemaphorePermit>,
}

/// One live logical connection bound to exactly one tenant.
///
/// Owned by the multiplexer; requests only ever see it through a [`HandleGuard`].
pub struct ConnectionHandle {
    tenant_id: String,
    generation: u64,
    pool: DbPool,
    opened_at: Instant,
    inner: Mutex<HandleInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        tenant_id: impl Into<String>,
        generation: u64,
        pool: DbPool,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let now = Instant::now();
        Self {
            tenant_id: tenant_id.into(),
            generation,
            pool,
            opened_at: now,
            inner: Mutex::new(HandleInner {
                state: HandleState::Open,
                ref_count: 0,
                last_used: now,
                permit,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        // Critical sections never panic midway, so a poisoned lock still holds
        // consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Monotonic number distinguishing successive handles for the same tenant.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn state(&self) -> HandleState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == HandleState::Open
    }

    pub fn ref_count(&self) -> usize {
        self.lock().ref_count
    }

    pub fn last_used_at(&self) -> Instant {
        self.lock().last_used
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Take a reference. Only succeeds while the handle is Open.
    pub(crate) fn retain(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != HandleState::Open {
            return false;
        }
        inner.ref_count += 1;
        inner.last_used = Instant::now();
        true
    }

    /// Drop a reference. Saturates at 0 to prevent underflow from extra release calls.
    pub(crate) fn release(&self) {
        let mut inner = self.lock();
        if inner.ref_count == 0 {
            warn!(
                tenant_id = %self.tenant_id,
                generation = self.generation,
                "Reference count underflow detected - extra release call"
            );
            return;
        }
        inner.ref_count -= 1;
        inner.last_used = Instant::now();
    }

    /// Record that the underlying connection is broken.
    ///
    /// Returns true if this call moved the handle out of Open.
    pub(crate) fn mark_failed(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != HandleState::Open {
            return false;
        }
        inner.state = HandleState::Failed;
        true
    }

    /// Open → Closing, but only for an unreferenced handle idle past `idle_timeout`.
    pub(crate) fn try_begin_close(&self, idle_timeout: Duration, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.state != HandleState::Open || inner.ref_count > 0 {
            return false;
        }
        if now.saturating_duration_since(inner.last_used) < idle_timeout {
            return false;
        }
        inner.state = HandleState::Closing;
        true
    }

    /// Open → Closing regardless of references. Used at shutdown.
    pub(crate) fn force_begin_close(&self) {
        let mut inner = self.lock();
        if inner.state == HandleState::Open {
            inner.state = HandleState::Closing;
        }
    }

    /// Closing → Closed once the connection has been released.
    pub(crate) fn finish_close(&self) {
        let mut inner = self.lock();
        if inner.state == HandleState::Closing {
            inner.state = HandleState::Closed;
        }
    }

    /// Give the handle's slot back to the open-handle budget.
    pub(crate) fn release_capacity(&self) {
        let permit = self.lock().permit.take();
        drop(permit);
    }

    /// Unreferenced and either failed or idle past the threshold.
    pub(crate) fn is_evictable(&self, idle_timeout: Duration, now: Instant) -> bool {
        let inner = self.lock();
        if inner.ref_count > 0 {
            return false;
        }
        match inner.state {
            HandleState::Failed => true,
            HandleState::Open => now.saturating_duration_since(inner.last_used) >= idle_timeout,
            _ => false,
        }
    }

    pub fn summary(&self) -> HandleSummary {
        let inner = self.lock();
        HandleSummary {
            tenant_id: self.tenant_id.clone(),
            generation: self.generation,
            state: inner.state,
            ref_count: inner.ref_count,
            idle_ms: inner.last_used.elapsed().as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ConnectionHandle")
            .field("tenant_id", &self.tenant_id)
            .field("generation", &self.generation)
            .field("db_type", &self.pool.db_type())
            .field("state", &inner.state)
            .field("ref_count", &inner.ref_count)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of one tenant entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleSummary {
    pub tenant_id: String,
    pub generation: u64,
    pub state: HandleState,
    pub ref_count: usize,
    pub idle_ms: u64,
}

/// A counted borrow of a [`ConnectionHandle`].
///
/// Releases its reference exactly once, either via [`HandleGuard::release`] or
/// when dropped, so every exit path of a request (error, timeout, client
/// disconnect) gives the reference back.
pub struct HandleGuard {
    handle: Arc<ConnectionHandle>,
    released: bool,
}

impl HandleGuard {
    /// Wrap a handle whose reference has already been taken.
    pub(crate) fn new(handle: Arc<ConnectionHandle>) -> Self {
        Self {
            handle,
            released: false,
        }
    }

    /// Take a reference and wrap it, or None if the handle is no longer Open.
    pub(crate) fn try_retain(handle: Arc<ConnectionHandle>) -> Option<Self> {
        handle.retain().then(|| Self::new(handle))
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.handle.release();
        }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for HandleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleGuard")
            .field("tenant_id", &self.handle.tenant_id)
            .field("generation", &self.handle.generation)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    fn handle() -> Arc<ConnectionHandle> {
        let pool = DbPool::SQLite(SqlitePool::connect_lazy("sqlite::memory:").unwrap());
        Arc::new(ConnectionHandle::new("acme", 1, pool, None))
    }

    #[tokio::test]
    async fn test_new_handle_is_open_and_unreferenced() {
        let handle = handle();
        assert_eq!(handle.state(), HandleState::Open);
        assert_eq!(handle.ref_count(), 0);
        assert_eq!(handle.tenant_id(), "acme");
    }

    #[tokio::test]
    async fn test_guard_releases_once() {
        let handle = handle();
        let guard = HandleGuard::try_retain(Arc::clone(&handle)).unwrap();
        let second = HandleGuard::try_retain(Arc::clone(&handle)).unwrap();
        assert_eq!(handle.ref_count(), 2);

        guard.release();
        assert_eq!(handle.ref_count(), 1);
        drop(second);
        assert_eq!(handle.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_release_saturates_at_zero() {
        let handle = handle();
        handle.release();
        assert_eq!(handle.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_retain_refused_once_failed() {
        let handle = handle();
        assert!(handle.mark_failed());
        assert!(!handle.mark_failed());
        assert_eq!(handle.state(), HandleState::Failed);
        assert!(HandleGuard::try_retain(Arc::clone(&handle)).is_none());
        assert_eq!(handle.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_close_skips_referenced_handle() {
        let handle = handle();
        let guard = HandleGuard::try_retain(Arc::clone(&handle)).unwrap();
        let later = Instant::now() + Duration::from_secs(3600);

        assert!(!handle.try_begin_close(Duration::from_secs(1), later));
        assert!(!handle.is_evictable(Duration::from_secs(1), later));
        drop(guard);

        assert!(handle.is_evictable(Duration::from_secs(1), later));
        assert!(handle.try_begin_close(Duration::from_secs(1), later));
        assert_eq!(handle.state(), HandleState::Closing);
        assert!(HandleGuard::try_retain(Arc::clone(&handle)).is_none());

        handle.finish_close();
        assert_eq!(handle.state(), HandleState::Closed);
        assert!(handle.state().is_terminal());
    }

    #[tokio::test]
    async fn test_failed_handle_evictable_once_unreferenced() {
        let handle = handle();
        let guard = HandleGuard::try_retain(Arc::clone(&handle)).unwrap();
        handle.mark_failed();
        assert!(!handle.is_evictable(Duration::ZERO, Instant::now()));

        drop(guard);
        assert!(handle.is_evictable(Duration::ZERO, Instant::now()));
    }

    #[tokio::test]
    async fn test_idle_close_waits_for_threshold() {
        let handle = handle();
        assert!(!handle.try_begin_close(Duration::from_secs(60), Instant::now()));
        assert_eq!(handle.state(), HandleState::Open);
    }

    #[tokio::test]
    async fn test_capacity_permit_released() {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = Arc::clone(&semaphore).try_acquire_owned().unwrap();
        let pool = DbPool::SQLite(SqlitePool::connect_lazy("sqlite::memory:").unwrap());
        let handle = ConnectionHandle::new("acme", 7, pool, Some(permit));
        assert_eq!(semaphore.available_permits(), 0);

        handle.release_capacity();
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_summary() {
        let handle = handle();
        let _guard = HandleGuard::try_retain(Arc::clone(&handle)).unwrap();
        let summary = handle.summary();
        assert_eq!(summary.tenant_id, "acme");
        assert_eq!(summary.generation, 1);
        assert_eq!(summary.state, HandleState::Open);
        assert_eq!(summary.ref_count, 1);
    }
}
