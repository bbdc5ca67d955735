//! Integration tests for idle eviction, failed-handle replacement and shutdown.

mod common;

use common::{FakeConnector, eventually, mux_config, tenant};
use std::sync::Arc;
use std::time::Duration;
use tenant_mux::db::{
    CapacityPolicy, ConnectionMultiplexer, HandleEvent, HandleState, MultiplexerConfig,
};
use tenant_mux::error::TenantError;

#[tokio::test]
async fn test_background_sweep_evicts_idle_handles() {
    let connector = FakeConnector::new();
    let mux = ConnectionMultiplexer::new(
        connector.clone(),
        MultiplexerConfig {
            max_open_handles: 4,
            capacity: CapacityPolicy::FailFast,
            idle_timeout: Duration::from_millis(30),
            sweep_interval: Duration::from_millis(10),
        },
    );
    let mut events = mux.subscribe();

    let guard = mux.acquire(&tenant("acme")).await.unwrap();
    let handle = Arc::clone(guard.handle());

    // Referenced handles survive any number of sweeps
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mux.peek("acme").is_some());
    assert_eq!(handle.state(), HandleState::Open);

    drop(guard);
    assert!(eventually(Duration::from_secs(2), || mux.peek("acme").is_none()).await);
    assert!(eventually(Duration::from_secs(2), || handle.state() == HandleState::Closed).await);
    assert_eq!(connector.closes(), 1);
    assert_eq!(
        events.recv().await.unwrap(),
        HandleEvent::Retired {
            tenant_id: "acme".to_string(),
            generation: handle.generation(),
        }
    );
    assert_eq!(mux.stats().evictions, 1);
}

#[tokio::test]
async fn test_eviction_only_touches_idle_tenants() {
    let connector = FakeConnector::new();
    let mux = ConnectionMultiplexer::new(
        connector.clone(),
        mux_config(4, CapacityPolicy::FailFast, Duration::from_millis(30)),
    );

    let acme = mux.acquire(&tenant("acme")).await.unwrap();
    drop(mux.acquire(&tenant("globex")).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(mux.evict_idle().await, 1);
    assert!(mux.peek("acme").is_some());
    assert!(mux.peek("globex").is_none());
    assert_eq!(acme.handle().ref_count(), 1);
}

#[tokio::test]
async fn test_failed_handle_replaced_while_old_borrow_outstanding() {
    let connector = FakeConnector::new();
    let mux = ConnectionMultiplexer::new(
        connector.clone(),
        mux_config(4, CapacityPolicy::FailFast, Duration::from_secs(60)),
    );

    let old_guard = mux.acquire(&tenant("acme")).await.unwrap();
    let old = Arc::clone(old_guard.handle());
    mux.mark_failed(&old);

    // The sweep leaves a failed handle alone while it is still borrowed
    assert_eq!(mux.evict_idle().await, 0);

    let fresh = mux.acquire(&tenant("acme")).await.unwrap();
    assert!(!Arc::ptr_eq(fresh.handle(), &old));
    assert_eq!(fresh.handle().state(), HandleState::Open);
    assert_eq!(connector.opens(), 2);

    // The old borrow still releases cleanly
    assert_eq!(old.ref_count(), 1);
    drop(old_guard);
    assert_eq!(old.ref_count(), 0);
    assert_eq!(fresh.handle().ref_count(), 1);
}

#[tokio::test]
async fn test_unreferenced_failed_handle_swept() {
    let connector = FakeConnector::new();
    let mux = ConnectionMultiplexer::new(
        connector.clone(),
        mux_config(1, CapacityPolicy::FailFast, Duration::from_secs(60)),
    );

    let guard = mux.acquire(&tenant("acme")).await.unwrap();
    let handle = Arc::clone(guard.handle());
    drop(guard);
    mux.mark_failed(&handle);

    assert_eq!(mux.evict_idle().await, 1);
    assert!(mux.peek("acme").is_none());
    // Capacity is returned immediately, before the background close finishes
    assert_eq!(mux.stats().available_capacity, 1);
    assert!(eventually(Duration::from_secs(2), || connector.closes() == 1).await);
}

#[tokio::test]
async fn test_shutdown_closes_everything_and_refuses_acquire() {
    let connector = FakeConnector::new();
    let mux = ConnectionMultiplexer::new(
        connector.clone(),
        mux_config(4, CapacityPolicy::FailFast, Duration::from_secs(60)),
    );

    let acme = Arc::clone(mux.acquire(&tenant("acme")).await.unwrap().handle());
    let globex = Arc::clone(mux.acquire(&tenant("globex")).await.unwrap().handle());

    mux.shutdown().await;
    assert_eq!(acme.state(), HandleState::Closed);
    assert_eq!(globex.state(), HandleState::Closed);
    assert_eq!(connector.closes(), 2);
    assert!(mux.snapshot().is_empty());
    assert!(matches!(
        mux.acquire(&tenant("acme")).await,
        Err(TenantError::ShuttingDown)
    ));

    // Idempotent
    mux.shutdown().await;
    assert_eq!(connector.closes(), 2);
}
