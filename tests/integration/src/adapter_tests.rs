//! Adapter Tests - Hold, Activate and Deactivate Gating
//!
//! These tests exercise the adapter state machine against live clients:
//! - Requests arriving while holding are parked, not rejected
//! - Deactivation fails parked and queued requests, running ones complete
//! - `wait_for_hold` and `hold_for` observe the drained hold
//! - Concurrent adapters overlap dispatches, serialized ones never do

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;

use common::*;
use rpcgate::{AdapterConfig, AdapterState, Communicator, Config, RpcError};

/// Test: A held adapter parks requests until it is activated again
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_held_request_completes_after_activate() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, register) = register_servant();
    let (adapter, endpoint) =
        start_adapter(&server, "Gate", AdapterConfig::default(), vec![("register", servant)])
            .await;

    let client = client(&[]);
    let proxy = client.proxy("register", endpoint);
    proxy.invoke(SET, encode_u64(1)).await.unwrap();

    adapter.hold().unwrap();
    assert_eq!(adapter.state(), AdapterState::Holding);

    let held = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.invoke(SET, encode_u64(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!held.is_finished(), "request dispatched while holding");
    assert_eq!(register.calls(), 1);

    adapter.activate().unwrap();
    let previous = held.await.unwrap().unwrap();
    assert_eq!(decode_u64(previous), 1);
    assert_eq!(register.calls(), 2);

    client.destroy().await;
    server.destroy().await;
}

/// Test: Deactivating a held adapter fails the parked request
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hold_then_deactivate_fails_parked_request() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, register) = register_servant();
    let (adapter, endpoint) =
        start_adapter(&server, "Gate", AdapterConfig::default(), vec![("register", servant)])
            .await;

    let client = client(&[("Rpc.RetryIntervals", "0 0 0")]);
    let proxy = client.proxy("register", endpoint);
    proxy.invoke(GET, Bytes::new()).await.unwrap();

    adapter.hold().unwrap();
    let held = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.invoke(GET, Bytes::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    adapter.deactivate().await;
    assert_eq!(adapter.state(), AdapterState::Deactivated);

    let result = held.await.unwrap();
    assert!(
        matches!(result, Err(RpcError::AdapterUnavailable(_))),
        "got {:?}",
        result
    );
    assert_eq!(register.calls(), 1);
    assert_eq!(client.stats().retries, 0);

    client.destroy().await;
    server.destroy().await;
}

/// Test: Deactivating a serialized adapter lets the running dispatch finish
/// and fails the ones queued behind it
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deactivate_fails_queued_requests() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, sleeper) = sleeper_servant();
    let (adapter, endpoint) =
        start_adapter(&server, "Serial", AdapterConfig::serialized(), vec![("sleeper", servant)])
            .await;

    let client = client(&[]);
    let proxy = client.proxy("sleeper", endpoint);
    proxy.invoke(SLEEP, encode_u64(0)).await.unwrap();

    let running = proxy.begin_invoke(SLEEP, encode_u64(500)).await;
    let queued_a = proxy.begin_invoke(SLEEP, encode_u64(0)).await;
    let queued_b = proxy.begin_invoke(SLEEP, encode_u64(0)).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let start = Instant::now();
    adapter.deactivate().await;
    assert!(
        start.elapsed() >= Duration::from_millis(200),
        "deactivate returned before the running dispatch drained"
    );

    assert_eq!(decode_u64(running.await.unwrap()), 500);
    for queued in [queued_a, queued_b] {
        assert!(matches!(queued.await, Err(RpcError::AdapterUnavailable(_))));
    }
    assert_eq!(sleeper.calls(), 2);

    client.destroy().await;
    server.destroy().await;
}

/// Test: `wait_for_hold` returns only once running dispatches are done
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_for_hold_waits_for_drain() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, sleeper) = sleeper_servant();
    let (adapter, endpoint) =
        start_adapter(&server, "Drain", AdapterConfig::default(), vec![("sleeper", servant)])
            .await;

    let client = client(&[]);
    let proxy = client.proxy("sleeper", endpoint);

    let in_flight = proxy.begin_invoke(SLEEP, encode_u64(300)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sleeper.calls(), 1);

    adapter.hold().unwrap();
    adapter.wait_for_hold().await.unwrap();
    assert_eq!(sleeper.completed(), 1);
    assert_eq!(decode_u64(in_flight.await.unwrap()), 300);

    // Already drained: returns immediately
    tokio::time::timeout(Duration::from_millis(100), adapter.wait_for_hold())
        .await
        .expect("drained hold observed immediately")
        .unwrap();

    client.destroy().await;
    server.destroy().await;
}

/// Test: Deactivation releases a `wait_for_hold` caller with an error
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_for_hold_released_by_deactivate() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, _sleeper) = sleeper_servant();
    let (adapter, _endpoint) =
        start_adapter(&server, "Drain", AdapterConfig::default(), vec![("sleeper", servant)])
            .await;

    let waiter = {
        let adapter = adapter.clone();
        tokio::spawn(async move { adapter.wait_for_hold().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    adapter.deactivate().await;
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(RpcError::AdapterUnavailable(_))));

    server.destroy().await;
}

/// Test: `hold_for` parks requests for the requested time, then reactivates
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hold_for_reactivates() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, register) = register_servant();
    let (adapter, endpoint) =
        start_adapter(&server, "Timed", AdapterConfig::default(), vec![("register", servant)])
            .await;

    let client = client(&[]);
    let proxy = client.proxy("register", endpoint);
    proxy.invoke(GET, Bytes::new()).await.unwrap();

    let start = Instant::now();
    adapter.hold_for(Duration::from_millis(200)).unwrap();
    assert_eq!(adapter.state(), AdapterState::Holding);

    proxy.invoke(SET, encode_u64(9)).await.unwrap();
    assert!(
        start.elapsed() >= Duration::from_millis(200),
        "dispatched before the hold expired: {:?}",
        start.elapsed()
    );
    assert_eq!(adapter.state(), AdapterState::Active);
    assert_eq!(register.calls(), 2);

    client.destroy().await;
    server.destroy().await;
}

/// Test: After deactivation existing connections get `AdapterUnavailable`
/// and new connections are refused
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_after_deactivate() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, register) = register_servant();
    let (adapter, endpoint) =
        start_adapter(&server, "Gone", AdapterConfig::default(), vec![("register", servant)])
            .await;

    let client = client(&[("Rpc.ConnectTimeout", "500")]);
    let proxy = client.proxy("register", endpoint.clone());
    proxy.invoke(GET, Bytes::new()).await.unwrap();

    adapter.deactivate().await;
    assert!(matches!(adapter.activate(), Err(RpcError::AdapterUnavailable(_))));
    assert!(matches!(adapter.hold(), Err(RpcError::AdapterUnavailable(_))));

    let result = proxy.invoke(GET, Bytes::new()).await;
    assert!(matches!(result, Err(RpcError::AdapterUnavailable(_))), "got {:?}", result);

    let fresh = common::client(&[("Rpc.ConnectTimeout", "500"), ("Rpc.RetryIntervals", "-1")]);
    let result = fresh.proxy("register", endpoint).invoke(GET, Bytes::new()).await;
    assert!(result.is_err());
    assert_eq!(register.calls(), 1);

    client.destroy().await;
    fresh.destroy().await;
    server.destroy().await;
}

/// Test: A concurrent adapter overlaps dispatches up to its pool size
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_adapter_overlaps_dispatch() {
    init_logging();

    const CALLS: usize = 4;

    let server = Communicator::new(Config::default());
    let (servant, sleeper) = sleeper_servant();
    let config = AdapterConfig {
        pool_size: CALLS,
        ..AdapterConfig::default()
    };
    let (_adapter, endpoint) =
        start_adapter(&server, "Pool", config, vec![("sleeper", servant)]).await;

    let client = client(&[]);
    let proxy = client.proxy("sleeper", endpoint);

    let start = Instant::now();
    let results = join_all((0..CALLS).map(|_| proxy.invoke(SLEEP, encode_u64(300)))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(
        start.elapsed() < Duration::from_millis(300 * CALLS as u64),
        "dispatches did not overlap: {:?}",
        start.elapsed()
    );
    assert!(sleeper.max_active() > 1);

    client.destroy().await;
    server.destroy().await;
}

/// Test: The adapter's counters track what happened at its gate
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_adapter_stats() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, _register) = register_servant();
    let (adapter, endpoint) =
        start_adapter(&server, "Stats", AdapterConfig::default(), vec![("register", servant)])
            .await;

    let client = client(&[]);
    let proxy = client.proxy("register", endpoint);
    for value in 1..=3 {
        proxy.invoke(SET, encode_u64(value)).await.unwrap();
    }
    adapter.deactivate().await;
    assert!(proxy.invoke(GET, Bytes::new()).await.is_err());

    let stats = adapter.stats().snapshot();
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.requests_received, 4);
    assert_eq!(stats.requests_dispatched, 3);
    assert_eq!(stats.requests_rejected, 1);

    client.destroy().await;
    server.destroy().await;
}
