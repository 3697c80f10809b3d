//! Timeout Tests - Connect, Invocation and Close Deadlines
//!
//! These tests check the three deadline domains independently:
//! - Connect timeout while the server never validates the connection
//! - Invocation timeout against slow servants, with late replies discarded
//! - Close timeout while a reply is still outstanding
//! - Override properties taking precedence over per-proxy settings

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;

use common::*;
use rpcgate::{AdapterConfig, CloseMode, Communicator, Config, ConnectionState, Operation, RpcError};

/// Test: A holding adapter never validates, so establishment times out
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_timeout_against_holding_adapter() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, register) = register_servant();
    let (adapter, endpoint) =
        listen_adapter(&server, "Held", AdapterConfig::default(), vec![("register", servant)])
            .await;

    let client = client(&[("Rpc.ConnectTimeout", "100"), ("Rpc.RetryIntervals", "-1")]);
    let proxy = client.proxy("register", endpoint);

    let start = Instant::now();
    let result = proxy.invoke(GET, Bytes::new()).await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(RpcError::ConnectTimeout)), "got {:?}", result);
    assert!(elapsed >= Duration::from_millis(100), "too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "too late: {:?}", elapsed);
    assert_eq!(register.calls(), 0);

    // Once active, the same proxy connects normally
    adapter.activate().unwrap();
    let value = proxy.invoke(GET, Bytes::new()).await.unwrap();
    assert_eq!(decode_u64(value), 0);

    client.destroy().await;
    server.destroy().await;
}

/// Test: A connect timeout is retried like any failure before send
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_timeout_retried_by_schedule() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, _register) = register_servant();
    let (_adapter, endpoint) =
        listen_adapter(&server, "Held", AdapterConfig::default(), vec![("register", servant)])
            .await;

    let client = client(&[("Rpc.ConnectTimeout", "100"), ("Rpc.RetryIntervals", "0 0")]);
    let proxy = client.proxy("register", endpoint);

    let start = Instant::now();
    let result = proxy.invoke(SET, encode_u64(1)).await;

    assert!(matches!(result, Err(RpcError::ConnectTimeout)));
    assert!(start.elapsed() >= Duration::from_millis(300));
    let stats = client.stats();
    assert_eq!(stats.failures, 3);
    assert_eq!(stats.retries, 2);

    client.destroy().await;
    server.destroy().await;
}

/// Test: A slow reply times out; a generous timeout on the same connection
/// succeeds
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invocation_timeout() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, sleeper) = sleeper_servant();
    let (_adapter, endpoint) =
        start_adapter(&server, "Sleepy", AdapterConfig::default(), vec![("sleeper", servant)])
            .await;

    let client = client(&[("Rpc.RetryIntervals", "0 0 0")]);
    let proxy = client.proxy("sleeper", endpoint);

    let impatient = proxy.with_invocation_timeout(Some(Duration::from_millis(100)));
    let start = Instant::now();
    let result = impatient.invoke(SLEEP, encode_u64(1000)).await;
    assert!(matches!(result, Err(RpcError::InvocationTimeout)), "got {:?}", result);
    assert!(start.elapsed() < Duration::from_millis(900));

    // Invocation timeouts are never retried, even for idempotent calls
    assert_eq!(sleeper.calls(), 1);
    assert_eq!(client.stats().retries, 0);

    let patient = proxy.with_invocation_timeout(Some(Duration::from_millis(1000)));
    let reply = patient.invoke(SLEEP, encode_u64(500)).await.unwrap();
    assert_eq!(decode_u64(reply), 500);

    // The connection outlived the timed-out call
    let connection = proxy.connection().await.unwrap();
    assert!(connection.is_open());

    client.destroy().await;
    server.destroy().await;
}

/// Test: The reply to a timed-out call arrives later and is dropped without
/// disturbing the calls behind it
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_reply_is_discarded() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, sleeper) = sleeper_servant();
    let (_adapter, endpoint) =
        start_adapter(&server, "Sleepy", AdapterConfig::default(), vec![("sleeper", servant)])
            .await;

    let client = client(&[]);
    let proxy = client.proxy("sleeper", endpoint);

    let impatient = proxy.with_invocation_timeout(Some(Duration::from_millis(50)));
    assert!(matches!(
        impatient.invoke(SLEEP, encode_u64(300)).await,
        Err(RpcError::InvocationTimeout)
    ));

    // Straddle the late reply with calls of our own
    let mut handles = Vec::new();
    for millis in [100u64, 250, 400] {
        handles.push(proxy.begin_invoke(SLEEP, encode_u64(millis)).await);
    }
    for (handle, millis) in handles.into_iter().zip([100u64, 250, 400]) {
        assert_eq!(decode_u64(handle.await.unwrap()), millis);
    }

    assert_eq!(sleeper.completed(), 4);
    assert_eq!(proxy.connection().await.unwrap().pending_count(), 0);

    client.destroy().await;
    server.destroy().await;
}

/// Test: Override properties win over per-proxy and default timeouts
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_override_takes_precedence() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, _sleeper) = sleeper_servant();
    let (_adapter, endpoint) =
        start_adapter(&server, "Sleepy", AdapterConfig::default(), vec![("sleeper", servant)])
            .await;

    let client = client(&[
        ("Rpc.InvocationTimeout", "5000"),
        ("Rpc.Override.InvocationTimeout", "100"),
    ]);
    let proxy = client
        .proxy("sleeper", endpoint)
        .with_invocation_timeout(Some(Duration::from_secs(10)));
    assert_eq!(proxy.invocation_timeout(), Some(Duration::from_millis(100)));

    let result = proxy.invoke(SLEEP, encode_u64(1000)).await;
    assert!(matches!(result, Err(RpcError::InvocationTimeout)));

    let unbounded = common::client(&[("Rpc.InvocationTimeout", "-1")]);
    assert_eq!(
        unbounded
            .proxy("sleeper", proxy.endpoint().clone())
            .invocation_timeout(),
        None
    );

    client.destroy().await;
    server.destroy().await;
}

/// Test: Graceful close waits for outstanding replies within the close timeout
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_close_drains_pending() {
    init_logging();

    let server = Communicator::new(Config::default());
    let (servant, _sleeper) = sleeper_servant();
    let (_adapter, endpoint) =
        start_adapter(&server, "Sleepy", AdapterConfig::default(), vec![("sleeper", servant)])
            .await;

    let client = client(&[("Rpc.CloseTimeout", "2000")]);
    let proxy = client.proxy("sleeper", endpoint);

    let handle = proxy.begin_invoke(SLEEP, encode_u64(150)).await;
    let connection = proxy.connection().await.unwrap();
    proxy.close_connection(CloseMode::Gracefully).await.unwrap();

    assert_eq!(decode_u64(handle.await.unwrap()), 150);
    assert_eq!(connection.state(), ConnectionState::Closed);

    client.destroy().await;
    server.destroy().await;
}

/// Test: A graceful close that outlasts the close timeout becomes forceful
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_timeout_forces_close() {
    init_logging();

    const SLOW: Operation = Operation::normal("sleep");

    let server = Communicator::new(Config::default());
    let (servant, _sleeper) = sleeper_servant();
    let (_adapter, endpoint) =
        start_adapter(&server, "Sleepy", AdapterConfig::default(), vec![("sleeper", servant)])
            .await;

    let client = client(&[("Rpc.CloseTimeout", "100")]);
    let proxy = client.proxy("sleeper", endpoint);

    let handle = proxy.begin_invoke(SLOW, encode_u64(2000)).await;
    let connection = proxy.connection().await.unwrap();

    let start = Instant::now();
    let closed = proxy.close_connection(CloseMode::Gracefully).await;
    assert!(matches!(closed, Err(RpcError::CloseTimeout)), "got {:?}", closed);
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(connection.state(), ConnectionState::Closed);

    // The outstanding call fails with the close timeout, not a hang
    let result = handle.await;
    assert!(matches!(result, Err(RpcError::CloseTimeout)), "got {:?}", result);

    client.destroy().await;
    server.destroy().await;
}
