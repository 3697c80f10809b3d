//! Ordering Tests - Serialized Dispatch
//!
//! A serialized adapter dispatches one request at a time in the order the
//! requests were admitted. These tests check that order from the servant's
//! point of view:
//! - Sequential calls observe every previous write
//! - Pipelined calls on one connection run in send order
//! - Many connections never overlap inside the servant

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use common::*;
use rpcgate::{AdapterConfig, Communicator, Config, Endpoint, ObjectAdapter};

async fn serialized_register(server: &Communicator) -> (ObjectAdapter, Endpoint, Arc<Register>) {
    let (servant, register) = register_servant();
    let (adapter, endpoint) = start_adapter(
        server,
        "Serial",
        AdapterConfig::serialized(),
        vec![("register", servant)],
    )
    .await;
    (adapter, endpoint, register)
}

/// Test: Each `set` returns the value written by the call before it
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_sets_observe_previous_value() {
    init_logging();

    const CALLS: u64 = 100;

    let server = Communicator::new(Config::default());
    let (adapter, endpoint, register) = serialized_register(&server).await;
    assert!(adapter.is_serialized());

    let client = client(&[]);
    let proxy = client.proxy("register", endpoint);

    for value in 1..=CALLS {
        let previous = proxy.invoke(SET, encode_u64(value)).await.unwrap();
        assert_eq!(decode_u64(previous), value - 1);
    }
    assert_eq!(register.calls(), CALLS as usize);

    client.destroy().await;
    server.destroy().await;
}

/// Test: Pipelined requests from one proxy are dispatched in send order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipelined_requests_dispatch_in_order() {
    init_logging();

    const CALLS: u64 = 200;

    let server = Communicator::new(Config::default());
    let (_adapter, endpoint, register) = serialized_register(&server).await;

    let client = client(&[]);
    let proxy = client.proxy("register", endpoint);

    let mut handles = Vec::with_capacity(CALLS as usize);
    for value in 1..=CALLS {
        handles.push(proxy.begin_invoke(SET, encode_u64(value)).await);
    }

    let results = join_all(handles).await;
    for (index, result) in results.into_iter().enumerate() {
        assert_eq!(decode_u64(result.unwrap()), index as u64);
    }

    let history = register.history.lock().clone();
    let expected: Vec<u64> = (1..=CALLS).collect();
    assert_eq!(history, expected);

    client.destroy().await;
    server.destroy().await;
}

/// Test: Requests from many connections never run concurrently
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_serialized_adapter_never_overlaps() {
    init_logging();

    const CLIENTS: usize = 8;
    const CALLS_PER_CLIENT: usize = 5;

    let server = Communicator::new(Config::default());
    let (servant, sleeper) = sleeper_servant();
    let (_adapter, endpoint) = start_adapter(
        &server,
        "Serial",
        AdapterConfig::serialized(),
        vec![("sleeper", servant)],
    )
    .await;

    let clients: Vec<Communicator> = (0..CLIENTS).map(|_| client(&[])).collect();
    let calls = clients.iter().map(|client| {
        let proxy = client.proxy("sleeper", endpoint.clone());
        async move {
            for _ in 0..CALLS_PER_CLIENT {
                proxy.invoke(SLEEP, encode_u64(5)).await.unwrap();
            }
        }
    });
    tokio::time::timeout(Duration::from_secs(30), join_all(calls))
        .await
        .expect("serialized calls finished");

    assert_eq!(sleeper.calls(), CLIENTS * CALLS_PER_CLIENT);
    assert_eq!(sleeper.max_active(), 1);

    join_all(clients.iter().map(|client| client.destroy())).await;
    server.destroy().await;
}

/// Test: Holding a serialized adapter does not reorder the requests it parked
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_order_preserved_across_hold() {
    init_logging();

    const CALLS: u64 = 20;

    let server = Communicator::new(Config::default());
    let (adapter, endpoint, register) = serialized_register(&server).await;

    let client = client(&[]);
    let proxy = client.proxy("register", endpoint);
    proxy.connection().await.unwrap();

    adapter.hold().unwrap();
    let mut handles = Vec::with_capacity(CALLS as usize);
    for value in 1..=CALLS {
        handles.push(proxy.begin_invoke(SET, encode_u64(value)).await);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(register.calls(), 0);

    adapter.activate().unwrap();
    for (index, handle) in handles.into_iter().enumerate() {
        assert_eq!(decode_u64(handle.await.unwrap()), index as u64);
    }

    client.destroy().await;
    server.destroy().await;
}
