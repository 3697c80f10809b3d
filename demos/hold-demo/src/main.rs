//! Hold / Timeout / Retry Demo
//!
//! Runs a small counter service and a client in one process and walks
//! through the reliability features one scenario at a time.
//!
//! USAGE:
//!   hold-demo [OPTIONS]
//!
//! EXAMPLES:
//!   hold-demo                             # run every scenario
//!   hold-demo --scenario hold             # requests parked by a hold
//!   hold-demo --scenario timeout          # invocation timeout vs slow servant
//!   hold-demo --scenario retry            # idempotent retry after connection loss
//!   hold-demo --retry-intervals "0 100"   # custom retry schedule

use bytes::{Buf, Bytes};
use clap::{Parser, ValueEnum};
use rpcgate::{
    AdapterConfig, Communicator, Config, Endpoint, ObjectAdapter, Operation, Proxy, RpcError,
    Servant,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const INCREMENT: Operation = Operation::normal("increment");
const READ: Operation = Operation::idempotent("read");
const SLOW_READ: Operation = Operation::idempotent("slowRead");
const FLAKY_READ: Operation = Operation::idempotent("flakyRead");

/// Scenario to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Every scenario in turn
    All,
    /// Hold the adapter, send a request, activate
    Hold,
    /// Invocation timeout against a slow operation
    Timeout,
    /// Connection lost mid-call, idempotent retry
    Retry,
}

#[derive(Parser, Debug)]
#[command(name = "hold-demo")]
#[command(version)]
#[command(about = "Demonstrates adapter holds, invocation timeouts and retries")]
struct Args {
    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Address the counter adapter listens on
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// How long the hold scenario keeps the adapter held (ms)
    #[arg(long, default_value_t = 500)]
    hold_ms: u64,

    /// Invocation timeout used by the timeout scenario (ms)
    #[arg(long, default_value_t = 200)]
    timeout_ms: u64,

    /// Client retry schedule, `Rpc.RetryIntervals` syntax
    #[arg(long, default_value = "0 50 100")]
    retry_intervals: String,

    /// Serialize dispatch on the counter adapter
    #[arg(long)]
    serialize: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

struct Counter {
    value: AtomicU64,
    flaky_failures: AtomicU64,
}

fn create_servant(counter: Arc<Counter>) -> Servant {
    let on_increment = counter.clone();
    let on_read = counter.clone();
    let on_slow = counter.clone();
    let on_flaky = counter;

    Servant::builder()
        .operation("increment", move |_current, _args| {
            let counter = on_increment.clone();
            async move {
                let value = counter.value.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Bytes::copy_from_slice(&value.to_le_bytes()))
            }
        })
        .operation("read", move |_current, _args| {
            let counter = on_read.clone();
            async move {
                let value = counter.value.load(Ordering::SeqCst);
                Ok(Bytes::copy_from_slice(&value.to_le_bytes()))
            }
        })
        .operation("slowRead", move |_current, mut args| {
            let counter = on_slow.clone();
            async move {
                let millis = if args.remaining() >= 8 { args.get_u64_le() } else { 0 };
                tokio::time::sleep(Duration::from_millis(millis)).await;
                let value = counter.value.load(Ordering::SeqCst);
                Ok(Bytes::copy_from_slice(&value.to_le_bytes()))
            }
        })
        .operation("flakyRead", move |current, _args| {
            let counter = on_flaky.clone();
            async move {
                // Only the first call loses its connection
                if counter.flaky_failures.fetch_add(1, Ordering::SeqCst) == 0 {
                    warn!("flakyRead: dropping connection");
                    current.connection.close_forcefully();
                }
                let value = counter.value.load(Ordering::SeqCst);
                Ok(Bytes::copy_from_slice(&value.to_le_bytes()))
            }
        })
        .build()
}

fn decode(mut reply: Bytes) -> Result<u64, RpcError> {
    if reply.remaining() < 8 {
        return Err(RpcError::Protocol(format!(
            "expected 8-byte counter, got {} bytes",
            reply.len()
        )));
    }
    Ok(reply.get_u64_le())
}

fn millis_arg(duration: Duration) -> Bytes {
    Bytes::copy_from_slice(&(duration.as_millis() as u64).to_le_bytes())
}

async fn start_server(
    server: &Communicator,
    args: &Args,
) -> Result<(ObjectAdapter, Endpoint, Arc<Counter>), RpcError> {
    let counter = Arc::new(Counter {
        value: AtomicU64::new(0),
        flaky_failures: AtomicU64::new(0),
    });
    let config = if args.serialize {
        AdapterConfig::serialized()
    } else {
        AdapterConfig::default()
    };

    let adapter = server.create_object_adapter_with_config("Counter", config)?;
    adapter.add("counter", create_servant(counter.clone()))?;
    let addr = adapter.listen(args.listen).await?;
    adapter.activate()?;
    info!("Counter adapter listening on {}", addr);

    Ok((adapter, Endpoint::tcp(addr), counter))
}

async fn run_hold(
    adapter: &ObjectAdapter,
    proxy: &Proxy,
    hold: Duration,
) -> Result<(), RpcError> {
    info!("--- hold scenario ---");
    let before = decode(proxy.invoke(INCREMENT, Bytes::new()).await?)?;
    info!("Counter is {}", before);

    adapter.hold()?;
    info!("Adapter {} is {}", adapter.name(), adapter.state());

    let start = Instant::now();
    let pending = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.invoke(INCREMENT, Bytes::new()).await })
    };

    tokio::time::sleep(hold).await;
    info!(
        "After {:?} the held request is {}",
        start.elapsed(),
        if pending.is_finished() { "done (unexpected)" } else { "still parked" }
    );

    adapter.activate()?;
    let after = decode(pending.await??)?;
    info!(
        "Activated; held request completed after {:?} with {}",
        start.elapsed(),
        after
    );
    Ok(())
}

async fn run_timeout(proxy: &Proxy, timeout: Duration) -> Result<(), RpcError> {
    info!("--- timeout scenario ---");
    let bounded = proxy.with_invocation_timeout(Some(timeout));
    let slow = timeout * 3;

    let start = Instant::now();
    match bounded.invoke(SLOW_READ, millis_arg(slow)).await {
        Err(RpcError::InvocationTimeout) => {
            info!("slowRead({:?}) timed out after {:?}", slow, start.elapsed());
        }
        Ok(_) => warn!("slowRead finished inside {:?}", timeout),
        Err(e) => return Err(e),
    }

    let quick = timeout / 4;
    let value = decode(bounded.invoke(SLOW_READ, millis_arg(quick)).await?)?;
    info!("slowRead({:?}) returned {} on the same connection", quick, value);
    Ok(())
}

async fn run_retry(client: &Communicator, proxy: &Proxy) -> Result<(), RpcError> {
    info!("--- retry scenario ---");
    let before = client.stats();
    let value = decode(proxy.invoke(FLAKY_READ, Bytes::new()).await?)?;
    let after = client.stats();
    info!(
        "flakyRead returned {} after {} retries",
        value,
        after.retries - before.retries
    );

    let read = decode(proxy.invoke(READ, Bytes::new()).await?)?;
    info!("read returned {}", read);
    Ok(())
}

async fn run(args: Args) -> Result<(), RpcError> {
    let server = Communicator::new(Config::default());
    let (adapter, endpoint, _counter) = start_server(&server, &args).await?;

    let client = Communicator::builder()
        .property("Rpc.RetryIntervals", args.retry_intervals.clone())
        .build()?;
    let proxy = client.proxy("counter", endpoint);

    let hold = Duration::from_millis(args.hold_ms);
    let timeout = Duration::from_millis(args.timeout_ms);

    if matches!(args.scenario, Scenario::All | Scenario::Hold) {
        run_hold(&adapter, &proxy, hold).await?;
    }
    if matches!(args.scenario, Scenario::All | Scenario::Timeout) {
        run_timeout(&proxy, timeout).await?;
    }
    if matches!(args.scenario, Scenario::All | Scenario::Retry) {
        run_retry(&client, &proxy).await?;
    }

    let stats = client.stats();
    info!(
        "Client stats: {} invocations, {} failures, {} retries",
        stats.invocations, stats.failures, stats.retries
    );

    client.destroy().await;
    server.destroy().await;
    info!("Done");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    run(args).await?;
    Ok(())
}
