//! Invocation reliability layer for request/response RPC
//!
//! This crate decides, for every remote call, whether a failure may be retried,
//! how long a call or connection may stay pending, and whether a server-side
//! adapter is currently willing to accept work.
//!
//! # Features
//!
//! - Retry schedule and policy distinguishing pre-send from post-send failures
//! - Independent connect, invocation and close timeouts with global overrides
//! - Race-free invocation timeout: a late reply is fenced, never misdelivered
//! - Object adapters with hold / activate / deactivate admission control
//! - Serialized (FIFO) or concurrent dispatch per adapter
//! - TCP and collocated (in-process) endpoints
//! - Explicit [`Communicator`] context object; no global state
//!
//! # Example
//!
//! ```no_run
//! use rpcgate::{Communicator, Config, Operation, Servant};
//! use bytes::Bytes;
//!
//! const ECHO: Operation = Operation::idempotent("echo");
//!
//! #[tokio::main]
//! async fn main() -> rpcgate::Result<()> {
//!     let communicator = Communicator::new(Config::default());
//!
//!     let adapter = communicator.create_object_adapter("Echo")?;
//!     adapter.add(
//!         "echo",
//!         Servant::builder()
//!             .operation("echo", |_current, args| async move { Ok(args) })
//!             .build(),
//!     )?;
//!     let endpoint = adapter.listen("127.0.0.1:0".parse().unwrap()).await?;
//!     adapter.activate()?;
//!
//!     let proxy = communicator.proxy("echo", endpoint.into());
//!     let reply = proxy.invoke(ECHO, Bytes::from_static(b"hello")).await?;
//!     assert_eq!(reply, Bytes::from_static(b"hello"));
//!
//!     communicator.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod proxy;
pub mod retry;
pub mod timeout;
pub mod transport;

pub use adapter::{
    AdapterState, AdapterStats, AdapterStatsSnapshot, ConnectionControl, Current, ObjectAdapter,
    Servant, ServantBuilder,
};
pub use communicator::{Communicator, CommunicatorBuilder};
pub use config::{AdapterConfig, Config, Properties};
pub use connection::{CloseMode, Connection, ConnectionState};
pub use endpoint::Endpoint;
pub use error::{ErrorCategory, FailureKind, Result, RpcError};
pub use frame::Context;
pub use proxy::{InvocationHandle, Operation, Proxy};
pub use retry::{
    InvocationStats, InvocationStatsSnapshot, RetryDecision, RetryPolicy, RetrySchedule,
    SendPhase,
};
pub use timeout::{TimeoutSettings, TimeoutSupervisor};
pub use transport::{BoxedStream, ByteStream, Connector, DefaultConnector};
