//! Proxies
//!
//! A [`Proxy`] is the client-side handle to a remote object. Every call goes
//! through the same loop: get (or establish) the connection under the connect
//! timeout, send, wait for the reply under the invocation timeout, and on
//! failure ask the retry policy whether to try again. The caller always sees
//! the last concrete failure, never a wrapper.

use crate::communicator::Communicator;
use crate::connection::{CloseMode, Connection, PendingReply, SendFailure};
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::frame::{Context, OperationMode, RequestFrame};
use crate::retry::RetryDecision;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Operation descriptor; idempotency is part of the interface, not the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    name: &'static str,
    idempotent: bool,
}

impl Operation {
    pub const fn normal(name: &'static str) -> Self {
        Self {
            name,
            idempotent: false,
        }
    }

    pub const fn idempotent(name: &'static str) -> Self {
        Self {
            name,
            idempotent: true,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    fn mode(&self) -> OperationMode {
        if self.idempotent {
            OperationMode::Idempotent
        } else {
            OperationMode::Normal
        }
    }
}

/// Client-side handle to a remote object
#[derive(Clone)]
pub struct Proxy {
    communicator: Communicator,
    identity: Arc<str>,
    endpoint: Endpoint,
    /// `None`: communicator default; `Some(None)`: no timeout
    invocation_timeout: Option<Option<Duration>>,
}

impl Proxy {
    pub(crate) fn new(communicator: Communicator, identity: &str, endpoint: Endpoint) -> Self {
        Self {
            communicator,
            identity: Arc::from(identity),
            endpoint,
            invocation_timeout: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    /// A copy of this proxy with its own invocation timeout; `None` waits
    /// forever. A configured override still wins.
    pub fn with_invocation_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            invocation_timeout: Some(timeout),
            ..self.clone()
        }
    }

    /// The invocation timeout calls through this proxy actually get
    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.communicator
            .timeouts()
            .invocation_timeout(self.invocation_timeout)
    }

    /// Twoway invocation
    pub async fn invoke(&self, operation: Operation, args: Bytes) -> Result<Bytes> {
        self.invoke_with_context(operation, args, Context::new())
            .await
    }

    pub async fn invoke_with_context(
        &self,
        operation: Operation,
        args: Bytes,
        context: Context,
    ) -> Result<Bytes> {
        let mut invocation = Invocation::new(self.clone(), operation, args, context);
        let pending = invocation.send().await?;
        invocation.finish(pending).await
    }

    /// Send a twoway request and return a handle to its eventual result.
    ///
    /// Returns once the request has been written (or has failed), so requests
    /// started in sequence on one proxy are sent in that order.
    pub async fn begin_invoke(&self, operation: Operation, args: Bytes) -> InvocationHandle {
        let mut invocation = Invocation::new(self.clone(), operation, args, Context::new());
        let task = match invocation.send().await {
            Ok(pending) => tokio::spawn(invocation.finish(pending)),
            Err(e) => tokio::spawn(async move { Err(e) }),
        };
        InvocationHandle { task }
    }

    /// Oneway invocation; returns once the request has been written
    pub async fn invoke_oneway(&self, operation: Operation, args: Bytes) -> Result<()> {
        let mut invocation = Invocation::new(self.clone(), operation, args, Context::new());
        invocation.send_oneway().await
    }

    /// The open connection for this proxy's endpoint, established if needed
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        self.communicator.connection_to(&self.endpoint).await
    }

    /// Close the cached connection for this proxy's endpoint, if any
    pub async fn close_connection(&self, mode: CloseMode) -> Result<()> {
        match self.communicator.cached_connection(&self.endpoint).await {
            Some(connection) => connection.close(mode).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.endpoint)
    }
}

/// Result of [`Proxy::begin_invoke`]
pub struct InvocationHandle {
    task: JoinHandle<Result<Bytes>>,
}

impl InvocationHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for InvocationHandle {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(RpcError::from(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One logical call across all of its attempts
struct Invocation {
    proxy: Proxy,
    operation: Operation,
    args: Bytes,
    context: Context,
    timeout: Option<Duration>,
    attempt: usize,
}

impl Invocation {
    fn new(proxy: Proxy, operation: Operation, args: Bytes, context: Context) -> Self {
        proxy.communicator.retry_policy().record_invocation();
        let timeout = proxy.invocation_timeout();
        Self {
            proxy,
            operation,
            args,
            context,
            timeout,
            attempt: 0,
        }
    }

    fn request(&self) -> RequestFrame {
        RequestFrame {
            request_id: 0,
            identity: self.proxy.identity.to_string(),
            operation: self.operation.name.to_string(),
            mode: self.operation.mode(),
            context: self.context.clone(),
            args: self.args.clone(),
        }
    }

    async fn connection(&self) -> std::result::Result<Arc<Connection>, SendFailure> {
        self.proxy
            .communicator
            .connection_to(&self.proxy.endpoint)
            .await
            .map_err(SendFailure::before_send)
    }

    /// Send the request, retrying failures the policy allows
    async fn send(&mut self) -> Result<PendingReply> {
        loop {
            let sent = match self.connection().await {
                Ok(connection) => connection.send_request(self.request()).await,
                Err(failure) => Err(failure),
            };
            match sent {
                Ok(pending) => return Ok(pending),
                Err(failure) => self.retry_or_fail(failure).await?,
            }
        }
    }

    async fn send_oneway(&mut self) -> Result<()> {
        loop {
            let sent = match self.connection().await {
                Ok(connection) => connection.send_oneway(self.request()).await,
                Err(failure) => Err(failure),
            };
            match sent {
                Ok(()) => return Ok(()),
                Err(failure) => self.retry_or_fail(failure).await?,
            }
        }
    }

    /// Wait for the reply, resending while the policy allows
    async fn finish(mut self, mut pending: PendingReply) -> Result<Bytes> {
        loop {
            let supervisor = self.proxy.communicator.timeouts();
            match supervisor.await_reply(pending, self.timeout).await {
                Ok(reply) => return Ok(reply),
                Err(error) => {
                    self.retry_or_fail(SendFailure::after_send(error)).await?;
                    pending = self.send().await?;
                }
            }
        }
    }

    /// Sleep and count the attempt if the failure may be retried, otherwise
    /// hand the failure back
    async fn retry_or_fail(&mut self, failure: SendFailure) -> Result<()> {
        let policy = self.proxy.communicator.retry_policy();
        let decision = policy.evaluate_error(
            &failure.error,
            failure.phase,
            self.operation.idempotent,
            self.attempt,
        );

        match decision {
            RetryDecision::Retry(delay) => {
                debug!(
                    "Retrying {} on {} in {:?} (attempt {}): {}",
                    self.operation.name,
                    self.proxy,
                    delay,
                    self.attempt + 2,
                    failure.error
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.attempt += 1;
                Ok(())
            }
            RetryDecision::Fail => Err(failure.error),
        }
    }
}
