//! Timeout supervision
//!
//! Three independent deadline domains bound the life of an invocation:
//!
//! - **connect**: establishing a connection (stream open + validation)
//! - **invocation**: one attempt's wait for its reply
//! - **close**: a graceful close handshake
//!
//! Each domain has a communicator-wide default and an optional override that
//! wins over every per-proxy or per-call setting. All deadlines run on tokio
//! timers; no I/O task ever blocks on one.

use crate::config::{DEFAULT_CLOSE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
use crate::connection::PendingReply;
use crate::error::{Result, RpcError};
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tracing::{trace, warn};

/// Timeout configuration; `None` means "no timeout"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub connect: Option<Duration>,
    pub close: Option<Duration>,
    /// Default invocation timeout of proxies that do not set their own
    pub invocation: Option<Duration>,
    /// When set, forces the connect domain
    pub override_connect: Option<Option<Duration>>,
    /// When set, forces the close domain
    pub override_close: Option<Option<Duration>>,
    /// When set, forces the invocation domain over any proxy setting
    pub override_invocation: Option<Option<Duration>>,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect: Some(DEFAULT_CONNECT_TIMEOUT),
            close: Some(DEFAULT_CLOSE_TIMEOUT),
            invocation: None,
            override_connect: None,
            override_close: None,
            override_invocation: None,
        }
    }
}

/// Resolves and enforces the three deadline domains
#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    settings: TimeoutSettings,
}

impl TimeoutSupervisor {
    pub fn new(settings: TimeoutSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TimeoutSettings {
        &self.settings
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.settings
            .override_connect
            .unwrap_or(self.settings.connect)
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        self.settings.override_close.unwrap_or(self.settings.close)
    }

    /// Effective invocation timeout: override, then the proxy's own setting,
    /// then the communicator default
    pub fn invocation_timeout(&self, proxy: Option<Option<Duration>>) -> Option<Duration> {
        self.settings
            .override_invocation
            .or(proxy)
            .unwrap_or(self.settings.invocation)
    }

    /// Run connection establishment under the connect deadline
    pub async fn bound_connect<T, F>(&self, establish: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.connect_timeout() {
            None => establish.await,
            Some(limit) => match tokio::time::timeout(limit, establish).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Connect timed out after {:?}", limit);
                    Err(RpcError::ConnectTimeout)
                }
            },
        }
    }

    /// Run a graceful close handshake under the close deadline.
    ///
    /// On expiry the handshake future is dropped and `CloseTimeout` returned;
    /// the caller is responsible for forcing the connection closed.
    pub async fn bound_close<T, F>(&self, handshake: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bound_close_with(self.close_timeout(), handshake).await
    }

    /// Wait for a reply under `timeout`.
    ///
    /// On expiry the reply slot is fenced before the timeout is reported. If
    /// the reply won the race and was already delivered into the slot, it is
    /// returned instead, so each reply resolves exactly once.
    pub async fn await_reply(
        &self,
        mut pending: PendingReply,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let Some(limit) = timeout else {
            return pending.wait().await;
        };

        match tokio::time::timeout(limit, pending.recv()).await {
            Ok(result) => result,
            Err(_) => {
                if pending.fence() {
                    warn!(
                        "Invocation timed out after {:?}: request_id={}",
                        limit,
                        pending.request_id()
                    );
                    Err(RpcError::InvocationTimeout)
                } else {
                    trace!(
                        "Reply raced the deadline and was accepted: request_id={}",
                        pending.request_id()
                    );
                    pending.take_delivered()
                }
            }
        }
    }
}

impl Default for TimeoutSupervisor {
    fn default() -> Self {
        Self::new(TimeoutSettings::default())
    }
}

pub(crate) async fn bound_close_with<T, F>(limit: Option<Duration>, handshake: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        None => handshake.await,
        Some(limit) => match tokio::time::timeout(limit, handshake).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Graceful close timed out after {:?}", limit);
                Err(RpcError::CloseTimeout)
            }
        },
    }
}
