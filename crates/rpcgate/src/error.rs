//! Error types for invocations, connections and adapters

use bytes::Bytes;
use thiserror::Error;

/// RPC error types
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("invocation timeout")]
    InvocationTimeout,

    #[error("close timeout")]
    CloseTimeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("cannot encode frame: {0}")]
    Encoding(String),

    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("object does not exist: {0}")]
    ObjectNotExist(String),

    #[error("operation does not exist: {identity}::{operation}")]
    OperationNotExist { identity: String, operation: String },

    #[error("application failure ({} bytes)", .0.len())]
    Application(Bytes),

    #[error("unknown failure: {0}")]
    Unknown(String),

    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Coarse classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient communication fault; the retry policy decides
    Retryable,
    /// Communication fault that must reach the caller unchanged
    TerminalCommunication,
    /// Failure raised by the servant itself
    TerminalApplication,
    /// Misuse of the API or invalid configuration
    ProgrammerError,
}

/// Failure kind as seen by [`RetryPolicy`](crate::retry::RetryPolicy)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection establishment, loss or framing failure
    Transport,
    ConnectTimeout,
    InvocationTimeout,
    CloseTimeout,
    AdapterUnavailable,
    /// Servant-raised failure, never retried here
    Application,
    /// Anything else that must not be retried
    Terminal,
}

impl RpcError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_)
            | Self::ConnectFailed(_)
            | Self::ConnectTimeout
            | Self::CloseTimeout
            | Self::ConnectionLost(_)
            | Self::Protocol(_) => ErrorCategory::Retryable,
            Self::InvocationTimeout
            | Self::FrameTooLarge { .. }
            | Self::AdapterUnavailable(_)
            | Self::ObjectNotExist(_)
            | Self::OperationNotExist { .. }
            | Self::Unknown(_) => ErrorCategory::TerminalCommunication,
            Self::Application(_) => ErrorCategory::TerminalApplication,
            Self::Encoding(_)
            | Self::CommunicatorDestroyed
            | Self::Config(_)
            | Self::JoinError(_) => ErrorCategory::ProgrammerError,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Io(_)
            | Self::ConnectFailed(_)
            | Self::ConnectionLost(_)
            | Self::Protocol(_) => FailureKind::Transport,
            Self::ConnectTimeout => FailureKind::ConnectTimeout,
            Self::InvocationTimeout => FailureKind::InvocationTimeout,
            Self::CloseTimeout => FailureKind::CloseTimeout,
            Self::AdapterUnavailable(_) => FailureKind::AdapterUnavailable,
            Self::Application(_) => FailureKind::Application,
            _ => FailureKind::Terminal,
        }
    }

    /// Whether this failure is a timeout of any of the three deadline domains
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout | Self::InvocationTimeout | Self::CloseTimeout
        )
    }
}
