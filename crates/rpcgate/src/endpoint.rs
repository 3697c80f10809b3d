//! Endpoints
//!
//! An endpoint names where a connection is established. Endpoints are built
//! programmatically; there is no endpoint string syntax.

use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP listener address
    Tcp(SocketAddr),
    /// In-process endpoint registered by an adapter of the same communicator
    Local(String),
}

impl Endpoint {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self::Local(name.into())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
            Self::Local(name) => write!(f, "local://{}", name),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}
