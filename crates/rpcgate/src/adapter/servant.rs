//! Servants
//!
//! A servant is a dispatch table from operation name to handler closure.

use super::incoming::ConnectionControl;
use crate::error::{Result, RpcError};
use crate::frame::{Context, OperationMode};
use bytes::Bytes;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

/// Operation handler function type
pub type OperationHandler =
    Arc<dyn Fn(Current, Bytes) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send>> + Send + Sync>;

/// Information about the request being dispatched
#[derive(Debug, Clone)]
pub struct Current {
    pub adapter: String,
    pub identity: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    /// Zero for oneway requests
    pub request_id: u32,
    pub connection: ConnectionControl,
}

/// Server-side object implementing a set of operations
pub struct Servant {
    operations: HashMap<String, OperationHandler>,
}

impl Servant {
    pub fn builder() -> ServantBuilder {
        ServantBuilder {
            servant: Servant {
                operations: HashMap::new(),
            },
        }
    }

    /// Register an operation handler
    pub fn register_operation<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Current, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.operations.insert(
            name.to_string(),
            Arc::new(move |current, args| Box::pin(handler(current, args))),
        );
    }

    pub fn get_operation(&self, name: &str) -> Option<&OperationHandler> {
        self.operations.get(name)
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    /// Run the handler for `current.operation`.
    ///
    /// Servant failures other than [`RpcError::Application`] are reported as
    /// [`RpcError::Unknown`]; so is a panicking handler.
    pub async fn dispatch(&self, current: Current, args: Bytes) -> Result<Bytes> {
        let Some(handler) = self.get_operation(&current.operation) else {
            return Err(RpcError::OperationNotExist {
                identity: current.identity,
                operation: current.operation,
            });
        };

        let operation = current.operation.clone();
        match AssertUnwindSafe(handler(current, args)).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(RpcError::Application(payload))) => Err(RpcError::Application(payload)),
            Ok(Err(e)) => Err(RpcError::Unknown(e.to_string())),
            Err(_) => {
                warn!("Operation {} panicked", operation);
                Err(RpcError::Unknown(format!("operation {} panicked", operation)))
            }
        }
    }
}

/// Servants of one adapter, by identity
#[derive(Default)]
pub(crate) struct ServantMap {
    servants: RwLock<HashMap<String, Arc<Servant>>>,
}

impl ServantMap {
    /// Insert unless the identity is taken; false if it was
    pub(crate) fn insert(&self, identity: &str, servant: Arc<Servant>) -> bool {
        let mut servants = self.servants.write().unwrap_or_else(PoisonError::into_inner);
        if servants.contains_key(identity) {
            return false;
        }
        servants.insert(identity.to_string(), servant);
        true
    }

    pub(crate) fn remove(&self, identity: &str) -> Option<Arc<Servant>> {
        self.servants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
    }

    pub(crate) fn find(&self, identity: &str) -> Option<Arc<Servant>> {
        self.servants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }
}

/// Builder for servants with a fluent API
pub struct ServantBuilder {
    servant: Servant,
}

impl ServantBuilder {
    pub fn operation<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Current, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.servant.register_operation(name, handler);
        self
    }

    pub fn build(self) -> Servant {
        self.servant
    }
}
