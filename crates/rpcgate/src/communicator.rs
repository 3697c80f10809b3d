//! Communicator
//!
//! The context object every component hangs off. There is no process-wide
//! state: each communicator owns its configuration, retry policy, timeout
//! supervisor, connections and adapters, and several can coexist.

use crate::adapter::ObjectAdapter;
use crate::config::{AdapterConfig, Config, Properties};
use crate::connection::{CloseMode, Connection, ConnectionCache};
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::proxy::Proxy;
use crate::retry::{InvocationStatsSnapshot, RetryPolicy};
use crate::timeout::TimeoutSupervisor;
use crate::transport::{Connector, DefaultConnector, LocalRegistry};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

type ConnectorWrapper = Box<dyn FnOnce(Arc<dyn Connector>) -> Arc<dyn Connector> + Send>;

struct CommunicatorInner {
    config: Config,
    properties: Properties,
    policy: RetryPolicy,
    supervisor: TimeoutSupervisor,
    connections: ConnectionCache,
    connector: Arc<dyn Connector>,
    local: Arc<LocalRegistry>,
    adapters: Mutex<Vec<ObjectAdapter>>,
    destroyed: AtomicBool,
}

/// Cheaply cloneable handle to one communicator instance
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<CommunicatorInner>,
}

impl Communicator {
    pub fn new(config: Config) -> Self {
        Self::assemble(config, Properties::new(), None)
    }

    pub fn builder() -> CommunicatorBuilder {
        CommunicatorBuilder::default()
    }

    /// Build from properties; invalid values are rejected here
    pub fn from_properties(properties: Properties) -> Result<Self> {
        Self::builder().properties(properties).build()
    }

    fn assemble(config: Config, properties: Properties, wrap: Option<ConnectorWrapper>) -> Self {
        let local = Arc::new(LocalRegistry::new());
        let base: Arc<dyn Connector> = Arc::new(DefaultConnector::new(Arc::clone(&local)));
        let connector = match wrap {
            Some(wrap) => wrap(base),
            None => base,
        };

        debug!(
            "Communicator created: retry={:?}, timeouts={:?}",
            config.retry, config.timeouts
        );
        Self {
            inner: Arc::new(CommunicatorInner {
                policy: RetryPolicy::new(config.retry.clone()),
                supervisor: TimeoutSupervisor::new(config.timeouts.clone()),
                config,
                properties,
                connections: ConnectionCache::new(),
                connector,
                local,
                adapters: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn properties(&self) -> &Properties {
        &self.inner.properties
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn timeouts(&self) -> &TimeoutSupervisor {
        &self.inner.supervisor
    }

    /// Invocation counters
    pub fn stats(&self) -> InvocationStatsSnapshot {
        self.inner.policy.stats().snapshot()
    }

    pub fn proxy(&self, identity: &str, endpoint: Endpoint) -> Proxy {
        Proxy::new(self.clone(), identity, endpoint)
    }

    /// Create an adapter configured from `<name>.*` properties
    pub fn create_object_adapter(&self, name: &str) -> Result<ObjectAdapter> {
        let config = AdapterConfig::from_properties(name, &self.inner.properties)?;
        self.create_object_adapter_with_config(name, config)
    }

    /// Create an adapter in the Holding state; call `activate` to start it
    pub fn create_object_adapter_with_config(
        &self,
        name: &str,
        config: AdapterConfig,
    ) -> Result<ObjectAdapter> {
        if self.is_destroyed() {
            return Err(RpcError::CommunicatorDestroyed);
        }

        let mut adapters = self
            .inner
            .adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if adapters.iter().any(|a| a.name() == name) {
            return Err(RpcError::Config(format!(
                "object adapter {} already exists",
                name
            )));
        }

        let adapter = ObjectAdapter::new(
            name,
            config,
            Arc::clone(&self.inner.local),
            self.inner.config.max_frame_size,
        );
        adapters.push(adapter.clone());
        Ok(adapter)
    }

    pub(crate) async fn connection_to(&self, endpoint: &Endpoint) -> Result<Arc<Connection>> {
        if self.is_destroyed() {
            return Err(RpcError::CommunicatorDestroyed);
        }
        let inner = &self.inner;
        inner
            .connections
            .get_or_connect(endpoint, || {
                Connection::establish(
                    endpoint.clone(),
                    inner.connector.as_ref(),
                    &inner.supervisor,
                    inner.config.max_frame_size,
                )
            })
            .await
    }

    pub(crate) async fn cached_connection(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.inner.connections.cached(endpoint).await
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Deactivate every adapter and gracefully close every connection.
    /// Later invocations fail with `CommunicatorDestroyed`.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Destroying communicator");

        let adapters: Vec<ObjectAdapter> = self
            .inner
            .adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        futures::future::join_all(adapters.iter().map(|a| a.deactivate())).await;

        self.inner.connections.close_all(CloseMode::Gracefully).await;
        debug!("Communicator destroyed");
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("config", &self.inner.config)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Builder for [`Communicator`]
#[derive(Default)]
pub struct CommunicatorBuilder {
    properties: Properties,
    config: Option<Config>,
    wrap: Option<ConnectorWrapper>,
}

impl CommunicatorBuilder {
    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.set(key, value);
        self
    }

    /// Use `config` as is instead of parsing it from the properties
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Wrap the connector that opens byte streams
    pub fn wrap_connector<F>(mut self, wrap: F) -> Self
    where
        F: FnOnce(Arc<dyn Connector>) -> Arc<dyn Connector> + Send + 'static,
    {
        self.wrap = Some(Box::new(wrap));
        self
    }

    pub fn build(self) -> Result<Communicator> {
        let config = match self.config {
            Some(config) => config,
            None => Config::from_properties(&self.properties)?,
        };
        Ok(Communicator::assemble(config, self.properties, self.wrap))
    }
}
