//! Object adapter dispatch gate

use super::dispatch_queue::{DispatchMode, DispatchQueue};
use super::incoming::{self, AdapterStats, DispatchTask};
use super::servant::{Servant, ServantMap};
use crate::config::AdapterConfig;
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::transport::LocalRegistry;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Adapter state
///
/// `Holding` and `Active` alternate freely; `Deactivating` and `Deactivated`
/// are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Holding,
    Active,
    Deactivating,
    Deactivated,
}

impl AdapterState {
    /// Deactivating or Deactivated
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Deactivating | Self::Deactivated)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Holding => "holding",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Deactivated => "deactivated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AdapterStatus {
    state: AdapterState,
    /// Bumped by every hold, hold_for, activate and deactivate
    generation: u64,
    /// Number of times the adapter was seen Holding with nothing queued or running
    drained_holds: u64,
}

struct Gate {
    state: AdapterState,
    generation: u64,
    drained_holds: u64,
}

struct AdapterInner {
    name: Arc<str>,
    config: AdapterConfig,
    max_frame_size: usize,
    gate: Mutex<Gate>,
    status: watch::Sender<AdapterStatus>,
    queue: DispatchQueue<DispatchTask>,
    servants: Arc<ServantMap>,
    stats: Arc<AdapterStats>,
    shutdown: watch::Sender<bool>,
    local: Arc<LocalRegistry>,
    local_names: Mutex<Vec<String>>,
}

/// Server-side admission gate binding servants to listeners.
///
/// Admission decisions are taken under the adapter mutex, so no request can
/// enter the dispatch queue during a state transition. A request arriving while
/// the adapter holds is parked until it is activated (then admitted) or
/// deactivated (then failed with `AdapterUnavailable`).
#[derive(Clone)]
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

impl ObjectAdapter {
    /// Create an adapter in the Holding state
    pub(crate) fn new(
        name: &str,
        config: AdapterConfig,
        local: Arc<LocalRegistry>,
        max_frame_size: usize,
    ) -> Self {
        let mode = if config.serialize {
            DispatchMode::Serialized
        } else {
            DispatchMode::Concurrent(config.pool_size)
        };

        let inner = Arc::new_cyclic(|weak: &Weak<AdapterInner>| {
            let weak = weak.clone();
            let queue = DispatchQueue::with_idle_hook(mode, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.queue_drained();
                }
            });
            let (status, _) = watch::channel(AdapterStatus {
                state: AdapterState::Holding,
                generation: 0,
                drained_holds: 0,
            });
            let (shutdown, _) = watch::channel(false);

            AdapterInner {
                name: Arc::from(name),
                config,
                max_frame_size,
                gate: Mutex::new(Gate {
                    state: AdapterState::Holding,
                    generation: 0,
                    drained_holds: 0,
                }),
                status,
                queue,
                servants: Arc::new(ServantMap::default()),
                stats: Arc::new(AdapterStats::default()),
                shutdown,
                local,
                local_names: Mutex::new(Vec::new()),
            }
        });

        debug!("Created adapter {} ({:?})", name, mode);
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> AdapterState {
        self.inner.lock_gate().state
    }

    pub fn is_deactivated(&self) -> bool {
        self.state() == AdapterState::Deactivated
    }

    pub fn is_serialized(&self) -> bool {
        self.inner.config.serialize
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &Arc<AdapterStats> {
        &self.inner.stats
    }

    pub(crate) fn servants(&self) -> Arc<ServantMap> {
        Arc::clone(&self.inner.servants)
    }

    /// Register a servant under `identity`
    pub fn add(&self, identity: &str, servant: Servant) -> Result<()> {
        if self.state().is_shutting_down() {
            return Err(self.inner.unavailable());
        }
        if !self.inner.servants.insert(identity, Arc::new(servant)) {
            return Err(RpcError::Config(format!(
                "servant {} already registered with adapter {}",
                identity, self.inner.name
            )));
        }
        debug!("Adapter {}: added servant {}", self.inner.name, identity);
        Ok(())
    }

    pub fn remove(&self, identity: &str) -> Option<Arc<Servant>> {
        self.inner.servants.remove(identity)
    }

    pub fn find(&self, identity: &str) -> Option<Arc<Servant>> {
        self.inner.servants.find(identity)
    }

    /// Enter Active; requests parked by a hold resume
    pub fn activate(&self) -> Result<()> {
        let mut gate = self.inner.lock_gate();
        if gate.state.is_shutting_down() {
            return Err(self.inner.unavailable());
        }
        let previous = gate.state;
        gate.state = AdapterState::Active;
        gate.generation += 1;
        self.inner.publish(&gate);
        drop(gate);

        if previous != AdapterState::Active {
            debug!("Adapter {} active", self.inner.name);
        }
        Ok(())
    }

    /// Enter Holding; no new dispatch begins, admitted requests complete
    pub fn hold(&self) -> Result<()> {
        self.inner.enter_hold().map(|_| ())
    }

    /// Hold now and reactivate once the hold has drained and `duration` has
    /// elapsed. A later hold, activate or deactivate cancels the reactivation.
    pub fn hold_for(&self, duration: Duration) -> Result<()> {
        let (generation, drained_before) = self.inner.enter_hold()?;
        let mut status = self.inner.status.subscribe();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let drained = async move {
                status
                    .wait_for(|s| s.generation != generation || s.drained_holds > drained_before)
                    .await
                    .is_ok()
            };
            let ((), drained) = tokio::join!(tokio::time::sleep(duration), drained);
            if !drained {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.reactivate(generation);
            }
        });
        Ok(())
    }

    /// Wait until the adapter is Holding with nothing queued and nothing
    /// running. Fails with `AdapterUnavailable` if the adapter is deactivated
    /// first.
    pub async fn wait_for_hold(&self) -> Result<()> {
        let mut status = self.inner.status.subscribe();
        let start = {
            let gate = self.inner.lock_gate();
            match gate.state {
                state if state.is_shutting_down() => return Err(self.inner.unavailable()),
                AdapterState::Holding if self.inner.queue.is_idle() => return Ok(()),
                _ => gate.drained_holds,
            }
        };

        let seen = status
            .wait_for(|s| s.drained_holds > start || s.state.is_shutting_down())
            .await
            .map(|s| *s)
            .map_err(|_| self.inner.unavailable())?;

        if seen.drained_holds > start {
            Ok(())
        } else {
            Err(self.inner.unavailable())
        }
    }

    /// Deactivate the adapter.
    ///
    /// Requests not yet started are failed with `AdapterUnavailable`, listeners
    /// stop, and running dispatches drain before the adapter is Deactivated.
    /// Concurrent callers all return once deactivation is complete.
    pub async fn deactivate(&self) {
        let first = {
            let mut gate = self.inner.lock_gate();
            if gate.state.is_shutting_down() {
                false
            } else {
                gate.state = AdapterState::Deactivating;
                gate.generation += 1;
                self.inner.publish(&gate);
                true
            }
        };
        if !first {
            self.wait_for_deactivate().await;
            return;
        }

        info!("Deactivating adapter {}", self.inner.name);
        let not_started = self.inner.queue.close();
        if !not_started.is_empty() {
            debug!(
                "Adapter {}: failing {} queued requests",
                self.inner.name,
                not_started.len()
            );
        }
        for task in not_started {
            task.reject(self.inner.unavailable());
        }

        let _ = self.inner.shutdown.send(true);
        let names: Vec<String> = self
            .inner
            .local_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for name in names {
            self.inner.local.unregister(&name);
        }

        self.inner.queue.wait_idle().await;

        {
            let mut gate = self.inner.lock_gate();
            gate.state = AdapterState::Deactivated;
            self.inner.publish(&gate);
        }
        info!("Adapter {} deactivated", self.inner.name);
    }

    pub async fn wait_for_deactivate(&self) {
        let mut status = self.inner.status.subscribe();
        let _ = status
            .wait_for(|s| s.state == AdapterState::Deactivated)
            .await;
    }

    /// Accept TCP connections on `addr`; returns the bound address
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.state().is_shutting_down() {
            return Err(self.inner.unavailable());
        }
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Adapter {} listening on {} (max_connections: {})",
            self.inner.name, local_addr, self.inner.config.max_connections
        );

        tokio::spawn(incoming::run_tcp_listener(
            listener,
            self.clone(),
            self.inner.config.max_connections,
            self.inner.max_frame_size,
            self.inner.shutdown.subscribe(),
        ));
        Ok(local_addr)
    }

    /// Register a collocated endpoint reachable through this adapter's
    /// communicator
    pub fn add_local_endpoint(&self, name: &str) -> Result<Endpoint> {
        if self.state().is_shutting_down() {
            return Err(self.inner.unavailable());
        }
        let incoming = self.inner.local.register(name)?;
        self.inner
            .local_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());

        tokio::spawn(incoming::run_local_listener(
            name.to_string(),
            incoming,
            self.clone(),
            self.inner.config.max_connections,
            self.inner.max_frame_size,
            self.inner.shutdown.subscribe(),
        ));
        info!("Adapter {} listening on local://{}", self.inner.name, name);
        Ok(Endpoint::local(name))
    }

    /// Wait until the adapter is Active; fails once it is shutting down
    pub(crate) async fn wait_until_active(&self) -> Result<()> {
        let mut status = self.inner.status.subscribe();
        let state = status
            .wait_for(|s| s.state != AdapterState::Holding)
            .await
            .map(|s| s.state)
            .map_err(|_| self.inner.unavailable())?;
        match state {
            AdapterState::Active => Ok(()),
            _ => Err(self.inner.unavailable()),
        }
    }

    /// Admit a request to the dispatch queue, parking while Holding
    pub(crate) async fn admit(&self, task: DispatchTask) {
        let mut status = self.inner.status.subscribe();
        loop {
            {
                let gate = self.inner.lock_gate();
                match gate.state {
                    AdapterState::Active => {
                        if let Err(task) = self.inner.queue.push(task) {
                            drop(gate);
                            task.reject(self.inner.unavailable());
                        }
                        return;
                    }
                    AdapterState::Holding => {}
                    AdapterState::Deactivating | AdapterState::Deactivated => {
                        drop(gate);
                        task.reject(self.inner.unavailable());
                        return;
                    }
                }
            }

            trace!("Adapter {} holding, request parked", self.inner.name);
            if status
                .wait_for(|s| s.state != AdapterState::Holding)
                .await
                .is_err()
            {
                task.reject(self.inner.unavailable());
                return;
            }
        }
    }
}

impl fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("serialize", &self.inner.config.serialize)
            .finish()
    }
}

impl AdapterInner {
    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, gate: &Gate) {
        self.status.send_replace(AdapterStatus {
            state: gate.state,
            generation: gate.generation,
            drained_holds: gate.drained_holds,
        });
    }

    fn unavailable(&self) -> RpcError {
        RpcError::AdapterUnavailable(self.name.to_string())
    }

    /// Returns the new hold generation and the drained-hold count before it
    fn enter_hold(&self) -> Result<(u64, u64)> {
        let mut gate = self.lock_gate();
        if gate.state.is_shutting_down() {
            return Err(self.unavailable());
        }
        let drained_before = gate.drained_holds;
        let previous = gate.state;
        gate.state = AdapterState::Holding;
        gate.generation += 1;
        if self.queue.is_idle() {
            gate.drained_holds += 1;
        }
        self.publish(&gate);
        let generation = gate.generation;
        drop(gate);

        if previous != AdapterState::Holding {
            debug!("Adapter {} holding", self.name);
        }
        Ok((generation, drained_before))
    }

    /// Called by the dispatch queue each time it becomes idle
    fn queue_drained(&self) {
        let mut gate = self.lock_gate();
        if gate.state == AdapterState::Holding && self.queue.is_idle() {
            gate.drained_holds += 1;
            self.publish(&gate);
            trace!("Adapter {} hold drained", self.name);
        }
    }

    fn reactivate(&self, generation: u64) {
        let mut gate = self.lock_gate();
        if gate.generation != generation || gate.state != AdapterState::Holding {
            trace!("Adapter {}: timed reactivation superseded", self.name);
            return;
        }
        gate.state = AdapterState::Active;
        gate.generation += 1;
        self.publish(&gate);
        drop(gate);
        debug!("Adapter {} reactivated after timed hold", self.name);
    }
}
