//! One connection per endpoint, created lazily

use super::{CloseMode, Connection, ConnectionState};
use crate::endpoint::Endpoint;
use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

type Slot = Arc<tokio::sync::Mutex<Option<Arc<Connection>>>>;

/// Connection cache keyed by endpoint.
///
/// Concurrent callers for the same endpoint share one establishment; a cached
/// connection that is no longer Open is replaced on the next lookup. A slot
/// left empty by a failed establishment is dropped unless another caller is
/// waiting on it.
#[derive(Default)]
pub struct ConnectionCache {
    slots: Mutex<HashMap<Endpoint, Slot>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, endpoint: &Endpoint) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(endpoint.clone()).or_default().clone()
    }

    /// Return the open connection to `endpoint`, establishing one with
    /// `establish` if there is none
    pub async fn get_or_connect<F, Fut>(
        &self,
        endpoint: &Endpoint,
        establish: F,
    ) -> Result<Arc<Connection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Connection>>>,
    {
        let slot = self.slot(endpoint);
        let mut cached = slot.lock().await;

        if let Some(connection) = cached.as_ref() {
            if connection.is_open() {
                return Ok(Arc::clone(connection));
            }
            debug!(
                "Replacing {} connection to {}",
                connection.state(),
                endpoint
            );
        }

        match establish().await {
            Ok(connection) => {
                *cached = Some(Arc::clone(&connection));
                Ok(connection)
            }
            Err(e) => {
                drop(cached);
                self.forget_unused(endpoint, &slot);
                Err(e)
            }
        }
    }

    fn forget_unused(&self, endpoint: &Endpoint, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = slots.get(endpoint) else {
            return;
        };
        // Slots are only cloned under this lock: the map and `slot` are the
        // sole owners when the count is 2
        if !Arc::ptr_eq(current, slot) || Arc::strong_count(slot) != 2 {
            return;
        }
        let reusable = match slot.try_lock() {
            Ok(cached) => cached
                .as_ref()
                .is_some_and(|c| c.state() != ConnectionState::Closed),
            Err(_) => true,
        };
        if !reusable {
            slots.remove(endpoint);
            debug!("Dropped connection slot for {}", endpoint);
        }
    }

    /// The cached connection to `endpoint`, whatever its state
    pub async fn cached(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.get(endpoint).cloned()
        }?;
        let cached = slot.lock().await;
        cached.clone()
    }

    /// Close every cached connection and empty the cache
    pub async fn close_all(&self, mode: CloseMode) {
        let slots: Vec<Slot> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.drain().map(|(_, slot)| slot).collect()
        };

        let closes = slots.into_iter().map(|slot| async move {
            let connection = slot.lock().await.take();
            if let Some(connection) = connection {
                if let Err(e) = connection.close(mode).await {
                    debug!("Close of {} failed: {}", connection.endpoint(), e);
                }
            }
        });
        futures::future::join_all(closes).await;
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
