//! Invocation counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic invocation counters, owned by one communicator
#[derive(Debug, Default)]
pub struct InvocationStats {
    pub invocations: AtomicU64,
    pub failures: AtomicU64,
    pub retries: AtomicU64,
}

impl InvocationStats {
    pub fn snapshot(&self) -> InvocationStatsSnapshot {
        InvocationStatsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of invocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationStatsSnapshot {
    pub invocations: u64,
    pub failures: u64,
    pub retries: u64,
}
