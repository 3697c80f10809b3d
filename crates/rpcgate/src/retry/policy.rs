//! Retry policy

use super::schedule::RetrySchedule;
use super::stats::InvocationStats;
use crate::error::{FailureKind, RpcError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Whether a failure is known to have happened before the request was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    /// No byte of the request reached the transport
    BeforeSend,
    /// The request may have reached the server
    AfterSend,
}

/// Outcome of classifying a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Start the next attempt no earlier than this delay from now
    Retry(Duration),
    /// Report the failure to the caller
    Fail,
}

/// Classifies failed attempts against the communicator's retry schedule
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    schedule: RetrySchedule,
    stats: Arc<InvocationStats>,
}

impl RetryPolicy {
    pub fn new(schedule: RetrySchedule) -> Self {
        Self {
            schedule,
            stats: Arc::new(InvocationStats::default()),
        }
    }

    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    pub fn stats(&self) -> &Arc<InvocationStats> {
        &self.stats
    }

    /// Count one logical invocation
    pub fn record_invocation(&self) {
        self.stats.invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Classify failed attempt `attempt` (zero-based)
    pub fn evaluate(
        &self,
        kind: FailureKind,
        phase: SendPhase,
        idempotent: bool,
        attempt: usize,
    ) -> RetryDecision {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);

        let decision = classify(kind, phase, idempotent, attempt, &self.schedule);
        if let RetryDecision::Retry(_) = decision {
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
        }

        trace!(
            "Retry evaluation: kind={:?}, phase={:?}, idempotent={}, attempt={} -> {:?}",
            kind,
            phase,
            idempotent,
            attempt,
            decision
        );
        decision
    }

    /// Classify an error value, using its failure kind
    pub fn evaluate_error(
        &self,
        error: &RpcError,
        phase: SendPhase,
        idempotent: bool,
        attempt: usize,
    ) -> RetryDecision {
        self.evaluate(error.failure_kind(), phase, idempotent, attempt)
    }
}

/// Pure classification, no counters
fn classify(
    kind: FailureKind,
    phase: SendPhase,
    idempotent: bool,
    attempt: usize,
    schedule: &RetrySchedule,
) -> RetryDecision {
    if schedule.is_disabled() {
        return RetryDecision::Fail;
    }

    let phase = match kind {
        FailureKind::Application
        | FailureKind::AdapterUnavailable
        | FailureKind::InvocationTimeout
        | FailureKind::Terminal => return RetryDecision::Fail,
        FailureKind::ConnectTimeout => SendPhase::BeforeSend,
        FailureKind::Transport | FailureKind::CloseTimeout => phase,
    };

    let Some(delay) = schedule.delay(attempt) else {
        return RetryDecision::Fail;
    };

    match phase {
        SendPhase::BeforeSend => RetryDecision::Retry(delay),
        SendPhase::AfterSend if idempotent => RetryDecision::Retry(delay),
        SendPhase::AfterSend => RetryDecision::Fail,
    }
}
