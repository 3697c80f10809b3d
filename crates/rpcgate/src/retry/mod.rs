//! Retry classification
//!
//! A failed attempt is classified by [`RetryPolicy::evaluate`] into either a
//! retry after a scheduled delay or a terminal failure:
//! - failures known to precede transmission are always retry-eligible
//! - failures after transmission are retried only for idempotent operations
//! - application failures, adapter-unavailable and invocation timeouts are never retried
//! - the schedule bounds the number of retries, or disables them entirely

mod policy;
mod schedule;
mod stats;

pub use policy::{RetryDecision, RetryPolicy, SendPhase};
pub use schedule::RetrySchedule;
pub use stats::{InvocationStats, InvocationStatsSnapshot};
