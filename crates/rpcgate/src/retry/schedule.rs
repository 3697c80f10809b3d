//! Retry schedule

use crate::error::{Result, RpcError};
use std::time::Duration;

/// Ordered retry delays, or retries disabled
///
/// The schedule is fixed when the communicator is built. With `n` intervals an
/// invocation makes at most `n + 1` attempts; the delay before retry `i`
/// (zero-based) is `intervals[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrySchedule {
    /// Every failure is final on first occurrence
    Disabled,
    Intervals(Vec<Duration>),
}

impl Default for RetrySchedule {
    /// One immediate retry
    fn default() -> Self {
        Self::Intervals(vec![Duration::ZERO])
    }
}

impl RetrySchedule {
    /// Sentinel value that disables retries
    pub const DISABLED_SENTINEL: i64 = -1;

    pub fn from_millis(delays: &[u64]) -> Self {
        Self::Intervals(delays.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    /// Parse a whitespace or comma separated list of millisecond delays.
    ///
    /// The single value `-1` disables retries. An empty list means "no retries"
    /// while still allowing the first attempt.
    pub fn parse(raw: &str) -> Result<Self> {
        let values = raw
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<i64>()
                    .map_err(|_| RpcError::Config(format!("retry interval not an integer: {:?}", s)))
            })
            .collect::<Result<Vec<_>>>()?;

        if values.len() == 1 && values[0] == Self::DISABLED_SENTINEL {
            return Ok(Self::Disabled);
        }

        let mut intervals = Vec::with_capacity(values.len());
        for value in values {
            if value < 0 {
                return Err(RpcError::Config(format!(
                    "negative retry interval {} (only a lone -1 is allowed)",
                    value
                )));
            }
            intervals.push(Duration::from_millis(value as u64));
        }
        Ok(Self::Intervals(intervals))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    /// Maximum number of retries after the first attempt
    pub fn max_retries(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Intervals(intervals) => intervals.len(),
        }
    }

    /// Maximum number of attempts, including the first
    pub fn max_attempts(&self) -> usize {
        self.max_retries() + 1
    }

    /// Delay before the retry that follows failed attempt `attempt` (zero-based)
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Intervals(intervals) => intervals.get(attempt).copied(),
        }
    }
}
