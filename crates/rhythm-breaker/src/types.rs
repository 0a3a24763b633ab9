use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Breaker classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    /// Normal operation; invocations pass through.
    Closed,
    /// Failing fast until `next_retry_time`.
    Open,
    /// One trial invocation decides between Closed and Open.
    HalfOpen,
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Per-component breaker state.
///
/// Callers only ever see owned copies via `CircuitBreakers::snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerState {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Always `Some` while `Open`.
    pub next_retry_time: Option<DateTime<Utc>>,
    /// When the breaker last moved to `Open`.
    pub opened_at: Option<DateTime<Utc>>,
    /// A half-open trial has been handed out and has not reported back.
    pub trial_in_flight: bool,
}

impl CircuitBreakerState {
    pub(crate) fn closed() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            next_retry_time: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::closed()
    }
}
