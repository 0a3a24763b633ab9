use std::fmt;

use chrono::{DateTime, Utc};
use rhythm_breaker::BreakerStatus;
use rhythm_core::JobClass;
use serde::Serialize;

/// Aggregate health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Result of the datastore probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub ok: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Breaker view included in a report.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub class: JobClass,
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub next_retry_time: Option<DateTime<Utc>>,
}

/// Outcome of one health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub datastore: ProbeReport,
    pub breakers: Vec<BreakerHealth>,
    /// Breakers moved Open → HalfOpen by this check.
    pub forced_half_open: Vec<JobClass>,
    /// All breakers were forced open because the datastore is unreachable.
    pub forced_open: bool,
    /// `None` when the DLQ could not be read.
    pub dlq_pending: Option<u64>,
    pub dlq_dropped: u64,
    /// Dead letters held in memory because the store rejected the insert.
    pub dlq_unpersisted: usize,
    pub dlq_write_failures: u64,
    pub recent_errors: usize,
    pub errors_dropped: u64,
    /// Human-readable reasons for `Degraded`; empty when healthy.
    pub reasons: Vec<String>,
}
