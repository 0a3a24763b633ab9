use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rhythm_breaker::CircuitBreakerState;
use rhythm_core::{JobClass, Outcome};
use rhythm_dlq::DlqStatus;
use rhythm_health::{HealthReport, HealthStatus};
use serde::Serialize;
use tokio::task::JoinHandle;

/// Orchestrator lifecycle.  Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why a due class was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The previous invocation of this class has not finished.
    InFlight,
    /// The class's breaker rejected the call.
    BreakerOpen,
    /// No enabled job spec for this class.
    NotConfigured,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InFlight => write!(f, "in_flight"),
            Self::BreakerOpen => write!(f, "breaker_open"),
            Self::NotConfigured => write!(f, "not_configured"),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Due classes not yet fired in this minute slot, in dispatch order.
    pub due: Vec<JobClass>,
    pub dispatched: Vec<JobClass>,
    pub skipped: Vec<(JobClass, SkipReason)>,
    /// Handles of the runs dispatched by this tick.
    pub runs: Vec<JoinHandle<Outcome>>,
}

/// Result of replaying one dead letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ReplayResult {
    Resolved,
    /// Still failing; the entry is now in `status`.
    Failed { status: DlqStatus },
    /// Entry was already resolved; nothing ran.
    AlreadyResolved,
    Skipped { reason: SkipReason },
    /// The entry could not be moved to retrying (claimed by another
    /// process, purged, or the store failed); nothing ran.
    Unclaimed { error: String },
    /// Drain interrupted the run; the entry went back to pending.
    Interrupted,
}

/// Per-entry replay results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub results: Vec<(String, ReplayResult)>,
}

impl ReplayReport {
    pub fn resolved(&self) -> usize {
        self.count(|r| matches!(r, ReplayResult::Resolved))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, ReplayResult::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|r| {
            matches!(
                r,
                ReplayResult::Skipped { .. } | ReplayResult::Unclaimed { .. }
            )
        })
    }

    fn count(&self, f: impl Fn(&ReplayResult) -> bool) -> usize {
        self.results.iter().filter(|(_, r)| f(r)).count()
    }
}

/// Synchronous aggregate health returned by `health_check()`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub lifecycle: Lifecycle,
    pub breaker_states: BTreeMap<JobClass, CircuitBreakerState>,
    /// `None` when the DLQ could not be read.
    pub dlq_pending_count: Option<u64>,
    pub dlq_dropped: u64,
    /// Dead letters held in memory because the store rejected the insert.
    pub dlq_unpersisted: usize,
    pub errors_dropped: u64,
    pub in_flight: Vec<JobClass>,
    pub last_tick_time: Option<DateTime<Utc>>,
    /// Latest periodic check, if one has completed.
    pub last_report: Option<HealthReport>,
}
