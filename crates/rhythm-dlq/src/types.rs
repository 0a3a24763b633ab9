use chrono::{DateTime, SecondsFormat, Utc};
use rhythm_core::redact::{redact, redact_argv};
use rhythm_core::{ErrorKind, JobClass, JobSpec};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a dead letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    /// Waiting for a retry or operator replay.
    Pending,
    /// A replay is currently running.
    Retrying,
    /// A retry succeeded; replaying again is a no-op.
    Resolved,
    /// Retries exhausted or given up by an operator. Still replayable by hand.
    Abandoned,
}

impl DlqStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqStatus::Pending => "pending",
            DlqStatus::Retrying => "retrying",
            DlqStatus::Resolved => "resolved",
            DlqStatus::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DlqStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DlqStatus::Pending),
            "retrying" => Ok(DlqStatus::Retrying),
            "resolved" => Ok(DlqStatus::Resolved),
            "abandoned" => Ok(DlqStatus::Abandoned),
            other => Err(format!("unknown dlq status: {other}")),
        }
    }
}

/// A persisted failed job invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// UUIDv7 string; primary key, unique even for same-instant failures.
    pub id: String,
    pub job_class: JobClass,
    /// Argument vector of the failed run, secrets redacted.
    pub command: Vec<String>,
    pub timeout_ms: u64,
    pub error_kind: ErrorKind,
    /// Redacted failure detail (exit code, stderr tail).
    pub error_detail: String,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: DlqStatus,
}

impl DeadLetterEntry {
    /// Capture a failed run of `spec`.  Every text field is redacted here so
    /// nothing downstream can persist a raw secret.
    pub fn new(
        spec: &JobSpec,
        error_kind: ErrorKind,
        detail: &str,
        retry_count: u32,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_class: spec.class,
            command: redact_argv(&spec.command),
            timeout_ms: u64::try_from(spec.timeout.as_millis()).unwrap_or(u64::MAX),
            error_kind,
            error_detail: redact(detail),
            first_failed_at: failed_at,
            last_failed_at: failed_at,
            retry_count,
            status: DlqStatus::Pending,
        }
    }
}

/// Row counts per status, for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    pub pending: u64,
    pub retrying: u64,
    pub resolved: u64,
    pub abandoned: u64,
    /// Unresolved entries purged by the size cap or lost from the backlog
    /// since the store was opened.
    pub dropped: u64,
    /// Entries held in memory because the store rejected the insert.
    pub unpersisted: u64,
}

impl DlqStats {
    pub fn total(&self) -> u64 {
        self.pending + self.retrying + self.resolved + self.abandoned
    }
}

/// What happened while enqueuing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    /// Unresolved entries purged to respect `max_entries`.
    pub dropped: usize,
    /// Resolved entries purged to respect `max_entries`.
    pub pruned_resolved: usize,
}

/// Fixed-width UTC timestamp so lexical order equals chronological order.
pub(crate) fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}
