use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Named category of scheduled consolidation job.
///
/// Each class doubles as the circuit-breaker component name, so a failing
/// REM job never trips the breaker guarding working-memory runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    WorkingMemory,
    ShortTerm,
    Rem,
    DeepConsolidation,
    Homeostasis,
}

impl JobClass {
    /// All classes in declaration order (also the priority tie-break order).
    pub const ALL: [JobClass; 5] = [
        JobClass::WorkingMemory,
        JobClass::ShortTerm,
        JobClass::Rem,
        JobClass::DeepConsolidation,
        JobClass::Homeostasis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::WorkingMemory => "working_memory",
            JobClass::ShortTerm => "short_term",
            JobClass::Rem => "rem",
            JobClass::DeepConsolidation => "deep_consolidation",
            JobClass::Homeostasis => "homeostasis",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "working_memory" | "wm" => Ok(JobClass::WorkingMemory),
            "short_term" | "stm" => Ok(JobClass::ShortTerm),
            "rem" => Ok(JobClass::Rem),
            "deep_consolidation" | "deep" => Ok(JobClass::DeepConsolidation),
            "homeostasis" => Ok(JobClass::Homeostasis),
            other => Err(format!("unknown job class: {other}")),
        }
    }
}

/// Immutable description of how to run one job class.
///
/// Built once from configuration; `command` is an argument vector handed to
/// the OS verbatim, never re-parsed by a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub class: JobClass,
    pub command: Vec<String>,
    pub timeout: Duration,
    /// Lower runs first when several classes are due on the same tick.
    pub priority: u32,
}

/// Why a finished job counts as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureKind {
    /// Process exited with a non-zero status.
    NonZeroExit { code: i32, stderr_tail: String },
    /// Process was terminated by a signal we did not send.
    Signaled { stderr_tail: String },
    /// The command could not be started at all.
    Spawn { reason: String },
    /// Draining cancelled the run before it finished.
    Cancelled,
}

impl FailureKind {
    /// Short detail string suitable for DLQ `error_detail`.
    pub fn detail(&self) -> String {
        match self {
            FailureKind::NonZeroExit { code, stderr_tail } => {
                format!("exit code {code}: {stderr_tail}")
            }
            FailureKind::Signaled { stderr_tail } => format!("killed by signal: {stderr_tail}"),
            FailureKind::Spawn { reason } => format!("spawn failed: {reason}"),
            FailureKind::Cancelled => "cancelled during shutdown".to_string(),
        }
    }
}

/// Classified result of one job invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    Success,
    Failure(FailureKind),
    /// Wall clock exceeded `JobSpec::timeout`. Kept apart from `Failure`
    /// so retry and backoff policy can differ.
    Timeout,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Stable label stored in DLQ rows and error events.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success => None,
            Outcome::Timeout => Some(ErrorKind::JobTimeout),
            Outcome::Failure(FailureKind::Spawn { .. }) => Some(ErrorKind::SpawnFailure),
            Outcome::Failure(FailureKind::Cancelled) => Some(ErrorKind::Cancelled),
            Outcome::Failure(_) => Some(ErrorKind::JobFailure),
        }
    }
}

/// Persisted label for a failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    JobFailure,
    JobTimeout,
    SpawnFailure,
    Cancelled,
    DatastoreUnavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::JobFailure => "job_failure",
            ErrorKind::JobTimeout => "job_timeout",
            ErrorKind::SpawnFailure => "spawn_failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DatastoreUnavailable => "datastore_unavailable",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "job_failure" => Ok(ErrorKind::JobFailure),
            "job_timeout" => Ok(ErrorKind::JobTimeout),
            "spawn_failure" => Ok(ErrorKind::SpawnFailure),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "datastore_unavailable" => Ok(ErrorKind::DatastoreUnavailable),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}
