//! Shared data types for rhythm-executor.

use std::time::Duration;

use async_trait::async_trait;
use rhythm_core::{JobSpec, Outcome};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Everything observed about one finished job process.
#[derive(Debug, Clone, Serialize)]
pub struct ExecReport {
    pub outcome: Outcome,
    /// `None` when the process never started or was killed by a signal.
    pub exit_code: Option<i32>,
    /// ANSI-stripped, bounded, redacted tail of stdout.
    pub stdout_tail: String,
    /// ANSI-stripped, bounded, redacted tail of stderr.
    pub stderr_tail: String,
    pub duration: Duration,
}

impl ExecReport {
    pub(crate) fn not_started(outcome: Outcome) -> Self {
        Self {
            outcome,
            exit_code: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            duration: Duration::ZERO,
        }
    }
}

/// Runs one job invocation to completion.
///
/// Implementations must never hang past `spec.timeout` and must classify every
/// result into an [`Outcome`] rather than returning an error.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, spec: &JobSpec, cancel: CancellationToken) -> ExecReport;
}
