use thiserror::Error;

/// Errors that can occur within the orchestrator.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Dead letter queue read or write failed.
    #[error("DLQ error: {0}")]
    Dlq(#[from] rhythm_dlq::DlqError),

    /// Configuration rejected at startup.
    #[error(transparent)]
    Config(#[from] rhythm_core::RhythmError),

    /// A window definition cannot be evaluated.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The orchestrator is draining or stopped and accepts no new work.
    #[error("Orchestrator is {0}, not accepting work")]
    NotAccepting(crate::types::Lifecycle),

    /// A tracked task ended without producing a result.
    #[error("Task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
