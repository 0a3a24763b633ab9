use thiserror::Error;

use crate::types::JobClass;

#[derive(Debug, Error)]
pub enum RhythmError {
    #[error("Job {class} failed: {detail}")]
    JobFailure { class: JobClass, detail: String },

    #[error("Job {class} timed out after {ms}ms")]
    JobTimeout { class: JobClass, ms: u64 },

    #[error("Datastore unavailable: {0}")]
    DatastoreUnavailable(String),

    #[error("Dead letter queue over capacity (max {max}), purged {purged} entries")]
    DlqCapacityExceeded { max: usize, purged: usize },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl RhythmError {
    /// Short error code used in health reports and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            RhythmError::JobFailure { .. } => "JOB_FAILURE",
            RhythmError::JobTimeout { .. } => "JOB_TIMEOUT",
            RhythmError::DatastoreUnavailable(_) => "DATASTORE_UNAVAILABLE",
            RhythmError::DlqCapacityExceeded { .. } => "DLQ_CAPACITY_EXCEEDED",
            RhythmError::ConfigInvalid(_) => "CONFIG_INVALID",
        }
    }

    /// Only configuration errors stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RhythmError::ConfigInvalid(_))
    }
}

pub type Result<T> = std::result::Result<T, RhythmError>;
