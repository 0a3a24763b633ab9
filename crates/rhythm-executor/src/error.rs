//! Error types for the rhythm-executor crate.

use thiserror::Error;

/// Errors raised while preparing a job process.
///
/// Anything that happens after the process starts is reported through
/// [`rhythm_core::Outcome`] instead, so a bad run never surfaces as `Err`.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The job spec carried an empty argument vector.
    #[error("empty command for {class}")]
    EmptyCommand { class: String },

    /// The OS refused to start the process.
    #[error("spawn error: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ExecError>;
