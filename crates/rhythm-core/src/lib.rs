//! `rhythm-core`: shared types, configuration, error taxonomy and secret
//! redaction for the rhythm orchestrator crates.

pub mod config;
pub mod error;
pub mod redact;
pub mod types;
pub mod window;

pub use config::{RhythmConfig, ScheduledClass};
pub use error::{Result, RhythmError};
pub use types::{ErrorKind, FailureKind, JobClass, JobSpec, Outcome};
pub use window::{HourRange, WindowRule};
