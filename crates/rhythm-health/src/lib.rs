//! `rhythm-health`: periodic self-checks for the rhythm orchestrator.
//!
//! Each check probes the datastore, releases breakers stuck open for too
//! long, and compares the DLQ backlog and the recent error rate against their
//! thresholds.  The result is a [`HealthReport`]; a check never fails.

pub mod events;
pub mod monitor;
pub mod probe;
pub mod types;

pub use events::{ErrorEvent, ErrorRing};
pub use monitor::HealthMonitor;
pub use probe::{DatastoreProbe, SqliteProbe};
pub use types::{BreakerHealth, HealthReport, HealthStatus, ProbeReport};
