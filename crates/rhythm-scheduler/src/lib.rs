//! `rhythm-scheduler`: the rhythm orchestrator and its window resolver.
//!
//! # Overview
//!
//! The [`engine::RhythmOrchestrator`] ticks every second, asks the
//! [`window::WindowResolver`] which classes are due, and dispatches each one
//! through its circuit breaker to the job runner.  Failures are recorded on
//! the breaker and persisted to the dead letter queue; the health monitor runs
//! beside it on its own timer.
//!
//! # Default timetable (local clock)
//!
//! | Class                | Fires                         |
//! |----------------------|-------------------------------|
//! | `working_memory`     | every 5 min, 06:00-21:59      |
//! | `short_term`         | every 15 min, all day         |
//! | `rem`                | :00 and :30, 22:00-05:59      |
//! | `deep_consolidation` | :00, 02:00-03:59              |
//! | `homeostasis`        | Sunday 03:00                  |

pub mod engine;
pub mod error;
pub mod types;
pub mod window;

pub use engine::RhythmOrchestrator;
pub use error::{Result, SchedulerError};
pub use types::{HealthSnapshot, Lifecycle, ReplayReport, ReplayResult, SkipReason, TickReport};
pub use window::{ScheduleWindow, WindowResolver};
