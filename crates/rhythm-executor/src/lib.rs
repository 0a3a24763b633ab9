//! `rhythm-executor`: runs job argument vectors as child processes under a
//! timeout, with bounded, redacted output capture.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rhythm_core::{config::ExecutorConfig, JobClass, JobSpec};
//! use rhythm_executor::{JobExecutor, JobRunner};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let exec = JobExecutor::new(&ExecutorConfig::default());
//! let spec = JobSpec {
//!     class: JobClass::Rem,
//!     command: vec!["dbt".into(), "run".into(), "--select".into(), "tag:rem".into()],
//!     timeout: Duration::from_secs(900),
//!     priority: 30,
//! };
//! let report = exec.run(&spec, CancellationToken::new()).await;
//! println!("{:?}", report.outcome);
//! # }
//! ```

pub mod error;
pub mod executor;
pub mod truncate;
pub mod types;

pub use error::{ExecError, Result};
pub use executor::JobExecutor;
pub use types::{ExecReport, JobRunner};
