//! `rhythm-dlq`: durable dead letter queue for failed job invocations.
//!
//! # Overview
//!
//! Failed runs are persisted to a SQLite `dead_letters` table (WAL mode,
//! owner-only file permissions).  The table is bounded by `max_entries`;
//! when an insert pushes it over the cap, rows are purged in the order
//!
//! | order | status      | counted as dropped |
//! |-------|-------------|--------------------|
//! | 1     | `resolved`  | no                 |
//! | 2     | `abandoned` | yes                |
//! | 3     | `pending`   | yes                |
//! | 4     | `retrying`  | yes                |
//!
//! oldest `first_failed_at` first within each status.  Every text column is
//! passed through [`rhythm_core::redact`] before it is written.
//!
//! An insert that fails (disk full, I/O error, lock timeout) parks the entry
//! in a small in-memory backlog.  The backlog is retried before the next
//! insert, on demand via [`DeadLetterQueue::retry_backlog`] and once more by
//! [`DeadLetterQueue::flush`]; entries pushed out of it, or still in it when
//! `flush` gives up, are added to the dropped counter.

pub mod db;
pub mod error;
pub mod queue;
pub mod types;

pub use error::{DlqError, Result};
pub use queue::{DeadLetterQueue, BACKLOG_CAPACITY};
pub use types::{DeadLetterEntry, DlqStats, DlqStatus, EnqueueReport};
