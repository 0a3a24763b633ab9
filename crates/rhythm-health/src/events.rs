//! Bounded in-memory ring of recent error events.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rhythm_core::redact::redact;
use rhythm_core::ErrorKind;
use serde::Serialize;

/// One recorded failure.  `message` is redacted on construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    /// Job class name, or `datastore` for probe failures.
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub error_kind: ErrorKind,
    pub message: String,
    pub retry_count: u32,
}

impl ErrorEvent {
    pub fn new(
        component: impl Into<String>,
        timestamp: DateTime<Utc>,
        error_kind: ErrorKind,
        message: &str,
        retry_count: u32,
    ) -> Self {
        Self {
            component: component.into(),
            timestamp,
            error_kind,
            message: redact(message),
            retry_count,
        }
    }
}

struct Ring {
    events: VecDeque<ErrorEvent>,
    dropped: u64,
}

/// Fixed-capacity FIFO: the oldest event is evicted (and counted) when full.
pub struct ErrorRing {
    capacity: usize,
    inner: Mutex<Ring>,
}

impl ErrorRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: ErrorEvent) {
        let mut ring = self.lock();
        while ring.events.len() >= self.capacity {
            ring.events.pop_front();
            ring.dropped += 1;
        }
        ring.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events evicted so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Events stamped at or after `since`.
    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.lock()
            .events
            .iter()
            .rev()
            .take_while(|e| e.timestamp >= since)
            .count()
    }

    /// Up to `limit` most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorEvent> {
        self.lock().events.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(sec: u32) -> ErrorEvent {
        ErrorEvent::new(
            "rem",
            Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, sec).unwrap(),
            ErrorKind::JobFailure,
            "exit code 1",
            0,
        )
    }

    #[test]
    fn never_exceeds_capacity() {
        let ring = ErrorRing::new(4);
        for s in 0..10 {
            ring.push(event(s));
            assert!(ring.len() <= 4);
        }
        assert_eq!(ring.dropped(), 6);
        let recent = ring.recent(10);
        assert_eq!(recent.len(), 4);
        // newest first, oldest evicted
        assert_eq!(recent[0].timestamp, event(9).timestamp);
        assert_eq!(recent[3].timestamp, event(6).timestamp);
    }

    #[test]
    fn count_since_window() {
        let ring = ErrorRing::new(10);
        for s in 0..6 {
            ring.push(event(s * 10));
        }
        assert_eq!(ring.count_since(event(30).timestamp), 3);
        assert_eq!(ring.count_since(event(59).timestamp), 0);
    }

    #[test]
    fn message_is_redacted() {
        let e = ErrorEvent::new(
            "datastore",
            Utc::now(),
            ErrorKind::DatastoreUnavailable,
            "token=abc123 rejected",
            0,
        );
        assert!(!e.message.contains("abc123"));
    }
}
