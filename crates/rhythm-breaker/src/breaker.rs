//! Per-component circuit breakers.
//!
//! One `Mutex` guards each component's state, so recording a REM failure
//! never contends with a working-memory `allow` check.  All transitions have
//! an `*_at(now)` form taking an explicit clock reading; the plain forms use
//! `Utc::now()`.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rhythm_core::config::BreakerConfig;
use rhythm_core::{JobClass, Outcome};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::types::{BreakerStatus, CircuitBreakerState};

/// Circuit breakers for every job class.
pub struct CircuitBreakers {
    threshold: u32,
    policy: BackoffPolicy,
    /// Indexed by position in `JobClass::ALL`.
    entries: [Mutex<CircuitBreakerState>; 5],
}

fn slot(class: JobClass) -> usize {
    match class {
        JobClass::WorkingMemory => 0,
        JobClass::ShortTerm => 1,
        JobClass::Rem => 2,
        JobClass::DeepConsolidation => 3,
        JobClass::Homeostasis => 4,
    }
}

fn add(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
    now.checked_add_signed(chrono::Duration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl CircuitBreakers {
    pub fn new(threshold: u32, policy: BackoffPolicy) -> Self {
        Self {
            threshold: threshold.max(1),
            policy,
            entries: std::array::from_fn(|_| Mutex::new(CircuitBreakerState::closed())),
        }
    }

    pub fn from_config(cfg: &BreakerConfig) -> Self {
        Self::new(cfg.failure_threshold, BackoffPolicy::from_config(cfg))
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    fn lock(&self, class: JobClass) -> MutexGuard<'_, CircuitBreakerState> {
        self.entries[slot(class)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// May `class` run now?
    pub fn allow(&self, class: JobClass) -> bool {
        self.allow_at(class, Utc::now())
    }

    /// Closed always admits.  Open admits nothing until `next_retry_time`,
    /// then hands out exactly one half-open trial.
    pub fn allow_at(&self, class: JobClass, now: DateTime<Utc>) -> bool {
        let mut state = self.lock(class);
        match state.status {
            BreakerStatus::Closed => true,
            BreakerStatus::Open => {
                let due = state.next_retry_time.map_or(true, |t| now >= t);
                if !due {
                    return false;
                }
                state.status = BreakerStatus::HalfOpen;
                state.trial_in_flight = true;
                info!(%class, failures = state.consecutive_failures, "breaker half-open, admitting trial");
                true
            }
            BreakerStatus::HalfOpen => {
                if state.trial_in_flight {
                    return false;
                }
                state.trial_in_flight = true;
                debug!(%class, "admitting half-open trial");
                true
            }
        }
    }

    /// Feed an invocation outcome back into the breaker.
    pub fn record(&self, class: JobClass, outcome: &Outcome) -> BreakerStatus {
        self.record_at(class, outcome, Utc::now())
    }

    pub fn record_at(&self, class: JobClass, outcome: &Outcome, now: DateTime<Utc>) -> BreakerStatus {
        let mut state = self.lock(class);
        if outcome.is_success() {
            if state.status != BreakerStatus::Closed || state.consecutive_failures > 0 {
                info!(%class, previous = %state.status, "breaker closed");
            }
            *state = CircuitBreakerState::closed();
            return BreakerStatus::Closed;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_time = Some(now);
        state.trial_in_flight = false;

        let after_timeout = matches!(outcome, Outcome::Timeout);
        let should_open = match state.status {
            BreakerStatus::Closed => state.consecutive_failures >= self.threshold,
            BreakerStatus::HalfOpen | BreakerStatus::Open => true,
        };
        if should_open {
            let delay = self.policy.delay(state.consecutive_failures, after_timeout);
            let mut next = add(now, delay);
            if state.status == BreakerStatus::Open {
                // Already open (forced during the run): never shorten it.
                next = state.next_retry_time.map_or(next, |t| t.max(next));
            } else {
                state.opened_at = Some(now);
            }
            state.status = BreakerStatus::Open;
            state.next_retry_time = Some(next);
            warn!(
                %class,
                failures = state.consecutive_failures,
                backoff_ms = delay.as_millis() as u64,
                "breaker open"
            );
        } else {
            debug!(%class, failures = state.consecutive_failures, "failure recorded");
        }
        state.status
    }

    /// Give back a half-open trial that never ran (e.g. cancelled by shutdown).
    pub fn release_trial(&self, class: JobClass) {
        let mut state = self.lock(class);
        state.trial_in_flight = false;
    }

    /// Read-only copy of one component's state.
    pub fn snapshot(&self, class: JobClass) -> CircuitBreakerState {
        self.lock(class).clone()
    }

    pub fn snapshots(&self) -> Vec<(JobClass, CircuitBreakerState)> {
        JobClass::ALL
            .iter()
            .map(|c| (*c, self.snapshot(*c)))
            .collect()
    }

    /// Liveness override: move an `Open` breaker to `HalfOpen` without
    /// waiting out its backoff.  Returns false if it was not open.
    pub fn force_half_open(&self, class: JobClass) -> bool {
        let mut state = self.lock(class);
        if state.status != BreakerStatus::Open {
            return false;
        }
        state.status = BreakerStatus::HalfOpen;
        state.trial_in_flight = false;
        warn!(%class, "breaker forced half-open");
        true
    }

    /// Open a breaker out-of-band until `until` (datastore outage).
    pub fn force_open(&self, class: JobClass, now: DateTime<Utc>, until: DateTime<Utc>) {
        let mut state = self.lock(class);
        if state.status != BreakerStatus::Open {
            state.opened_at = Some(now);
        }
        state.status = BreakerStatus::Open;
        state.trial_in_flight = false;
        let next = state.next_retry_time.map_or(until, |t| t.max(until));
        state.next_retry_time = Some(next.max(now));
        warn!(%class, until = %next, "breaker forced open");
    }
}
