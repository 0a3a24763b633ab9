//! Periodic self-checks on an independent timer.
//!
//! The monitor shares nothing with the tick loop except the breakers (one
//! mutex per class), the DLQ connection and the error ring.  Its own report is
//! kept behind a separate `RwLock`, so a slow probe never delays dispatch.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rhythm_breaker::{BreakerStatus, CircuitBreakers};
use rhythm_core::config::HealthConfig;
use rhythm_core::{ErrorKind, JobClass, RhythmError};
use rhythm_dlq::DeadLetterQueue;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::events::{ErrorEvent, ErrorRing};
use crate::probe::DatastoreProbe;
use crate::types::{BreakerHealth, HealthReport, HealthStatus, ProbeReport};

pub struct HealthMonitor {
    cfg: HealthConfig,
    breakers: Arc<CircuitBreakers>,
    dlq: Arc<DeadLetterQueue>,
    errors: Arc<ErrorRing>,
    probe: Arc<dyn DatastoreProbe>,
    latest: RwLock<Option<HealthReport>>,
}

fn secs(n: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX / 1_000))
}

impl HealthMonitor {
    pub fn new(
        cfg: HealthConfig,
        breakers: Arc<CircuitBreakers>,
        dlq: Arc<DeadLetterQueue>,
        errors: Arc<ErrorRing>,
        probe: Arc<dyn DatastoreProbe>,
    ) -> Self {
        Self {
            cfg,
            breakers,
            dlq,
            errors,
            probe,
            latest: RwLock::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.cfg.interval_secs.max(1))
    }

    /// Most recent report, if a check has completed.
    pub fn latest(&self) -> Option<HealthReport> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one check.  Never fails: every problem becomes a `Degraded` reason.
    pub async fn check_once(&self, now: DateTime<Utc>) -> HealthReport {
        let mut reasons = Vec::new();

        // (a) datastore
        let datastore = self.probe_datastore().await;
        let mut forced_open = false;
        if let Some(err) = &datastore.error {
            let e = RhythmError::DatastoreUnavailable(err.clone());
            warn!(code = e.code(), "{e}");
            reasons.push(format!("datastore unavailable: {err}"));
            self.errors.push(ErrorEvent::new(
                "datastore",
                now,
                ErrorKind::DatastoreUnavailable,
                err,
                0,
            ));
        }

        // (b) breakers stuck open
        let stuck_after = secs(self.cfg.stuck_open_secs);
        let mut forced_half_open = Vec::new();
        for (class, state) in self.breakers.snapshots() {
            let stuck = state.status == BreakerStatus::Open
                && state.opened_at.is_some_and(|t| now - t > stuck_after);
            if stuck && datastore.ok && self.breakers.force_half_open(class) {
                forced_half_open.push(class);
            }
        }
        if !forced_half_open.is_empty() {
            reasons.push(format!(
                "breakers stuck open, forced half-open: {}",
                join(&forced_half_open)
            ));
        }

        if !datastore.ok && self.cfg.open_breakers_on_datastore_failure {
            let until = now + secs(self.cfg.datastore_cooldown_secs);
            for class in JobClass::ALL {
                self.breakers.force_open(class, now, until);
            }
            forced_open = true;
        }

        // (c) DLQ backlog
        let dlq_pending = match self.dlq.pending_count() {
            Ok(n) => {
                if n > self.cfg.dlq_high_water {
                    reasons.push(format!(
                        "dlq pending {n} above high-water mark {}",
                        self.cfg.dlq_high_water
                    ));
                }
                Some(n)
            }
            Err(e) => {
                error!(error = %e, "dlq pending count failed");
                reasons.push(format!("dlq unreadable: {e}"));
                None
            }
        };
        let dlq_dropped = self.dlq.dropped_count();
        let dlq_unpersisted = self.dlq.backlog_len();
        if dlq_unpersisted > 0 {
            reasons.push(format!(
                "{dlq_unpersisted} dead letters not yet persisted ({} failed writes)",
                self.dlq.write_failures()
            ));
        }

        // (d) error rate
        let recent_errors = self.errors.count_since(now - secs(self.cfg.error_window_secs));
        if recent_errors > self.cfg.error_rate_threshold {
            reasons.push(format!(
                "{recent_errors} errors in the last {}s (threshold {})",
                self.cfg.error_window_secs, self.cfg.error_rate_threshold
            ));
        }

        let breakers = self
            .breakers
            .snapshots()
            .into_iter()
            .map(|(class, s)| BreakerHealth {
                class,
                status: s.status,
                consecutive_failures: s.consecutive_failures,
                next_retry_time: s.next_retry_time,
            })
            .collect();

        let status = if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        let report = HealthReport {
            status,
            checked_at: now,
            datastore,
            breakers,
            forced_half_open,
            forced_open,
            dlq_pending,
            dlq_dropped,
            dlq_unpersisted,
            dlq_write_failures: self.dlq.write_failures(),
            recent_errors,
            errors_dropped: self.errors.dropped(),
            reasons,
        };

        match report.status {
            HealthStatus::Healthy => debug!("health check passed"),
            HealthStatus::Degraded => {
                warn!(reasons = ?report.reasons, "health degraded")
            }
        }

        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    /// Check loop.  Runs one check immediately, then every `interval` until
    /// `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.cfg.interval_secs, "health monitor started");
        let mut interval = tokio::time::interval(self.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_once(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    async fn probe_datastore(&self) -> ProbeReport {
        let timeout = Duration::from_secs(self.cfg.probe_timeout_secs.max(1));
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.probe.probe()).await {
            Ok(r) => r,
            Err(_) => Err(format!("probe timed out after {}s", timeout.as_secs())),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ProbeReport {
                ok: true,
                latency_ms,
                error: None,
            },
            Err(e) => ProbeReport {
                ok: false,
                latency_ms,
                error: Some(rhythm_core::redact::redact(&e)),
            },
        }
    }
}

fn join(classes: &[JobClass]) -> String {
    classes
        .iter()
        .map(JobClass::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rhythm_core::config::BreakerConfig;
    use rhythm_core::{FailureKind, JobSpec, Outcome};
    use rhythm_dlq::DeadLetterEntry;
    use rusqlite::Connection;

    struct AlwaysUp;

    #[async_trait]
    impl DatastoreProbe for AlwaysUp {
        async fn probe(&self) -> Result<(), String> {
            Ok(())
        }
    }

    struct AlwaysDown;

    #[async_trait]
    impl DatastoreProbe for AlwaysDown {
        async fn probe(&self) -> Result<(), String> {
            Err("connection refused (password=hunter2)".into())
        }
    }

    struct Hangs;

    #[async_trait]
    impl DatastoreProbe for Hangs {
        async fn probe(&self) -> Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn fail() -> Outcome {
        Outcome::Failure(FailureKind::NonZeroExit {
            code: 1,
            stderr_tail: String::new(),
        })
    }

    struct Fixture {
        breakers: Arc<CircuitBreakers>,
        dlq: Arc<DeadLetterQueue>,
        errors: Arc<ErrorRing>,
    }

    fn fixture() -> Fixture {
        Fixture {
            breakers: Arc::new(CircuitBreakers::from_config(&BreakerConfig::default())),
            dlq: Arc::new(
                DeadLetterQueue::new(Connection::open_in_memory().unwrap(), 100, 3).unwrap(),
            ),
            errors: Arc::new(ErrorRing::new(50)),
        }
    }

    fn monitor(f: &Fixture, cfg: HealthConfig, probe: Arc<dyn DatastoreProbe>) -> HealthMonitor {
        HealthMonitor::new(
            cfg,
            Arc::clone(&f.breakers),
            Arc::clone(&f.dlq),
            Arc::clone(&f.errors),
            probe,
        )
    }

    #[tokio::test]
    async fn quiet_system_is_healthy() {
        let f = fixture();
        let m = monitor(&f, HealthConfig::default(), Arc::new(AlwaysUp));
        assert!(m.latest().is_none());
        let r = m.check_once(t0()).await;
        assert_eq!(r.status, HealthStatus::Healthy);
        assert!(r.reasons.is_empty());
        assert_eq!(r.breakers.len(), 5);
        assert_eq!(m.latest().unwrap().checked_at, t0());
    }

    #[tokio::test]
    async fn probe_failure_degrades_and_opens_breakers() {
        let f = fixture();
        let m = monitor(&f, HealthConfig::default(), Arc::new(AlwaysDown));
        let r = m.check_once(t0()).await;
        assert_eq!(r.status, HealthStatus::Degraded);
        assert!(r.forced_open);
        assert!(!r.datastore.error.as_deref().unwrap().contains("hunter2"));
        for class in JobClass::ALL {
            assert_eq!(f.breakers.snapshot(class).status, BreakerStatus::Open);
            assert!(!f.breakers.allow_at(class, t0() + chrono::Duration::seconds(60)));
        }
        assert_eq!(f.errors.len(), 1);
    }

    #[tokio::test]
    async fn datastore_override_can_be_disabled() {
        let f = fixture();
        let cfg = HealthConfig {
            open_breakers_on_datastore_failure: false,
            ..HealthConfig::default()
        };
        let r = monitor(&f, cfg, Arc::new(AlwaysDown)).check_once(t0()).await;
        assert_eq!(r.status, HealthStatus::Degraded);
        assert!(!r.forced_open);
        assert_eq!(
            f.breakers.snapshot(JobClass::Rem).status,
            BreakerStatus::Closed
        );
    }

    #[tokio::test]
    async fn hanging_probe_times_out() {
        let f = fixture();
        let cfg = HealthConfig {
            probe_timeout_secs: 1,
            open_breakers_on_datastore_failure: false,
            ..HealthConfig::default()
        };
        let r = monitor(&f, cfg, Arc::new(Hangs)).check_once(t0()).await;
        assert!(!r.datastore.ok);
        assert!(r.datastore.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn stuck_open_breaker_forced_half_open() {
        let f = fixture();
        for _ in 0..3 {
            f.breakers.record_at(JobClass::Rem, &fail(), t0());
        }
        assert_eq!(f.breakers.snapshot(JobClass::Rem).status, BreakerStatus::Open);

        let m = monitor(&f, HealthConfig::default(), Arc::new(AlwaysUp));
        let early = m.check_once(t0() + chrono::Duration::seconds(60)).await;
        assert!(early.forced_half_open.is_empty());

        let late = m.check_once(t0() + chrono::Duration::hours(2)).await;
        assert_eq!(late.forced_half_open, vec![JobClass::Rem]);
        assert_eq!(
            f.breakers.snapshot(JobClass::Rem).status,
            BreakerStatus::HalfOpen
        );
        assert_eq!(late.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn dlq_backlog_and_error_rate_degrade() {
        let f = fixture();
        let cfg = HealthConfig {
            dlq_high_water: 1,
            error_rate_threshold: 2,
            ..HealthConfig::default()
        };
        let spec = JobSpec {
            class: JobClass::ShortTerm,
            command: vec!["dbt".into()],
            timeout: Duration::from_secs(1),
            priority: 0,
        };
        for _ in 0..2 {
            f.dlq
                .enqueue(&DeadLetterEntry::new(&spec, ErrorKind::JobFailure, "x", 0, t0()))
                .unwrap();
        }
        for _ in 0..3 {
            f.errors.push(ErrorEvent::new("short_term", t0(), ErrorKind::JobFailure, "x", 0));
        }
        let r = monitor(&f, cfg, Arc::new(AlwaysUp)).check_once(t0()).await;
        assert_eq!(r.status, HealthStatus::Degraded);
        assert_eq!(r.dlq_pending, Some(2));
        assert_eq!(r.recent_errors, 3);
        assert_eq!(r.reasons.len(), 2);
    }

    #[tokio::test]
    async fn rejected_dlq_writes_degrade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.db");
        let dlq = Arc::new(
            DeadLetterQueue::open(&rhythm_core::config::DlqConfig {
                path: path.to_string_lossy().into_owned(),
                ..Default::default()
            })
            .unwrap(),
        );
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_insert BEFORE INSERT ON dead_letters
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();
        let spec = JobSpec {
            class: JobClass::ShortTerm,
            command: vec!["dbt".into()],
            timeout: Duration::from_secs(1),
            priority: 0,
        };
        assert!(dlq
            .enqueue(&DeadLetterEntry::new(&spec, ErrorKind::JobFailure, "x", 0, t0()))
            .is_err());

        let f = Fixture { dlq, ..fixture() };
        let r = monitor(&f, HealthConfig::default(), Arc::new(AlwaysUp))
            .check_once(t0())
            .await;
        assert_eq!(r.status, HealthStatus::Degraded);
        assert_eq!(r.dlq_unpersisted, 1);
        assert_eq!(r.dlq_write_failures, 1);
        assert!(r.reasons[0].contains("not yet persisted"));
    }

    #[tokio::test]
    async fn report_serializes() {
        let f = fixture();
        let r = monitor(&f, HealthConfig::default(), Arc::new(AlwaysUp))
            .check_once(t0())
            .await;
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["breakers"][0]["status"], "closed");
    }
}
