//! `RhythmOrchestrator`: owns the tick loop, the lifecycle and every
//! dispatched run.
//!
//! Each tick resolves the due classes, filters out classes already fired in
//! the current minute slot, and dispatches the rest in priority order onto a
//! `TaskTracker`.  A class runs at most once at a time; a due class whose
//! previous run is still going is skipped and logged, never queued.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rhythm_breaker::{BreakerStatus, CircuitBreakers};
use rhythm_core::redact::REDACTED;
use rhythm_core::{ErrorKind, FailureKind, JobClass, JobSpec, Outcome, RhythmConfig, RhythmError};
use rhythm_dlq::{DeadLetterEntry, DeadLetterQueue, DlqError, DlqStatus};
use rhythm_executor::{JobExecutor, JobRunner};
use rhythm_health::{
    DatastoreProbe, ErrorEvent, ErrorRing, HealthMonitor, HealthStatus, SqliteProbe,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    types::{HealthSnapshot, Lifecycle, ReplayReport, ReplayResult, SkipReason, TickReport},
    window::WindowResolver,
};

/// What an in-flight slot is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Scheduled,
    Replay,
}

/// Removes the class from the in-flight map when the run ends, including by
/// panic or abort.
struct InFlightGuard {
    map: Arc<DashMap<JobClass, RunKind>>,
    class: JobClass,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.class);
    }
}

pub struct RhythmOrchestrator {
    specs: HashMap<JobClass, JobSpec>,
    resolver: WindowResolver,
    breakers: Arc<CircuitBreakers>,
    dlq: Arc<DeadLetterQueue>,
    errors: Arc<ErrorRing>,
    health: Arc<HealthMonitor>,
    runner: Arc<dyn JobRunner>,

    in_flight: Arc<DashMap<JobClass, RunKind>>,
    last_slot: DashMap<JobClass, i64>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
    lifecycle: watch::Sender<Lifecycle>,
    health_stop: watch::Sender<bool>,
    replay_running: AtomicBool,

    cancel: CancellationToken,
    tracker: TaskTracker,

    tick_interval: Duration,
    timeout_retry_delay: Duration,
    auto_replay_interval: Duration,
    replay_batch: usize,
}

impl RhythmOrchestrator {
    /// Wire up an orchestrator from already-built stores and collaborators.
    pub fn new(
        cfg: &RhythmConfig,
        dlq: Arc<DeadLetterQueue>,
        probe: Arc<dyn DatastoreProbe>,
        runner: Arc<dyn JobRunner>,
    ) -> Result<Self> {
        cfg.validate()?;
        let classes = cfg.classes();
        let resolver = WindowResolver::from_classes(&classes, cfg.scheduler.utc_offset_minutes)?;
        let specs = classes
            .into_iter()
            .map(|c| (c.spec.class, c.spec))
            .collect();

        let breakers = Arc::new(CircuitBreakers::from_config(&cfg.breaker));
        let errors = Arc::new(ErrorRing::new(cfg.errors.ring_capacity));
        let health = Arc::new(HealthMonitor::new(
            cfg.health.clone(),
            Arc::clone(&breakers),
            Arc::clone(&dlq),
            Arc::clone(&errors),
            probe,
        ));
        let (lifecycle, _) = watch::channel(Lifecycle::Starting);
        let (health_stop, _) = watch::channel(false);

        Ok(Self {
            specs,
            resolver,
            breakers,
            dlq,
            errors,
            health,
            runner,
            in_flight: Arc::new(DashMap::new()),
            last_slot: DashMap::new(),
            last_tick: Mutex::new(None),
            lifecycle,
            health_stop,
            replay_running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            tick_interval: cfg.scheduler.tick_interval(),
            timeout_retry_delay: cfg.scheduler.timeout_retry_delay(),
            auto_replay_interval: Duration::from_secs(cfg.dlq.auto_replay_interval_secs),
            replay_batch: cfg.dlq.replay_batch,
        })
    }

    /// Production wiring: file-backed DLQ, SQLite datastore probe and the
    /// subprocess executor.
    pub fn from_config(cfg: &RhythmConfig) -> Result<Self> {
        cfg.validate()?;
        let dlq = Arc::new(DeadLetterQueue::open(&cfg.dlq)?);
        let probe = Arc::new(SqliteProbe::new(&cfg.datastore.path));
        let runner = Arc::new(JobExecutor::new(&cfg.executor));
        Self::new(cfg, dlq, probe, runner)
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn errors(&self) -> &Arc<ErrorRing> {
        &self.errors
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        self.lifecycle.send_if_modified(|current| {
            if next > *current {
                info!(from = %current, to = %next, "lifecycle transition");
                *current = next;
                true
            } else {
                false
            }
        });
    }

    fn accepting(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Starting | Lifecycle::Running => Ok(()),
            other => Err(SchedulerError::NotAccepting(other)),
        }
    }

    /// Starting → Running: recover interrupted replays and start the health
    /// timer.  Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.lifecycle() != Lifecycle::Starting {
            return;
        }
        match self.dlq.reset_retrying() {
            Ok(n) if n > 0 => info!(count = n, "dlq entries recovered from interrupted replay"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "dlq startup recovery failed"),
        }

        let now = Utc::now();
        for class in JobClass::ALL {
            match self.specs.get(&class) {
                Some(spec) => info!(
                    %class,
                    priority = spec.priority,
                    timeout_secs = spec.timeout.as_secs(),
                    next_due = ?self.resolver.next_due(class, now),
                    "job class scheduled"
                ),
                None => info!(%class, "job class disabled"),
            }
        }

        let health = Arc::clone(&self.health);
        let stop = self.health_stop.subscribe();
        self.tracker.spawn(health.run(stop));
        self.set_lifecycle(Lifecycle::Running);
    }

    /// Main event loop.  Ticks every `tick_interval` until `shutdown`
    /// broadcasts `true`, then drains.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.start();
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            "rhythm orchestrator started"
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut replay_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.auto_replay_interval,
            self.auto_replay_interval.max(Duration::from_secs(1)),
        );
        replay_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick_at(Utc::now());
                    if !report.dispatched.is_empty() || !report.skipped.is_empty() {
                        debug!(
                            dispatched = ?report.dispatched,
                            skipped = ?report.skipped,
                            "tick"
                        );
                    }
                }
                _ = replay_timer.tick(), if !self.auto_replay_interval.is_zero() => {
                    self.spawn_auto_replay();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("rhythm orchestrator shutting down");
                        break;
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Evaluate one tick at `now` and dispatch every eligible due class.
    ///
    /// Never fails: one class being skipped or broken does not affect the
    /// others.
    pub fn tick_at(self: &Arc<Self>, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        if self.accepting().is_err() {
            return report;
        }
        *self.last_tick.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        if self.dlq.backlog_len() > 0 {
            self.dlq.retry_backlog();
        }

        let slot = WindowResolver::slot(now);
        let mut due: Vec<JobClass> = self
            .resolver
            .due_classes(now)
            .into_iter()
            .filter(|class| {
                let fresh = self.last_slot.get(class).map_or(true, |s| *s != slot);
                if fresh {
                    self.last_slot.insert(*class, slot);
                }
                fresh
            })
            .collect();
        due.sort_by_key(|c| {
            let priority = self.specs.get(c).map_or(u32::MAX, |s| s.priority);
            (priority, *c)
        });
        report.due = due.clone();

        for class in due {
            let Some(spec) = self.specs.get(&class).cloned() else {
                report.skipped.push((class, SkipReason::NotConfigured));
                continue;
            };
            match self.claim(class, RunKind::Scheduled, now) {
                Err(reason) => {
                    match reason {
                        SkipReason::InFlight => {
                            warn!(%class, "previous run still in flight, skipping tick")
                        }
                        _ => info!(%class, %reason, "dispatch skipped"),
                    }
                    report.skipped.push((class, reason));
                }
                Ok(guard) => {
                    info!(%class, priority = spec.priority, "dispatching job");
                    let this = Arc::clone(self);
                    let handle = self
                        .tracker
                        .spawn(async move { this.run_scheduled(spec, guard).await });
                    report.dispatched.push(class);
                    report.runs.push(handle);
                }
            }
        }
        report
    }

    /// Reserve the class's in-flight slot, then ask its breaker.  The slot is
    /// held across the breaker check so no second caller can slip in between.
    fn claim(
        &self,
        class: JobClass,
        kind: RunKind,
        now: DateTime<Utc>,
    ) -> std::result::Result<InFlightGuard, SkipReason> {
        match self.in_flight.entry(class) {
            Entry::Occupied(_) => Err(SkipReason::InFlight),
            Entry::Vacant(slot) => {
                if !self.breakers.allow_at(class, now) {
                    return Err(SkipReason::BreakerOpen);
                }
                slot.insert(kind);
                Ok(InFlightGuard {
                    map: Arc::clone(&self.in_flight),
                    class,
                })
            }
        }
    }

    async fn run_scheduled(self: Arc<Self>, spec: JobSpec, _guard: InFlightGuard) -> Outcome {
        let class = spec.class;
        let mut attempt: u32 = 0;
        let mut report = self.runner.run(&spec, self.cancel.child_token()).await;

        // A first timeout earns one quick retry while the breaker still admits it.
        if report.outcome == Outcome::Timeout && !self.cancel.is_cancelled() {
            let now = Utc::now();
            self.breakers.record_at(class, &Outcome::Timeout, now);
            self.push_error(&spec, ErrorKind::JobTimeout, &timeout_detail(&spec), 0, now);

            let resumed = tokio::select! {
                _ = tokio::time::sleep(self.timeout_retry_delay) => true,
                _ = self.cancel.cancelled() => false,
            };
            if resumed && self.breakers.allow(class) {
                attempt = 1;
                info!(%class, "retrying after timeout");
                report = self.runner.run(&spec, self.cancel.child_token()).await;
            } else {
                // The timeout already counted against the breaker.
                self.dead_letter(&spec, &Outcome::Timeout, 0, now);
                return Outcome::Timeout;
            }
        }

        let now = Utc::now();
        let outcome = report.outcome;
        match &outcome {
            Outcome::Failure(FailureKind::Cancelled) => {
                self.breakers.release_trial(class);
                info!(%class, "run cancelled by shutdown");
                self.dead_letter(&spec, &outcome, attempt, now);
            }
            Outcome::Success => {
                self.breakers.record_at(class, &outcome, now);
            }
            Outcome::Failure(_) | Outcome::Timeout => {
                self.breakers.record_at(class, &outcome, now);
                let (kind, detail) = describe(&spec, &outcome);
                self.push_error(&spec, kind, &detail, attempt, now);
                self.dead_letter(&spec, &outcome, attempt, now);
            }
        }
        outcome
    }

    fn push_error(
        &self,
        spec: &JobSpec,
        kind: ErrorKind,
        detail: &str,
        retry_count: u32,
        now: DateTime<Utc>,
    ) {
        self.errors.push(ErrorEvent::new(
            spec.class.as_str(),
            now,
            kind,
            detail,
            retry_count,
        ));
    }

    fn dead_letter(&self, spec: &JobSpec, outcome: &Outcome, retry_count: u32, now: DateTime<Utc>) {
        let (kind, detail) = describe(spec, outcome);
        let entry = DeadLetterEntry::new(spec, kind, &detail, retry_count, now);
        match self.dlq.enqueue(&entry) {
            Ok(_) => info!(class = %spec.class, entry_id = %entry.id, %kind, "run dead-lettered"),
            Err(e) => error!(
                class = %spec.class,
                entry_id = %entry.id,
                error = %e,
                backlog = self.dlq.backlog_len(),
                "dead letter not persisted, held for retry"
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Replay up to `limit` dead letters, oldest first.  `Abandoned` entries
    /// are included only when asked (operator replay).
    pub async fn replay(
        self: &Arc<Self>,
        limit: usize,
        include_abandoned: bool,
    ) -> Result<ReplayReport> {
        self.accepting()?;
        let entries = self.dlq.list_replayable(limit, include_abandoned)?;
        let this = Arc::clone(self);
        let handle = self.tracker.spawn(async move {
            let mut report = ReplayReport::default();
            for entry in entries {
                if this.cancel.is_cancelled() {
                    break;
                }
                let id = entry.id.clone();
                let result = this.replay_one(entry).await;
                report.results.push((id, result));
            }
            report
        });
        join(handle).await
    }

    /// Replay a single entry by ID.  Replaying a resolved entry is a no-op.
    pub async fn replay_entry(self: &Arc<Self>, id: &str) -> Result<ReplayResult> {
        self.accepting()?;
        let entry = self.dlq.get(id)?;
        let this = Arc::clone(self);
        let handle = self.tracker.spawn(async move { this.replay_one(entry).await });
        join(handle).await
    }

    fn spawn_auto_replay(self: &Arc<Self>) {
        if self.replay_running.swap(true, Ordering::AcqRel) {
            debug!("auto replay still running, skipping");
            return;
        }
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            match this.replay(this.replay_batch, false).await {
                Ok(r) if !r.results.is_empty() => info!(
                    resolved = r.resolved(),
                    failed = r.failed(),
                    skipped = r.skipped(),
                    "auto replay finished"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "auto replay failed"),
            }
            this.replay_running.store(false, Ordering::Release);
        });
    }

    async fn replay_one(&self, entry: DeadLetterEntry) -> ReplayResult {
        let class = entry.job_class;
        if entry.status == DlqStatus::Resolved {
            debug!(entry_id = %entry.id, "entry already resolved, replay is a no-op");
            return ReplayResult::AlreadyResolved;
        }

        let _guard = match self.claim(class, RunKind::Replay, Utc::now()) {
            Ok(guard) => guard,
            Err(reason) => {
                debug!(entry_id = %entry.id, %class, %reason, "replay skipped");
                return ReplayResult::Skipped { reason };
            }
        };

        match self.dlq.mark_retrying(&entry.id) {
            Ok(()) => {}
            Err(DlqError::InvalidTransition {
                from: DlqStatus::Resolved,
                ..
            }) => {
                self.breakers.release_trial(class);
                return ReplayResult::AlreadyResolved;
            }
            Err(e) => {
                self.breakers.release_trial(class);
                warn!(entry_id = %entry.id, error = %e, "could not claim entry for replay");
                return ReplayResult::Unclaimed {
                    error: e.to_string(),
                };
            }
        }

        let spec = self.replay_spec(&entry);
        info!(
            entry_id = %entry.id,
            %class,
            retry_count = entry.retry_count,
            "replaying dead letter"
        );
        let report = self.runner.run(&spec, self.cancel.child_token()).await;
        let now = Utc::now();

        match &report.outcome {
            Outcome::Failure(FailureKind::Cancelled) => {
                self.breakers.release_trial(class);
                if let Err(e) = self.dlq.release(&entry.id) {
                    warn!(entry_id = %entry.id, error = %e, "could not release replay claim");
                }
                ReplayResult::Interrupted
            }
            Outcome::Success => {
                self.breakers.record_at(class, &report.outcome, now);
                match self.dlq.resolve(&entry.id) {
                    Ok(()) => ReplayResult::Resolved,
                    Err(e) => {
                        error!(entry_id = %entry.id, error = %e, "replay succeeded but resolve failed");
                        ReplayResult::Failed {
                            status: DlqStatus::Retrying,
                        }
                    }
                }
            }
            outcome => {
                self.breakers.record_at(class, outcome, now);
                let (kind, detail) = describe(&spec, outcome);
                let retries = entry.retry_count.saturating_add(1);
                self.push_error(&spec, kind, &detail, retries, now);
                match self.dlq.record_retry_failure(&entry.id, kind, &detail, now) {
                    Ok(status) => ReplayResult::Failed { status },
                    Err(e) => {
                        error!(entry_id = %entry.id, error = %e, "failed to record replay failure");
                        ReplayResult::Failed {
                            status: DlqStatus::Retrying,
                        }
                    }
                }
            }
        }
    }

    /// The stored argv is the one that failed, unless redaction rewrote part
    /// of it; then the class's configured argv is the only runnable form.
    fn replay_spec(&self, entry: &DeadLetterEntry) -> JobSpec {
        let configured = self.specs.get(&entry.job_class);
        let redacted = entry.command.iter().any(|a| a.contains(REDACTED));
        let command = match configured {
            Some(spec) if redacted || entry.command.is_empty() => spec.command.clone(),
            _ => entry.command.clone(),
        };
        JobSpec {
            class: entry.job_class,
            command,
            timeout: Duration::from_millis(entry.timeout_ms.max(1)),
            priority: configured.map_or(0, |s| s.priority),
        }
    }

    // -----------------------------------------------------------------------
    // Drain and health
    // -----------------------------------------------------------------------

    /// Running → Draining → Stopped.  Cancels in-flight runs (each is forced
    /// once its own timeout elapses), waits for them and flushes the DLQ.
    pub async fn drain(&self) {
        if self.lifecycle() >= Lifecycle::Draining {
            return;
        }
        self.set_lifecycle(Lifecycle::Draining);
        let in_flight: Vec<(JobClass, RunKind)> =
            self.in_flight.iter().map(|e| (*e.key(), *e.value())).collect();
        info!(?in_flight, "draining in-flight runs");

        self.cancel.cancel();
        let _ = self.health_stop.send(true);
        self.tracker.close();
        self.tracker.wait().await;

        if let Err(e) = self.dlq.flush() {
            error!(error = %e, "dlq flush failed during drain");
        }
        self.set_lifecycle(Lifecycle::Stopped);
        info!("rhythm orchestrator stopped");
    }

    /// Aggregate health for operators.  Reads state only.
    pub fn health_check(&self) -> HealthSnapshot {
        let lifecycle = self.lifecycle();
        let breaker_states: BTreeMap<_, _> = self.breakers.snapshots().into_iter().collect();
        let dlq_pending_count = match self.dlq.pending_count() {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "dlq unreadable during health check");
                None
            }
        };
        let last_report = self.health.latest();
        let dlq_unpersisted = self.dlq.backlog_len();

        let degraded = lifecycle != Lifecycle::Running
            || dlq_pending_count.is_none()
            || dlq_unpersisted > 0
            || breaker_states
                .values()
                .any(|s| s.status == BreakerStatus::Open)
            || last_report
                .as_ref()
                .is_some_and(|r| r.status == HealthStatus::Degraded);

        let mut in_flight: Vec<JobClass> = self.in_flight.iter().map(|e| *e.key()).collect();
        in_flight.sort();

        HealthSnapshot {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            lifecycle,
            breaker_states,
            dlq_pending_count,
            dlq_dropped: self.dlq.dropped_count(),
            dlq_unpersisted,
            errors_dropped: self.errors.dropped(),
            in_flight,
            last_tick_time: *self.last_tick.lock().unwrap_or_else(PoisonError::into_inner),
            last_report,
        }
    }
}

async fn join<T>(handle: JoinHandle<T>) -> Result<T> {
    handle.await.map_err(|e| SchedulerError::Task(e.to_string()))
}

fn timeout_detail(spec: &JobSpec) -> String {
    RhythmError::JobTimeout {
        class: spec.class,
        ms: spec.timeout.as_millis() as u64,
    }
    .to_string()
}

/// Error kind and redaction-ready detail for a non-success outcome.
fn describe(spec: &JobSpec, outcome: &Outcome) -> (ErrorKind, String) {
    let kind = outcome.error_kind().unwrap_or(ErrorKind::JobFailure);
    let detail = match outcome {
        Outcome::Timeout => timeout_detail(spec),
        Outcome::Failure(f) => RhythmError::JobFailure {
            class: spec.class,
            detail: f.detail(),
        }
        .to_string(),
        Outcome::Success => String::new(),
    };
    (kind, detail)
}
