use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rhythm_core::config::DlqConfig;
use rhythm_core::redact::redact;
use rhythm_core::{ErrorKind, RhythmError};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, error, info, warn};

use crate::{
    db::init_db,
    error::{DlqError, Result},
    types::{ts, DeadLetterEntry, DlqStats, DlqStatus, EnqueueReport},
};

const COLUMNS: &str = "id, job_class, command, timeout_ms, error_kind, error_detail,
     first_failed_at, last_failed_at, retry_count, status";

/// Statuses purged by the size cap, in order.  Resolved rows are housekeeping;
/// the rest count as dropped.
const PURGE_ORDER: [DlqStatus; 4] = [
    DlqStatus::Resolved,
    DlqStatus::Abandoned,
    DlqStatus::Pending,
    DlqStatus::Retrying,
];

/// Entries held in memory while the store rejects writes.
pub const BACKLOG_CAPACITY: usize = 64;

/// Durable, size-bounded store of failed job invocations.
///
/// All access goes through one connection behind a `Mutex`; inserts and the
/// size enforcement that follows share a transaction, so concurrent failures
/// from different classes cannot push the table past `max_entries`.
pub struct DeadLetterQueue {
    conn: Mutex<Connection>,
    max_entries: usize,
    max_retries: u32,
    dropped: AtomicU64,
    /// Entries whose insert failed, oldest first, awaiting a retry.
    backlog: Mutex<VecDeque<DeadLetterEntry>>,
    write_failures: AtomicU64,
}

impl DeadLetterQueue {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection, max_entries: usize, max_retries: u32) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_entries: max_entries.max(1),
            max_retries,
            dropped: AtomicU64::new(0),
            backlog: Mutex::new(VecDeque::new()),
            write_failures: AtomicU64::new(0),
        })
    }

    /// Open (or create) the store at `cfg.path` with owner-only permissions
    /// and a bounded busy timeout on every statement.
    pub fn open(cfg: &DlqConfig) -> Result<Self> {
        let path = Path::new(&cfg.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        restrict_permissions(path)?;

        let queue = Self::new(conn, cfg.max_entries, cfg.max_retries)?;
        info!(path = %cfg.path, max_entries = cfg.max_entries, "dead letter queue opened");
        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Persist a new entry, purging old rows if the cap is exceeded.
    ///
    /// Backlogged entries go first so the table keeps failure order.  If the
    /// insert fails the entry is parked in the backlog and the error is
    /// returned; it is not lost until the backlog overflows.
    pub fn enqueue(&self, entry: &DeadLetterEntry) -> Result<EnqueueReport> {
        if self.backlog_len() > 0 {
            self.retry_backlog();
        }
        match self.insert(entry) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    entry_id = %entry.id,
                    class = %entry.job_class,
                    error = %e,
                    "dead letter insert failed, kept in memory"
                );
                self.park(entry.clone());
                Err(e)
            }
        }
    }

    /// Re-insert backlogged entries, oldest first, stopping at the first
    /// failure.  Returns how many were persisted.
    pub fn retry_backlog(&self) -> usize {
        let mut persisted = 0;
        loop {
            let Some(entry) = self.backlog().pop_front() else {
                break;
            };
            match self.insert(&entry) {
                Ok(_) => persisted += 1,
                Err(e) => {
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(entry_id = %entry.id, error = %e, "backlog retry failed");
                    self.backlog().push_front(entry);
                    break;
                }
            }
        }
        if persisted > 0 {
            info!(count = persisted, "backlogged dead letters persisted");
        }
        persisted
    }

    /// Entries waiting in memory for the store to accept writes.
    pub fn backlog_len(&self) -> usize {
        self.backlog().len()
    }

    /// Failed insert attempts since this store was opened, retries included.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    fn backlog(&self) -> MutexGuard<'_, VecDeque<DeadLetterEntry>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn park(&self, entry: DeadLetterEntry) {
        let mut backlog = self.backlog();
        backlog.push_back(entry);
        if backlog.len() > BACKLOG_CAPACITY {
            if let Some(lost) = backlog.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    entry_id = %lost.id,
                    class = %lost.job_class,
                    "dead letter backlog full, oldest entry dropped"
                );
            }
        }
    }

    fn insert(&self, entry: &DeadLetterEntry) -> Result<EnqueueReport> {
        let command = serde_json::to_string(&entry.command)?;
        let now = ts(&Utc::now());

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO dead_letters
             (id, job_class, command, timeout_ms, error_kind, error_detail,
              first_failed_at, last_failed_at, retry_count, status, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?11)",
            params![
                entry.id,
                entry.job_class.as_str(),
                command,
                i64::try_from(entry.timeout_ms).unwrap_or(i64::MAX),
                entry.error_kind.to_string(),
                redact(&entry.error_detail),
                ts(&entry.first_failed_at),
                ts(&entry.last_failed_at),
                entry.retry_count,
                entry.status.as_str(),
                now,
            ],
        )?;

        let mut report = EnqueueReport::default();
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get(0))?;
        let mut excess = count - self.max_entries as i64;
        for status in PURGE_ORDER {
            if excess <= 0 {
                break;
            }
            let n = tx.execute(
                "DELETE FROM dead_letters WHERE id IN (
                     SELECT id FROM dead_letters WHERE status = ?1
                     ORDER BY first_failed_at, rowid LIMIT ?2)",
                params![status.as_str(), excess],
            )?;
            excess -= n as i64;
            if status == DlqStatus::Resolved {
                report.pruned_resolved += n;
            } else {
                report.dropped += n;
            }
        }
        tx.commit()?;
        drop(conn);

        if report.dropped > 0 {
            self.dropped
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
            let err = RhythmError::DlqCapacityExceeded {
                max: self.max_entries,
                purged: report.dropped,
            };
            warn!(code = err.code(), "{err}");
        }
        debug!(
            entry_id = %entry.id,
            class = %entry.job_class,
            kind = %entry.error_kind,
            "dead letter enqueued"
        );
        Ok(report)
    }

    /// Fetch one entry by ID.
    pub fn get(&self, id: &str) -> Result<DeadLetterEntry> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM dead_letters WHERE id = ?1"),
            [id],
            row_to_entry,
        )
        .optional()?
        .ok_or_else(|| DlqError::EntryNotFound { id: id.to_string() })
    }

    /// Pending entries, oldest `first_failed_at` first.
    pub fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        self.list(Some(DlqStatus::Pending), limit)
    }

    /// Entries a replay may pick up: Pending, plus Abandoned when requested.
    pub fn list_replayable(
        &self,
        limit: usize,
        include_abandoned: bool,
    ) -> Result<Vec<DeadLetterEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM dead_letters
             WHERE status = 'pending' OR (?1 AND status = 'abandoned')
             ORDER BY first_failed_at, rowid LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![include_abandoned, limit as i64], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Entries in one status (or all), oldest first.
    pub fn list(&self, status: Option<DlqStatus>, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM dead_letters
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY first_failed_at, rowid LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                row_to_entry,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Claim an entry for replay.  Only Pending or Abandoned entries qualify.
    pub fn mark_retrying(&self, id: &str) -> Result<()> {
        self.transition(
            id,
            &[DlqStatus::Pending, DlqStatus::Abandoned],
            DlqStatus::Retrying,
        )
    }

    /// Hand a claimed entry back untouched (the replay never ran to an outcome).
    pub fn release(&self, id: &str) -> Result<()> {
        self.transition(id, &[DlqStatus::Retrying], DlqStatus::Pending)
    }

    /// Mark an entry done.  Resolving an already-resolved entry is a no-op.
    pub fn resolve(&self, id: &str) -> Result<()> {
        self.transition(
            id,
            &[
                DlqStatus::Pending,
                DlqStatus::Retrying,
                DlqStatus::Abandoned,
                DlqStatus::Resolved,
            ],
            DlqStatus::Resolved,
        )?;
        info!(entry_id = %id, "dead letter resolved");
        Ok(())
    }

    /// Give up on an entry without deleting it.
    pub fn abandon(&self, id: &str) -> Result<()> {
        self.transition(
            id,
            &[
                DlqStatus::Pending,
                DlqStatus::Retrying,
                DlqStatus::Abandoned,
            ],
            DlqStatus::Abandoned,
        )?;
        info!(entry_id = %id, "dead letter abandoned");
        Ok(())
    }

    /// A replay of `id` failed again: bump `retry_count` and return the entry
    /// to Pending, or to Abandoned once `max_retries` is exceeded.
    pub fn record_retry_failure(
        &self,
        id: &str,
        kind: ErrorKind,
        detail: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<DlqStatus> {
        let conn = self.lock();
        let current: Option<(u32, String)> = conn
            .query_row(
                "SELECT retry_count, status FROM dead_letters WHERE id = ?1",
                [id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (retry_count, status_str) =
            current.ok_or_else(|| DlqError::EntryNotFound { id: id.to_string() })?;
        let status = parse_status(&status_str);
        if status == DlqStatus::Resolved {
            return Err(DlqError::InvalidTransition {
                id: id.to_string(),
                from: status,
                to: DlqStatus::Pending,
            });
        }

        let retries = retry_count.saturating_add(1);
        let next = if retries > self.max_retries {
            DlqStatus::Abandoned
        } else {
            DlqStatus::Pending
        };
        conn.execute(
            "UPDATE dead_letters
             SET retry_count = ?1, status = ?2, error_kind = ?3, error_detail = ?4,
                 last_failed_at = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                retries,
                next.as_str(),
                kind.to_string(),
                redact(detail),
                ts(&failed_at),
                ts(&Utc::now()),
                id
            ],
        )?;
        if next == DlqStatus::Abandoned {
            warn!(entry_id = %id, retries, "retries exhausted, dead letter abandoned");
        } else {
            debug!(entry_id = %id, retries, "dead letter retry failed");
        }
        Ok(next)
    }

    /// Return entries left `Retrying` by an interrupted process to `Pending`.
    pub fn reset_retrying(&self) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE dead_letters SET status = 'pending', updated_at = ?1
             WHERE status = 'retrying'",
            [ts(&Utc::now())],
        )?;
        if n > 0 {
            warn!(count = n, "interrupted replays returned to pending");
        }
        Ok(n)
    }

    pub fn pending_count(&self) -> Result<u64> {
        let conn = self.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'",
            [],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Unresolved entries purged by the size cap, or lost from the backlog,
    /// since this store was opened.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Result<DlqStats> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM dead_letters GROUP BY status")?;
        let mut stats = DlqStats {
            dropped: self.dropped_count(),
            unpersisted: self.backlog_len() as u64,
            ..DlqStats::default()
        };
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            let n = n.max(0) as u64;
            match parse_status(&status) {
                DlqStatus::Pending => stats.pending = n,
                DlqStatus::Retrying => stats.retrying = n,
                DlqStatus::Resolved => stats.resolved = n,
                DlqStatus::Abandoned => stats.abandoned = n,
            }
        }
        Ok(stats)
    }

    /// Persist the backlog, then checkpoint the WAL so every committed write
    /// is in the main file.  Run once at shutdown: entries the store still
    /// rejects are counted as dropped and reported as `Unpersisted`.
    pub fn flush(&self) -> Result<()> {
        if self.backlog_len() > 0 {
            self.retry_backlog();
        }
        {
            let conn = self.lock();
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        }

        let lost: Vec<DeadLetterEntry> = self.backlog().drain(..).collect();
        if !lost.is_empty() {
            self.dropped.fetch_add(lost.len() as u64, Ordering::Relaxed);
            for entry in &lost {
                error!(entry_id = %entry.id, class = %entry.job_class, "dead letter lost at shutdown");
            }
            return Err(DlqError::Unpersisted { count: lost.len() });
        }
        debug!("dead letter queue flushed");
        Ok(())
    }

    // --- private helpers ---------------------------------------------------

    fn transition(&self, id: &str, from: &[DlqStatus], to: DlqStatus) -> Result<()> {
        let conn = self.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM dead_letters WHERE id = ?1",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        let current = current
            .map(|s| parse_status(&s))
            .ok_or_else(|| DlqError::EntryNotFound { id: id.to_string() })?;

        if !from.contains(&current) {
            return Err(DlqError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to,
            });
        }
        if current == to {
            return Ok(());
        }
        conn.execute(
            "UPDATE dead_letters SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), ts(&Utc::now()), id, current.as_str()],
        )?;
        Ok(())
    }
}

/// Unknown status strings (written by a newer version) are treated as pending
/// so the entry stays visible instead of vanishing from every listing.
fn parse_status(s: &str) -> DlqStatus {
    s.parse().unwrap_or_else(|e| {
        warn!("{e}; treating as pending");
        DlqStatus::Pending
    })
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn text_err(idx: usize, msg: String) -> rusqlite::Error {
    conversion_err(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<DeadLetterEntry> {
    let class: String = row.get(1)?;
    let command: String = row.get(2)?;
    let timeout_ms: i64 = row.get(3)?;
    let kind: String = row.get(4)?;
    let first: String = row.get(6)?;
    let last: String = row.get(7)?;
    let status: String = row.get(9)?;

    Ok(DeadLetterEntry {
        id: row.get(0)?,
        job_class: class.parse().map_err(|e| text_err(1, e))?,
        command: serde_json::from_str(&command).map_err(|e| conversion_err(2, e))?,
        timeout_ms: timeout_ms.max(0) as u64,
        error_kind: kind.parse().map_err(|e| text_err(4, e))?,
        error_detail: row.get(5)?,
        first_failed_at: parse_ts(6, &first)?,
        last_failed_at: parse_ts(7, &last)?,
        retry_count: row.get(8)?,
        status: parse_status(&status),
    })
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let owner_only = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, owner_only.clone())?;
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let side = Path::new(&side);
        if side.exists() {
            std::fs::set_permissions(side, owner_only.clone())?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rhythm_core::{JobClass, JobSpec};

    fn queue(max_entries: usize) -> DeadLetterQueue {
        DeadLetterQueue::new(Connection::open_in_memory().unwrap(), max_entries, 2).unwrap()
    }

    fn spec(class: JobClass) -> JobSpec {
        JobSpec {
            class,
            command: vec!["dbt".into(), "run".into()],
            timeout: Duration::from_secs(10),
            priority: 0,
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 4, 3, minute, 0).unwrap()
    }

    fn entry(minute: u32) -> DeadLetterEntry {
        DeadLetterEntry::new(
            &spec(JobClass::ShortTerm),
            ErrorKind::JobFailure,
            "exit code 1",
            0,
            at(minute),
        )
    }

    #[test]
    fn enqueue_and_get() {
        let q = queue(10);
        let e = entry(1);
        q.enqueue(&e).unwrap();
        let got = q.get(&e.id).unwrap();
        assert_eq!(got, e);
        assert_eq!(q.pending_count().unwrap(), 1);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let q = queue(10);
        assert!(matches!(
            q.get("missing"),
            Err(DlqError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn list_pending_oldest_first() {
        let q = queue(10);
        let newer = entry(30);
        let older = entry(5);
        let middle = entry(10);
        q.enqueue(&newer).unwrap();
        q.enqueue(&older).unwrap();
        q.enqueue(&middle).unwrap();

        let ids: Vec<_> = q.list_pending(10).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![older.id, middle.id, newer.id]);
        assert_eq!(q.list_pending(2).unwrap().len(), 2);
    }

    #[test]
    fn size_never_exceeds_max() {
        let q = queue(5);
        for m in 0..40 {
            q.enqueue(&entry(m % 60)).unwrap();
            assert!(q.count().unwrap() <= 5);
        }
        assert_eq!(q.dropped_count(), 35);
    }

    #[test]
    fn abandoned_purged_before_pending() {
        let q = queue(3);
        let oldest_pending = entry(1);
        let abandoned = entry(2);
        let pending = entry(3);
        q.enqueue(&oldest_pending).unwrap();
        q.enqueue(&abandoned).unwrap();
        q.enqueue(&pending).unwrap();
        q.abandon(&abandoned.id).unwrap();

        let report = q.enqueue(&entry(4)).unwrap();
        assert_eq!(report.dropped, 1);
        assert!(q.get(&abandoned.id).is_err());
        assert!(q.get(&oldest_pending.id).is_ok());

        // no abandoned left: the oldest pending goes next
        q.enqueue(&entry(5)).unwrap();
        assert!(q.get(&oldest_pending.id).is_err());
        assert_eq!(q.count().unwrap(), 3);
    }

    #[test]
    fn resolved_pruned_without_counting_as_dropped() {
        let q = queue(2);
        let done = entry(1);
        q.enqueue(&done).unwrap();
        q.resolve(&done.id).unwrap();
        q.enqueue(&entry(2)).unwrap();
        let report = q.enqueue(&entry(3)).unwrap();
        assert_eq!(report.pruned_resolved, 1);
        assert_eq!(report.dropped, 0);
        assert_eq!(q.dropped_count(), 0);
    }

    #[test]
    fn retry_failures_abandon_after_max() {
        let q = queue(10);
        let e = entry(1);
        q.enqueue(&e).unwrap();

        q.mark_retrying(&e.id).unwrap();
        let s = q
            .record_retry_failure(&e.id, ErrorKind::JobTimeout, "slow", at(20))
            .unwrap();
        assert_eq!(s, DlqStatus::Pending);

        q.mark_retrying(&e.id).unwrap();
        assert_eq!(
            q.record_retry_failure(&e.id, ErrorKind::JobFailure, "x", at(21))
                .unwrap(),
            DlqStatus::Pending
        );
        q.mark_retrying(&e.id).unwrap();
        assert_eq!(
            q.record_retry_failure(&e.id, ErrorKind::JobFailure, "x", at(22))
                .unwrap(),
            DlqStatus::Abandoned
        );

        let got = q.get(&e.id).unwrap();
        assert_eq!(got.retry_count, 3);
        assert_eq!(got.first_failed_at, at(1));
        assert_eq!(got.last_failed_at, at(22));
    }

    #[test]
    fn resolve_is_idempotent_and_blocks_retrying() {
        let q = queue(10);
        let e = entry(1);
        q.enqueue(&e).unwrap();
        q.resolve(&e.id).unwrap();
        q.resolve(&e.id).unwrap();
        assert!(matches!(
            q.mark_retrying(&e.id),
            Err(DlqError::InvalidTransition { .. })
        ));
        assert!(q.abandon(&e.id).is_err());
    }

    #[test]
    fn replayable_includes_abandoned_on_request() {
        let q = queue(10);
        let p = entry(1);
        let a = entry(2);
        q.enqueue(&p).unwrap();
        q.enqueue(&a).unwrap();
        q.abandon(&a.id).unwrap();

        assert_eq!(q.list_replayable(10, false).unwrap().len(), 1);
        assert_eq!(q.list_replayable(10, true).unwrap().len(), 2);
    }

    #[test]
    fn release_returns_claim_without_counting_retry() {
        let q = queue(10);
        let e = entry(1);
        q.enqueue(&e).unwrap();
        q.mark_retrying(&e.id).unwrap();
        q.release(&e.id).unwrap();
        let got = q.get(&e.id).unwrap();
        assert_eq!(got.status, DlqStatus::Pending);
        assert_eq!(got.retry_count, 0);
        assert!(q.release(&e.id).is_err());
    }

    #[test]
    fn reset_retrying_recovers_interrupted_replays() {
        let q = queue(10);
        let e = entry(1);
        q.enqueue(&e).unwrap();
        q.mark_retrying(&e.id).unwrap();
        assert_eq!(q.reset_retrying().unwrap(), 1);
        assert_eq!(q.get(&e.id).unwrap().status, DlqStatus::Pending);
    }

    #[test]
    fn payload_with_quotes_stored_verbatim() {
        let q = queue(10);
        let mut e = entry(1);
        e.command = vec!["tool".into(), "'; DROP TABLE dead_letters; --".into()];
        q.enqueue(&e).unwrap();
        assert_eq!(q.get(&e.id).unwrap().command, e.command);
        assert_eq!(q.count().unwrap(), 1);
    }

    #[test]
    fn stats_group_by_status() {
        let q = queue(10);
        let a = entry(1);
        let b = entry(2);
        q.enqueue(&a).unwrap();
        q.enqueue(&b).unwrap();
        q.enqueue(&entry(3)).unwrap();
        q.abandon(&a.id).unwrap();
        q.resolve(&b.id).unwrap();
        let stats = q.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DlqConfig {
            path: dir.path().join("dlq.db").to_string_lossy().into_owned(),
            ..DlqConfig::default()
        };
        let e = entry(7);
        {
            let q = DeadLetterQueue::open(&cfg).unwrap();
            q.enqueue(&e).unwrap();
            q.flush().unwrap();
        }
        let q = DeadLetterQueue::open(&cfg).unwrap();
        assert_eq!(q.get(&e.id).unwrap(), e);
    }

    fn reject_inserts(q: &DeadLetterQueue) {
        q.lock()
            .execute_batch(
                "CREATE TRIGGER reject_insert BEFORE INSERT ON dead_letters
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();
    }

    fn accept_inserts(q: &DeadLetterQueue) {
        q.lock()
            .execute_batch("DROP TRIGGER reject_insert")
            .unwrap();
    }

    #[test]
    fn failed_insert_is_backlogged_then_persisted() {
        let q = queue(10);
        reject_inserts(&q);
        let e = entry(1);
        assert!(q.enqueue(&e).is_err());
        assert_eq!(q.count().unwrap(), 0);
        assert_eq!(q.backlog_len(), 1);
        assert_eq!(q.write_failures(), 1);
        assert_eq!(q.stats().unwrap().unpersisted, 1);

        // still failing: the entry stays parked
        assert_eq!(q.retry_backlog(), 0);
        assert_eq!(q.backlog_len(), 1);

        accept_inserts(&q);
        let later = entry(2);
        q.enqueue(&later).unwrap();
        assert_eq!(q.backlog_len(), 0);
        assert_eq!(q.get(&e.id).unwrap(), e);
        let ids: Vec<_> = q.list_pending(10).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![e.id, later.id]);
        assert_eq!(q.dropped_count(), 0);
    }

    #[test]
    fn backlog_overflow_counts_as_dropped() {
        let q = queue(10);
        reject_inserts(&q);
        for m in 0..(BACKLOG_CAPACITY + 3) {
            assert!(q.enqueue(&entry((m % 60) as u32)).is_err());
        }
        assert_eq!(q.backlog_len(), BACKLOG_CAPACITY);
        assert_eq!(q.dropped_count(), 3);
    }

    #[test]
    fn flush_persists_backlog() {
        let q = queue(10);
        reject_inserts(&q);
        let e = entry(4);
        assert!(q.enqueue(&e).is_err());
        accept_inserts(&q);
        q.flush().unwrap();
        assert_eq!(q.backlog_len(), 0);
        assert_eq!(q.get(&e.id).unwrap().status, DlqStatus::Pending);
    }

    #[test]
    fn flush_reports_entries_it_cannot_persist() {
        let q = queue(10);
        reject_inserts(&q);
        assert!(q.enqueue(&entry(4)).is_err());
        assert!(q.enqueue(&entry(5)).is_err());
        assert!(matches!(q.flush(), Err(DlqError::Unpersisted { count: 2 })));
        assert_eq!(q.backlog_len(), 0);
        assert_eq!(q.dropped_count(), 2);
    }

    #[test]
    fn concurrent_enqueues_respect_cap() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;
        let q = queue(10);
        std::thread::scope(|s| {
            for (i, class) in JobClass::ALL.iter().cycle().take(THREADS).enumerate() {
                let q = &q;
                s.spawn(move || {
                    for n in 0..PER_THREAD {
                        let e = DeadLetterEntry::new(
                            &spec(*class),
                            ErrorKind::JobFailure,
                            "exit code 1",
                            0,
                            at(((i * PER_THREAD + n) % 60) as u32),
                        );
                        q.enqueue(&e).unwrap();
                        assert!(q.count().unwrap() <= 10);
                    }
                });
            }
        });
        let remaining = q.count().unwrap();
        assert_eq!(remaining, 10);
        assert_eq!(q.dropped_count() + remaining, (THREADS * PER_THREAD) as u64);
    }

    #[cfg(unix)]
    #[test]
    fn store_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.db");
        let cfg = DlqConfig {
            path: path.to_string_lossy().into_owned(),
            ..DlqConfig::default()
        };
        let _q = DeadLetterQueue::open(&cfg).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
