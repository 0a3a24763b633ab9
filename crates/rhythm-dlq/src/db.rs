use rusqlite::Connection;

use crate::error::Result;

/// Initialise the dead letter schema in `conn`.
///
/// Creates the `dead_letters` table (idempotent) plus the indexes used by the
/// oldest-first listing and the purge queries.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS dead_letters (
            id              TEXT    NOT NULL PRIMARY KEY,   -- UUIDv7
            job_class       TEXT    NOT NULL,
            command         TEXT    NOT NULL,   -- JSON array, redacted argv
            timeout_ms      INTEGER NOT NULL,
            error_kind      TEXT    NOT NULL,
            error_detail    TEXT    NOT NULL,   -- redacted
            first_failed_at TEXT    NOT NULL,   -- RFC-3339, UTC, fixed width
            last_failed_at  TEXT    NOT NULL,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            status          TEXT    NOT NULL DEFAULT 'pending',
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- Oldest-first scans per status (listing, replay, purge)
        CREATE INDEX IF NOT EXISTS idx_dead_letters_status_age
            ON dead_letters (status, first_failed_at);
        ",
    )?;
    Ok(())
}
