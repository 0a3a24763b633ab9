//! Datastore connectivity probes.

use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};

/// A trivial read-only connectivity check against the domain datastore.
///
/// The monitor wraps every call in its own timeout, so implementations do not
/// need to bound themselves.
#[async_trait]
pub trait DatastoreProbe: Send + Sync {
    async fn probe(&self) -> Result<(), String>;
}

/// Runs `SELECT 1` against a SQLite datastore opened read-only.
pub struct SqliteProbe {
    path: PathBuf,
}

impl SqliteProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DatastoreProbe for SqliteProbe {
    async fn probe(&self) -> Result<(), String> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| format!("open {}: {e}", path.display()))?;
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
                .map(|_| ())
                .map_err(|e| format!("SELECT 1 failed: {e}"))
        })
        .await
        .map_err(|e| format!("probe task failed: {e}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_database_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wh.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER);")
            .unwrap();
        assert!(SqliteProbe::new(&path).probe().await.is_ok());
    }

    #[tokio::test]
    async fn missing_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SqliteProbe::new(dir.path().join("absent.db"));
        assert!(probe.probe().await.is_err());
    }
}
