use thiserror::Error;

use crate::types::DlqStatus;

/// Errors that can occur within the dead letter queue.
#[derive(Debug, Error)]
pub enum DlqError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Creating the store directory or tightening file permissions failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No entry with the given ID exists in the store.
    #[error("Entry not found: {id}")]
    EntryNotFound { id: String },

    /// The entry's current status does not allow the requested change.
    #[error("Entry {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: DlqStatus,
        to: DlqStatus,
    },

    /// Entries that never reached the store before shutdown.
    #[error("{count} dead letters could not be persisted")]
    Unpersisted { count: usize },
}

pub type Result<T> = std::result::Result<T, DlqError>;
