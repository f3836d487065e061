//! Error types for cairn operations.
//!
//! Errors are split the way the sync pipeline needs them:
//!
//! - **`Error`**: failures that abort their own unit of work (a migration, a
//!   dependency insert, a sync pass)
//! - **`ParseError`** (in [`crate::sync`]): per-item flat-file problems that are
//!   collected and reported while the rest of the file keeps syncing

use crate::domain::IssueId;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// The error type for cairn operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization error (snapshot files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File watcher could not be set up.
    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// No `.cairn/` directory in the working directory or any parent.
    #[error("not a cairn workspace (or any parent directory); run 'cairn init' first")]
    NotInitialized,

    /// Malformed input fields.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Adding the edge would close a cycle in the dependency graph.
    #[error("dependency {issue} -> {depends_on} would create a cycle")]
    CycleDetected {
        /// The issue that would gain the dependency
        issue: IssueId,
        /// The issue it would depend on
        depends_on: IssueId,
    },

    /// An issue cannot depend on itself.
    #[error("issue {0} cannot depend on itself")]
    SelfDependency(IssueId),

    /// Unknown issue or dependency.
    #[error("not found: {0}")]
    NotFound(String),

    /// Both representations changed the same fields differently.
    #[error("{count} sync conflict(s) need manual resolution")]
    ConflictDetected {
        /// Number of conflicting fields
        count: usize,
    },

    /// No connection became available before the timeout.
    #[error("connection pool exhausted after waiting {timeout:?}")]
    PoolExhausted {
        /// How long the caller waited
        timeout: Duration,
    },

    /// `begin` was called on a handle that already has an open transaction.
    #[error("a transaction is already in progress on this connection")]
    TransactionInProgress,

    /// Migration versions are not a gap-free increasing sequence.
    #[error("migration sequence error: {0}")]
    MigrationSequence(String),

    /// An applied migration no longer matches its definition.
    #[error("checksum mismatch for applied migration {version}: recorded {recorded}, definition {actual}")]
    MigrationChecksumMismatch {
        /// Version of the edited migration
        version: u32,
        /// Checksum stored in the history table
        recorded: String,
        /// Checksum of the current definition
        actual: String,
    },

    /// A migration statement failed; the migration was rolled back.
    #[error("migration {version} failed: {source}")]
    MigrationFailed {
        /// Version that failed
        version: u32,
        /// Underlying database error
        #[source]
        source: rusqlite::Error,
    },

    /// The operation was cancelled before it could finish.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns `true` if retrying the same call later may succeed.
    ///
    /// Pool exhaustion and SQLite lock contention are transient; callers are
    /// expected to back off and retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// A specialized Result type for cairn operations.
pub type Result<T> = std::result::Result<T, Error>;
