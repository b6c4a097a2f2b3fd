//! # Error Handling
//!
//! Error taxonomy for the mirror engine. Per-record failures never surface
//! here; they are absorbed by the asset synchronizer and recorded. What
//! reaches [`MirrorError`] aborts a phase or a whole cycle.

use std::path::PathBuf;

use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;
use uuid::Uuid;

use crate::file_mirror::PathError;
use crate::schema::SchemaViolations;

/// Errors raised by engine phases.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },
    #[error(transparent)]
    Schema(#[from] SchemaViolations),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("filesystem operation failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("phase '{phase}' exceeded its {seconds}s timeout")]
    Timeout { phase: &'static str, seconds: u64 },
    #[error("sync cycle cancelled")]
    Cancelled,
    #[error("source asset {0} disappeared before it could be mirrored")]
    SourceVanished(Uuid),
    #[error("target path '{path}' is already mirrored from another source")]
    TargetOccupied { path: String },
    #[error("sync job '{job}' references invalid data: {reason}")]
    JobReference { job: String, reason: String },
}

impl MirrorError {
    /// True when the underlying database error is a unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Database { source, .. } if is_unique_violation(source))
    }
}

/// Attach a short context string to a database error.
pub fn map_db_err(context: &'static str, err: DbErr) -> MirrorError {
    MirrorError::Database {
        context,
        source: err,
    }
}

/// Postgres reports unique violations as SQLSTATE 23505.
pub fn is_unique_violation(error: &DbErr) -> bool {
    const PG_UNIQUE: &str = "23505";

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    db_error.is_unique_violation() || db_error.code().as_deref() == Some(PG_UNIQUE)
}
