//! Error types for the migration engine
//!
//! Every failure the engine can report maps onto one variant of
//! [`MigrateError`]. Nothing here is fatal to the process: after a failure the
//! caller can repair the schema and re-run the same operation, or `force` a
//! version.

use std::time::Duration;

use crate::config::ConfigError;
use crate::dialect::Dialect;
use crate::migrations::definitions::MigrationDirection;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Error types for migration operations
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// No script exists for a version/direction/dialect the operation needs
    #[error("No {direction} migration found for version {version} ({dialect})")]
    NotFound {
        version: i64,
        direction: MigrationDirection,
        dialect: Dialect,
    },

    /// Two migration files claim the same version
    #[error("Conflicting migrations for version {version} ({dialect}): '{first}' and '{second}'")]
    Conflict {
        version: u64,
        dialect: Dialect,
        first: String,
        second: String,
    },

    /// A previous run left an incomplete step behind
    #[error("Database is dirty at version {version}: repair the schema, then force a version")]
    DirtyState { version: i64 },

    /// Connection or execution failure reported by the backend
    #[error("Driver error: {message}")]
    Driver { message: String },

    /// The advisory lock was not obtained within the wait bound
    #[error("Migration lock is held by another process (waited {timeout:?})")]
    LockBusy { timeout: Duration },

    /// Dialect name that does not normalize to a supported dialect
    #[error("Unsupported database dialect: {0}")]
    UnsupportedDialect(String),

    /// Caller passed an argument outside the accepted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Migration directory I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or validated
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MigrateError {
    /// Create a driver error
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Check if this error reports a dirty database
    pub fn is_dirty(&self) -> bool {
        matches!(self, MigrateError::DirtyState { .. })
    }

    /// Check if this error reports lock contention
    pub fn is_lock_busy(&self) -> bool {
        matches!(self, MigrateError::LockBusy { .. })
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        MigrateError::Driver {
            message: err.to_string(),
        }
    }
}
