//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the fundamental types used throughout the migration system:
//! migration files, the persisted version record, run results and the
//! engine state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::dialect::Dialect;

/// Version recorded when no migration has been applied
pub const NIL_VERSION: i64 = -1;

/// Reserved name of the control table; application migrations must not use it
pub const DEFAULT_MIGRATIONS_TABLE: &str = "elif_schema_migrations";

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Apply the migration (run UP script)
    Up,
    /// Rollback the migration (run DOWN script)
    Down,
}

impl MigrationDirection {
    /// Suffix used in migration file names
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationDirection::Up => "up",
            MigrationDirection::Down => "down",
        }
    }
}

impl std::fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One migration script on disk, for one version, dialect and direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// Unique, monotonically increasing version (microsecond timestamp)
    pub version: u64,
    /// Human-readable name from the file name
    pub name: String,
    pub dialect: Dialect,
    pub direction: MigrationDirection,
    /// SQL body executed for this version in this direction
    pub script: String,
    pub path: PathBuf,
}

impl MigrationFile {
    /// The version as stored in the control table
    pub fn record_version(&self) -> i64 {
        // Versions above i64::MAX are rejected when the directory is read
        self.version as i64
    }

    /// File name without directory
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}_{}", self.version, self.name))
    }
}

/// The single row of the control table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Applied (or in-progress, when dirty) version; -1 when nothing is applied
    pub version: i64,
    /// The last attempted step did not complete
    pub dirty: bool,
}

impl VersionRecord {
    pub fn new(version: i64, dirty: bool) -> Self {
        Self { version, dirty }
    }

    /// The initial record: nothing applied, clean
    pub fn nil() -> Self {
        Self::new(NIL_VERSION, false)
    }

    /// Record written before a step's script runs
    pub fn in_progress(version: i64) -> Self {
        Self::new(version, true)
    }

    /// Record written after a step's script succeeded
    pub fn clean(version: i64) -> Self {
        Self::new(version, false)
    }

    /// Whether no migration has been applied
    pub fn is_nil(&self) -> bool {
        self.version == NIL_VERSION
    }
}

impl Default for VersionRecord {
    fn default() -> Self {
        Self::nil()
    }
}

impl std::fmt::Display for VersionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dirty {
            write!(f, "{} (dirty)", self.version)
        } else {
            write!(f, "{}", self.version)
        }
    }
}

/// One completed step of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedStep {
    pub version: u64,
    pub name: String,
    pub direction: MigrationDirection,
    pub execution_time_ms: u128,
}

/// Result of an engine operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRunResult {
    /// Steps that completed, in execution order
    pub steps: Vec<AppliedStep>,
    /// Control table contents when the operation finished
    pub version: VersionRecord,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
    /// Failures releasing the lock or connection after the work succeeded
    pub warnings: Vec<String>,
}

impl MigrationRunResult {
    /// Number of migrations that were applied
    pub fn applied_count(&self) -> usize {
        self.count(MigrationDirection::Up)
    }

    /// Number of migrations that were rolled back
    pub fn rolled_back_count(&self) -> usize {
        self.count(MigrationDirection::Down)
    }

    /// Whether no script ran
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    fn count(&self, direction: MigrationDirection) -> usize {
        self.steps.iter().filter(|step| step.direction == direction).count()
    }
}

/// Status of one known migration version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatusEntry {
    pub version: u64,
    pub name: String,
    pub applied: bool,
    pub has_up: bool,
    pub has_down: bool,
}

/// Applied/pending overview for every migration in the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub current: VersionRecord,
    pub entries: Vec<MigrationStatusEntry>,
}

impl MigrationStatus {
    /// Entries not yet applied
    pub fn pending(&self) -> impl Iterator<Item = &MigrationStatusEntry> {
        self.entries.iter().filter(|entry| !entry.applied)
    }
}

/// Lifecycle state of the migration engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// No step in progress and the database is clean
    Idle,
    /// Running the Up script of a version
    Applying(u64),
    /// Running the Down script of a version
    Reverting(u64),
    /// The control table reports an incomplete step at this version
    Dirty(i64),
}

impl EngineState {
    /// State implied by a freshly loaded control record
    pub fn from_record(record: VersionRecord) -> Self {
        if record.dirty {
            EngineState::Dirty(record.version)
        } else {
            EngineState::Idle
        }
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, EngineState::Dirty(_))
    }
}
