//! Migration Engine - Executes migrations against the database
//!
//! The engine owns a driver, a migration source and a version store. Every
//! mutating operation opens one dedicated connection, takes the advisory lock
//! keyed on the control table, does its work strictly in version order and
//! releases the lock and connection on every exit path.
//!
//! Each step follows the same protocol: write `(v, dirty = true)`, run the
//! script, write the resulting clean version. A failure leaves the dirty
//! record behind and aborts the operation; later steps are never attempted.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::definitions::{
    AppliedStep, EngineState, MigrationDirection, MigrationFile, MigrationRunResult, MigrationStatus,
    MigrationStatusEntry, VersionRecord, NIL_VERSION,
};
use super::source::{MigrationSet, MigrationSource};
use super::version_store::VersionStore;
use crate::backends::{driver_for, Connection, Driver, LockKey};
use crate::config::MigrateConfig;
use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};

/// Interval between two attempts to take a busy advisory lock
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Work done under one lock acquisition
#[derive(Debug, Clone, Copy)]
enum Operation {
    Up { limit: Option<usize> },
    Down { limit: Option<usize> },
    Reset,
    Force(i64),
}

/// Migration engine bound to one database and one migration directory
pub struct MigrationEngine {
    driver: Arc<dyn Driver>,
    dsn: String,
    source: MigrationSource,
    store: VersionStore,
    lock_key: LockKey,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
    state: EngineState,
}

impl MigrationEngine {
    /// Create an engine using the default control table and lock timeout
    pub fn new(driver: Arc<dyn Driver>, dsn: impl Into<String>, source: MigrationSource) -> MigrateResult<Self> {
        let store = VersionStore::new(super::definitions::DEFAULT_MIGRATIONS_TABLE)?;
        let lock_key = LockKey::for_table(store.table());

        Ok(Self {
            driver,
            dsn: dsn.into(),
            source,
            store,
            lock_key,
            lock_timeout: crate::config::DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            state: EngineState::Idle,
        })
    }

    /// Create an engine for the configured database with the matching sqlx driver
    pub fn from_config(config: &MigrateConfig) -> MigrateResult<Self> {
        config.validate()?;

        tracing::debug!(
            "Creating migration engine for {} ({})",
            crate::config::redact_dsn(&config.database_url),
            config.dialect
        );

        Ok(Self::new(
            driver_for(config.dialect),
            config.database_url.clone(),
            MigrationSource::new(&config.migrations_dir),
        )?
        .with_migrations_table(config.migrations_table.clone())?
        .with_lock_timeout(config.lock_timeout))
    }

    /// Use a different control table; the lock key follows the table name
    pub fn with_migrations_table(mut self, table: impl Into<String>) -> MigrateResult<Self> {
        self.store = VersionStore::new(table)?;
        self.lock_key = LockKey::for_table(self.store.table());
        Ok(self)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.driver.dialect()
    }

    pub fn source(&self) -> &MigrationSource {
        &self.source
    }

    pub fn migrations_table(&self) -> &str {
        self.store.table()
    }

    pub fn lock_key(&self) -> &LockKey {
        &self.lock_key
    }

    /// State as of the last operation
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Apply every pending migration in ascending version order
    pub async fn up(&mut self) -> MigrateResult<MigrationRunResult> {
        self.run(Operation::Up { limit: None }).await
    }

    /// Revert applied migrations, most recent first
    ///
    /// `n == -1` reverts everything; `n >= 1` reverts at most `n` versions.
    pub async fn down(&mut self, n: i64) -> MigrateResult<MigrationRunResult> {
        let limit = match n {
            -1 => None,
            n if n >= 1 => Some(to_limit(n)),
            n => {
                return Err(MigrateError::invalid_argument(format!(
                    "down expects -1 (all) or a positive count, got {}",
                    n
                )))
            }
        };
        self.run(Operation::Down { limit }).await
    }

    /// Apply (`n > 0`) or revert (`n < 0`) at most `|n|` migrations
    pub async fn steps(&mut self, n: i64) -> MigrateResult<MigrationRunResult> {
        let operation = match n {
            0 => return Err(MigrateError::invalid_argument("steps expects a non-zero count")),
            n if n > 0 => Operation::Up { limit: Some(to_limit(n)) },
            n => Operation::Down {
                limit: Some(to_limit(n.unsigned_abs())),
            },
        };
        self.run(operation).await
    }

    /// Revert everything, then apply everything, under a single lock
    pub async fn reset(&mut self) -> MigrateResult<MigrationRunResult> {
        self.run(Operation::Reset).await
    }

    /// Record `version` as applied and clean without running any script
    ///
    /// This is the way out of a dirty state once the schema has been repaired
    /// by hand.
    pub async fn force(&mut self, version: i64) -> MigrateResult<MigrationRunResult> {
        if version < NIL_VERSION {
            return Err(MigrateError::invalid_argument(format!(
                "cannot force version {}; use -1 for no migrations",
                version
            )));
        }
        self.run(Operation::Force(version)).await
    }

    /// Read the control record without locking or creating anything
    pub async fn current(&mut self) -> MigrateResult<VersionRecord> {
        let mut conn = self.driver.open(&self.dsn).await?;
        let outcome = self.store.current(conn.as_mut()).await;
        self.close_quietly(conn).await;

        let record = outcome?;
        self.state = EngineState::from_record(record);
        Ok(record)
    }

    /// Every known version with its applied flag
    pub async fn status(&mut self) -> MigrateResult<MigrationStatus> {
        let set = self.source.load(self.dialect())?;
        let current = self.current().await?;

        let entries = set
            .entries()
            .map(|entry| MigrationStatusEntry {
                version: entry.version,
                name: entry.name.clone(),
                applied: (entry.version as i64) <= current.version,
                has_up: entry.up.is_some(),
                has_down: entry.down.is_some(),
            })
            .collect();

        Ok(MigrationStatus { current, entries })
    }

    async fn run(&mut self, operation: Operation) -> MigrateResult<MigrationRunResult> {
        let start_time = Instant::now();
        let mut conn = self.driver.open(&self.dsn).await?;

        if let Err(e) = self.acquire_lock(conn.as_mut()).await {
            self.release(conn, false).await;
            return Err(e);
        }

        let mut steps = Vec::new();
        let outcome = self.execute(conn.as_mut(), operation, &mut steps).await;
        let warnings = self.release(conn, true).await;

        let version = outcome?;
        Ok(MigrationRunResult {
            steps,
            version,
            execution_time_ms: start_time.elapsed().as_millis(),
            warnings,
        })
    }

    async fn acquire_lock(&self, conn: &mut dyn Connection) -> MigrateResult<()> {
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            if conn.try_lock(&self.lock_key).await? {
                tracing::debug!("Acquired migration lock {}", self.lock_key.name());
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(MigrateError::LockBusy {
                    timeout: self.lock_timeout,
                });
            }

            tracing::debug!("Migration lock {} is busy, retrying", self.lock_key.name());
            tokio::time::sleep(self.lock_poll_interval).await;
        }
    }

    /// Unlock and close, returning what went wrong along the way
    async fn release(&self, mut conn: Box<dyn Connection>, locked: bool) -> Vec<String> {
        let mut warnings = Vec::new();

        if locked {
            if let Err(e) = conn.unlock(&self.lock_key).await {
                warnings.push(format!("Failed to release migration lock: {}", e));
            }
        }
        if let Err(e) = conn.close().await {
            warnings.push(format!("Failed to close database connection: {}", e));
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        warnings
    }

    async fn close_quietly(&self, conn: Box<dyn Connection>) {
        if let Err(e) = conn.close().await {
            tracing::warn!("Failed to close database connection: {}", e);
        }
    }

    async fn execute(
        &mut self,
        conn: &mut dyn Connection,
        operation: Operation,
        steps: &mut Vec<AppliedStep>,
    ) -> MigrateResult<VersionRecord> {
        self.store.ensure_initialized(conn).await?;
        let current = self.store.current(conn).await?;
        self.state = EngineState::from_record(current);

        if let Operation::Force(version) = operation {
            let record = VersionRecord::clean(version);
            self.store.set_version(conn, record).await?;
            self.state = EngineState::Idle;
            tracing::info!("Forced migration version to {} (was {})", version, current);
            return Ok(record);
        }

        if self.state.is_dirty() {
            return Err(MigrateError::DirtyState {
                version: current.version,
            });
        }

        let set = self.source.load(self.dialect())?;
        tracing::debug!("Loaded {} migration version(s) from {}", set.len(), self.source.dir().display());

        match operation {
            Operation::Up { limit } => self.apply(conn, &set, current, limit, steps).await,
            Operation::Down { limit } => self.revert(conn, &set, current, limit, steps).await,
            Operation::Reset => {
                let reverted = self.revert(conn, &set, current, None, steps).await?;
                self.apply(conn, &set, reverted, None, steps).await
            }
            Operation::Force(_) => Ok(current),
        }
    }

    async fn apply(
        &mut self,
        conn: &mut dyn Connection,
        set: &MigrationSet,
        from: VersionRecord,
        limit: Option<usize>,
        steps: &mut Vec<AppliedStep>,
    ) -> MigrateResult<VersionRecord> {
        let pending = set.pending(from.version, limit)?;
        if pending.is_empty() {
            tracing::info!("No pending migrations (current version {})", from);
            return Ok(from);
        }

        let mut current = from;
        for file in pending {
            let (record, step) = self.run_step(conn, file, file.record_version()).await?;
            current = record;
            steps.push(step);
        }
        Ok(current)
    }

    async fn revert(
        &mut self,
        conn: &mut dyn Connection,
        set: &MigrationSet,
        from: VersionRecord,
        limit: Option<usize>,
        steps: &mut Vec<AppliedStep>,
    ) -> MigrateResult<VersionRecord> {
        let applied = set.applied(from.version, limit)?;
        if applied.is_empty() {
            tracing::info!("No migrations to roll back");
            return Ok(from);
        }

        let mut current = from;
        for file in applied {
            let target = set.previous_version(file.version);
            let (record, step) = self.run_step(conn, file, target).await?;
            current = record;
            steps.push(step);
        }
        Ok(current)
    }

    /// Run one script, leaving the control table at `target` when it succeeds
    async fn run_step(
        &mut self,
        conn: &mut dyn Connection,
        file: &MigrationFile,
        target: i64,
    ) -> MigrateResult<(VersionRecord, AppliedStep)> {
        let version = file.record_version();
        let start_time = Instant::now();

        match file.direction {
            MigrationDirection::Up => {
                tracing::info!("Applying migration: {} - {}", file.version, file.name);
                self.state = EngineState::Applying(file.version);
            }
            MigrationDirection::Down => {
                tracing::info!("Rolling back migration: {} - {}", file.version, file.name);
                self.state = EngineState::Reverting(file.version);
            }
        }

        if let Err(e) = self.store.set_version(conn, VersionRecord::in_progress(version)).await {
            self.state = EngineState::Idle;
            return Err(e);
        }

        if let Err(e) = conn.execute_script(&file.script).await {
            tracing::error!("Migration {} failed: {}", file.file_name(), e);
            self.state = EngineState::Dirty(version);
            return Err(e);
        }

        let record = VersionRecord::clean(target);
        if let Err(e) = self.store.set_version(conn, record).await {
            self.state = EngineState::Dirty(version);
            return Err(e);
        }
        self.state = EngineState::Idle;

        let step = AppliedStep {
            version: file.version,
            name: file.name.clone(),
            direction: file.direction,
            execution_time_ms: start_time.elapsed().as_millis(),
        };
        tracing::info!("Migration {} ({}) completed in {}ms", file.version, file.direction, step.execution_time_ms);

        Ok((record, step))
    }
}

fn to_limit(n: impl TryInto<usize>) -> usize {
    n.try_into().unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryDriver;
    use std::fs;
    use tempfile::TempDir;

    fn engine_with(driver: &MemoryDriver, dir: &TempDir) -> MigrationEngine {
        MigrationEngine::new(Arc::new(driver.clone()), "memory://test", MigrationSource::new(dir.path()))
            .unwrap()
            .with_lock_timeout(Duration::from_millis(50))
            .with_lock_poll_interval(Duration::from_millis(5))
    }

    fn write_pair(dir: &TempDir, version: u64, name: &str, up: &str, down: &str) {
        fs::write(dir.path().join(format!("{}_{}.postgres.up.sql", version, name)), up).unwrap();
        fs::write(dir.path().join(format!("{}_{}.postgres.down.sql", version, name)), down).unwrap();
    }

    #[tokio::test]
    async fn test_invalid_counts_are_rejected_before_connecting() {
        let temp_dir = TempDir::new().unwrap();
        let driver = MemoryDriver::new(Dialect::Postgres);
        driver.set_unreachable(true);
        let mut engine = engine_with(&driver, &temp_dir);

        assert!(matches!(engine.down(0).await, Err(MigrateError::InvalidArgument(_))));
        assert!(matches!(engine.down(-2).await, Err(MigrateError::InvalidArgument(_))));
        assert!(matches!(engine.steps(0).await, Err(MigrateError::InvalidArgument(_))));
        assert!(matches!(engine.force(-2).await, Err(MigrateError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_state_follows_the_control_record() {
        let temp_dir = TempDir::new().unwrap();
        write_pair(&temp_dir, 100, "users", "CREATE TABLE users (id INT);", "DROP TABLE users;");
        write_pair(&temp_dir, 200, "broken", "CREATE TABLE broken_table (id INT);", "DROP TABLE broken_table;");

        let driver = MemoryDriver::new(Dialect::Postgres);
        driver.fail_statements_containing("broken_table");
        let mut engine = engine_with(&driver, &temp_dir);
        assert_eq!(engine.state(), EngineState::Idle);

        assert!(engine.up().await.is_err());
        assert_eq!(engine.state(), EngineState::Dirty(200));

        engine.force(100).await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_lock_is_released_after_each_operation() {
        let temp_dir = TempDir::new().unwrap();
        write_pair(&temp_dir, 100, "users", "CREATE TABLE users (id INT);", "DROP TABLE users;");

        let driver = MemoryDriver::new(Dialect::Postgres);
        let mut engine = engine_with(&driver, &temp_dir);

        engine.up().await.unwrap();
        assert_eq!(driver.held_locks(), 0);
        assert_eq!(driver.open_connections(), 0);

        engine.down(-1).await.unwrap();
        assert_eq!(driver.held_locks(), 0);
        assert_eq!(driver.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_custom_table_changes_lock_key() {
        let temp_dir = TempDir::new().unwrap();
        let driver = MemoryDriver::new(Dialect::Postgres);
        let engine = engine_with(&driver, &temp_dir).with_migrations_table("app_versions").unwrap();

        assert_eq!(engine.migrations_table(), "app_versions");
        assert_eq!(engine.lock_key(), &LockKey::for_table("app_versions"));
        assert_ne!(engine.lock_key(), &LockKey::for_table(crate::migrations::DEFAULT_MIGRATIONS_TABLE));
        assert!(engine_with(&driver, &temp_dir).with_migrations_table("bad name").is_err());
    }

    #[test]
    fn test_from_config_picks_dialect_driver() {
        let config = MigrateConfig::new("mysql://root@localhost/app", Dialect::MySql);
        let engine = MigrationEngine::from_config(&config).unwrap();
        assert_eq!(engine.dialect(), Dialect::MySql);

        let config = MigrateConfig::new("postgres://localhost/app", Dialect::Postgres).with_migrations_table("x y");
        assert!(MigrationEngine::from_config(&config).is_err());
    }
}
