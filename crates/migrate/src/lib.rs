//! # elif-migrate: Schema Migrations for elif.rs
//!
//! Applies an ordered, reversible sequence of SQL migration scripts to a
//! PostgreSQL or MySQL/MariaDB database and records the applied version in a
//! single-row control table.
//!
//! Migrations live in one directory as
//! `<version>_<name>.<dialect>.<up|down>.sql` files. A [`MigrationEngine`]
//! brings the database to the newest version (`up`), walks it back (`down`,
//! `steps`), or rebuilds it (`reset`). Before each script runs the control row
//! is marked dirty; it is cleared only once the script succeeds. A dirty
//! database refuses further work until an operator repairs the schema and
//! calls `force`.
//!
//! ## Atomicity differs per dialect
//!
//! PostgreSQL migrations run in a single transaction and roll back completely
//! on failure. MySQL and MariaDB commit DDL implicitly, so a failing script
//! keeps the statements that ran before the failing one. Either way the
//! control table stays dirty at the failing version.
//!
//! ```no_run
//! use elif_migrate::{MigrateConfig, MigrationEngine};
//!
//! # async fn run() -> elif_migrate::MigrateResult<()> {
//! let config = MigrateConfig::from_env()?;
//! let mut engine = MigrationEngine::from_config(&config)?;
//!
//! let result = engine.up().await?;
//! println!("Applied {} migration(s), now at {}", result.applied_count(), result.version);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod dialect;
pub mod error;
pub mod migrations;

// Re-export core traits and types
pub use backends::{driver_for, Connection, Driver, LockKey, MySqlDriver, PostgresDriver};
#[cfg(feature = "memory")]
pub use backends::MemoryDriver;
pub use config::{ConfigError, MigrateConfig, DEFAULT_LOCK_TIMEOUT};
pub use dialect::Dialect;
pub use error::{MigrateError, MigrateResult};
pub use migrations::*;
