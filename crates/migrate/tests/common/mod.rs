//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use elif_migrate::{Dialect, MemoryDriver, MigrationEngine, MigrationSource};
use tempfile::TempDir;

/// A migration directory plus an in-memory database
pub struct Fixture {
    pub dir: TempDir,
    pub driver: MemoryDriver,
    pub dialect: Dialect,
}

impl Fixture {
    pub fn new(dialect: Dialect) -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().unwrap(),
            driver: MemoryDriver::new(dialect),
            dialect,
        }
    }

    /// Write an Up/Down pair for this fixture's dialect
    pub fn add(&self, version: u64, name: &str, up: &str, down: &str) -> &Self {
        self.add_up(version, name, up);
        self.add_down(version, name, down);
        self
    }

    pub fn add_up(&self, version: u64, name: &str, script: &str) {
        self.write(version, name, "up", script);
    }

    pub fn add_down(&self, version: u64, name: &str, script: &str) {
        self.write(version, name, "down", script);
    }

    /// Write a table-creating migration named after the table
    pub fn add_table(&self, version: u64, table: &str) -> &Self {
        self.add(
            version,
            &format!("create_{}", table),
            &format!("CREATE TABLE {} (id BIGINT PRIMARY KEY);", table),
            &format!("DROP TABLE {};", table),
        )
    }

    fn write(&self, version: u64, name: &str, direction: &str, script: &str) {
        let file = format!("{}_{}.{}.{}.sql", version, name, self.dialect.as_str(), direction);
        fs::write(self.dir.path().join(file), script).unwrap();
    }

    pub fn engine(&self) -> MigrationEngine {
        MigrationEngine::new(
            Arc::new(self.driver.clone()),
            "memory://migrate-tests",
            MigrationSource::new(self.dir.path()),
        )
        .unwrap()
        .with_lock_timeout(Duration::from_millis(200))
        .with_lock_poll_interval(Duration::from_millis(10))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("elif_migrate=debug")
        .with_test_writer()
        .try_init();
}
