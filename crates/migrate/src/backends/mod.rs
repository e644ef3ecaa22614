//! Database Backend Abstractions
//!
//! This module provides the driver abstraction the engine runs against, with
//! sqlx-backed PostgreSQL and MySQL implementations and an in-memory one.

use std::sync::Arc;

use crate::dialect::Dialect;

pub mod core;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod mysql;
pub mod postgres;

// Re-export core traits and types
pub use self::core::*;
#[cfg(any(test, feature = "memory"))]
pub use memory::{MemoryConnection, MemoryDriver};
pub use mysql::{MySqlDriver, MySqlMigrationConnection};
pub use postgres::{PostgresConnection, PostgresDriver};

/// The sqlx driver for a dialect
pub fn driver_for(dialect: Dialect) -> Arc<dyn Driver> {
    match dialect {
        Dialect::Postgres => Arc::new(PostgresDriver::new()),
        Dialect::MySql => Arc::new(MySqlDriver::new()),
    }
}
