//! Version Store - Persists the applied version inside the target database
//!
//! The control table holds exactly one row `(version, dirty)`. Before a
//! step's script runs the row is set to `(v, true)`; only after the script
//! succeeds is it set to the resulting clean version. A process that dies
//! mid-script therefore leaves `dirty = true` at the in-progress version.

use super::definitions::VersionRecord;
use crate::backends::Connection;
use crate::config::is_valid_identifier;
use crate::error::{MigrateError, MigrateResult};

/// Reads and writes the control row through a borrowed connection
#[derive(Debug, Clone)]
pub struct VersionStore {
    table: String,
}

impl VersionStore {
    /// Create a store for a control table; the name must be a plain identifier
    pub fn new(table: impl Into<String>) -> MigrateResult<Self> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(MigrateError::invalid_argument(format!(
                "'{}' is not a valid migrations table name",
                table
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the control table and its initial `(-1, false)` row if missing
    pub async fn ensure_initialized(&self, conn: &mut dyn Connection) -> MigrateResult<()> {
        if !conn.version_table_exists(&self.table).await? {
            tracing::info!("Creating migrations table {}", self.table);
            conn.create_version_table(&self.table).await?;
        }

        if conn.read_version(&self.table).await?.is_none() {
            conn.write_version(&self.table, VersionRecord::nil()).await?;
        }

        Ok(())
    }

    /// Current record; `(-1, false)` when the table has not been created yet
    pub async fn current(&self, conn: &mut dyn Connection) -> MigrateResult<VersionRecord> {
        if !conn.version_table_exists(&self.table).await? {
            return Ok(VersionRecord::nil());
        }
        Ok(conn.read_version(&self.table).await?.unwrap_or_default())
    }

    /// Replace the record; durable once this returns
    pub async fn set_version(&self, conn: &mut dyn Connection, record: VersionRecord) -> MigrateResult<()> {
        tracing::debug!("Setting migration version to {}", record);
        conn.write_version(&self.table, record).await
    }
}
