//! PostgreSQL Backend Implementation
//!
//! Scripts run inside a single transaction, so a failing migration rolls back
//! completely. The advisory lock is a session-level `pg_advisory_lock`, which
//! PostgreSQL releases on its own if the session ends unexpectedly.

use async_trait::async_trait;
use sqlx::postgres::PgConnection;
use sqlx::{Connection as _, Executor as _};

use super::core::{split_statements, Connection, Driver, LockKey};
use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::VersionRecord;

/// PostgreSQL driver backed by sqlx
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDriver;

impl PostgresDriver {
    /// Create a new PostgreSQL driver
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn open(&self, dsn: &str) -> MigrateResult<Box<dyn Connection>> {
        let conn = PgConnection::connect(dsn)
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to connect to PostgreSQL: {}", e)))?;

        tracing::debug!("PostgreSQL connection opened");
        Ok(Box::new(PostgresConnection { conn }))
    }
}

/// A dedicated PostgreSQL connection
pub struct PostgresConnection {
    conn: PgConnection,
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn execute_script(&mut self, script: &str) -> MigrateResult<()> {
        if split_statements(Dialect::Postgres, script).is_empty() {
            tracing::debug!("Skipping empty migration script");
            return Ok(());
        }

        let mut transaction = self
            .conn
            .begin()
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to start transaction: {}", e)))?;

        // A plain string runs over the simple query protocol, which accepts
        // several statements at once
        let outcome = (&mut *transaction).execute(script).await;
        if let Err(e) = outcome {
            if let Err(rollback_err) = transaction.rollback().await {
                tracing::warn!("Failed to roll back migration transaction: {}", rollback_err);
            }
            return Err(MigrateError::driver(format!("Migration script failed: {}", e)));
        }

        transaction
            .commit()
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to commit migration: {}", e)))?;
        Ok(())
    }

    async fn version_table_exists(&mut self, table: &str) -> MigrateResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&mut self.conn)
        .await?;
        Ok(exists)
    }

    async fn create_version_table(&mut self, table: &str) -> MigrateResult<()> {
        sqlx::query(&create_version_table_sql(table))
            .execute(&mut self.conn)
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to create migrations table: {}", e)))?;
        Ok(())
    }

    async fn read_version(&mut self, table: &str) -> MigrateResult<Option<VersionRecord>> {
        let row = sqlx::query_as::<_, (i64, bool)>(&format!("SELECT version, dirty FROM {} LIMIT 1", table))
            .fetch_optional(&mut self.conn)
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to read migration version: {}", e)))?;
        Ok(row.map(|(version, dirty)| VersionRecord::new(version, dirty)))
    }

    async fn write_version(&mut self, table: &str, record: VersionRecord) -> MigrateResult<()> {
        let mut transaction = self.conn.begin().await?;

        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *transaction)
            .await?;

        sqlx::query(&format!("INSERT INTO {} (version, dirty) VALUES ($1, $2)", table))
            .bind(record.version)
            .bind(record.dirty)
            .execute(&mut *transaction)
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to record migration version: {}", e)))?;

        transaction
            .commit()
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to commit migration version: {}", e)))?;
        Ok(())
    }

    async fn try_lock(&mut self, key: &LockKey) -> MigrateResult<bool> {
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(key.id())
            .fetch_one(&mut self.conn)
            .await?;
        Ok(acquired)
    }

    async fn unlock(&mut self, key: &LockKey) -> MigrateResult<()> {
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key.id())
            .fetch_one(&mut self.conn)
            .await?;

        if released {
            Ok(())
        } else {
            Err(MigrateError::driver(format!("Advisory lock {} was not held by this session", key.id())))
        }
    }

    async fn close(self: Box<Self>) -> MigrateResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to close PostgreSQL connection: {}", e)))
    }
}

/// SQL to create the control table
pub(crate) fn create_version_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
            version BIGINT NOT NULL,\n    \
            dirty BOOLEAN NOT NULL\n\
        )",
        table
    )
}
