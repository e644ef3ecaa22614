//! MySQL / MariaDB Backend Implementation
//!
//! MySQL commits implicitly before and after most DDL statements, so a
//! migration script cannot be rolled back as a unit. Scripts are executed one
//! statement at a time and execution stops at the first failing statement;
//! statements that ran before it remain applied.

use async_trait::async_trait;
use sqlx::mysql::MySqlConnection;
use sqlx::{Connection as _, Executor as _};

use super::core::{split_statements, Connection, Driver, LockKey};
use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::VersionRecord;

/// MySQL / MariaDB driver backed by sqlx
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDriver;

impl MySqlDriver {
    /// Create a new MySQL driver
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn open(&self, dsn: &str) -> MigrateResult<Box<dyn Connection>> {
        let conn = MySqlConnection::connect(dsn)
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to connect to MySQL: {}", e)))?;

        tracing::debug!("MySQL connection opened");
        Ok(Box::new(MySqlMigrationConnection { conn }))
    }
}

/// A dedicated MySQL connection
pub struct MySqlMigrationConnection {
    conn: MySqlConnection,
}

#[async_trait]
impl Connection for MySqlMigrationConnection {
    async fn execute_script(&mut self, script: &str) -> MigrateResult<()> {
        let statements = split_statements(Dialect::MySql, script);
        let total = statements.len();

        for (index, statement) in statements.iter().enumerate() {
            if let Err(e) = (&mut self.conn).execute(statement.as_str()).await {
                if index > 0 {
                    tracing::warn!(
                        "Statement {} of {} failed; the {} statement(s) before it were committed and are not rolled back",
                        index + 1,
                        total,
                        index
                    );
                }
                return Err(MigrateError::driver(format!(
                    "Statement {} of {} failed: {}",
                    index + 1,
                    total,
                    e
                )));
            }
        }

        Ok(())
    }

    async fn version_table_exists(&mut self, table: &str) -> MigrateResult<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table)
        .fetch_one(&mut self.conn)
        .await?;
        Ok(count > 0)
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
        // Plain DML on InnoDB is transactional even though DDL is not
        let mut transaction = self.conn.begin().await?;

        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *transaction)
            .await?;

        sqlx::query(&format!("INSERT INTO {} (version, dirty) VALUES (?, ?)", table))
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
        // GET_LOCK returns 1 when acquired, 0 on timeout and NULL on error
        let acquired = sqlx::query_scalar::<_, Option<i64>>("SELECT GET_LOCK(?, 0)")
            .bind(key.name())
            .fetch_one(&mut self.conn)
            .await?;

        match acquired {
            Some(1) => Ok(true),
            Some(_) => Ok(false),
            None => Err(MigrateError::driver(format!("GET_LOCK failed for {}", key.name()))),
        }
    }

    async fn unlock(&mut self, key: &LockKey) -> MigrateResult<()> {
        let released = sqlx::query_scalar::<_, Option<i64>>("SELECT RELEASE_LOCK(?)")
            .bind(key.name())
            .fetch_one(&mut self.conn)
            .await?;

        match released {
            Some(1) => Ok(()),
            _ => Err(MigrateError::driver(format!("Named lock {} was not held by this session", key.name()))),
        }
    }

    async fn close(self: Box<Self>) -> MigrateResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| MigrateError::driver(format!("Failed to close MySQL connection: {}", e)))
    }
}

/// SQL to create the control table
pub(crate) fn create_version_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
            version BIGINT NOT NULL,\n    \
            dirty BOOLEAN NOT NULL\n\
        ) ENGINE=InnoDB",
        table
    )
}
