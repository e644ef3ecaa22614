//! Core Database Backend Traits
//!
//! These traits abstract the database-specific parts of the migration engine:
//! opening a connection, executing a migration script, reading and writing the
//! control table, and the advisory lock that serializes engine invocations.
//!
//! # Atomicity of scripts
//!
//! [`Connection::execute_script`] does **not** give the same guarantee on every
//! backend:
//!
//! - PostgreSQL runs the whole script in one transaction. A failing script
//!   leaves no trace.
//! - MySQL and MariaDB commit implicitly around DDL. The script is executed
//!   statement by statement and stops at the first failure; statements before
//!   it stay applied.
//!
//! In both cases the engine leaves the control table dirty at the failing
//! version, so an operator has to inspect the schema before forcing a version.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlparser::dialect::{Dialect as SqlParserDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::dialect::Dialect;
use crate::error::MigrateResult;
use crate::migrations::definitions::VersionRecord;

/// Opens connections to one kind of database
#[async_trait]
pub trait Driver: Send + Sync {
    /// Dialect every connection from this driver speaks
    fn dialect(&self) -> Dialect;

    /// Open a dedicated connection; fails with a driver error when the DSN is
    /// malformed or the server is unreachable
    async fn open(&self, dsn: &str) -> MigrateResult<Box<dyn Connection>>;
}

/// A single connection used for the duration of one engine operation
///
/// Connections are never shared between operations. Dropping a connection
/// without calling [`close`](Connection::close) still ends the session, which
/// releases any session-scoped advisory lock it held.
#[async_trait]
pub trait Connection: Send {
    /// Run a migration script; see the module docs for atomicity per dialect
    async fn execute_script(&mut self, script: &str) -> MigrateResult<()>;

    /// Whether the control table exists
    async fn version_table_exists(&mut self, table: &str) -> MigrateResult<bool>;

    /// Create the control table if it does not exist
    async fn create_version_table(&mut self, table: &str) -> MigrateResult<()>;

    /// Read the control row, `None` when the table holds no row
    async fn read_version(&mut self, table: &str) -> MigrateResult<Option<VersionRecord>>;

    /// Replace the control row; committed before this returns
    async fn write_version(&mut self, table: &str, record: VersionRecord) -> MigrateResult<()>;

    /// Try to take the advisory lock without waiting
    async fn try_lock(&mut self, key: &LockKey) -> MigrateResult<bool>;

    /// Release the advisory lock held by this connection
    async fn unlock(&mut self, key: &LockKey) -> MigrateResult<()>;

    /// Close the connection
    async fn close(self: Box<Self>) -> MigrateResult<()>;
}

/// Identifier of the advisory lock guarding one control table
///
/// PostgreSQL advisory locks are keyed by a 64-bit integer, MySQL named locks
/// by a string of at most 64 characters; both are derived from the same
/// digest so every engine pointed at the same table contends for the same lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    id: i64,
    name: String,
}

impl LockKey {
    /// Derive the lock for a control table
    pub fn for_table(table: &str) -> Self {
        let digest = Sha256::digest(format!("elif-migrate:{}", table).as_bytes());

        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&digest[..8]);
        let id = i64::from_be_bytes(id_bytes);

        let hex: String = digest[..8].iter().map(|byte| format!("{:02x}", byte)).collect();
        let name = format!("elif_migrate_{}", hex);

        Self { id, name }
    }

    /// Numeric key, for `pg_try_advisory_lock`
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Lock name, for `GET_LOCK`
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Split a script into individual statements
///
/// Semicolons inside string literals, quoted identifiers and comments do not
/// end a statement. Chunks holding only whitespace or comments are dropped,
/// so a script made only of comments yields no statements. Compound
/// statements whose bodies contain semicolons (stored procedures, triggers)
/// are not supported on statement-by-statement backends.
pub fn split_statements(dialect: Dialect, sql: &str) -> Vec<String> {
    let parser_dialect: Box<dyn SqlParserDialect> = match dialect {
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::MySql => Box::new(MySqlDialect {}),
    };

    // Tokens are rendered back to text, so literals must keep their escapes
    match Tokenizer::new(parser_dialect.as_ref(), sql).with_unescape(false).tokenize() {
        Ok(tokens) => {
            let mut statements = Vec::new();
            let mut current = String::new();
            let mut has_content = false;

            for token in tokens {
                match token {
                    Token::SemiColon => {
                        if has_content {
                            statements.push(current.trim().to_string());
                        }
                        current.clear();
                        has_content = false;
                    }
                    Token::Whitespace(whitespace) => current.push_str(&whitespace.to_string()),
                    Token::EOF => {}
                    other => {
                        has_content = true;
                        current.push_str(&other.to_string());
                    }
                }
            }

            if has_content {
                statements.push(current.trim().to_string());
            }
            statements
        }
        Err(e) => {
            // Fall back to naive splitting so unusual syntax still runs
            tracing::warn!("SQL tokenizing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(strip_line_comments)
                .filter(|s| !s.is_empty())
                .collect()
        }
    }
}

fn strip_line_comments(chunk: &str) -> String {
    chunk
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
