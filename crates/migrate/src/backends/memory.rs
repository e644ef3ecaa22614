//! In-memory backend
//!
//! An in-process stand-in for a database server, for tests and dry runs. It
//! understands just enough SQL to track which tables exist (`CREATE TABLE`,
//! `DROP TABLE`), keeps the control row and advisory locks per driver, and
//! reproduces each dialect's script semantics: Postgres scripts apply
//! all-or-nothing, MySQL scripts stop at the first failing statement and keep
//! the statements before it.
//!
//! Every connection opened from the same [`MemoryDriver`] (or its clones)
//! sees the same database. Enabled by the default `memory` feature; builds
//! that only talk to real servers can turn it off.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::core::{split_statements, Connection, Driver, LockKey};
use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::VersionRecord;

#[derive(Debug, Default)]
struct MemoryDatabase {
    tables: BTreeSet<String>,
    control: HashMap<String, Option<VersionRecord>>,
    locks: HashMap<i64, u64>,
    next_connection_id: u64,
    open_connections: usize,
    scripts: Vec<String>,
    statements: Vec<String>,
    version_writes: Vec<VersionRecord>,
    failing_markers: Vec<String>,
    unreachable: bool,
    fail_close: bool,
}

/// Driver for a shared in-memory database
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    dialect: Dialect,
    db: Arc<Mutex<MemoryDatabase>>,
}

impl MemoryDriver {
    /// Create an empty database emulating `dialect`
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            db: Arc::new(Mutex::new(MemoryDatabase::default())),
        }
    }

    /// Make every statement containing `marker` fail
    pub fn fail_statements_containing(&self, marker: impl Into<String>) {
        self.db.lock().failing_markers.push(marker.into());
    }

    /// Stop injecting statement failures
    pub fn clear_failures(&self) {
        self.db.lock().failing_markers.clear();
    }

    /// Make `open` fail as if the server were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.db.lock().unreachable = unreachable;
    }

    /// Make `close` report an error
    pub fn set_fail_close(&self, fail_close: bool) {
        self.db.lock().fail_close = fail_close;
    }

    /// Whether an application table exists
    pub fn has_table(&self, name: &str) -> bool {
        self.db.lock().tables.contains(&normalize_identifier(name))
    }

    /// Names of all application tables, sorted
    pub fn tables(&self) -> Vec<String> {
        self.db.lock().tables.iter().cloned().collect()
    }

    /// Control row of `table`, if the table exists and holds a row
    pub fn version_row(&self, table: &str) -> Option<VersionRecord> {
        self.db.lock().control.get(table).copied().flatten()
    }

    /// Every script passed to `execute_script`, in order
    pub fn executed_scripts(&self) -> Vec<String> {
        self.db.lock().scripts.clone()
    }

    /// Every statement run after splitting, in order, as it would reach the server
    pub fn executed_statements(&self) -> Vec<String> {
        self.db.lock().statements.clone()
    }

    /// Every control row written, in order
    pub fn version_writes(&self) -> Vec<VersionRecord> {
        self.db.lock().version_writes.clone()
    }

    /// Connections opened and not yet closed or dropped
    pub fn open_connections(&self) -> usize {
        self.db.lock().open_connections
    }

    /// Number of advisory locks currently held
    pub fn held_locks(&self) -> usize {
        self.db.lock().locks.len()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn open(&self, _dsn: &str) -> MigrateResult<Box<dyn Connection>> {
        let mut db = self.db.lock();
        if db.unreachable {
            return Err(MigrateError::driver("Failed to connect: in-memory database is unreachable"));
        }

        db.next_connection_id += 1;
        db.open_connections += 1;

        Ok(Box::new(MemoryConnection {
            id: db.next_connection_id,
            dialect: self.dialect,
            db: Arc::clone(&self.db),
        }))
    }
}

/// Connection to a [`MemoryDriver`] database
///
/// Dropping the connection releases its advisory locks, like a server does
/// when a session ends.
pub struct MemoryConnection {
    id: u64,
    dialect: Dialect,
    db: Arc<Mutex<MemoryDatabase>>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut db = self.db.lock();
        db.open_connections = db.open_connections.saturating_sub(1);
        let id = self.id;
        db.locks.retain(|_, holder| *holder != id);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute_script(&mut self, script: &str) -> MigrateResult<()> {
        let mut db = self.db.lock();
        db.scripts.push(script.to_string());

        let statements = split_statements(self.dialect, script);
        let total = statements.len();
        db.statements.extend(statements.iter().cloned());

        if self.dialect.supports_transactional_ddl() {
            let mut tables = db.tables.clone();
            for (index, statement) in statements.iter().enumerate() {
                apply_statement(&mut tables, &db.failing_markers, statement).map_err(|message| {
                    MigrateError::driver(format!("Migration script failed at statement {} of {}: {}", index + 1, total, message))
                })?;
            }
            db.tables = tables;
        } else {
            let MemoryDatabase {
                tables,
                failing_markers,
                ..
            } = &mut *db;
            for (index, statement) in statements.iter().enumerate() {
                apply_statement(tables, failing_markers, statement).map_err(|message| {
                    MigrateError::driver(format!("Statement {} of {} failed: {}", index + 1, total, message))
                })?;
            }
        }

        Ok(())
    }

    async fn version_table_exists(&mut self, table: &str) -> MigrateResult<bool> {
        Ok(self.db.lock().control.contains_key(table))
    }

    async fn create_version_table(&mut self, table: &str) -> MigrateResult<()> {
        self.db.lock().control.entry(table.to_string()).or_insert(None);
        Ok(())
    }

    async fn read_version(&mut self, table: &str) -> MigrateResult<Option<VersionRecord>> {
        match self.db.lock().control.get(table) {
            Some(row) => Ok(*row),
            None => Err(MigrateError::driver(format!("relation \"{}\" does not exist", table))),
        }
    }

    async fn write_version(&mut self, table: &str, record: VersionRecord) -> MigrateResult<()> {
        let mut db = self.db.lock();
        match db.control.get_mut(table) {
            Some(row) => *row = Some(record),
            None => return Err(MigrateError::driver(format!("relation \"{}\" does not exist", table))),
        }
        db.version_writes.push(record);
        Ok(())
    }

    async fn try_lock(&mut self, key: &LockKey) -> MigrateResult<bool> {
        let mut db = self.db.lock();
        match db.locks.get(&key.id()) {
            Some(holder) => Ok(*holder == self.id),
            None => {
                db.locks.insert(key.id(), self.id);
                Ok(true)
            }
        }
    }

    async fn unlock(&mut self, key: &LockKey) -> MigrateResult<()> {
        let mut db = self.db.lock();
        match db.locks.get(&key.id()) {
            Some(holder) if *holder == self.id => {
                db.locks.remove(&key.id());
                Ok(())
            }
            _ => Err(MigrateError::driver(format!("Advisory lock {} was not held by this session", key.id()))),
        }
    }

    async fn close(self: Box<Self>) -> MigrateResult<()> {
        let fail_close = self.db.lock().fail_close;
        drop(self);

        if fail_close {
            Err(MigrateError::driver("Failed to close in-memory connection"))
        } else {
            Ok(())
        }
    }
}

/// Apply one statement to the table set
fn apply_statement(tables: &mut BTreeSet<String>, failing_markers: &[String], statement: &str) -> Result<(), String> {
    if let Some(marker) = failing_markers.iter().find(|marker| statement.contains(marker.as_str())) {
        return Err(format!("injected failure on '{}'", marker));
    }

    let code = statement
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    let raw: Vec<&str> = code.split_whitespace().collect();
    let words: Vec<String> = raw.iter().map(|word| word.to_uppercase()).collect();

    match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["CREATE", "TABLE", "IF", "NOT", "EXISTS", ..] => {
            if let Some(name) = raw.get(5) {
                tables.insert(normalize_identifier(name));
            }
            Ok(())
        }
        ["CREATE", "TABLE", ..] => {
            let name = raw.get(2).map(|name| normalize_identifier(name)).unwrap_or_default();
            if !tables.insert(name.clone()) {
                return Err(format!("relation \"{}\" already exists", name));
            }
            Ok(())
        }
        ["DROP", "TABLE", "IF", "EXISTS", ..] => {
            for name in table_list(&raw[4..]) {
                tables.remove(&name);
            }
            Ok(())
        }
        ["DROP", "TABLE", ..] => {
            let names = table_list(&raw[2..]);
            if let Some(missing) = names.iter().find(|name| !tables.contains(*name)) {
                return Err(format!("table \"{}\" does not exist", missing));
            }
            for name in names {
                tables.remove(&name);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Table names of a `DROP TABLE a, b CASCADE` tail
fn table_list(words: &[&str]) -> Vec<String> {
    words
        .join(" ")
        .split(',')
        .filter_map(|part| part.split_whitespace().next())
        .map(normalize_identifier)
        .filter(|name| !name.is_empty())
        .collect()
}

/// Strip quoting, trailing punctuation and case from a table name
fn normalize_identifier(raw: &str) -> String {
    raw.split('(')
        .next()
        .unwrap_or_default()
        .trim_end_matches(|c| c == ';' || c == ',')
        .chars()
        .filter(|c| !matches!(c, '"' | '`'))
        .collect::<String>()
        .to_lowercase()
}
