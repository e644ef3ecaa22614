//! SQL dialects understood by the migration engine
//!
//! Drivers, migration file names and configuration all key off [`Dialect`];
//! raw dialect strings are normalized exactly once, at the boundary.

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, MigrateResult};

/// Normalized identifier for the target database's SQL variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    MySql,
}

impl Dialect {
    /// Normalize a dialect name or alias
    ///
    /// `postgres`, `postgresql` and `pgx` map to [`Dialect::Postgres`];
    /// `mysql` and `mariadb` map to [`Dialect::MySql`]. Matching ignores case
    /// and surrounding whitespace.
    pub fn normalize(raw: &str) -> MigrateResult<Self> {
        match raw.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pgx" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            _ => Err(MigrateError::UnsupportedDialect(raw.to_string())),
        }
    }

    /// Detect the dialect from a URL-style DSN scheme
    pub fn from_dsn(dsn: &str) -> MigrateResult<Self> {
        let scheme = dsn
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| {
                MigrateError::UnsupportedDialect("cannot detect dialect from a DSN without a scheme".to_string())
            })?;
        Self::normalize(scheme)
    }

    /// Canonical name, as used in migration file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
        }
    }

    /// Whether DDL can be wrapped in a transaction and rolled back
    ///
    /// PostgreSQL runs DDL transactionally. MySQL and MariaDB commit
    /// implicitly around most DDL statements, so a failing script may leave
    /// its earlier statements applied.
    pub fn supports_transactional_ddl(&self) -> bool {
        match self {
            Dialect::Postgres => true,
            Dialect::MySql => false,
        }
    }

    /// Default TCP port for this dialect
    pub fn default_port(&self) -> u16 {
        match self {
            Dialect::Postgres => 5432,
            Dialect::MySql => 3306,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Dialect {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dialect::normalize(s)
    }
}
