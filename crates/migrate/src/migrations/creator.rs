//! Migration Creator - Stamps out new migration file pairs
//!
//! Creating a migration and running it are separate steps: the creator only
//! writes files, it never touches a database.

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::definitions::MigrationDirection;
use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};

/// Paths of a freshly created migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMigration {
    pub version: u64,
    pub name: String,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
}

/// Creates `<version>_<name>.<dialect>.<up|down>.sql` pairs
#[derive(Debug, Clone)]
pub struct MigrationCreator {
    dir: PathBuf,
}

impl MigrationCreator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create an Up/Down pair versioned with the current time in microseconds
    pub fn create(&self, name: &str, dialect: Dialect) -> MigrateResult<CreatedMigration> {
        let version = Utc::now().timestamp_micros();
        let version = u64::try_from(version)
            .map_err(|_| MigrateError::invalid_argument("system clock is before the Unix epoch"))?;
        self.create_with_version(name, dialect, version)
    }

    /// Create an Up/Down pair with an explicit version
    pub fn create_with_version(&self, name: &str, dialect: Dialect, version: u64) -> MigrateResult<CreatedMigration> {
        let name = sanitize_name(name);
        if name.is_empty() {
            return Err(MigrateError::invalid_argument("a migration needs a name"));
        }
        if version > i64::MAX as u64 {
            return Err(MigrateError::invalid_argument(format!("version {} does not fit the control table", version)));
        }

        fs::create_dir_all(&self.dir)?;

        let up_path = self.path_for(version, &name, dialect, MigrationDirection::Up);
        let down_path = self.path_for(version, &name, dialect, MigrationDirection::Down);

        write_new(&up_path, &template(&name, dialect, MigrationDirection::Up))?;
        if let Err(e) = write_new(&down_path, &template(&name, dialect, MigrationDirection::Down)) {
            // Never leave half a pair behind
            if let Err(cleanup_err) = fs::remove_file(&up_path) {
                tracing::warn!("Failed to remove {}: {}", up_path.display(), cleanup_err);
            }
            return Err(e.into());
        }

        tracing::info!("Created migration {}_{} ({})", version, name, dialect);

        Ok(CreatedMigration {
            version,
            name,
            up_path,
            down_path,
        })
    }

    fn path_for(&self, version: u64, name: &str, dialect: Dialect, direction: MigrationDirection) -> PathBuf {
        self.dir
            .join(format!("{}_{}.{}.{}.sql", version, name, dialect.as_str(), direction.as_str()))
    }
}

/// Write a file that must not exist yet
fn write_new(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()
}

/// Lower-case a name and replace anything but ASCII letters and digits with `_`
fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();

    replaced
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn template(name: &str, dialect: Dialect, direction: MigrationDirection) -> String {
    let hint = match direction {
        MigrationDirection::Up => "Add your schema changes here",
        MigrationDirection::Down => "Reverse the changes made by the up migration",
    };
    let atomicity = if dialect.supports_transactional_ddl() {
        "This script runs inside a single transaction."
    } else {
        "Statements run one by one; a failure does not roll back earlier statements."
    };

    format!(
        "-- Migration: {}\n\
         -- Direction: {}\n\
         -- Created: {}\n\
         -- {}\n\n\
         -- {}\n\n",
        name,
        direction,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        atomicity,
        hint
    )
}
