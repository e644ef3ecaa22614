//! Migration Source - Reads and orders migration files from the filesystem
//!
//! Files are named `<version>_<name>.<dialect>.<up|down>.sql`. The directory
//! is re-read on every call; it is assumed not to change while a single
//! engine operation runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::definitions::{MigrationDirection, MigrationFile, NIL_VERSION};
use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};

/// Components of a migration file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFileName {
    pub version: u64,
    pub name: String,
    pub dialect: String,
    pub direction: MigrationDirection,
}

/// Split a migration file name into its components
///
/// Returns `None` for names that do not follow the
/// `<version>_<name>.<dialect>.<up|down>.sql` convention. The dialect segment
/// is returned raw; callers normalize it.
pub fn parse_file_name(file_name: &str) -> Option<ParsedFileName> {
    let stem = file_name.strip_suffix(".sql")?;

    let mut parts = stem.rsplitn(3, '.');
    let direction = match parts.next()? {
        "up" => MigrationDirection::Up,
        "down" => MigrationDirection::Down,
        _ => return None,
    };
    let dialect = parts.next()?;
    let prefix = parts.next()?;

    let (version, name) = prefix.split_once('_')?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) || name.is_empty() {
        return None;
    }

    let version: u64 = version.parse().ok()?;
    if version > i64::MAX as u64 {
        return None;
    }

    Some(ParsedFileName {
        version,
        name: name.to_string(),
        dialect: dialect.to_string(),
        direction,
    })
}

/// Up and Down scripts for one version
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub version: u64,
    pub name: String,
    pub up: Option<MigrationFile>,
    pub down: Option<MigrationFile>,
}

impl VersionEntry {
    fn script(&self, direction: MigrationDirection) -> Option<&MigrationFile> {
        match direction {
            MigrationDirection::Up => self.up.as_ref(),
            MigrationDirection::Down => self.down.as_ref(),
        }
    }
}

/// Every migration of one dialect, keyed and ordered by version
#[derive(Debug, Clone)]
pub struct MigrationSet {
    dialect: Dialect,
    entries: BTreeMap<u64, VersionEntry>,
}

impl MigrationSet {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            entries: BTreeMap::new(),
        }
    }

    fn insert(&mut self, file: MigrationFile) -> MigrateResult<()> {
        let dialect = self.dialect;
        let entry = self.entries.entry(file.version).or_insert_with(|| VersionEntry {
            version: file.version,
            name: file.name.clone(),
            up: None,
            down: None,
        });

        let existing = entry
            .up
            .as_ref()
            .or(entry.down.as_ref())
            .filter(|existing| existing.name != file.name)
            .or_else(|| entry.script(file.direction));

        if let Some(existing) = existing {
            return Err(MigrateError::Conflict {
                version: file.version,
                dialect,
                first: existing.file_name(),
                second: file.file_name(),
            });
        }

        match file.direction {
            MigrationDirection::Up => entry.up = Some(file),
            MigrationDirection::Down => entry.down = Some(file),
        }
        Ok(())
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All known versions, ascending
    pub fn versions(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    /// All entries, ascending
    pub fn entries(&self) -> impl Iterator<Item = &VersionEntry> {
        self.entries.values()
    }

    /// Highest known version, or -1 for an empty set
    pub fn latest_version(&self) -> i64 {
        self.entries.keys().next_back().map_or(NIL_VERSION, |v| *v as i64)
    }

    /// Version immediately preceding `version` in the history, or -1
    pub fn previous_version(&self, version: u64) -> i64 {
        self.entries
            .range(..version)
            .next_back()
            .map_or(NIL_VERSION, |(v, _)| *v as i64)
    }

    /// Up scripts newer than `from`, ascending, at most `limit` of them
    pub fn pending(&self, from: i64, limit: Option<usize>) -> MigrateResult<Vec<&MigrationFile>> {
        let newer = self
            .entries
            .values()
            .filter(|entry| (entry.version as i64) > from)
            .take(limit.unwrap_or(usize::MAX));

        newer.map(|entry| self.require(entry, MigrationDirection::Up)).collect()
    }

    /// Down scripts at or below `upto`, descending, at most `limit` of them
    ///
    /// `upto` itself must be a known version: reverting from a version that
    /// has no Down script is impossible.
    pub fn applied(&self, upto: i64, limit: Option<usize>) -> MigrateResult<Vec<&MigrationFile>> {
        if upto == NIL_VERSION {
            return Ok(Vec::new());
        }

        if upto < 0 || !self.entries.contains_key(&(upto as u64)) {
            return Err(MigrateError::NotFound {
                version: upto,
                direction: MigrationDirection::Down,
                dialect: self.dialect,
            });
        }

        self.entries
            .range(..=upto as u64)
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, entry)| self.require(entry, MigrationDirection::Down))
            .collect()
    }

    fn require<'a>(&self, entry: &'a VersionEntry, direction: MigrationDirection) -> MigrateResult<&'a MigrationFile> {
        entry.script(direction).ok_or(MigrateError::NotFound {
            version: entry.version as i64,
            direction,
            dialect: self.dialect,
        })
    }
}

/// Reads migration files for a dialect from a directory
#[derive(Debug, Clone)]
pub struct MigrationSource {
    dir: PathBuf,
}

impl MigrationSource {
    /// Create a source for a migrations directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load all migrations of `dialect` from the directory
    ///
    /// Files of other dialects are excluded. Two files for the same version
    /// and direction, or the same version under two names, are a conflict.
    pub fn load(&self, dialect: Dialect) -> MigrateResult<MigrationSet> {
        let mut set = MigrationSet::new(dialect);

        if !self.dir.exists() {
            tracing::debug!("Migrations directory {} does not exist", self.dir.display());
            return Ok(set);
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "sql") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            if let Some(file) = self.read_file(&path, dialect)? {
                set.insert(file)?;
            }
        }

        Ok(set)
    }

    /// Read one file, or `None` when it is not a migration of `dialect`
    fn read_file(&self, path: &Path, dialect: Dialect) -> MigrateResult<Option<MigrationFile>> {
        let file_name = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => return Ok(None),
        };

        let parsed = match parse_file_name(file_name) {
            Some(parsed) => parsed,
            None => {
                tracing::debug!("Skipping {}: not a migration file name", file_name);
                return Ok(None);
            }
        };

        let file_dialect = match Dialect::normalize(&parsed.dialect) {
            Ok(file_dialect) => file_dialect,
            Err(_) => {
                tracing::warn!("Skipping {}: unknown dialect '{}'", file_name, parsed.dialect);
                return Ok(None);
            }
        };

        if file_dialect != dialect {
            return Ok(None);
        }

        let script = fs::read_to_string(path)?;

        Ok(Some(MigrationFile {
            version: parsed.version,
            name: parsed.name,
            dialect: file_dialect,
            direction: parsed.direction,
            script,
            path: path.to_path_buf(),
        }))
    }

    /// Up migrations newer than `from_version`, ascending
    pub fn list_pending(&self, from_version: i64, dialect: Dialect) -> MigrateResult<Vec<MigrationFile>> {
        let set = self.load(dialect)?;
        let pending = set.pending(from_version, None)?;
        Ok(pending.into_iter().cloned().collect())
    }

    /// Down migrations at or below `upto_version`, descending
    pub fn list_applied(&self, upto_version: i64, dialect: Dialect) -> MigrateResult<Vec<MigrationFile>> {
        self.list_applied_limit(upto_version, dialect, None)
    }

    /// Like [`list_applied`](Self::list_applied), truncated to `limit` entries
    /// before Down scripts are required
    pub fn list_applied_limit(
        &self,
        upto_version: i64,
        dialect: Dialect,
        limit: Option<usize>,
    ) -> MigrateResult<Vec<MigrationFile>> {
        let set = self.load(dialect)?;
        let applied = set.applied(upto_version, limit)?;
        Ok(applied.into_iter().cloned().collect())
    }

    /// Every known version for `dialect`, ascending
    pub fn history(&self, dialect: Dialect) -> MigrateResult<Vec<u64>> {
        Ok(self.load(dialect)?.versions().collect())
    }
}
