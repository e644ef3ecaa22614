//! Migration System
//!
//! File discovery, the persisted version record, the engine that applies and
//! reverts migrations, and the creator for new migration files.

pub mod creator;
pub mod definitions;
pub mod engine;
pub mod source;
pub mod version_store;

// Re-export migration types
pub use creator::{CreatedMigration, MigrationCreator};
pub use definitions::*;
pub use engine::{MigrationEngine, DEFAULT_LOCK_POLL_INTERVAL};
pub use source::{parse_file_name, MigrationSet, MigrationSource, ParsedFileName, VersionEntry};
pub use version_store::VersionStore;
