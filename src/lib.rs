//! Familiar Store Migrations
//!
//! A schema migration engine for record stores. Extensions contribute migrations in
//! namespaced sequences; the engine orders them by their declared dependencies and
//! brings persisted records or whole store snapshots written by any earlier version
//! up to the current shape (and, for reversible record migrations, back down).
//!
//! ## Features
//!
//! - **Deterministic Ordering**: Dependency-based resolution, ties broken by registration order
//! - **Three Scopes**: Record, whole-store and legacy-format bridging migrations
//! - **Version Histories**: Data carries the ids of every migration applied to it
//! - **Legacy Descriptors**: Per-type integer versions are still read and written
//! - **Validation Hooks**: Post-migration validation with an optional repair callback
//!
//! ## Descriptor formats
//!
//! ```text
//! { "schemaVersion": 2, "versionHistory": ["com.familiar.store/001_init", ...] }
//! { "schemaVersion": 1, "storeVersion": 3, "recordVersions": { "page": { "version": 2 } } }
//! ```
//!
//! ## Example
//!
//! ```
//! use familiar_migrations::{
//!     MigrationDirection, MigrationSequence, Record, RecordMigration, RecordType,
//!     SerializedSchema, StoreSchema, StoreSchemaOptions,
//! };
//!
//! let add_color = RecordMigration::new("com.example/001_add_field", |mut record: Record| {
//!     if record.get("color").is_none() {
//!         record.insert("color", "black");
//!     }
//!     Ok(record)
//! });
//!
//! let schema = StoreSchema::new(
//!     [RecordType::new("shape")],
//!     StoreSchemaOptions::new()
//!         .with_sequence(MigrationSequence::new("com.example", vec![add_color.into()])),
//! )?;
//!
//! let migrated = schema
//!     .migrate_persisted_record(
//!         &Record::new("shape:1", "shape"),
//!         &SerializedSchema::current(Vec::new()),
//!         MigrationDirection::Up,
//!     )
//!     .map_err(|reason| reason.to_string())?;
//! assert_eq!(migrated.record.get("color"), Some(&serde_json::json!("black")));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod migration;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod version;

pub use config::{MigrationConfig, UnknownTypePolicy};
pub use engine::{MigratedRecord, MigrationDirection, StoreSchema, StoreSchemaOptions};
pub use error::{MigrationFailureReason, MigrationResult, Result, SchemaError, ValidationError};
pub use migration::{
    LegacyMigration, Migration, MigrationScope, MigrationSequence, RecordMigration, StoreMigration,
};
pub use record::{Record, RecordId, SerializedStore, StoreSnapshot};
pub use registry::{RecordType, RecordTypeRegistry, ValidationFailure, ValidationPhase};
pub use resolver::{resolve, ResolvedMigrations};
pub use schema::{LegacySchema, RecordVersion, SchemaComparison, SerializedSchema};
pub use version::{LegacyVersions, MigrationId, VersionRange};
