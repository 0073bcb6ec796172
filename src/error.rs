//! Error types for the migration engine
//!
//! Two families:
//! - [`SchemaError`] is raised while building a [`crate::StoreSchema`]. A schema that
//!   fails to build never becomes usable.
//! - [`MigrationFailureReason`] is returned from individual migration calls so callers
//!   can decide what to do with one bad record or snapshot.

use thiserror::Error;

use crate::version::MigrationId;

/// Result type for load-time operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Result type for a single migration call
pub type MigrationResult<T> = std::result::Result<T, MigrationFailureReason>;

/// Load-time errors
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid migration id '{0}': expected '<namespace>/<local-name>'")]
    InvalidMigrationId(String),

    #[error("Duplicate migration id: {0}")]
    DuplicateMigrationId(MigrationId),

    #[error("Duplicate migration sequence: {0}")]
    DuplicateSequence(String),

    #[error("Migration {id} does not belong to sequence '{sequence}'")]
    NamespaceMismatch { sequence: String, id: MigrationId },

    #[error("Migration {id} depends on unknown migration {missing}")]
    UnknownMigrationTarget { id: MigrationId, missing: MigrationId },

    #[error("Cyclic dependency between migrations: {}", format_cycle(.members))]
    CyclicDependency { members: Vec<MigrationId> },

    #[error("Record type registered twice: {0}")]
    DuplicateRecordType(String),

    #[error("Migration {id} is scoped to unregistered record type '{type_name}'")]
    UnregisteredRecordType { type_name: String, id: MigrationId },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config_crate::ConfigError),

    #[error("TOML error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

fn format_cycle(members: &[MigrationId]) -> String {
    members
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Why a record or snapshot could not be migrated
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationFailureReason {
    #[error("Migration {id} has no down migration")]
    NoInverse { id: MigrationId },

    #[error("Migration {id} failed: {message}")]
    TransformFailed { id: MigrationId, message: String },

    #[error("Unknown record type: {type_name}")]
    UnknownRecordType { type_name: String },

    #[error("Record {record_id} failed validation: {message}")]
    ValidationFailed { record_id: String, message: String },

    #[error("Target version is too new: {reason}")]
    TargetVersionTooNew { reason: String },

    #[error("Target version is too old: {reason}")]
    TargetVersionTooOld { reason: String },

    #[error("Version history lists {id} without its dependency {missing}")]
    InconsistentFrontier { id: MigrationId, missing: MigrationId },

    #[error("Legacy migration {id} removed record {record_id}")]
    RecordDroppedByLegacyMigration { id: MigrationId, record_id: String },
}

/// Validation failures from the record-type registry
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing definition for record type {0}")]
    MissingDefinition(String),

    #[error("Invalid {type_name} record {record_id}: {source:#}")]
    Rejected {
        type_name: String,
        record_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Repair of record {record_id} failed: {source:#}")]
    RepairFailed {
        record_id: String,
        #[source]
        source: anyhow::Error,
    },
}
