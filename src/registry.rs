//! Record Type Registry
//!
//! Maps each record type name to its validator and legacy versions, and answers
//! which record migrations apply to a type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SchemaError, ValidationError};
use crate::migration::{Migration, RecordMigration};
use crate::record::{Record, SerializedStore};
use crate::resolver::ResolvedMigrations;
use crate::version::{LegacyVersions, VersionRange};

/// Checks a record against its type's current invariants, possibly normalizing it
pub type Validator = Arc<dyn Fn(Record) -> anyhow::Result<Record> + Send + Sync>;

/// Produces a replacement for a record that failed validation
pub type RepairHook =
    Arc<dyn for<'a> Fn(ValidationFailure<'a>) -> anyhow::Result<Record> + Send + Sync>;

/// Where a record is being validated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationPhase {
    Initialize,
    CreateRecord,
    UpdateRecord,
    Tests,
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPhase::Initialize => write!(f, "initialize"),
            ValidationPhase::CreateRecord => write!(f, "createRecord"),
            ValidationPhase::UpdateRecord => write!(f, "updateRecord"),
            ValidationPhase::Tests => write!(f, "tests"),
        }
    }
}

/// Everything a repair hook gets to see
pub struct ValidationFailure<'a> {
    pub error: ValidationError,
    pub store: &'a SerializedStore,
    pub record: &'a Record,
    pub phase: ValidationPhase,
    pub record_before: Option<&'a Record>,
}

/// Definition of one record type
#[derive(Clone)]
pub struct RecordType {
    pub type_name: String,
    pub validator: Validator,
    pub legacy: LegacyVersions,
}

impl RecordType {
    /// A type that accepts every record unchanged
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            validator: Arc::new(accept),
            legacy: LegacyVersions::new(VersionRange::default()),
        }
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(Record) -> anyhow::Result<Record> + Send + Sync + 'static,
    {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_legacy_versions(mut self, legacy: LegacyVersions) -> Self {
        self.legacy = legacy;
        self
    }

    pub fn validate(&self, record: Record) -> std::result::Result<Record, ValidationError> {
        let record_id = record.id.clone();
        (self.validator)(record).map_err(|source| ValidationError::Rejected {
            type_name: self.type_name.clone(),
            record_id,
            source,
        })
    }
}

fn accept(record: Record) -> anyhow::Result<Record> {
    Ok(record)
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordType")
            .field("type_name", &self.type_name)
            .field("legacy", &self.legacy)
            .finish()
    }
}

/// All record types known to a schema
#[derive(Debug, Clone, Default)]
pub struct RecordTypeRegistry {
    types: BTreeMap<String, RecordType>,
}

impl RecordTypeRegistry {
    pub fn new(types: impl IntoIterator<Item = RecordType>) -> Result<Self> {
        let mut registry = Self::default();
        for record_type in types {
            registry.register(record_type)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, record_type: RecordType) -> Result<()> {
        if self.types.contains_key(&record_type.type_name) {
            return Err(SchemaError::DuplicateRecordType(record_type.type_name));
        }
        self.types.insert(record_type.type_name.clone(), record_type);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<&RecordType> {
        self.types.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Types sorted by name
    pub fn iter(&self) -> impl Iterator<Item = &RecordType> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Record migrations that touch `type_name`, in application order
    pub fn migrations_for<'m>(
        &self,
        type_name: &str,
        resolved: &'m ResolvedMigrations,
    ) -> Vec<&'m RecordMigration> {
        if !self.contains(type_name) {
            return Vec::new();
        }
        resolved
            .iter()
            .filter_map(Migration::as_record)
            .filter(|m| m.applies_to(type_name))
            .collect()
    }

    /// Check that type-scoped migrations name registered types
    pub(crate) fn check_scoped_migrations(&self, resolved: &ResolvedMigrations) -> Result<()> {
        for migration in resolved.iter().filter_map(Migration::as_record) {
            if let Some(type_name) = &migration.record_type {
                if !self.contains(type_name) {
                    return Err(SchemaError::UnregisteredRecordType {
                        type_name: type_name.clone(),
                        id: migration.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
