//! Schema descriptors
//!
//! A [`SerializedSchema`] records which version a snapshot or record was written at.
//! It comes in two wire formats, distinguished by `schemaVersion`:
//!
//! ```text
//! { "schemaVersion": 1, "storeVersion": 3,
//!   "recordVersions": { "page":  { "version": 2 },
//!                       "shape": { "version": 3, "subTypeKey": "type",
//!                                  "subTypeVersions": { "geo": 4 } } } }
//!
//! { "schemaVersion": 2, "versionHistory": ["com.familiar.store/001_init", ...] }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::version::MigrationId;

/// `schemaVersion` of the per-type integer format
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

/// `schemaVersion` of the applied-migrations format
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Version descriptor attached to persisted data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSchema", into = "RawSchema")]
pub enum SerializedSchema {
    /// Coarse per-type integer versions (schema format v1)
    Legacy(LegacySchema),
    /// Ids of every migration applied to the data (schema format v2)
    Current { version_history: Vec<MigrationId> },
}

/// Schema format v1
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LegacySchema {
    /// Version of the store's overall structure
    pub store_version: u32,
    /// Version of each record type
    pub record_versions: BTreeMap<String, RecordVersion>,
}

/// Legacy version of a single record type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawRecordVersion", into = "RawRecordVersion")]
pub enum RecordVersion {
    WithSubTypes {
        version: u32,
        sub_type_key: String,
        sub_type_versions: BTreeMap<String, u32>,
    },
    Flat {
        version: u32,
    },
}

impl RecordVersion {
    pub fn version(&self) -> u32 {
        match self {
            RecordVersion::WithSubTypes { version, .. } | RecordVersion::Flat { version } => *version,
        }
    }

    pub fn sub_type_version(&self, sub_type: &str) -> Option<u32> {
        match self {
            RecordVersion::WithSubTypes { sub_type_versions, .. } => {
                sub_type_versions.get(sub_type).copied()
            }
            RecordVersion::Flat { .. } => None,
        }
    }
}

impl SerializedSchema {
    /// Parse a descriptor from a JSON value
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Descriptor in the current format
    pub fn current(version_history: Vec<MigrationId>) -> Self {
        SerializedSchema::Current { version_history }
    }

    /// The `schemaVersion` this descriptor serializes with
    pub fn schema_version(&self) -> u32 {
        match self {
            SerializedSchema::Legacy(_) => LEGACY_SCHEMA_VERSION,
            SerializedSchema::Current { .. } => CURRENT_SCHEMA_VERSION,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, SerializedSchema::Legacy(_))
    }

    pub fn as_legacy(&self) -> Option<&LegacySchema> {
        match self {
            SerializedSchema::Legacy(legacy) => Some(legacy),
            SerializedSchema::Current { .. } => None,
        }
    }

    pub fn version_history(&self) -> Option<&[MigrationId]> {
        match self {
            SerializedSchema::Current { version_history } => Some(version_history),
            SerializedSchema::Legacy(_) => None,
        }
    }

    /// Describe how `other` differs from `self`
    pub fn compare(&self, other: &SerializedSchema) -> SchemaComparison {
        match (self, other) {
            (
                SerializedSchema::Current { version_history: left },
                SerializedSchema::Current { version_history: right },
            ) => {
                let left_set: BTreeSet<_> = left.iter().collect();
                let right_set: BTreeSet<_> = right.iter().collect();
                SchemaComparison::History {
                    missing: right.iter().filter(|id| !left_set.contains(id)).cloned().collect(),
                    extra: left.iter().filter(|id| !right_set.contains(id)).cloned().collect(),
                }
            }
            (SerializedSchema::Legacy(left), SerializedSchema::Legacy(right)) => {
                SchemaComparison::Legacy {
                    store_version: (left.store_version != right.store_version)
                        .then_some((left.store_version, right.store_version)),
                    changes: left.version_changes(right),
                }
            }
            _ => SchemaComparison::FormatMismatch {
                left: self.schema_version(),
                right: other.schema_version(),
            },
        }
    }
}

impl LegacySchema {
    pub fn version_of(&self, type_name: &str) -> Option<u32> {
        self.record_versions.get(type_name).map(RecordVersion::version)
    }

    pub fn sub_type_version(&self, type_name: &str, sub_type: &str) -> Option<u32> {
        self.record_versions
            .get(type_name)
            .and_then(|v| v.sub_type_version(sub_type))
    }

    fn version_changes(&self, other: &LegacySchema) -> Vec<VersionChange> {
        let type_names: BTreeSet<&String> = self
            .record_versions
            .keys()
            .chain(other.record_versions.keys())
            .collect();

        let mut changes = Vec::new();
        for type_name in type_names {
            let before = self.record_versions.get(type_name);
            let after = other.record_versions.get(type_name);

            let from = before.map(RecordVersion::version);
            let to = after.map(RecordVersion::version);
            if from != to {
                changes.push(VersionChange {
                    type_name: type_name.clone(),
                    sub_type: None,
                    from,
                    to,
                });
            }

            let sub_types: BTreeSet<&String> = [before, after]
                .into_iter()
                .flatten()
                .flat_map(|v| match v {
                    RecordVersion::WithSubTypes { sub_type_versions, .. } => {
                        sub_type_versions.keys().collect::<Vec<_>>()
                    }
                    RecordVersion::Flat { .. } => Vec::new(),
                })
                .collect();
            for sub_type in sub_types {
                let from = before.and_then(|v| v.sub_type_version(sub_type));
                let to = after.and_then(|v| v.sub_type_version(sub_type));
                if from != to {
                    changes.push(VersionChange {
                        type_name: type_name.clone(),
                        sub_type: Some(sub_type.clone()),
                        from,
                        to,
                    });
                }
            }
        }
        changes
    }
}

/// Result of [`SerializedSchema::compare`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaComparison {
    /// Both descriptors are version histories
    History {
        /// Applied on the right but not on the left
        missing: Vec<MigrationId>,
        /// Applied on the left but not on the right
        extra: Vec<MigrationId>,
    },
    /// Both descriptors are legacy integer versions
    Legacy {
        store_version: Option<(u32, u32)>,
        changes: Vec<VersionChange>,
    },
    FormatMismatch { left: u32, right: u32 },
}

impl SchemaComparison {
    pub fn is_identical(&self) -> bool {
        match self {
            SchemaComparison::History { missing, extra } => missing.is_empty() && extra.is_empty(),
            SchemaComparison::Legacy { store_version, changes } => {
                store_version.is_none() && changes.is_empty()
            }
            SchemaComparison::FormatMismatch { .. } => false,
        }
    }
}

/// One differing legacy version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChange {
    pub type_name: String,
    pub sub_type: Option<String>,
    pub from: Option<u32>,
    pub to: Option<u32>,
}

// Wire representation shared by both formats
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSchema {
    schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    store_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record_versions: Option<BTreeMap<String, RecordVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version_history: Option<Vec<MigrationId>>,
}

// Wire representation of one legacy record version; the sub-type form needs both keys
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecordVersion {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub_type_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub_type_versions: Option<BTreeMap<String, u32>>,
}

impl From<RawRecordVersion> for RecordVersion {
    fn from(raw: RawRecordVersion) -> Self {
        match (raw.sub_type_key, raw.sub_type_versions) {
            (Some(sub_type_key), Some(sub_type_versions)) => RecordVersion::WithSubTypes {
                version: raw.version,
                sub_type_key,
                sub_type_versions,
            },
            _ => RecordVersion::Flat {
                version: raw.version,
            },
        }
    }
}

impl From<RecordVersion> for RawRecordVersion {
    fn from(version: RecordVersion) -> Self {
        match version {
            RecordVersion::WithSubTypes {
                version,
                sub_type_key,
                sub_type_versions,
            } => RawRecordVersion {
                version,
                sub_type_key: Some(sub_type_key),
                sub_type_versions: Some(sub_type_versions),
            },
            RecordVersion::Flat { version } => RawRecordVersion {
                version,
                sub_type_key: None,
                sub_type_versions: None,
            },
        }
    }
}

impl TryFrom<RawSchema> for SerializedSchema {
    type Error = String;

    fn try_from(raw: RawSchema) -> std::result::Result<Self, Self::Error> {
        match raw.schema_version {
            LEGACY_SCHEMA_VERSION => {
                let store_version = raw
                    .store_version
                    .ok_or("legacy schema is missing storeVersion")?;
                let record_versions = raw
                    .record_versions
                    .ok_or("legacy schema is missing recordVersions")?;
                Ok(SerializedSchema::Legacy(LegacySchema {
                    store_version,
                    record_versions,
                }))
            }
            CURRENT_SCHEMA_VERSION => {
                let version_history = raw
                    .version_history
                    .ok_or("schema is missing versionHistory")?;
                Ok(SerializedSchema::Current { version_history })
            }
            other => Err(format!("unsupported schemaVersion {other}")),
        }
    }
}

impl From<SerializedSchema> for RawSchema {
    fn from(schema: SerializedSchema) -> Self {
        match schema {
            SerializedSchema::Legacy(legacy) => RawSchema {
                schema_version: LEGACY_SCHEMA_VERSION,
                store_version: Some(legacy.store_version),
                record_versions: Some(legacy.record_versions),
                version_history: None,
            },
            SerializedSchema::Current { version_history } => RawSchema {
                schema_version: CURRENT_SCHEMA_VERSION,
                store_version: None,
                record_versions: None,
                version_history: Some(version_history),
            },
        }
    }
}
