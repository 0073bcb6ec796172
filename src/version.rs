//! Migration identifiers and legacy version numbers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SchemaError};

/// Identifies a migration: `<namespace>/<local-name>`
///
/// The namespace is the id of the sequence that contributes the migration
/// (e.g. `com.familiar.shape.arrow/003_add_label_position`). Ids compare as
/// strings but are never used for ordering; ordering comes from dependencies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(String);

impl MigrationId {
    /// Parse and validate an id
    pub fn parse(id: &str) -> Result<Self> {
        let id = Self(id.to_string());
        id.validate()?;
        Ok(id)
    }

    /// Check the `<namespace>/<local-name>` shape
    pub fn validate(&self) -> Result<()> {
        match self.0.rsplit_once('/') {
            Some((namespace, local)) if !namespace.is_empty() && !local.is_empty() => Ok(()),
            _ => Err(SchemaError::InvalidMigrationId(self.0.clone())),
        }
    }

    /// Everything before the last `/`
    pub fn namespace(&self) -> &str {
        self.0.rsplit_once('/').map(|(ns, _)| ns).unwrap_or("")
    }

    /// Everything after the last `/`
    pub fn local_name(&self) -> &str {
        self.0.rsplit_once('/').map(|(_, local)| local).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MigrationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MigrationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for MigrationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Oldest and newest legacy version of one versioned thing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionRange {
    /// Lowest version still readable
    pub first: u32,
    /// Version written today
    pub current: u32,
}

impl VersionRange {
    pub fn new(first: u32, current: u32) -> Self {
        Self { first, current }
    }

    /// Range where nothing was ever migrated
    pub fn fixed(version: u32) -> Self {
        Self::new(version, version)
    }

    pub fn contains(&self, version: u32) -> bool {
        (self.first..=self.current).contains(&version)
    }
}

/// Legacy (schema format v1) versions declared by one record type
///
/// Record types with polymorphic props (shapes, assets) name the field that
/// selects the variant in `sub_type_key` and version each variant separately.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LegacyVersions {
    pub range: VersionRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_types: BTreeMap<String, VersionRange>,
}

impl LegacyVersions {
    pub fn new(range: VersionRange) -> Self {
        Self {
            range,
            sub_type_key: None,
            sub_types: BTreeMap::new(),
        }
    }

    /// Declare the sub-type axis
    pub fn with_sub_type_key(mut self, key: impl Into<String>) -> Self {
        self.sub_type_key = Some(key.into());
        self
    }

    /// Declare the versions of one sub-type
    pub fn with_sub_type(mut self, name: impl Into<String>, range: VersionRange) -> Self {
        self.sub_types.insert(name.into(), range);
        self
    }

    /// Whether this type is serialized with per-sub-type versions
    pub fn has_sub_types(&self) -> bool {
        self.sub_type_key.is_some() && !self.sub_types.is_empty()
    }
}
