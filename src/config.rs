//! Configuration for the migration engine
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (migrations.toml)
//! - Environment variables (MIGRATIONS__*)
//!
//! ## Example config file (migrations.toml):
//! ```toml
//! [migration]
//! validate_after_migration = true
//! unknown_record_types = "pass_through"
//!
//! [legacy]
//! store_version = 4
//! first_store_version = 0
//! ```

use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Main configuration for a [`crate::StoreSchema`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Migration behavior
    #[serde(default)]
    pub migration: MigrationSettings,

    /// Legacy descriptor settings
    #[serde(default)]
    pub legacy: LegacySettings,
}

/// Migration behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSettings {
    /// Run the validation hook on records after migrating them up
    #[serde(default = "default_true")]
    pub validate_after_migration: bool,

    /// What snapshot migration does with records of unregistered types
    #[serde(default)]
    pub unknown_record_types: UnknownTypePolicy,
}

/// Handling of records whose type is not registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTypePolicy {
    /// Keep the record untouched and log it
    #[default]
    PassThrough,
    /// Fail the snapshot
    Reject,
}

/// Coarse store version reported in legacy-format descriptors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacySettings {
    #[serde(default)]
    pub store_version: u32,

    #[serde(default)]
    pub first_store_version: u32,
}

fn default_true() -> bool {
    true
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            validate_after_migration: true,
            unknown_record_types: UnknownTypePolicy::PassThrough,
        }
    }
}

impl MigrationConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, adding a required file on top of the defaults
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        let config_locations = [
            "migrations.toml",
            ".migrations.toml",
            "config/migrations.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "migrations") {
            let xdg_config = config_dir.config_dir().join("migrations.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("MIGRATIONS")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
