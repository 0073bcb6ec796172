//! Schema Migration CLI
//!
//! Inspects persisted snapshots and schema descriptors, and manages the migration config.
//!
//! Usage:
//!   schema-migrate inspect snapshot.json
//!   schema-migrate compare old.json new.json
//!   schema-migrate config show

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use familiar_migrations::{MigrationConfig, SchemaComparison, SerializedSchema, StoreSnapshot};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-migrate")]
#[command(about = "Inspect migration state of persisted store data")]
struct Cli {
    /// Config file to load on top of the default locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the descriptor and record counts of a snapshot or descriptor file
    Inspect {
        /// JSON file holding a store snapshot or a bare schema descriptor
        file: PathBuf,
    },

    /// Compare the descriptors of two files
    Compare {
        /// Older snapshot or descriptor
        from: PathBuf,
        /// Newer snapshot or descriptor
        to: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,

    /// Write a default configuration file
    Init {
        #[arg(default_value = "migrations.toml")]
        path: PathBuf,
    },
}

/// Contents of an input file
enum Persisted {
    Snapshot(StoreSnapshot),
    Descriptor(SerializedSchema),
}

impl Persisted {
    fn schema(&self) -> &SerializedSchema {
        match self {
            Persisted::Snapshot(snapshot) => &snapshot.schema,
            Persisted::Descriptor(schema) => schema,
        }
    }
}

fn load(path: &Path) -> Result<Persisted, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;

    let is_snapshot = value.get("store").is_some() && value.get("schema").is_some();
    debug!(path = %path.display(), is_snapshot, "loaded input file");

    if is_snapshot {
        Ok(Persisted::Snapshot(StoreSnapshot::from_value(value)?))
    } else {
        Ok(Persisted::Descriptor(SerializedSchema::from_value(value)?))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }
}

/// Returns whether the command succeeded
fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Inspect { file } => {
            let persisted = load(&file)?;
            print_descriptor(persisted.schema());

            if let Persisted::Snapshot(snapshot) = &persisted {
                println!();
                println!("Records: {}", snapshot.store.len());
                for (type_name, count) in snapshot.type_counts() {
                    println!("  {:<24} {}", type_name, count);
                }
            }
            Ok(true)
        }

        Commands::Compare { from, to } => {
            let from_schema = load(&from)?;
            let to_schema = load(&to)?;
            let comparison = from_schema.schema().compare(to_schema.schema());

            println!("🔍 Comparing {} -> {}", from.display(), to.display());
            println!();
            print_comparison(&comparison);

            Ok(comparison.is_identical())
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = MigrationConfig::load_from(cli.config.as_deref())?;
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(true)
            }
            ConfigAction::Init { path } => {
                if path.exists() {
                    eprintln!("❌ {} already exists", path.display());
                    return Ok(false);
                }
                MigrationConfig::default().save(&path)?;
                println!("✅ Wrote default config to {}", path.display());
                Ok(true)
            }
        },
    }
}

fn print_descriptor(schema: &SerializedSchema) {
    println!("Schema version: {}", schema.schema_version());
    match schema {
        SerializedSchema::Current { version_history } => {
            println!("Applied migrations: {}", version_history.len());
            for id in version_history {
                println!("  {}", id);
            }
        }
        SerializedSchema::Legacy(legacy) => {
            println!("Store version: {}", legacy.store_version);
            for (type_name, version) in &legacy.record_versions {
                println!("  {:<24} v{}", type_name, version.version());
            }
        }
    }
}

fn print_comparison(comparison: &SchemaComparison) {
    match comparison {
        SchemaComparison::History { missing, extra } => {
            if missing.is_empty() && extra.is_empty() {
                println!("✅ Same migration history");
            }
            for id in missing {
                println!("  + {}", id);
            }
            for id in extra {
                println!("  - {}", id);
            }
        }
        SchemaComparison::Legacy { store_version, changes } => {
            if comparison.is_identical() {
                println!("✅ Same legacy versions");
            }
            if let Some((from, to)) = store_version {
                println!("  store: v{} -> v{}", from, to);
            }
            for change in changes {
                let name = match &change.sub_type {
                    Some(sub_type) => format!("{}.{}", change.type_name, sub_type),
                    None => change.type_name.clone(),
                };
                println!("  {}: {} -> {}", name, show_version(change.from), show_version(change.to));
            }
        }
        SchemaComparison::FormatMismatch { left, right } => {
            println!("❌ Descriptor formats differ: schemaVersion {} vs {}", left, right);
        }
    }
}

fn show_version(version: Option<u32>) -> String {
    version.map_or_else(|| "absent".to_string(), |v| format!("v{}", v))
}
