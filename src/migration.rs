//! Migrations and migration sequences
//!
//! A [`Migration`] is one identified transformation. Its scope decides what it
//! operates on:
//!
//! - [`RecordMigration`]: one record at a time, optionally reversible
//! - [`StoreMigration`]: the whole store, forward only
//! - [`LegacyMigration`]: a one-time bridge from the legacy descriptor format
//!
//! Extensions contribute migrations grouped in a [`MigrationSequence`] whose id is
//! the namespace of every migration in it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::record::{Record, SerializedStore};
use crate::schema::LegacySchema;
use crate::version::MigrationId;

/// Rewrites one record
pub type RecordTransform = Arc<dyn Fn(Record) -> anyhow::Result<Record> + Send + Sync>;

/// Rewrites a whole store
pub type StoreTransform =
    Arc<dyn Fn(SerializedStore) -> anyhow::Result<SerializedStore> + Send + Sync>;

/// Normalizes a store written with the legacy descriptor format
pub type LegacyTransform =
    Arc<dyn Fn(&LegacySchema, SerializedStore) -> anyhow::Result<SerializedStore> + Send + Sync>;

/// Granularity of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationScope {
    Record,
    Store,
    Legacy,
}

impl fmt::Display for MigrationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationScope::Record => write!(f, "record"),
            MigrationScope::Store => write!(f, "store"),
            MigrationScope::Legacy => write!(f, "legacy"),
        }
    }
}

/// A single migration
#[derive(Clone)]
pub enum Migration {
    Record(RecordMigration),
    Store(StoreMigration),
    Legacy(LegacyMigration),
}

impl Migration {
    pub fn id(&self) -> &MigrationId {
        match self {
            Migration::Record(m) => &m.id,
            Migration::Store(m) => &m.id,
            Migration::Legacy(m) => &m.id,
        }
    }

    /// Migrations that must run before this one
    pub fn depends_on(&self) -> &[MigrationId] {
        match self {
            Migration::Record(m) => &m.depends_on,
            Migration::Store(m) => &m.depends_on,
            Migration::Legacy(m) => &m.depends_on,
        }
    }

    pub fn scope(&self) -> MigrationScope {
        match self {
            Migration::Record(_) => MigrationScope::Record,
            Migration::Store(_) => MigrationScope::Store,
            Migration::Legacy(_) => MigrationScope::Legacy,
        }
    }

    pub fn as_record(&self) -> Option<&RecordMigration> {
        match self {
            Migration::Record(m) => Some(m),
            _ => None,
        }
    }

    fn depends_on_mut(&mut self) -> &mut Vec<MigrationId> {
        match self {
            Migration::Record(m) => &mut m.depends_on,
            Migration::Store(m) => &mut m.depends_on,
            Migration::Legacy(m) => &mut m.depends_on,
        }
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", self.id())
            .field("scope", &self.scope())
            .field("depends_on", &self.depends_on())
            .finish()
    }
}

impl From<RecordMigration> for Migration {
    fn from(m: RecordMigration) -> Self {
        Migration::Record(m)
    }
}

impl From<StoreMigration> for Migration {
    fn from(m: StoreMigration) -> Self {
        Migration::Store(m)
    }
}

impl From<LegacyMigration> for Migration {
    fn from(m: LegacyMigration) -> Self {
        Migration::Legacy(m)
    }
}

/// Migration over a single record
///
/// Record migrations may not create or delete records and must not look at any
/// record other than the one they receive. Unless restricted with
/// [`RecordMigration::for_type`], they run for every record and decide on their
/// own whether the record is one they care about.
///
/// When `down` is present it must undo `up`; this is not checked.
#[derive(Clone)]
pub struct RecordMigration {
    pub id: MigrationId,
    pub depends_on: Vec<MigrationId>,
    pub record_type: Option<String>,
    pub up: RecordTransform,
    pub down: Option<RecordTransform>,
}

impl RecordMigration {
    pub fn new<F>(id: impl Into<MigrationId>, up: F) -> Self
    where
        F: Fn(Record) -> anyhow::Result<Record> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            record_type: None,
            up: Arc::new(up),
            down: None,
        }
    }

    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: Fn(Record) -> anyhow::Result<Record> + Send + Sync + 'static,
    {
        self.down = Some(Arc::new(down));
        self
    }

    pub fn depends_on<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<MigrationId>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Only run this migration on records of `type_name`
    pub fn for_type(mut self, type_name: impl Into<String>) -> Self {
        self.record_type = Some(type_name.into());
        self
    }

    /// Whether this migration touches records of `type_name`
    pub fn applies_to(&self, type_name: &str) -> bool {
        self.record_type.as_deref().map_or(true, |t| t == type_name)
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }
}

/// Migration over the whole store
///
/// Store migrations can add, remove and rewrite any records. They have no down
/// migration: undoing one would mean reconstructing deleted records.
#[derive(Clone)]
pub struct StoreMigration {
    pub id: MigrationId,
    pub depends_on: Vec<MigrationId>,
    pub up: StoreTransform,
}

impl StoreMigration {
    pub fn new<F>(id: impl Into<MigrationId>, up: F) -> Self
    where
        F: Fn(SerializedStore) -> anyhow::Result<SerializedStore> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            up: Arc::new(up),
        }
    }

    pub fn depends_on<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<MigrationId>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// Bridge from the legacy descriptor format
///
/// Runs at most once, and only for data whose descriptor is in the legacy format.
/// After it runs the data counts as having applied this migration and everything
/// it depends on, so `depends_on` states which migrations the legacy format
/// already covers.
#[derive(Clone)]
pub struct LegacyMigration {
    pub id: MigrationId,
    pub depends_on: Vec<MigrationId>,
    pub up: LegacyTransform,
}

impl LegacyMigration {
    pub fn new<F>(id: impl Into<MigrationId>, up: F) -> Self
    where
        F: Fn(&LegacySchema, SerializedStore) -> anyhow::Result<SerializedStore>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            up: Arc::new(up),
        }
    }

    pub fn depends_on<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<MigrationId>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// Migrations contributed by one package or extension
///
/// Declaration order is only a tiebreak for the resolver. A `sequential` sequence
/// additionally makes each migration depend on the one declared before it.
#[derive(Debug, Clone)]
pub struct MigrationSequence {
    /// Namespace shared by every migration id in the sequence
    pub id: String,
    pub sequential: bool,
    pub migrations: Vec<Migration>,
}

impl MigrationSequence {
    pub fn new(id: impl Into<String>, migrations: Vec<Migration>) -> Self {
        Self {
            id: id.into(),
            sequential: false,
            migrations,
        }
    }

    /// Chain each migration to its predecessor
    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    /// Migrations with the implicit predecessor edges of a sequential sequence added
    pub(crate) fn expanded(&self) -> Vec<Migration> {
        let mut migrations = self.migrations.clone();
        if self.sequential {
            for i in 1..migrations.len() {
                let previous = migrations[i - 1].id().clone();
                let deps = migrations[i].depends_on_mut();
                if !deps.contains(&previous) {
                    deps.push(previous);
                }
            }
        }
        migrations
    }
}
