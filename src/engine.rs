//! Store Schema
//!
//! The migration engine. A [`StoreSchema`] is built once from the registered record
//! types and migration sequences; building it resolves the global migration order,
//! and the result is immutable. Every migration call afterwards is a pure function
//! of its inputs, so one schema can be shared across threads.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{MigrationConfig, UnknownTypePolicy};
use crate::error::{MigrationFailureReason, MigrationResult, Result, ValidationError};
use crate::migration::{
    LegacyMigration, Migration, MigrationScope, MigrationSequence, RecordMigration,
};
use crate::record::{Record, SerializedStore, StoreSnapshot};
use crate::registry::{
    RecordType, RecordTypeRegistry, RepairHook, ValidationFailure, ValidationPhase,
};
use crate::resolver::{resolve, ResolvedMigrations};
use crate::schema::{LegacySchema, RecordVersion, SerializedSchema};
use crate::version::{LegacyVersions, MigrationId, VersionRange};

/// Which way a record is migrated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// From the given descriptor to the current version
    #[default]
    Up,
    /// From the current version to the given (older) descriptor
    Down,
}

/// A migrated record and the descriptor it now conforms to
#[derive(Debug, Clone, PartialEq)]
pub struct MigratedRecord {
    pub record: Record,
    pub schema: SerializedSchema,
}

/// Options for [`StoreSchema::new`]
#[derive(Clone, Default)]
pub struct StoreSchemaOptions {
    pub sequences: Vec<MigrationSequence>,
    pub on_validation_failure: Option<RepairHook>,
    pub config: MigrationConfig,
}

impl StoreSchemaOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sequence(mut self, sequence: MigrationSequence) -> Self {
        self.sequences.push(sequence);
        self
    }

    pub fn with_sequences(mut self, sequences: impl IntoIterator<Item = MigrationSequence>) -> Self {
        self.sequences.extend(sequences);
        self
    }

    /// Register a hook that replaces records failing validation
    pub fn on_validation_failure<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(ValidationFailure<'a>) -> anyhow::Result<Record> + Send + Sync + 'static,
    {
        self.on_validation_failure = Some(Arc::new(hook));
        self
    }

    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for StoreSchemaOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSchemaOptions")
            .field("sequences", &self.sequences)
            .field("on_validation_failure", &self.on_validation_failure.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// The migration engine
pub struct StoreSchema {
    types: RecordTypeRegistry,
    migrations: ResolvedMigrations,
    on_validation_failure: Option<RepairHook>,
    config: MigrationConfig,
}

impl fmt::Debug for StoreSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSchema")
            .field("types", &self.types)
            .field("migrations", &self.migrations)
            .field("on_validation_failure", &self.on_validation_failure.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl StoreSchema {
    /// Build a schema, resolving the migration order
    ///
    /// Any structural problem (bad ids, unknown dependencies, cycles, duplicate
    /// types) is returned here and no schema is produced.
    pub fn new(
        types: impl IntoIterator<Item = RecordType>,
        options: StoreSchemaOptions,
    ) -> Result<Self> {
        let types = RecordTypeRegistry::new(types)?;
        let migrations = resolve(&options.sequences)?;
        types.check_scoped_migrations(&migrations)?;

        debug!(
            types = types.len(),
            migrations = migrations.len(),
            "store schema ready"
        );

        Ok(Self {
            types,
            migrations,
            on_validation_failure: options.on_validation_failure,
            config: options.config,
        })
    }

    pub fn types(&self) -> &RecordTypeRegistry {
        &self.types
    }

    /// Migrations in application order
    pub fn migrations(&self) -> &ResolvedMigrations {
        &self.migrations
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Descriptor stamped onto data at the current version
    pub fn current_schema(&self) -> SerializedSchema {
        SerializedSchema::current(self.migrations.ids())
    }

    // ========== Validation ==========

    /// Validate a record against its type, falling back to the repair hook
    ///
    /// Without a repair hook, validation errors are returned as-is.
    pub fn validate_record(
        &self,
        store: &SerializedStore,
        record: &Record,
        phase: ValidationPhase,
        record_before: Option<&Record>,
    ) -> std::result::Result<Record, ValidationError> {
        let result = match self.types.get(&record.type_name) {
            Some(record_type) => record_type.validate(record.clone()),
            None => Err(ValidationError::MissingDefinition(record.type_name.clone())),
        };

        let error = match result {
            Ok(valid) => return Ok(valid),
            Err(error) => error,
        };

        let Some(repair) = &self.on_validation_failure else {
            return Err(error);
        };

        warn!(record_id = %record.id, %phase, %error, "repairing invalid record");
        repair(ValidationFailure {
            error,
            store,
            record,
            phase,
            record_before,
        })
        .map_err(|source| ValidationError::RepairFailed {
            record_id: record.id.clone(),
            source,
        })
    }

    // ========== Record path ==========

    /// Migrate a single persisted record
    ///
    /// With [`MigrationDirection::Up`], `persisted` describes the version the record
    /// was written at and the record is brought to the current version. With
    /// [`MigrationDirection::Down`], the record is at the current version and
    /// `persisted` is the older version to bring it to.
    ///
    /// Only record migrations take part: if a store migration lies between the two
    /// versions the call fails instead (`TargetVersionTooNew` going up, `NoInverse`
    /// going down). The input is never modified.
    pub fn migrate_persisted_record(
        &self,
        record: &Record,
        persisted: &SerializedSchema,
        direction: MigrationDirection,
    ) -> MigrationResult<MigratedRecord> {
        if !self.types.contains(&record.type_name) {
            return Err(MigrationFailureReason::UnknownRecordType {
                type_name: record.type_name.clone(),
            });
        }

        match direction {
            MigrationDirection::Up => self.migrate_record_up(record, persisted),
            MigrationDirection::Down => self.migrate_record_down(record, persisted),
        }
    }

    fn migrate_record_up(
        &self,
        record: &Record,
        persisted: &SerializedSchema,
    ) -> MigrationResult<MigratedRecord> {
        let applied = match persisted {
            SerializedSchema::Legacy(_) => self.legacy_frontier(&self.legacy_bridges()?),
            SerializedSchema::Current { .. } => self.applied_set(persisted)?,
        };

        // Stamping the current history without running these would lose them for good
        if let Some(blocking) = self
            .pending(&applied)
            .into_iter()
            .find(|m| m.scope() == MigrationScope::Store)
        {
            return Err(MigrationFailureReason::TargetVersionTooNew {
                reason: format!(
                    "store migration {} must run on the whole snapshot",
                    blocking.id()
                ),
            });
        }

        let mut record = match persisted {
            SerializedSchema::Legacy(legacy) => self.apply_legacy_to_record(legacy, record)?,
            SerializedSchema::Current { .. } => record.clone(),
        };

        for m in self.types.migrations_for(&record.type_name, &self.migrations) {
            if !applied.contains(&m.id) {
                record = apply_record(m, record)?;
            }
        }

        if self.config.migration.validate_after_migration {
            record = self
                .validate_record(&SerializedStore::new(), &record, ValidationPhase::Initialize, None)
                .map_err(|e| MigrationFailureReason::ValidationFailed {
                    record_id: record.id.clone(),
                    message: e.to_string(),
                })?;
        }

        Ok(MigratedRecord {
            record,
            schema: self.current_schema(),
        })
    }

    fn migrate_record_down(
        &self,
        record: &Record,
        target: &SerializedSchema,
    ) -> MigrationResult<MigratedRecord> {
        if target.is_legacy() {
            return Err(MigrationFailureReason::TargetVersionTooOld {
                reason: "cannot migrate down to the legacy schema format".to_string(),
            });
        }
        let target_applied = self.applied_set(target)?;

        // Store migrations have no inverse
        if let Some(blocking) = self
            .pending(&target_applied)
            .into_iter()
            .rev()
            .find(|m| m.scope() == MigrationScope::Store)
        {
            return Err(MigrationFailureReason::NoInverse {
                id: blocking.id().clone(),
            });
        }

        let to_retract: Vec<&RecordMigration> = self
            .types
            .migrations_for(&record.type_name, &self.migrations)
            .into_iter()
            .rev()
            .filter(|m| !target_applied.contains(&m.id))
            .collect();

        if let Some(m) = to_retract.iter().find(|m| m.down.is_none()) {
            return Err(MigrationFailureReason::NoInverse { id: m.id.clone() });
        }

        let mut record = record.clone();
        for m in to_retract {
            if let Some(down) = &m.down {
                debug!(id = %m.id, record_id = %record.id, "retracting record migration");
                record = checked_transform(&m.id, down(record.clone()), &record.id)?;
            }
        }

        Ok(MigratedRecord {
            record,
            schema: target.clone(),
        })
    }

    // ========== Store path ==========

    /// Bring a whole snapshot to the current version
    ///
    /// Legacy migrations run first when the snapshot uses the legacy descriptor
    /// format. The remaining pending migrations then run in resolved order: store
    /// migrations on the whole store, record migrations on every record of a
    /// registered type. Any failure discards the partially migrated copy.
    pub fn migrate_store_snapshot(&self, snapshot: &StoreSnapshot) -> MigrationResult<StoreSnapshot> {
        let (mut store, applied) = match &snapshot.schema {
            SerializedSchema::Legacy(legacy) => self.apply_legacy(legacy, snapshot.store.clone())?,
            SerializedSchema::Current { .. } => {
                (snapshot.store.clone(), self.applied_set(&snapshot.schema)?)
            }
        };

        let pending = self.pending(&applied);
        for migration in &pending {
            match migration {
                Migration::Store(m) => {
                    debug!(id = %m.id, records = store.len(), "applying store migration");
                    store = (m.up)(store).map_err(|e| transform_failed(&m.id, e))?;
                }
                Migration::Record(m) => {
                    for record in store.values_mut() {
                        if !self.types.contains(&record.type_name) || !m.applies_to(&record.type_name) {
                            continue;
                        }
                        let migrated = apply_record(m, record.clone())?;
                        *record = migrated;
                    }
                }
                Migration::Legacy(_) => {}
            }
        }

        for record in store.values() {
            if self.types.contains(&record.type_name) {
                continue;
            }
            match self.config.migration.unknown_record_types {
                UnknownTypePolicy::PassThrough => {
                    warn!(
                        record_id = %record.id,
                        type_name = %record.type_name,
                        "carrying record of unknown type through migration unchanged"
                    );
                }
                UnknownTypePolicy::Reject => {
                    return Err(MigrationFailureReason::UnknownRecordType {
                        type_name: record.type_name.clone(),
                    });
                }
            }
        }

        if self.config.migration.validate_after_migration {
            store = self.validate_store(store)?;
        }

        info!(
            records = store.len(),
            applied = pending.len(),
            "migrated store snapshot"
        );

        Ok(StoreSnapshot {
            store,
            schema: self.current_schema(),
        })
    }

    fn validate_store(&self, store: SerializedStore) -> MigrationResult<SerializedStore> {
        let mut validated = SerializedStore::new();
        for (id, record) in &store {
            if !self.types.contains(&record.type_name) {
                validated.insert(id.clone(), record.clone());
                continue;
            }
            let valid = self
                .validate_record(&store, record, ValidationPhase::Initialize, None)
                .map_err(|e| MigrationFailureReason::ValidationFailed {
                    record_id: id.clone(),
                    message: e.to_string(),
                })?;
            validated.insert(id.clone(), valid);
        }
        Ok(validated)
    }

    // ========== Frontier handling ==========

    /// Migrations a current-format descriptor counts as applied
    ///
    /// Legacy migrations are always counted: data written in the current format
    /// never needs the format bridge.
    fn applied_set(&self, schema: &SerializedSchema) -> MigrationResult<HashSet<MigrationId>> {
        let history = schema.version_history().unwrap_or_default();

        let mut applied = HashSet::with_capacity(history.len());
        for id in history {
            if !self.migrations.contains(id) {
                return Err(MigrationFailureReason::TargetVersionTooNew {
                    reason: format!("unknown migration {id}"),
                });
            }
            applied.insert(id.clone());
        }

        applied.extend(
            self.migrations
                .iter()
                .filter(|m| m.scope() == MigrationScope::Legacy)
                .map(|m| m.id().clone()),
        );

        if let Some((id, missing)) = self.migrations.find_unmet_dependency(&applied) {
            return Err(MigrationFailureReason::InconsistentFrontier { id, missing });
        }
        Ok(applied)
    }

    /// Registered legacy migrations in application order
    fn legacy_bridges(&self) -> MigrationResult<Vec<&LegacyMigration>> {
        let bridges: Vec<_> = self
            .migrations
            .iter()
            .filter_map(|m| match m {
                Migration::Legacy(l) => Some(l),
                _ => None,
            })
            .collect();

        if bridges.is_empty() {
            return Err(MigrationFailureReason::TargetVersionTooOld {
                reason: "data uses the legacy schema format and no legacy migration is registered"
                    .to_string(),
            });
        }
        Ok(bridges)
    }

    /// Frontier of legacy data once `bridges` ran: the bridges and everything they depend on
    fn legacy_frontier(&self, bridges: &[&LegacyMigration]) -> HashSet<MigrationId> {
        self.migrations
            .dependency_closure(bridges.iter().copied().map(|b| &b.id))
    }

    /// Run every legacy migration over `store`
    fn apply_legacy(
        &self,
        legacy: &LegacySchema,
        mut store: SerializedStore,
    ) -> MigrationResult<(SerializedStore, HashSet<MigrationId>)> {
        let bridges = self.legacy_bridges()?;
        for bridge in &bridges {
            store = run_bridge(bridge, legacy, store)?;
        }
        Ok((store, self.legacy_frontier(&bridges)))
    }

    /// Run every legacy migration over a store holding only `record`
    fn apply_legacy_to_record(&self, legacy: &LegacySchema, record: &Record) -> MigrationResult<Record> {
        let mut current = record.clone();
        for bridge in self.legacy_bridges()? {
            let single = SerializedStore::from([(current.id.clone(), current)]);
            current = run_bridge(bridge, legacy, single)?
                .remove(&record.id)
                .ok_or_else(|| MigrationFailureReason::RecordDroppedByLegacyMigration {
                    id: bridge.id.clone(),
                    record_id: record.id.clone(),
                })?;
        }
        Ok(current)
    }

    /// Not-yet-applied migrations in application order
    fn pending(&self, applied: &HashSet<MigrationId>) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|m| !applied.contains(m.id()))
            .collect()
    }

    // ========== Serialization ==========

    /// Legacy-format descriptor with the current version of every type
    pub fn serialize(&self) -> SerializedSchema {
        self.serialize_legacy(self.config.legacy.store_version, |range| range.current)
    }

    /// Legacy-format descriptor with the earliest supported version of every type
    pub fn serialize_earliest_version(&self) -> SerializedSchema {
        self.serialize_legacy(self.config.legacy.first_store_version, |range| range.first)
    }

    fn serialize_legacy(&self, store_version: u32, pick: fn(&VersionRange) -> u32) -> SerializedSchema {
        let record_versions = self
            .types
            .iter()
            .map(|t| (t.type_name.clone(), legacy_record_version(&t.legacy, pick)))
            .collect();

        SerializedSchema::Legacy(LegacySchema {
            store_version,
            record_versions,
        })
    }

    /// Check that a legacy-format client can read data written by this schema
    ///
    /// Every version the client reports must fall between the earliest supported
    /// and the current version. Types this schema does not know are ignored.
    pub fn check_legacy_client(&self, client: &LegacySchema) -> MigrationResult<()> {
        let stores = VersionRange::new(
            self.config.legacy.first_store_version,
            self.config.legacy.store_version,
        );
        check_range("store", client.store_version, &stores)?;

        for (type_name, version) in &client.record_versions {
            let Some(record_type) = self.types.get(type_name) else {
                continue;
            };
            check_range(type_name, version.version(), &record_type.legacy.range)?;

            if let RecordVersion::WithSubTypes { sub_type_versions, .. } = version {
                for (sub_type, sub_version) in sub_type_versions {
                    if let Some(range) = record_type.legacy.sub_types.get(sub_type) {
                        check_range(&format!("{type_name}.{sub_type}"), *sub_version, range)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn legacy_record_version(legacy: &LegacyVersions, pick: fn(&VersionRange) -> u32) -> RecordVersion {
    match &legacy.sub_type_key {
        Some(sub_type_key) if legacy.has_sub_types() => RecordVersion::WithSubTypes {
            version: pick(&legacy.range),
            sub_type_key: sub_type_key.clone(),
            sub_type_versions: legacy
                .sub_types
                .iter()
                .map(|(name, range)| (name.clone(), pick(range)))
                .collect::<BTreeMap<_, _>>(),
        },
        _ => RecordVersion::Flat {
            version: pick(&legacy.range),
        },
    }
}

fn check_range(what: &str, version: u32, range: &VersionRange) -> MigrationResult<()> {
    if version < range.first {
        return Err(MigrationFailureReason::TargetVersionTooOld {
            reason: format!("{what} v{version} predates earliest supported v{}", range.first),
        });
    }
    if version > range.current {
        return Err(MigrationFailureReason::TargetVersionTooNew {
            reason: format!("{what} v{version} is newer than current v{}", range.current),
        });
    }
    Ok(())
}

fn run_bridge(
    bridge: &LegacyMigration,
    legacy: &LegacySchema,
    store: SerializedStore,
) -> MigrationResult<SerializedStore> {
    debug!(
        id = %bridge.id,
        store_version = legacy.store_version,
        records = store.len(),
        "applying legacy migration"
    );
    (bridge.up)(legacy, store).map_err(|e| transform_failed(&bridge.id, e))
}

fn apply_record(migration: &RecordMigration, record: Record) -> MigrationResult<Record> {
    debug!(id = %migration.id, record_id = %record.id, "applying record migration");
    let record_id = record.id.clone();
    checked_transform(&migration.id, (migration.up)(record), &record_id)
}

/// Record migrations may rewrite a record but never turn it into another one
fn checked_transform(
    id: &MigrationId,
    result: anyhow::Result<Record>,
    record_id: &str,
) -> MigrationResult<Record> {
    let record = result.map_err(|e| transform_failed(id, e))?;
    if record.id != record_id {
        return Err(MigrationFailureReason::TransformFailed {
            id: id.clone(),
            message: format!("record id changed from {record_id} to {}", record.id),
        });
    }
    Ok(record)
}

fn transform_failed(id: &MigrationId, error: anyhow::Error) -> MigrationFailureReason {
    MigrationFailureReason::TransformFailed {
        id: id.clone(),
        message: format!("{error:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::StoreMigration;
    use serde_json::{json, Value};

    fn schema_with(types: Vec<RecordType>, sequences: Vec<MigrationSequence>) -> StoreSchema {
        StoreSchema::new(types, StoreSchemaOptions::new().with_sequences(sequences)).unwrap()
    }

    fn empty_history() -> SerializedSchema {
        SerializedSchema::current(Vec::new())
    }

    #[test]
    fn test_current_schema_lists_resolved_order() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![
                MigrationSequence::new("b", vec![RecordMigration::new("b/1", Ok).depends_on(["a/1"]).into()]),
                MigrationSequence::new("a", vec![RecordMigration::new("a/1", Ok).into()]),
            ],
        );
        assert_eq!(
            schema.current_schema(),
            SerializedSchema::current(vec![MigrationId::from("a/1"), MigrationId::from("b/1")])
        );
    }

    #[test]
    fn test_cycle_prevents_construction() {
        let result = StoreSchema::new(
            vec![RecordType::new("page")],
            StoreSchemaOptions::new().with_sequence(MigrationSequence::new(
                "a",
                vec![
                    RecordMigration::new("a/1", Ok).depends_on(["a/2"]).into(),
                    RecordMigration::new("a/2", Ok).depends_on(["a/1"]).into(),
                ],
            )),
        );
        assert!(matches!(result, Err(crate::SchemaError::CyclicDependency { .. })));
    }

    #[test]
    fn test_up_applies_only_pending_migrations_in_order() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "a",
                vec![
                    RecordMigration::new("a/1", |mut r: Record| {
                        r.insert("log", "1");
                        Ok(r)
                    })
                    .into(),
                    RecordMigration::new("a/2", |mut r: Record| {
                        let log = r.get("log").and_then(|v| v.as_str()).unwrap_or("").to_string();
                        r.insert("log", format!("{log}2"));
                        Ok(r)
                    })
                    .depends_on(["a/1"])
                    .into(),
                ],
            )],
        );

        let record = Record::new("page:1", "page");
        let migrated = schema
            .migrate_persisted_record(&record, &empty_history(), MigrationDirection::Up)
            .unwrap();
        assert_eq!(migrated.record.get("log"), Some(&json!("12")));

        let partial = SerializedSchema::current(vec![MigrationId::from("a/1")]);
        let record = Record::new("page:2", "page").with_field("log", "1");
        let migrated = schema
            .migrate_persisted_record(&record, &partial, MigrationDirection::Up)
            .unwrap();
        assert_eq!(migrated.record.get("log"), Some(&json!("12")));
        assert_eq!(migrated.schema, schema.current_schema());
    }

    #[test]
    fn test_transform_failure_names_the_migration() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "a",
                vec![
                    RecordMigration::new("a/1", Ok).into(),
                    RecordMigration::new("a/2", |_| anyhow::bail!("bad record")).into(),
                ],
            )],
        );
        let err = schema
            .migrate_persisted_record(&Record::new("p", "page"), &empty_history(), MigrationDirection::Up)
            .unwrap_err();
        assert_eq!(
            err,
            MigrationFailureReason::TransformFailed {
                id: MigrationId::from("a/2"),
                message: "bad record".to_string(),
            }
        );
    }

    #[test]
    fn test_record_migration_may_not_change_id() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "a",
                vec![RecordMigration::new("a/1", |mut r: Record| {
                    r.id = "other".to_string();
                    Ok(r)
                })
                .into()],
            )],
        );
        let err = schema
            .migrate_persisted_record(&Record::new("p", "page"), &empty_history(), MigrationDirection::Up)
            .unwrap_err();
        assert!(matches!(err, MigrationFailureReason::TransformFailed { .. }));
    }

    #[test]
    fn test_unknown_history_entry_is_too_new() {
        let schema = schema_with(vec![RecordType::new("page")], vec![]);
        let from_newer = SerializedSchema::current(vec![MigrationId::from("future/1")]);
        let err = schema
            .migrate_persisted_record(&Record::new("p", "page"), &from_newer, MigrationDirection::Up)
            .unwrap_err();
        assert!(matches!(err, MigrationFailureReason::TargetVersionTooNew { .. }));
    }

    #[test]
    fn test_history_missing_dependency_is_inconsistent() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "a",
                vec![
                    RecordMigration::new("a/1", Ok).into(),
                    RecordMigration::new("a/2", Ok).depends_on(["a/1"]).into(),
                ],
            )],
        );
        let broken = SerializedSchema::current(vec![MigrationId::from("a/2")]);
        let err = schema
            .migrate_persisted_record(&Record::new("p", "page"), &broken, MigrationDirection::Up)
            .unwrap_err();
        assert_eq!(
            err,
            MigrationFailureReason::InconsistentFrontier {
                id: MigrationId::from("a/2"),
                missing: MigrationId::from("a/1"),
            }
        );
    }

    #[test]
    fn test_unknown_type_on_record_path() {
        let schema = schema_with(vec![RecordType::new("page")], vec![]);
        let err = schema
            .migrate_persisted_record(&Record::new("x", "ghost"), &empty_history(), MigrationDirection::Up)
            .unwrap_err();
        assert_eq!(
            err,
            MigrationFailureReason::UnknownRecordType {
                type_name: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_down_skips_migrations_for_other_types() {
        let schema = schema_with(
            vec![RecordType::new("page"), RecordType::new("shape")],
            vec![MigrationSequence::new(
                "a",
                vec![
                    RecordMigration::new("a/1", Ok).for_type("shape").into(),
                    RecordMigration::new("a/2", |mut r: Record| {
                        r.insert("title", "untitled");
                        Ok(r)
                    })
                    .with_down(|mut r: Record| {
                        r.remove("title");
                        Ok(r)
                    })
                    .for_type("page")
                    .into(),
                ],
            )],
        );

        let record = Record::new("page:1", "page").with_field("title", "untitled");
        let migrated = schema
            .migrate_persisted_record(&record, &empty_history(), MigrationDirection::Down)
            .unwrap();
        assert_eq!(migrated.record, Record::new("page:1", "page"));
        assert_eq!(migrated.schema, empty_history());

        let shape = Record::new("shape:1", "shape");
        let err = schema
            .migrate_persisted_record(&shape, &empty_history(), MigrationDirection::Down)
            .unwrap_err();
        assert_eq!(err, MigrationFailureReason::NoInverse { id: MigrationId::from("a/1") });
    }

    fn record_then_store_schema() -> StoreSchema {
        schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "p",
                vec![
                    RecordMigration::new("p/1", |mut r: Record| {
                        r.insert("b", r.get("a").cloned().unwrap_or(Value::Null));
                        Ok(r)
                    })
                    .with_down(|mut r: Record| {
                        r.remove("b");
                        Ok(r)
                    })
                    .into(),
                    StoreMigration::new("p/2", |mut store: SerializedStore| {
                        for record in store.values_mut() {
                            record.insert("storeRan", true);
                        }
                        Ok(store)
                    })
                    .depends_on(["p/1"])
                    .into(),
                ],
            )],
        )
    }

    #[test]
    fn test_down_across_store_migration_has_no_inverse() {
        let schema = record_then_store_schema();
        let record = Record::new("page:1", "page")
            .with_field("a", 1)
            .with_field("b", 1)
            .with_field("storeRan", true);

        let err = schema
            .migrate_persisted_record(&record, &empty_history(), MigrationDirection::Down)
            .unwrap_err();
        assert_eq!(err, MigrationFailureReason::NoInverse { id: MigrationId::from("p/2") });

        let before_store = SerializedSchema::current(vec![MigrationId::from("p/1")]);
        let err = schema
            .migrate_persisted_record(&record, &before_store, MigrationDirection::Down)
            .unwrap_err();
        assert_eq!(err, MigrationFailureReason::NoInverse { id: MigrationId::from("p/2") });
    }

    #[test]
    fn test_up_across_store_migration_is_refused() {
        let schema = record_then_store_schema();
        let record = Record::new("page:1", "page").with_field("a", 1);

        let err = schema
            .migrate_persisted_record(&record, &empty_history(), MigrationDirection::Up)
            .unwrap_err();
        assert!(matches!(err, MigrationFailureReason::TargetVersionTooNew { ref reason } if reason.contains("p/2")));

        // The snapshot path still runs both
        let snapshot = StoreSnapshot::new(empty_history()).with_record(record);
        let migrated = schema.migrate_store_snapshot(&snapshot).unwrap();
        assert_eq!(migrated.store["page:1"].get("storeRan"), Some(&json!(true)));
        assert_eq!(migrated.store["page:1"].get("b"), Some(&json!(1)));

        // Once past the store migration, single records move freely again
        let current = schema
            .migrate_persisted_record(&migrated.store["page:1"], &migrated.schema, MigrationDirection::Up)
            .unwrap();
        assert_eq!(current.record, migrated.store["page:1"]);
    }

    #[test]
    fn test_history_may_omit_legacy_migrations() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "core",
                vec![
                    RecordMigration::new("core/1", Ok).into(),
                    LegacyMigration::new("core/legacy", |_, store| Ok(store))
                        .depends_on(["core/1"])
                        .into(),
                    RecordMigration::new("core/2", Ok).depends_on(["core/legacy"]).into(),
                ],
            )],
        );
        let history = SerializedSchema::current(vec![MigrationId::from("core/1"), MigrationId::from("core/2")]);
        let migrated = schema
            .migrate_persisted_record(&Record::new("page:1", "page"), &history, MigrationDirection::Up)
            .unwrap();
        assert_eq!(migrated.schema, schema.current_schema());
    }

    #[test]
    fn test_down_to_legacy_format_is_too_old() {
        let schema = schema_with(vec![RecordType::new("page")], vec![]);
        let err = schema
            .migrate_persisted_record(
                &Record::new("p", "page"),
                &SerializedSchema::Legacy(LegacySchema::default()),
                MigrationDirection::Down,
            )
            .unwrap_err();
        assert!(matches!(err, MigrationFailureReason::TargetVersionTooOld { .. }));
    }

    #[test]
    fn test_legacy_record_without_bridge_is_too_old() {
        let schema = schema_with(vec![RecordType::new("page")], vec![]);
        let err = schema
            .migrate_persisted_record(
                &Record::new("p", "page"),
                &SerializedSchema::Legacy(LegacySchema::default()),
                MigrationDirection::Up,
            )
            .unwrap_err();
        assert!(matches!(err, MigrationFailureReason::TargetVersionTooOld { .. }));
    }

    #[test]
    fn test_legacy_record_goes_through_bridge() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "core",
                vec![
                    RecordMigration::new("core/1", |mut r: Record| {
                        r.insert("v1", true);
                        Ok(r)
                    })
                    .into(),
                    LegacyMigration::new("core/legacy", |legacy: &LegacySchema, mut store: SerializedStore| {
                        let version = legacy.version_of("page").unwrap_or(0);
                        for record in store.values_mut() {
                            record.insert("legacyVersion", version);
                        }
                        Ok(store)
                    })
                    .depends_on(["core/1"])
                    .into(),
                    RecordMigration::new("core/2", |mut r: Record| {
                        r.insert("v2", true);
                        Ok(r)
                    })
                    .depends_on(["core/legacy"])
                    .into(),
                ],
            )],
        );

        let mut record_versions = BTreeMap::new();
        record_versions.insert("page".to_string(), RecordVersion::Flat { version: 5 });
        let legacy = SerializedSchema::Legacy(LegacySchema {
            store_version: 1,
            record_versions,
        });

        let migrated = schema
            .migrate_persisted_record(&Record::new("page:1", "page"), &legacy, MigrationDirection::Up)
            .unwrap();
        assert_eq!(migrated.record.get("legacyVersion"), Some(&json!(5)));
        assert_eq!(migrated.record.get("v1"), None);
        assert_eq!(migrated.record.get("v2"), Some(&json!(true)));
    }

    #[test]
    fn test_legacy_bridge_dropping_record() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "core",
                vec![LegacyMigration::new("core/legacy", |_, _| Ok(SerializedStore::new())).into()],
            )],
        );
        let err = schema
            .migrate_persisted_record(
                &Record::new("page:1", "page"),
                &SerializedSchema::Legacy(LegacySchema::default()),
                MigrationDirection::Up,
            )
            .unwrap_err();
        assert_eq!(
            err,
            MigrationFailureReason::RecordDroppedByLegacyMigration {
                id: MigrationId::from("core/legacy"),
                record_id: "page:1".to_string(),
            }
        );
    }

    #[test]
    fn test_dropped_record_names_the_bridge_that_dropped_it() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "core",
                vec![
                    LegacyMigration::new("core/legacy_drop", |_, _| Ok(SerializedStore::new())).into(),
                    LegacyMigration::new("core/legacy_keep", |_, store| Ok(store)).into(),
                ],
            )],
        );
        let err = schema
            .migrate_persisted_record(
                &Record::new("page:1", "page"),
                &SerializedSchema::Legacy(LegacySchema::default()),
                MigrationDirection::Up,
            )
            .unwrap_err();
        assert_eq!(
            err,
            MigrationFailureReason::RecordDroppedByLegacyMigration {
                id: MigrationId::from("core/legacy_drop"),
                record_id: "page:1".to_string(),
            }
        );
    }

    #[test]
    fn test_validation_failure_without_repair() {
        let page = RecordType::new("page").with_validator(|r| {
            if r.get("name").is_some() {
                Ok(r)
            } else {
                anyhow::bail!("name is required")
            }
        });
        let schema = schema_with(vec![page], vec![]);

        let err = schema
            .migrate_persisted_record(&Record::new("page:1", "page"), &empty_history(), MigrationDirection::Up)
            .unwrap_err();
        assert_eq!(
            err,
            MigrationFailureReason::ValidationFailed {
                record_id: "page:1".to_string(),
                message: "Invalid page record page:1: name is required".to_string(),
            }
        );
    }

    #[test]
    fn test_validation_disabled_by_config() {
        let page = RecordType::new("page").with_validator(|_| anyhow::bail!("never valid"));
        let mut config = MigrationConfig::default();
        config.migration.validate_after_migration = false;
        let schema = StoreSchema::new(vec![page], StoreSchemaOptions::new().with_config(config)).unwrap();

        assert!(schema
            .migrate_persisted_record(&Record::new("page:1", "page"), &empty_history(), MigrationDirection::Up)
            .is_ok());
    }

    #[test]
    fn test_repair_hook_sees_full_context() {
        let page = RecordType::new("page").with_validator(|r| {
            if r.get("name").is_some() {
                Ok(r)
            } else {
                anyhow::bail!("name is required")
            }
        });
        let options = StoreSchemaOptions::new().on_validation_failure(|failure| {
            assert_eq!(failure.phase, ValidationPhase::UpdateRecord);
            assert_eq!(failure.record_before.map(|r| r.id.as_str()), Some("page:1"));
            assert!(failure.store.contains_key("page:1"));
            assert!(matches!(failure.error, ValidationError::Rejected { .. }));
            Ok(failure.record.clone().with_field("name", "repaired"))
        });
        let schema = StoreSchema::new(vec![page], options).unwrap();

        let before = Record::new("page:1", "page").with_field("name", "old");
        let store = SerializedStore::from([(before.id.clone(), before.clone())]);
        let after = Record::new("page:1", "page");

        let repaired = schema
            .validate_record(&store, &after, ValidationPhase::UpdateRecord, Some(&before))
            .unwrap();
        assert_eq!(repaired.get("name"), Some(&json!("repaired")));
    }

    #[test]
    fn test_missing_definition_goes_through_repair_hook() {
        let options = StoreSchemaOptions::new().on_validation_failure(|failure| {
            assert!(matches!(failure.error, ValidationError::MissingDefinition(_)));
            anyhow::bail!("cannot repair {}", failure.record.type_name)
        });
        let schema = StoreSchema::new(vec![RecordType::new("page")], options).unwrap();

        let err = schema
            .validate_record(&SerializedStore::new(), &Record::new("x", "ghost"), ValidationPhase::Tests, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "Repair of record x failed: cannot repair ghost");
    }

    #[test]
    fn test_store_migrations_interleave_with_record_migrations() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "a",
                vec![
                    RecordMigration::new("a/1", |mut r: Record| {
                        r.insert("stage", 1);
                        Ok(r)
                    })
                    .into(),
                    StoreMigration::new("a/2", |mut store: SerializedStore| {
                        let all_stage_one = store.values().all(|r| r.get("stage") == Some(&json!(1)));
                        anyhow::ensure!(all_stage_one, "record migration a/1 has not run");
                        store.insert("page:new".to_string(), Record::new("page:new", "page"));
                        Ok(store)
                    })
                    .depends_on(["a/1"])
                    .into(),
                ],
            )],
        );

        let snapshot = StoreSnapshot::new(empty_history()).with_record(Record::new("page:1", "page"));
        let migrated = schema.migrate_store_snapshot(&snapshot).unwrap();
        assert_eq!(migrated.store.len(), 2);
        assert_eq!(migrated.schema, schema.current_schema());
    }

    #[test]
    fn test_store_failure_aborts_snapshot() {
        let schema = schema_with(
            vec![RecordType::new("page")],
            vec![MigrationSequence::new(
                "a",
                vec![StoreMigration::new("a/1", |_| anyhow::bail!("disk full")).into()],
            )],
        );
        let snapshot = StoreSnapshot::new(empty_history()).with_record(Record::new("page:1", "page"));
        let err = schema.migrate_store_snapshot(&snapshot).unwrap_err();
        assert_eq!(
            err,
            MigrationFailureReason::TransformFailed {
                id: MigrationId::from("a/1"),
                message: "disk full".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected_by_policy() {
        let mut config = MigrationConfig::default();
        config.migration.unknown_record_types = UnknownTypePolicy::Reject;
        let schema = StoreSchema::new(
            vec![RecordType::new("page")],
            StoreSchemaOptions::new().with_config(config),
        )
        .unwrap();

        let snapshot = StoreSnapshot::new(empty_history()).with_record(Record::new("x", "ghost"));
        assert_eq!(
            schema.migrate_store_snapshot(&snapshot).unwrap_err(),
            MigrationFailureReason::UnknownRecordType {
                type_name: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_serialize_reports_current_and_earliest_versions() {
        let shape = RecordType::new("shape").with_legacy_versions(
            LegacyVersions::new(VersionRange::new(1, 3))
                .with_sub_type_key("type")
                .with_sub_type("geo", VersionRange::new(0, 7))
                .with_sub_type("arrow", VersionRange::new(2, 4)),
        );
        let page = RecordType::new("page").with_legacy_versions(LegacyVersions::new(VersionRange::new(0, 2)));
        let mut config = MigrationConfig::default();
        config.legacy.store_version = 4;
        config.legacy.first_store_version = 1;
        let schema = StoreSchema::new(vec![shape, page], StoreSchemaOptions::new().with_config(config)).unwrap();

        assert_eq!(
            serde_json::to_value(schema.serialize()).unwrap(),
            json!({
                "schemaVersion": 1,
                "storeVersion": 4,
                "recordVersions": {
                    "page": { "version": 2 },
                    "shape": { "version": 3, "subTypeKey": "type", "subTypeVersions": { "arrow": 4, "geo": 7 } }
                }
            })
        );
        assert_eq!(
            serde_json::to_value(schema.serialize_earliest_version()).unwrap(),
            json!({
                "schemaVersion": 1,
                "storeVersion": 1,
                "recordVersions": {
                    "page": { "version": 0 },
                    "shape": { "version": 1, "subTypeKey": "type", "subTypeVersions": { "arrow": 2, "geo": 0 } }
                }
            })
        );
    }

    #[test]
    fn test_check_legacy_client() {
        let shape = RecordType::new("shape").with_legacy_versions(
            LegacyVersions::new(VersionRange::new(1, 3))
                .with_sub_type_key("type")
                .with_sub_type("geo", VersionRange::new(2, 5)),
        );
        let mut config = MigrationConfig::default();
        config.legacy.store_version = 2;
        let schema = StoreSchema::new(vec![shape], StoreSchemaOptions::new().with_config(config)).unwrap();

        let client = |store_version: u32, shape: u32, geo: u32| {
            let mut record_versions = BTreeMap::new();
            record_versions.insert(
                "shape".to_string(),
                RecordVersion::WithSubTypes {
                    version: shape,
                    sub_type_key: "type".to_string(),
                    sub_type_versions: BTreeMap::from([("geo".to_string(), geo)]),
                },
            );
            record_versions.insert("unknown".to_string(), RecordVersion::Flat { version: 99 });
            LegacySchema {
                store_version,
                record_versions,
            }
        };

        assert!(schema.check_legacy_client(&client(2, 2, 3)).is_ok());
        assert!(matches!(
            schema.check_legacy_client(&client(2, 0, 3)),
            Err(MigrationFailureReason::TargetVersionTooOld { .. })
        ));
        assert!(matches!(
            schema.check_legacy_client(&client(2, 2, 6)),
            Err(MigrationFailureReason::TargetVersionTooNew { .. })
        ));
        assert!(matches!(
            schema.check_legacy_client(&client(3, 2, 3)),
            Err(MigrationFailureReason::TargetVersionTooNew { .. })
        ));
    }

    #[test]
    fn test_schema_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StoreSchema>();
    }
}
