//! Opaque persisted records and store snapshots

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::schema::SerializedSchema;

/// Record id, unique within a store
pub type RecordId = String;

/// All records of a store keyed by id
pub type SerializedStore = BTreeMap<RecordId, Record>;

/// A persisted record
///
/// Only `id` and `typeName` are interpreted by the engine; every other field is
/// carried as JSON and belongs to whoever defines the record type. A record that is
/// read and written back without changes keeps its key order, including where `id`
/// and `typeName` sat, and its number literals.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: RecordId,
    pub type_name: String,
    pub fields: Map<String, Value>,
    layout: KeyLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reserved {
    Id,
    TypeName,
}

/// Where `id` and `typeName` go among `fields`, as the number of fields before each
#[derive(Debug, Clone, Copy)]
struct KeyLayout([(usize, Reserved); 2]);

impl Default for KeyLayout {
    fn default() -> Self {
        Self([(0, Reserved::Id), (0, Reserved::TypeName)])
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.type_name == other.type_name && self.fields == other.fields
    }
}

impl Record {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            fields: Map::new(),
            layout: KeyLayout::default(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    /// Remove a field, keeping the order of the rest
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    /// Value of the sub-type field, when it is a string
    pub fn sub_type(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    fn serialize_reserved<M: SerializeMap>(
        &self,
        map: &mut M,
        key: Reserved,
    ) -> std::result::Result<(), M::Error> {
        match key {
            Reserved::Id => map.serialize_entry("id", &self.id),
            Reserved::TypeName => map.serialize_entry("typeName", &self.type_name),
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 2))?;
        let mut reserved = self.layout.0.iter().peekable();

        let fields = self
            .fields
            .iter()
            .filter(|(key, _)| key.as_str() != "id" && key.as_str() != "typeName");
        for (i, (key, value)) in fields.enumerate() {
            while let Some((_, slot)) = reserved.next_if(|(before, _)| *before <= i) {
                self.serialize_reserved(&mut map, *slot)?;
            }
            map.serialize_entry(key, value)?;
        }
        for (_, slot) in reserved {
            self.serialize_reserved(&mut map, *slot)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let object = Map::<String, Value>::deserialize(deserializer)?;

        let mut fields = Map::new();
        let mut id = None;
        let mut type_name = None;
        let mut positions = Vec::with_capacity(2);
        for (key, value) in object {
            match key.as_str() {
                "id" => {
                    id = Some(string_field::<D::Error>("id", value)?);
                    positions.push((fields.len(), Reserved::Id));
                }
                "typeName" => {
                    type_name = Some(string_field::<D::Error>("typeName", value)?);
                    positions.push((fields.len(), Reserved::TypeName));
                }
                _ => {
                    fields.insert(key, value);
                }
            }
        }

        let layout = match positions.as_slice() {
            [first, second] => KeyLayout([*first, *second]),
            _ => KeyLayout::default(),
        };
        Ok(Record {
            id: id.ok_or_else(|| de::Error::missing_field("id"))?,
            type_name: type_name.ok_or_else(|| de::Error::missing_field("typeName"))?,
            fields,
            layout,
        })
    }
}

fn string_field<E: de::Error>(name: &str, value: Value) -> std::result::Result<String, E> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(E::custom(format!("record {name} must be a string, got {other}"))),
    }
}

/// A whole store together with the schema it was written with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub store: SerializedStore,
    pub schema: SerializedSchema,
}

impl StoreSnapshot {
    /// Parse a snapshot from a JSON value
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Read a snapshot from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn new(schema: SerializedSchema) -> Self {
        Self {
            store: SerializedStore::new(),
            schema,
        }
    }

    /// Builder-style record insert
    pub fn with_record(mut self, record: Record) -> Self {
        self.store.insert(record.id.clone(), record);
        self
    }

    /// Count records per type name
    pub fn type_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for record in self.store.values() {
            *counts.entry(record.type_name.as_str()).or_insert(0) += 1;
        }
        counts
    }
}
