//! Core data types and error definitions for the ingestion pipeline.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Reserved field carrying the embedding vector inside stored documents.
pub const EMBEDDING_FIELD: &str = "embedding";
/// Field holding the stable document key of every record.
pub const ID_FIELD: &str = "id";
/// Suffix appended to collection names written by the embedding task kind.
pub const EMBEDDING_COLLECTION_SUFFIX: &str = "_emb";

/// Record as received on the wire, before conversion into [`Record`].
pub type RawRecord = Map<String, serde_json::Value>;

/// Opaque job identifier assigned at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Placeholder used when a job's identity could not be recovered.
    pub const SENTINEL: &'static str = "0";

    /// Allocate a fresh, unique identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Identifier reported for deliveries without a usable execution context.
    pub fn sentinel() -> Self {
        Self(Self::SENTINEL.to_string())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processing variant requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Normalize and index records as-is.
    #[serde(rename = "insert")]
    Insert,
    /// Normalize, embed, and index records into `<collection>_emb`.
    #[serde(rename = "insert_emb")]
    InsertWithEmbedding,
}

impl TaskKind {
    /// Wire name of the task kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::InsertWithEmbedding => "insert_emb",
        }
    }

    /// Collection that records of `collection` are written to for this task kind.
    pub fn target_collection(self, collection: &str) -> String {
        match self {
            Self::Insert => collection.to_string(),
            Self::InsertWithEmbedding => format!("{collection}{EMBEDDING_COLLECTION_SUFFIX}"),
        }
    }

    /// Whether records are embedded before indexing.
    pub const fn embeds(self) -> bool {
        matches!(self, Self::InsertWithEmbedding)
    }
}

/// Records destined for a single collection, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionBatch {
    /// Collection name as submitted.
    pub name: String,
    /// Raw records in payload order.
    pub records: Vec<RawRecord>,
}

/// Errors raised when a submission body is not a `collection -> [record]` mapping.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    /// The top-level JSON value was not an object.
    #[error("payload must be a JSON object mapping collection names to record lists")]
    NotAnObject,
    /// A collection entry was not an array.
    #[error("collection '{0}' must map to a list of records")]
    NotAList(String),
    /// A record inside a collection was not an object.
    #[error("record {position} of collection '{collection}' is not a JSON object")]
    NotARecord {
        /// Collection holding the malformed entry.
        collection: String,
        /// Zero-based index within the collection.
        position: usize,
    },
    /// No collection carried any record.
    #[error("payload contains no records")]
    Empty,
}

/// Bulk payload of a job: collections and their records, order preserved.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobPayload {
    collections: Vec<CollectionBatch>,
}

impl JobPayload {
    /// Build a payload from already validated batches.
    pub fn new(collections: Vec<CollectionBatch>) -> Self {
        Self { collections }
    }

    /// Validate and convert an arbitrary JSON document.
    pub fn from_json(value: serde_json::Value) -> Result<Self, PayloadError> {
        let serde_json::Value::Object(map) = value else {
            return Err(PayloadError::NotAnObject);
        };

        let mut collections = Vec::with_capacity(map.len());
        for (name, entry) in map {
            let serde_json::Value::Array(items) = entry else {
                return Err(PayloadError::NotAList(name));
            };
            let mut records = Vec::with_capacity(items.len());
            for (position, item) in items.into_iter().enumerate() {
                match item {
                    serde_json::Value::Object(record) => records.push(record),
                    _ => {
                        return Err(PayloadError::NotARecord {
                            collection: name,
                            position,
                        });
                    }
                }
            }
            collections.push(CollectionBatch { name, records });
        }

        let payload = Self { collections };
        if payload.record_count() == 0 {
            return Err(PayloadError::Empty);
        }
        Ok(payload)
    }

    /// Collections in submission order.
    pub fn collections(&self) -> &[CollectionBatch] {
        &self.collections
    }

    /// Total number of records across every collection.
    pub fn record_count(&self) -> usize {
        self.collections.iter().map(|batch| batch.records.len()).sum()
    }

    fn to_json(&self) -> serde_json::Value {
        let mut map = Map::new();
        for batch in &self.collections {
            let records = batch
                .records
                .iter()
                .cloned()
                .map(serde_json::Value::Object)
                .collect();
            map.insert(batch.name.clone(), serde_json::Value::Array(records));
        }
        serde_json::Value::Object(map)
    }
}

impl Serialize for JobPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JobPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_json(value).map_err(serde::de::Error::custom)
    }
}

/// A unit of work owned by the broker until a worker acknowledges it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Identifier assigned at submission.
    pub id: JobId,
    /// Requested processing variant.
    pub task_kind: TaskKind,
    /// Records to ingest.
    pub payload: JobPayload,
}

/// Closed set of field values accepted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Free text.
    Text(String),
    /// Integer or floating point number, kept in its original representation.
    Number(Number),
    /// Multi-valued text field.
    List(Vec<String>),
}

impl Value {
    /// Borrow the text content of a [`Value::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// A single document keyed by field name.
///
/// Fields are kept sorted so that every serialization of a record is canonical.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a raw wire record, rejecting values outside the closed [`Value`] set.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, NormalizeError> {
        let mut fields = BTreeMap::new();
        for (name, value) in raw {
            let converted = match value {
                serde_json::Value::String(text) => Value::Text(text.clone()),
                serde_json::Value::Number(number) => Value::Number(number.clone()),
                serde_json::Value::Array(items) => {
                    let mut list = Vec::with_capacity(items.len());
                    for item in items {
                        let Some(text) = item.as_str() else {
                            return Err(NormalizeError::UnsupportedValue {
                                field: name.clone(),
                            });
                        };
                        list.push(text.to_string());
                    }
                    Value::List(list)
                }
                _ => {
                    return Err(NormalizeError::UnsupportedValue {
                        field: name.clone(),
                    });
                }
            };
            fields.insert(name.clone(), converted);
        }
        Ok(Self(fields))
    }

    /// Stable document key derived from the `id` field.
    pub fn doc_id(&self) -> Result<String, NormalizeError> {
        match self.0.get(ID_FIELD) {
            Some(Value::Text(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Some(Value::Number(number)) => Ok(number.to_string()),
            Some(_) => Err(NormalizeError::InvalidId),
            None => Err(NormalizeError::MissingId),
        }
    }

    /// Look up a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Insert or replace a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Iterate fields in canonical (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record holds no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the fields for which `keep` returns true.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &Value) -> bool,
    {
        self.0.retain(|name, value| keep(name, value));
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Document handed to the indexing client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    /// Normalized record fields, including `id`.
    #[serde(flatten)]
    pub fields: Record,
    /// Vector attached for the embedding task kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl IndexDocument {
    /// Build a document, dropping any caller-supplied field that collides with the vector slot.
    pub fn new(mut fields: Record, embedding: Option<Vec<f32>>) -> Self {
        if embedding.is_some() {
            fields.remove(EMBEDDING_FIELD);
        }
        Self { fields, embedding }
    }

    /// Serialize into the JSON object stored by the search backend.
    pub fn to_json(&self) -> Result<serde_json::Map<String, serde_json::Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(source) => Ok(source),
            other => Err(serde::ser::Error::custom(format!(
                "document serialized to a non-object: {other}"
            ))),
        }
    }
}

/// Errors produced while converting and normalizing a record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// Record carries no `id` field.
    #[error("record is missing the 'id' field")]
    MissingId,
    /// The `id` field is empty or not a string/number.
    #[error("record 'id' must be a non-empty string or a number")]
    InvalidId,
    /// A field holds a value outside the supported set.
    #[error("field '{field}' holds an unsupported value (expected string, number, or list of strings)")]
    UnsupportedValue {
        /// Offending field name.
        field: String,
    },
}
