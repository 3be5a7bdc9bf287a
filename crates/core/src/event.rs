use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::id::ResumeToken;

/// Kind of mutation reported by the change feed.
///
/// The four data operations are modelled explicitly; feed-level events
/// (collection drops, renames, stream invalidation) get their own variants and
/// anything unknown is carried verbatim in `Other` so new feed versions do not
/// break normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    Invalidate,
    Other(String),
}

impl OperationType {
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::Rename => "rename",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Invalidate => "invalidate",
            OperationType::Other(s) => s,
        }
    }
}

impl From<String> for OperationType {
    fn from(value: String) -> Self {
        match value.as_str() {
            // "create" is the generic spelling used by row-oriented feeds.
            "insert" | "create" => OperationType::Insert,
            "update" => OperationType::Update,
            "replace" => OperationType::Replace,
            "delete" => OperationType::Delete,
            "drop" => OperationType::Drop,
            "rename" => OperationType::Rename,
            "dropDatabase" => OperationType::DropDatabase,
            "invalidate" => OperationType::Invalidate,
            _ => OperationType::Other(value),
        }
    }
}

impl From<OperationType> for String {
    fn from(value: OperationType) -> Self {
        match value {
            OperationType::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl core::fmt::Display for OperationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a change: database plus (for collection-level events) collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub database: String,
    #[serde(default)]
    pub collection: Option<String>,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: Option<String>) -> Self {
        Self {
            database: database.into(),
            collection,
        }
    }
}

impl core::fmt::Display for Namespace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.collection {
            Some(coll) => write!(f, "{}.{}", self.database, coll),
            None => f.write_str(&self.database),
        }
    }
}

/// Primary-key fields of the mutated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(Map<String, JsonValue>);

impl DocumentKey {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.0
    }
}

/// Normalized representation of one change notification.
///
/// Built once by the normalizer and never mutated afterwards. The
/// transactional publisher consumes it exactly once.
///
/// Notes:
/// - `document_key` is always present.
/// - `full_document` depends on the operation and the feed's configuration;
///   never assume it.
/// - `source_timestamp` is the commit time at the origin store when the feed
///   reports one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    id: ResumeToken,
    operation_type: OperationType,
    source_timestamp: Option<DateTime<Utc>>,
    observed_timestamp: DateTime<Utc>,
    full_document: Option<JsonValue>,
    namespace: Namespace,
    document_key: DocumentKey,
}

impl ChangeEvent {
    pub fn new(
        id: ResumeToken,
        operation_type: OperationType,
        namespace: Namespace,
        document_key: DocumentKey,
        observed_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            operation_type,
            source_timestamp: None,
            observed_timestamp,
            full_document: None,
            namespace,
            document_key,
        }
    }

    pub fn with_source_timestamp(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.source_timestamp = at;
        self
    }

    pub fn with_full_document(mut self, document: Option<JsonValue>) -> Self {
        self.full_document = document;
        self
    }

    pub fn id(&self) -> &ResumeToken {
        &self.id
    }

    pub fn operation_type(&self) -> &OperationType {
        &self.operation_type
    }

    pub fn source_timestamp(&self) -> Option<DateTime<Utc>> {
        self.source_timestamp
    }

    pub fn observed_timestamp(&self) -> DateTime<Utc> {
        self.observed_timestamp
    }

    pub fn full_document(&self) -> Option<&JsonValue> {
        self.full_document.as_ref()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn document_key(&self) -> &DocumentKey {
        &self.document_key
    }
}
