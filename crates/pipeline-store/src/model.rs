//! Neutral document-store types: collections, stored documents, and the
//! small filter language used by `query`.

use chrono::{DateTime, Utc};
use pipeline_core::status::DocumentStatus;
use serde_json::Value;
use std::fmt;

/// The five collections. Each stage writes exclusively to the one it
/// produces; any stage may read upstream collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Archives,
    Messages,
    Threads,
    Chunks,
    Summaries,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Archives => "archives",
            Collection::Messages => "messages",
            Collection::Threads => "threads",
            Collection::Chunks => "chunks",
            Collection::Summaries => "summaries",
        }
    }

    pub const ALL: [Collection; 5] =
        [Collection::Archives, Collection::Messages, Collection::Threads, Collection::Chunks, Collection::Summaries];
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document as returned by the store: `payload` carries the entity's
/// immutable fields (see `pipeline-domain`); the mutable lifecycle fields
/// are exposed separately because the store is their only write
/// authority outside the stage that inserted the document.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredDocument {
    pub collection_key: String,
    pub payload: Value,
    pub status: DocumentStatus,
    pub attempt_count: u32,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

/// An equality/membership/temporal-comparison condition on a `payload`
/// field or on the lifecycle fields. Only equality, `$in`, and
/// `$lt`/`$gt` on timestamps are required.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Eq(Value),
    In(Vec<Value>),
    Lt(DateTime<Utc>),
    Gt(DateTime<Utc>),
}

/// A filter is a conjunction of conditions on named fields. The names
/// `status`, `attempt_count`, `last_attempt_time` and `last_updated`
/// resolve against the lifecycle columns; any other name resolves
/// against `payload->>name`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub conditions: Vec<(String, FilterValue)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push((field.into(), FilterValue::Eq(value)));
        self
    }

    pub fn status_eq(self, status: DocumentStatus) -> Self {
        self.eq("status", Value::String(status.to_string()))
    }

    pub fn in_values(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push((field.into(), FilterValue::In(values)));
        self
    }

    pub fn last_updated_lt(mut self, ts: DateTime<Utc>) -> Self {
        self.conditions.push(("last_updated".to_string(), FilterValue::Lt(ts)));
        self
    }

    pub fn last_updated_gt(mut self, ts: DateTime<Utc>) -> Self {
        self.conditions.push(("last_updated".to_string(), FilterValue::Gt(ts)));
        self
    }

    /// Evaluates the filter in memory against a document; used both by
    /// `InMemoryDocumentStore` and by the Postgres driver's tests.
    pub fn matches(&self, doc: &StoredDocument) -> bool {
        self.conditions.iter().all(|(field, cond)| field_matches(doc, field, cond))
    }
}

fn field_matches(doc: &StoredDocument, field: &str, cond: &FilterValue) -> bool {
    match field {
        "status" => match cond {
            FilterValue::Eq(v) => v.as_str() == Some(doc.status.to_string().as_str()),
            FilterValue::In(vs) => vs.iter().any(|v| v.as_str() == Some(doc.status.to_string().as_str())),
            _ => false,
        },
        "attempt_count" => match cond {
            FilterValue::Eq(v) => v.as_u64() == Some(doc.attempt_count as u64),
            _ => false,
        },
        "last_updated" => match cond {
            FilterValue::Lt(ts) => doc.last_updated < *ts,
            FilterValue::Gt(ts) => doc.last_updated > *ts,
            FilterValue::Eq(v) => v.as_str().and_then(|s| s.parse::<DateTime<Utc>>().ok()) == Some(doc.last_updated),
            _ => false,
        },
        "last_attempt_time" => match (cond, doc.last_attempt_time) {
            (FilterValue::Lt(ts), Some(t)) => t < *ts,
            (FilterValue::Gt(ts), Some(t)) => t > *ts,
            _ => false,
        },
        other => {
            let actual = doc.payload.get(other);
            match cond {
                FilterValue::Eq(v) => actual == Some(v),
                FilterValue::In(vs) => actual.is_some_and(|a| vs.contains(a)),
                _ => false,
            }
        }
    }
}

/// Patch of mutable fields applied by `update`: only
/// `status`/`attempt_count`/`last_attempt_time`/`last_updated` plus
/// stage-specific derived fields (e.g. `chunks.embedding_generated`,
/// `threads.summary_id`), which travel as a JSON merge over `payload`
/// since they aren't part of the lifecycle trio shared by every
/// collection.
#[derive(Debug, Clone, Default)]
pub struct MutablePatch {
    pub status: Option<DocumentStatus>,
    pub attempt_count: Option<u32>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub payload_merge: Option<Value>,
}

impl MutablePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: DocumentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_attempt_count(mut self, n: u32) -> Self {
        self.attempt_count = Some(n);
        self
    }

    pub fn with_last_attempt_time(mut self, ts: DateTime<Utc>) -> Self {
        self.last_attempt_time = Some(ts);
        self
    }

    pub fn merging_payload(mut self, merge: Value) -> Self {
        self.payload_merge = Some(merge);
        self
    }
}
