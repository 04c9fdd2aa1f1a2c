//! The `DocumentStore` trait: a collection-oriented store with
//! deterministic-key discipline. `insert` is the system's idempotency
//! primitive: inserts if the key doesn't exist, or merges only the
//! lifecycle fields if it does — it never duplicates and never mutates
//! an existing document's immutable fields.

use crate::error::StoreError;
use crate::model::{Collection, Filter, MutablePatch, StoredDocument};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts `payload` under `key` in `collection`. If a document with
    /// that key already exists, this is a no-op on the immutable fields
    /// (the original payload is kept); only the lifecycle trio is
    /// considered for upgrade, and only if the caller asks for it
    /// explicitly via a later `update`. Returns the key (lets the stage
    /// treat insertion and idempotency uniformly).
    async fn insert(&self, collection: Collection, key: &str, payload: Value, now: DateTime<Utc>) -> Result<String, StoreError>;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<StoredDocument>, StoreError>;

    async fn query(&self, collection: Collection, filter: &Filter, limit: Option<usize>) -> Result<Vec<StoredDocument>, StoreError>;

    /// Applies `patch` to document `key`'s mutable fields. Returns
    /// `false` if the document doesn't exist; never touches immutable
    /// fields.
    async fn update(&self, collection: Collection, key: &str, patch: MutablePatch, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Used only by explicit retention jobs; not part of the pipeline's
    /// happy path.
    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError>;
}
