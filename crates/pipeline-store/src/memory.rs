//! In-memory implementation of `DocumentStore`, used by every test in the
//! pipeline so that none of them depend on a live broker or database.
//! Functionally 1:1 with the Postgres driver in `pg`.

use crate::error::StoreError;
use crate::model::{Collection, Filter, MutablePatch, StoredDocument};
use crate::store_trait::DocumentStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::status::DocumentStatus;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<&'static str, HashMap<String, StoredDocument>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(&self, collection: Collection, key: &str, payload: Value, now: DateTime<Utc>) -> Result<String, StoreError> {
        let mut guard = self.collections.lock().expect("in-memory store mutex poisoned");
        let table = guard.entry(collection.as_str()).or_default();
        table.entry(key.to_string()).or_insert_with(|| StoredDocument {
            collection_key: key.to_string(),
            payload,
            status: DocumentStatus::Pending,
            attempt_count: 0,
            last_attempt_time: None,
            last_updated: now,
        });
        Ok(key.to_string())
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<StoredDocument>, StoreError> {
        let guard = self.collections.lock().expect("in-memory store mutex poisoned");
        Ok(guard.get(collection.as_str()).and_then(|t| t.get(key)).cloned())
    }

    async fn query(&self, collection: Collection, filter: &Filter, limit: Option<usize>) -> Result<Vec<StoredDocument>, StoreError> {
        let guard = self.collections.lock().expect("in-memory store mutex poisoned");
        let mut results: Vec<StoredDocument> = guard
            .get(collection.as_str())
            .map(|t| t.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();
        results.sort_by(|a, b| a.collection_key.cmp(&b.collection_key));
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn update(&self, collection: Collection, key: &str, patch: MutablePatch, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut guard = self.collections.lock().expect("in-memory store mutex poisoned");
        let Some(table) = guard.get_mut(collection.as_str()) else {
            return Ok(false);
        };
        let Some(doc) = table.get_mut(key) else {
            return Ok(false);
        };
        if let Some(status) = patch.status {
            doc.status = status;
        }
        if let Some(n) = patch.attempt_count {
            doc.attempt_count = n;
        }
        if let Some(t) = patch.last_attempt_time {
            doc.last_attempt_time = Some(t);
        }
        if let Some(merge) = patch.payload_merge {
            merge_json(&mut doc.payload, &merge);
        }
        doc.last_updated = now;
        Ok(true)
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        let mut guard = self.collections.lock().expect("in-memory store mutex poisoned");
        Ok(guard.get_mut(collection.as_str()).map(|t| t.remove(key).is_some()).unwrap_or(false))
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    if let (Value::Object(base_map), Value::Object(patch_map)) = (base, patch) {
        for (k, v) in patch_map {
            base_map.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Collection;
    use serde_json::json;

    #[tokio::test]
    async fn insert_is_idempotent_on_key() {
        let store = InMemoryDocumentStore::new();
        let now = Utc::now();
        let k1 = store.insert(Collection::Archives, "k1", json!({"source": "s1"}), now).await.unwrap();
        let k2 = store.insert(Collection::Archives, "k1", json!({"source": "different"}), now).await.unwrap();
        assert_eq!(k1, k2);
        let doc = store.get(Collection::Archives, "k1").await.unwrap().unwrap();
        assert_eq!(doc.payload["source"], "s1");
    }

    #[tokio::test]
    async fn update_merges_mutable_fields_only() {
        let store = InMemoryDocumentStore::new();
        let now = Utc::now();
        store.insert(Collection::Chunks, "c1", json!({"text": "hi", "embedding_generated": false}), now).await.unwrap();
        let patch = MutablePatch::new().with_status(DocumentStatus::Completed).merging_payload(json!({"embedding_generated": true}));
        let updated = store.update(Collection::Chunks, "c1", patch, now).await.unwrap();
        assert!(updated);
        let doc = store.get(Collection::Chunks, "c1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert_eq!(doc.payload["embedding_generated"], true);
        assert_eq!(doc.payload["text"], "hi");
    }

    #[tokio::test]
    async fn update_on_missing_document_returns_false() {
        let store = InMemoryDocumentStore::new();
        let updated = store.update(Collection::Archives, "missing", MutablePatch::new(), Utc::now()).await.unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn query_filters_by_status_and_last_updated() {
        let store = InMemoryDocumentStore::new();
        let t0 = Utc::now();
        store.insert(Collection::Messages, "m1", json!({"archive_id": "a1"}), t0).await.unwrap();
        store.insert(Collection::Messages, "m2", json!({"archive_id": "a1"}), t0 - chrono::Duration::seconds(600)).await.unwrap();
        store
            .update(Collection::Messages, "m2", MutablePatch::new().with_status(DocumentStatus::Failed), t0 - chrono::Duration::seconds(600))
            .await
            .unwrap();

        let stale = Filter::new().status_eq(DocumentStatus::Failed);
        let results = store.query(Collection::Messages, &stale, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].collection_key, "m2");
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let store = InMemoryDocumentStore::new();
        store.insert(Collection::Archives, "k1", json!({}), Utc::now()).await.unwrap();
        assert!(store.delete(Collection::Archives, "k1").await.unwrap());
        assert!(store.get(Collection::Archives, "k1").await.unwrap().is_none());
        assert!(!store.delete(Collection::Archives, "k1").await.unwrap());
    }
}
