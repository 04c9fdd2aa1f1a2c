//! The `VectorStore` trait: fixed-dimension vectors, keyed by chunk key,
//! with a metadata payload and top-k query with an optional filter.

use crate::error::VectorStoreError;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces vectors keyed by `ids[i]`. Batching is an
    /// implementation detail; the three slices travel in lockstep
    /// (`ids.len() == vectors.len() == payloads.len()`).
    async fn upsert(&self, ids: &[String], vectors: &[Vec<f32>], payloads: &[Value]) -> Result<(), VectorStoreError>;

    /// Top-k by similarity, with an optional equality filter over a
    /// payload field (e.g. `thread_id=t`).
    async fn query(&self, vector: &[f32], k: usize, payload_filter: Option<(&str, &Value)>) -> Result<Vec<SearchResult>, VectorStoreError>;

    async fn delete(&self, id: &str) -> Result<(), VectorStoreError>;

    async fn count(&self) -> Result<u64, VectorStoreError>;
}
