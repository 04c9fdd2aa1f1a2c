//! In-memory implementation of `VectorStore`, used by every test and as
//! a dependency-free development backend.

use crate::error::VectorStoreError;
use crate::store_trait::{SearchResult, VectorStore};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

struct Entry {
    vector: Vec<f32>,
    payload: Value,
}

pub struct InMemoryVectorStore {
    dimension: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), VectorStoreError> {
        if vector.len() != self.dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn payload_matches(payload: &Value, filter: Option<(&str, &Value)>) -> bool {
    match filter {
        None => true,
        Some((field, expected)) => payload.get(field).map(|v| v == expected).unwrap_or(false),
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, ids: &[String], vectors: &[Vec<f32>], payloads: &[Value]) -> Result<(), VectorStoreError> {
        for vector in vectors {
            self.check_dimension(vector)?;
        }
        let mut entries = self.entries.lock().unwrap();
        for ((id, vector), payload) in ids.iter().zip(vectors.iter()).zip(payloads.iter()) {
            entries.insert(
                id.clone(),
                Entry {
                    vector: vector.clone(),
                    payload: payload.clone(),
                },
            );
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize, payload_filter: Option<(&str, &Value)>) -> Result<Vec<SearchResult>, VectorStoreError> {
        self.check_dimension(vector)?;
        let entries = self.entries.lock().unwrap();
        let mut scored: Vec<SearchResult> = entries
            .iter()
            .filter(|(_, entry)| payload_matches(&entry.payload, payload_filter))
            .map(|(id, entry)| SearchResult {
                id: id.clone(),
                score: cosine_similarity(vector, &entry.vector),
                payload: entry.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete(&self, id: &str) -> Result<(), VectorStoreError> {
        self.entries.lock().unwrap().remove(id);
        Ok(())
    }

    async fn count(&self) -> Result<u64, VectorStoreError> {
        Ok(self.entries.lock().unwrap().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_rejects_dimension_mismatch() {
        let store = InMemoryVectorStore::new(3);
        let err = store
            .upsert(&["a".to_string()], &[vec![1.0, 2.0]], &[json!({})])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[tokio::test]
    async fn query_returns_closest_vectors_ranked() {
        let store = InMemoryVectorStore::new(2);
        store
            .upsert(
                &["a".to_string(), "b".to_string(), "c".to_string()],
                &[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.9, 0.1]],
                &[json!({}), json!({}), json!({})],
            )
            .await
            .unwrap();
        let results = store.query(&[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert_eq!(results[1].id, "c");
    }

    #[tokio::test]
    async fn query_honors_payload_filter() {
        let store = InMemoryVectorStore::new(2);
        store
            .upsert(
                &["a".to_string(), "b".to_string()],
                &[vec![1.0, 0.0], vec![1.0, 0.0]],
                &[json!({"thread_id": "t1"}), json!({"thread_id": "t2"})],
            )
            .await
            .unwrap();
        let filter_value = json!("t2");
        let results = store.query(&[1.0, 0.0], 5, Some(("thread_id", &filter_value))).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "b");
    }

    #[tokio::test]
    async fn delete_removes_entry_and_count_reflects_it() {
        let store = InMemoryVectorStore::new(2);
        store.upsert(&["a".to_string()], &[vec![1.0, 0.0]], &[json!({})]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        store.delete("a").await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
