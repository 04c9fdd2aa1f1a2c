//! REST driver for a Qdrant-style vector store. The collection is
//! created at startup with the expected dimension; a dimension mismatch
//! there is fatal, which is why `connect` returns
//! `Err(DimensionMismatch)` instead of degrading silently.

use crate::error::VectorStoreError;
use crate::store_trait::{SearchResult, VectorStore};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

pub struct QdrantVectorStore {
    client: Client,
    base_url: String,
    collection: String,
    dimension: usize,
}

fn map_reqwest_err(e: reqwest::Error) -> VectorStoreError {
    if e.is_timeout() || e.is_connect() {
        VectorStoreError::Transient(e.to_string())
    } else {
        VectorStoreError::Rejected(e.to_string())
    }
}

impl QdrantVectorStore {
    /// Connects and ensures the collection exists with the given
    /// dimension. If the collection already exists with a different
    /// dimension, fails immediately.
    pub async fn connect(base_url: impl Into<String>, collection: impl Into<String>, dimension: usize) -> Result<Self, VectorStoreError> {
        let store = Self {
            client: Client::new(),
            base_url: base_url.into(),
            collection: collection.into(),
            dimension,
        };
        store.ensure_collection().await?;
        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<(), VectorStoreError> {
        let info_url = format!("{}/collections/{}", self.base_url, self.collection);
        let resp = self.client.get(&info_url).send().await.map_err(map_reqwest_err)?;

        if resp.status() == StatusCode::NOT_FOUND {
            let create_url = format!("{}/collections/{}", self.base_url, self.collection);
            let body = json!({ "vectors": { "size": self.dimension, "distance": "Cosine" } });
            let resp = self.client.put(&create_url).json(&body).send().await.map_err(map_reqwest_err)?;
            if !resp.status().is_success() {
                return Err(VectorStoreError::Rejected(format!("collection create failed: {}", resp.status())));
            }
            return Ok(());
        }

        if !resp.status().is_success() {
            return Err(VectorStoreError::Transient(format!("collection lookup failed: {}", resp.status())));
        }

        let body: Value = resp.json().await.map_err(map_reqwest_err)?;
        let existing = body
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .map(|n| n as usize);

        match existing {
            Some(size) if size != self.dimension => Err(VectorStoreError::DimensionMismatch {
                expected: self.dimension,
                actual: size,
            }),
            _ => Ok(()),
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

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, ids: &[String], vectors: &[Vec<f32>], payloads: &[Value]) -> Result<(), VectorStoreError> {
        for vector in vectors {
            self.check_dimension(vector)?;
        }
        let points: Vec<Value> = ids
            .iter()
            .zip(vectors.iter())
            .zip(payloads.iter())
            .map(|((id, vector), payload)| json!({ "id": id, "vector": vector, "payload": payload }))
            .collect();

        let url = format!("{}/collections/{}/points?wait=true", self.base_url, self.collection);
        let resp = self
            .client
            .put(&url)
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(map_reqwest_err)?;

        if resp.status().is_success() {
            Ok(())
        } else if resp.status().is_server_error() {
            Err(VectorStoreError::Transient(format!("upsert failed: {}", resp.status())))
        } else {
            Err(VectorStoreError::Rejected(format!("upsert rejected: {}", resp.status())))
        }
    }

    async fn query(&self, vector: &[f32], k: usize, payload_filter: Option<(&str, &Value)>) -> Result<Vec<SearchResult>, VectorStoreError> {
        self.check_dimension(vector)?;
        let mut body = json!({ "vector": vector, "limit": k, "with_payload": true });
        if let Some((field, expected)) = payload_filter {
            body["filter"] = json!({ "must": [{ "key": field, "match": { "value": expected } }] });
        }

        let url = format!("{}/collections/{}/points/search", self.base_url, self.collection);
        let resp = self.client.post(&url).json(&body).send().await.map_err(map_reqwest_err)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(VectorStoreError::CollectionNotFound(self.collection.clone()));
        }
        if !resp.status().is_success() {
            return Err(VectorStoreError::Transient(format!("query failed: {}", resp.status())));
        }

        let body: Value = resp.json().await.map_err(map_reqwest_err)?;
        let results = body
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|hit| {
                Some(SearchResult {
                    id: hit.get("id")?.as_str().map(str::to_string).unwrap_or_else(|| hit.get("id").unwrap().to_string()),
                    score: hit.get("score")?.as_f64()? as f32,
                    payload: hit.get("payload").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        Ok(results)
    }

    async fn delete(&self, id: &str) -> Result<(), VectorStoreError> {
        let url = format!("{}/collections/{}/points/delete?wait=true", self.base_url, self.collection);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "points": [id] }))
            .send()
            .await
            .map_err(map_reqwest_err)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(VectorStoreError::Transient(format!("delete failed: {}", resp.status())))
        }
    }

    async fn count(&self) -> Result<u64, VectorStoreError> {
        let url = format!("{}/collections/{}/points/count", self.base_url, self.collection);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "exact": true }))
            .send()
            .await
            .map_err(map_reqwest_err)?;
        if !resp.status().is_success() {
            return Err(VectorStoreError::Transient(format!("count failed: {}", resp.status())));
        }
        let body: Value = resp.json().await.map_err(map_reqwest_err)?;
        Ok(body.pointer("/result/count").and_then(Value::as_u64).unwrap_or(0))
    }
}
