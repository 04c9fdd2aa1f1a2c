//! Embed stage: consumes `chunks.prepared`, generates a vector per
//! chunk via the `Embedder` collaborator (retried with backoff on
//! transient failures), upserts into the vector store, and marks
//! `embedding_generated = true` on each `chunks[key]`. Publishes
//! `embeddings.generated` with the list of `chunk_id`s once complete.

use crate::collaborators::Embedder;
use crate::queues;
use crate::runtime::StageRuntime;
use chrono::{DateTime, Utc};
use pipeline_core::event::{routing_key, EventEnvelope};
use pipeline_core::retry::{retry_with_backoff, LoggingRetryHooks};
use pipeline_core::stage_worker::dispatch_safely;
use pipeline_core::status::DocumentStatus;
use pipeline_core::{tags, CoreError};
use pipeline_store::model::{Collection, Filter, MutablePatch};
use pipeline_vectorstore::VectorStore;
use serde_json::json;
use std::sync::Arc;

const STAGE: &str = "embed";

pub struct EmbedStage {
    runtime: StageRuntime,
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    stall_threshold_seconds: i64,
}

impl EmbedStage {
    pub fn new(runtime: StageRuntime, embedder: Arc<dyn Embedder>, vector_store: Arc<dyn VectorStore>, stall_threshold_seconds: i64) -> Self {
        Self { runtime, embedder, vector_store, stall_threshold_seconds }
    }

    pub async fn declare(&self) -> Result<(), CoreError> {
        let bus = &self.runtime.bus;
        bus.declare_queue(&queues::input_queue(STAGE), routing_key::CHUNKS_PREPARED, pipeline_core::constants::EVENTS_TOPIC).await?;
        bus.declare_queue(&queues::failure_queue(STAGE), routing_key::EMBEDDING_GENERATION_FAILED, pipeline_core::constants::EVENTS_TOPIC).await?;
        Ok(())
    }

    pub async fn handle(&self, envelope: EventEnvelope) -> Result<(), CoreError> {
        dispatch_safely(STAGE, &envelope.event_type, &self.runtime.stats, self.runtime.metrics.as_ref(), self.runtime.reporter.as_ref(), || async {
            let chunk_ids: Vec<String> = envelope.data["chunk_ids"]
                .as_array()
                .ok_or_else(|| CoreError::PermanentError("missing chunk_ids".into()))?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            let thread_id = envelope.data["thread_id"].as_str().unwrap_or_default().to_string();

            if let Err(err) = self.process_chunks(&chunk_ids, &thread_id).await {
                self.fail_chunks(&chunk_ids, &err).await;
                return Err(err);
            }
            Ok(())
        })
        .await
    }

    async fn process_chunks(&self, chunk_ids: &[String], thread_id: &str) -> Result<(), CoreError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();

        let mut pending_keys = Vec::new();
        let mut pending_texts = Vec::new();
        for id in chunk_ids {
            let doc = self.runtime.store.get(Collection::Chunks, id).await.map_err(CoreError::from)?;
            let Some(doc) = doc else { continue };
            if doc.payload["embedding_generated"].as_bool().unwrap_or(false) {
                continue;
            }
            self.runtime.store.update(Collection::Chunks, id, MutablePatch::new().with_status(DocumentStatus::Processing), now).await.map_err(CoreError::from)?;
            pending_keys.push(id.clone());
            pending_texts.push(doc.payload["text"].as_str().unwrap_or_default().to_string());
        }

        if pending_keys.is_empty() {
            return Ok(());
        }

        let embedder = self.embedder.clone();
        let vectors = retry_with_backoff(&self.runtime.retry_config, &LoggingRetryHooks, &self.runtime.cancellation, || {
            let embedder = embedder.clone();
            let texts = pending_texts.clone();
            async move { embedder.embed(&texts).await }
        })
        .await?;

        let payloads: Vec<serde_json::Value> = pending_keys.iter().map(|_| json!({"thread_id": thread_id})).collect();
        self.vector_store.upsert(&pending_keys, &vectors, &payloads).await.map_err(CoreError::from)?;

        for (key, vector) in pending_keys.iter().zip(vectors.iter()) {
            self.runtime
                .store
                .update(
                    Collection::Chunks,
                    key,
                    MutablePatch::new().with_status(DocumentStatus::Completed).merging_payload(json!({"embedding_generated": true, "embedding": vector})),
                    Utc::now(),
                )
                .await
                .map_err(CoreError::from)?;
        }

        let event = EventEnvelope::new(
            "EmbeddingsGenerated",
            json!({
                "thread_id": thread_id,
                "chunk_ids": pending_keys,
                "embedding_model": self.embedder.model_name(),
                "vector_store_updated": true,
                "timestamp": Utc::now(),
            }),
        );
        self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::EMBEDDINGS_GENERATED, event).await.map_err(CoreError::from)?;
        self.runtime.metrics.increment("embeddings_generated_total", &tags! {"stage" => STAGE});
        log::info!("stage={STAGE} thread_id={thread_id} embedded {} chunks", pending_keys.len());
        Ok(())
    }

    async fn fail_chunks(&self, chunk_ids: &[String], err: &CoreError) {
        for id in chunk_ids {
            let _ = self.runtime.store.update(Collection::Chunks, id, MutablePatch::new().with_status(DocumentStatus::Failed), Utc::now()).await;
        }
        let event = EventEnvelope::new("EmbeddingGenerationFailed", json!({"chunk_ids": chunk_ids, "error": err.to_string()}));
        let _ = self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::EMBEDDING_GENERATION_FAILED, event).await;
    }

    /// Startup requeue: stalled chunks without an embedding republish
    /// `chunks.prepared`, grouped by message.
    pub async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let threshold = now - chrono::Duration::seconds(self.stall_threshold_seconds);
        let mut requeued = 0u64;
        for status in [DocumentStatus::Pending, DocumentStatus::Processing] {
            let filter = Filter::new().status_eq(status).last_updated_lt(threshold);
            let stale = self.runtime.store.query(Collection::Chunks, &filter, None).await.map_err(CoreError::from)?;
            let mut by_message: std::collections::HashMap<String, (String, String, Vec<String>)> = std::collections::HashMap::new();
            for doc in stale {
                let message_id = doc.payload["message_id"].as_str().unwrap_or_default().to_string();
                let thread_id = doc.payload["thread_id"].as_str().unwrap_or_default().to_string();
                let archive_id = doc.payload["archive_id"].as_str().unwrap_or_default().to_string();
                let entry = by_message.entry(message_id.clone()).or_insert((archive_id, thread_id, Vec::new()));
                entry.2.push(doc.collection_key);
            }
            for (message_id, (archive_id, thread_id, chunk_ids)) in by_message {
                let event = EventEnvelope::new(
                    "ChunksPrepared",
                    json!({
                        "archive_id": archive_id,
                        "message_id": message_id,
                        "thread_id": thread_id,
                        "chunk_count": chunk_ids.len(),
                        "chunk_ids": chunk_ids,
                        "timestamp": now,
                    }),
                );
                self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::CHUNKS_PREPARED, event).await.map_err(CoreError::from)?;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::HashingEmbedder;
    use pipeline_bus::InMemoryBus;
    use pipeline_store::InMemoryDocumentStore;
    use pipeline_vectorstore::InMemoryVectorStore;

    async fn seed_chunk(store: &InMemoryDocumentStore, key: &str, text: &str) {
        store
            .insert(Collection::Chunks, key, json!({"archive_id": "a1", "message_id": "m1", "thread_id": "t1", "text": text, "embedding_generated": false}), Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn embeds_pending_chunks_and_marks_generated() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        bus.declare_queue("orchestrate.in", routing_key::EMBEDDINGS_GENERATED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        seed_chunk(&store, "c1", "hello world").await;

        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = EmbedStage::new(runtime, Arc::new(HashingEmbedder::new(8)), Arc::new(InMemoryVectorStore::new(8)), 300);
        stage.process_chunks(&["c1".to_string()], "t1").await.unwrap();

        let doc = store.get(Collection::Chunks, "c1").await.unwrap().unwrap();
        assert_eq!(doc.payload["embedding_generated"], true);
        assert_eq!(doc.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn chunk_already_embedded_is_skipped() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert(Collection::Chunks, "c1", json!({"text": "x", "embedding_generated": true}), Utc::now()).await.unwrap();

        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let vector_store = Arc::new(InMemoryVectorStore::new(8));
        let stage = EmbedStage::new(runtime, Arc::new(HashingEmbedder::new(8)), vector_store.clone(), 300);
        stage.process_chunks(&["c1".to_string()], "t1").await.unwrap();
        assert_eq!(vector_store.count().await.unwrap(), 0);
    }
}
