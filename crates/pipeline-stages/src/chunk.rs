//! Chunk stage: consumes `json.parsed`, reads the already-parsed
//! message, splits it according to the configured strategy from
//! `pipeline-stage-logic::chunker`, inserts `chunks[key]` for each piece
//! (skipping existing ones), and publishes a single `chunks.prepared`
//! with the message's list of `chunk_id`s.

use crate::queues;
use crate::runtime::StageRuntime;
use chrono::{DateTime, Utc};
use pipeline_core::config::ChunkingConfig;
use pipeline_core::event::{routing_key, EventEnvelope};
use pipeline_core::stage_worker::dispatch_safely;
use pipeline_core::status::DocumentStatus;
use pipeline_core::{tags, CoreError};
use pipeline_domain::chunk::chunk_key;
use pipeline_stage_logic::chunker::{chunk_semantic, chunk_token_window, RawChunk};
use pipeline_store::model::{Collection, Filter, MutablePatch};
use serde_json::json;

const STAGE: &str = "chunk";

pub struct ChunkStage {
    runtime: StageRuntime,
    config: ChunkingConfig,
    stall_threshold_seconds: i64,
}

impl ChunkStage {
    pub fn new(runtime: StageRuntime, config: ChunkingConfig, stall_threshold_seconds: i64) -> Self {
        Self { runtime, config, stall_threshold_seconds }
    }

    pub async fn declare(&self) -> Result<(), CoreError> {
        let bus = &self.runtime.bus;
        bus.declare_queue(&queues::input_queue(STAGE), routing_key::JSON_PARSED, pipeline_core::constants::EVENTS_TOPIC).await?;
        bus.declare_queue(&queues::failure_queue(STAGE), routing_key::CHUNKING_FAILED, pipeline_core::constants::EVENTS_TOPIC).await?;
        Ok(())
    }

    pub async fn handle(&self, envelope: EventEnvelope) -> Result<(), CoreError> {
        dispatch_safely(STAGE, &envelope.event_type, &self.runtime.stats, self.runtime.metrics.as_ref(), self.runtime.reporter.as_ref(), || async {
            let message_id = envelope.data["message_id"].as_str().ok_or_else(|| CoreError::PermanentError("missing message_id".into()))?.to_string();
            if let Err(err) = self.process_message(&message_id).await {
                self.fail_message(&message_id, &err).await;
                return Err(err);
            }
            Ok(())
        })
        .await
    }

    async fn process_message(&self, message_id: &str) -> Result<(), CoreError> {
        let now = Utc::now();
        let doc = self
            .runtime
            .store
            .get(Collection::Messages, message_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::PermanentError(format!("message {message_id} not found")))?;

        self.runtime
            .store
            .update(Collection::Messages, message_id, MutablePatch::new().with_status(DocumentStatus::Processing).with_attempt_count(doc.attempt_count + 1), now)
            .await
            .map_err(CoreError::from)?;

        let archive_id = doc.payload["archive_id"].as_str().unwrap_or_default().to_string();
        let thread_id = doc.payload["thread_id"].as_str().unwrap_or_default().to_string();
        let body = doc.payload["normalized_body"].as_str().unwrap_or_default();

        let raw_chunks = match self.config.strategy {
            pipeline_core::config::ChunkingStrategy::TokenWindow => chunk_token_window(body, &self.config),
            pipeline_core::config::ChunkingStrategy::Semantic => chunk_semantic(body, &self.config),
            pipeline_core::config::ChunkingStrategy::FixedSize => {
                pipeline_stage_logic::chunker::chunk_fixed_size(std::slice::from_ref(&body.to_string()), &self.config)
            }
        };

        let mut chunk_ids = Vec::with_capacity(raw_chunks.len());
        for (idx, raw) in raw_chunks.iter().enumerate() {
            let key = self.insert_chunk(&archive_id, message_id, &thread_id, idx, raw, now).await?;
            chunk_ids.push(key);
        }

        self.runtime
            .store
            .update(Collection::Messages, message_id, MutablePatch::new().with_status(DocumentStatus::Completed), Utc::now())
            .await
            .map_err(CoreError::from)?;

        if chunk_ids.is_empty() {
            log::warn!("stage={STAGE} message_id={message_id} produced zero chunks");
        } else {
            let event = EventEnvelope::new(
                "ChunksPrepared",
                json!({
                    "archive_id": archive_id,
                    "message_id": message_id,
                    "thread_id": thread_id,
                    "chunk_ids": chunk_ids,
                    "chunk_count": chunk_ids.len(),
                    "timestamp": Utc::now(),
                }),
            );
            self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::CHUNKS_PREPARED, event).await.map_err(CoreError::from)?;
        }
        self.runtime.metrics.increment("chunks_produced_total", &tags! {"stage" => STAGE});
        log::info!("stage={STAGE} message_id={message_id} produced {} chunks", chunk_ids.len());
        Ok(())
    }

    async fn insert_chunk(&self, archive_id: &str, message_id: &str, thread_id: &str, idx: usize, raw: &RawChunk, now: DateTime<Utc>) -> Result<String, CoreError> {
        let key = chunk_key(message_id, idx);
        if self.runtime.store.get(Collection::Chunks, &key).await.map_err(CoreError::from)?.is_some() {
            return Ok(key);
        }
        self.runtime
            .store
            .insert(
                Collection::Chunks,
                &key,
                json!({
                    "archive_id": archive_id,
                    "message_id": message_id,
                    "thread_id": thread_id,
                    "chunk_index": idx,
                    "text": raw.text,
                    "token_count": raw.token_count,
                    "start_offset": raw.start_offset,
                    "end_offset": raw.end_offset,
                    "embedding_generated": false,
                }),
                now,
            )
            .await
            .map_err(CoreError::from)?;
        Ok(key)
    }

    async fn fail_message(&self, message_id: &str, err: &CoreError) {
        let _ = self.runtime.store.update(Collection::Messages, message_id, MutablePatch::new().with_status(DocumentStatus::Failed), Utc::now()).await;
        let event = EventEnvelope::new("ChunkingFailed", json!({"message_id": message_id, "error": err.to_string()}));
        let _ = self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::CHUNKING_FAILED, event).await;
    }

    /// Startup requeue: stalled `processing`/`pending` messages
    /// republish `json.parsed`.
    pub async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let threshold = now - chrono::Duration::seconds(self.stall_threshold_seconds);
        let mut requeued = 0u64;
        for status in [DocumentStatus::Pending, DocumentStatus::Processing] {
            let filter = Filter::new().status_eq(status).last_updated_lt(threshold);
            let stale = self.runtime.store.query(Collection::Messages, &filter, None).await.map_err(CoreError::from)?;
            for doc in stale {
                let event = EventEnvelope::new(
                    "JSONParsed",
                    json!({"archive_id": doc.payload["archive_id"], "message_id": doc.collection_key, "thread_id": doc.payload["thread_id"], "parsed_at": now}),
                );
                self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::JSON_PARSED, event).await.map_err(CoreError::from)?;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_bus::InMemoryBus;
    use pipeline_core::config::ChunkingStrategy;
    use pipeline_store::InMemoryDocumentStore;
    use std::sync::Arc;

    fn cfg() -> ChunkingConfig {
        ChunkingConfig { strategy: ChunkingStrategy::TokenWindow, chunk_size: 4, chunk_overlap: 0, min_chunk_size: 1, max_chunk_size: 100, messages_per_chunk: 1 }
    }

    async fn seed_message(store: &InMemoryDocumentStore, body: &str) -> String {
        let key = "msgkey1".to_string();
        store
            .insert(Collection::Messages, &key, json!({"archive_id": "arc1", "thread_id": "th1", "normalized_body": body}), Utc::now())
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn chunking_a_message_inserts_chunks_and_publishes_once() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        bus.declare_queue("embed.in", routing_key::CHUNKS_PREPARED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        let msg_key = seed_message(&store, "one two three four five six seven eight").await;

        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = ChunkStage::new(runtime, cfg(), 300);
        stage.process_message(&msg_key).await.unwrap();

        let doc = store.get(Collection::Messages, &msg_key).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);

        let chunk0 = chunk_key(&msg_key, 0);
        assert!(store.get(Collection::Chunks, &chunk0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rechunking_same_message_is_idempotent_on_chunk_keys() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        let msg_key = seed_message(&store, "a b c d e f").await;

        let runtime = StageRuntime::new(bus.clone(), store.clone(), Default::default());
        let stage = ChunkStage::new(runtime, cfg(), 300);
        stage.process_message(&msg_key).await.unwrap();
        let first_count = store.query(Collection::Chunks, &Filter::new(), None).await.unwrap().len();

        stage.process_message(&msg_key).await.unwrap();
        let second_count = store.query(Collection::Chunks, &Filter::new(), None).await.unwrap().len();
        assert_eq!(first_count, second_count);
    }
}
