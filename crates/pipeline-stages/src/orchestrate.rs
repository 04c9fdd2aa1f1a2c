//! Orchestration stage: consumes `embeddings.generated`, computes a
//! query vector for the thread (average of the just-generated
//! embeddings), queries the vector store top-k filtered by `thread_id`,
//! assembles the context window, and decides whether to trigger a
//! summarization request via `pipeline_stage_logic::orchestrate::decide`.

use crate::queues;
use crate::runtime::StageRuntime;
use chrono::Utc;
use pipeline_core::event::{routing_key, EventEnvelope};
use pipeline_core::stage_worker::dispatch_safely;
use pipeline_core::{tags, CoreError};
use pipeline_stage_logic::orchestrate::{assemble_context_window, decide, request_id, OrchestrationDecision};
use pipeline_store::model::Collection;
use pipeline_vectorstore::VectorStore;
use serde_json::json;
use std::sync::Arc;

const STAGE: &str = "orchestrate";

pub struct OrchestrateStage {
    runtime: StageRuntime,
    vector_store: Arc<dyn VectorStore>,
    top_k: usize,
    context_window_tokens: usize,
    summary_type: String,
}

impl OrchestrateStage {
    pub fn new(runtime: StageRuntime, vector_store: Arc<dyn VectorStore>, top_k: usize, context_window_tokens: usize, summary_type: impl Into<String>) -> Self {
        Self { runtime, vector_store, top_k, context_window_tokens, summary_type: summary_type.into() }
    }

    pub async fn declare(&self) -> Result<(), CoreError> {
        let bus = &self.runtime.bus;
        bus.declare_queue(&queues::input_queue(STAGE), routing_key::EMBEDDINGS_GENERATED, pipeline_core::constants::EVENTS_TOPIC).await?;
        bus.declare_queue(&queues::failure_queue(STAGE), routing_key::ORCHESTRATION_FAILED, pipeline_core::constants::EVENTS_TOPIC).await?;
        Ok(())
    }

    pub async fn handle(&self, envelope: EventEnvelope) -> Result<(), CoreError> {
        dispatch_safely(STAGE, &envelope.event_type, &self.runtime.stats, self.runtime.metrics.as_ref(), self.runtime.reporter.as_ref(), || async {
            let thread_id = envelope.data["thread_id"].as_str().ok_or_else(|| CoreError::PermanentError("missing thread_id".into()))?.to_string();
            let chunk_ids: Vec<String> = envelope.data["chunk_ids"]
                .as_array()
                .ok_or_else(|| CoreError::PermanentError("missing chunk_ids".into()))?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            if let Err(err) = self.process_thread(&thread_id, &chunk_ids).await {
                self.fail_thread(&thread_id, &err).await;
                return Err(err);
            }
            Ok(())
        })
        .await
    }

    async fn process_thread(&self, thread_id: &str, triggering_chunk_ids: &[String]) -> Result<(), CoreError> {
        let query_vector = self.average_vector(triggering_chunk_ids).await?;
        let filter_value = json!(thread_id);
        let results = self.vector_store.query(&query_vector, self.top_k, Some(("thread_id", &filter_value))).await.map_err(CoreError::from)?;

        let ranked: Vec<(String, usize)> = {
            let mut out = Vec::with_capacity(results.len());
            for r in &results {
                let doc = self.runtime.store.get(Collection::Chunks, &r.id).await.map_err(CoreError::from)?;
                let token_count = doc.and_then(|d| d.payload["token_count"].as_u64()).unwrap_or(0) as usize;
                out.push((r.id.clone(), token_count));
            }
            out
        };
        let context_chunk_ids = assemble_context_window(&ranked, self.context_window_tokens);

        let existing_summary = self.existing_summary_citations(thread_id).await?;
        match decide(existing_summary.as_deref(), triggering_chunk_ids) {
            OrchestrationDecision::Skip(reason) => {
                self.runtime.metrics.increment("orchestration_skipped_total", &tags! {"reason" => format!("{reason:?}")});
                log::info!("stage={STAGE} thread_id={thread_id} skipped: {reason:?}");
                Ok(())
            }
            OrchestrationDecision::Trigger(reason) => {
                let req_id = request_id(thread_id, &context_chunk_ids, &self.summary_type);
                let event = EventEnvelope::new(
                    "SummarizationRequested",
                    json!({
                        "thread_id": thread_id,
                        "request_id": req_id,
                        "context_chunk_ids": context_chunk_ids,
                        "summary_type": self.summary_type,
                        "trigger_reason": format!("{reason:?}"),
                    }),
                );
                self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::SUMMARIZATION_REQUESTED, event).await.map_err(CoreError::from)?;
                self.runtime.metrics.increment("orchestration_triggered_total", &tags! {"reason" => format!("{reason:?}")});
                log::info!("stage={STAGE} thread_id={thread_id} triggered: {reason:?}");
                Ok(())
            }
        }
    }

    async fn average_vector(&self, chunk_ids: &[String]) -> Result<Vec<f32>, CoreError> {
        let mut accum: Vec<f32> = Vec::new();
        let mut count = 0usize;
        for id in chunk_ids {
            if let Some(vector) = self.fetch_vector(id).await? {
                if accum.is_empty() {
                    accum = vec![0.0; vector.len()];
                }
                for (a, v) in accum.iter_mut().zip(vector.iter()) {
                    *a += v;
                }
                count += 1;
            }
        }
        if count == 0 {
            return Err(CoreError::PermanentError("no embeddings available to build query vector".into()));
        }
        for a in accum.iter_mut() {
            *a /= count as f32;
        }
        Ok(accum)
    }

    /// The vector store doesn't expose "get by id" (only
    /// upsert/query/delete/count), so a single chunk's vector is read
    /// from the document store instead: the embed stage stores it there
    /// in addition to indexing it in the vector store.
    async fn fetch_vector(&self, chunk_id: &str) -> Result<Option<Vec<f32>>, CoreError> {
        let doc = self.runtime.store.get(Collection::Chunks, chunk_id).await.map_err(CoreError::from)?;
        let Some(doc) = doc else { return Ok(None) };
        if !doc.payload["embedding_generated"].as_bool().unwrap_or(false) {
            return Ok(None);
        }
        Ok(doc.payload.get("embedding").and_then(|v| v.as_array()).map(|arr| arr.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect()))
    }

    async fn existing_summary_citations(&self, thread_id: &str) -> Result<Option<Vec<String>>, CoreError> {
        let thread_doc = self.runtime.store.get(Collection::Threads, thread_id).await.map_err(CoreError::from)?;
        let Some(thread_doc) = thread_doc else { return Ok(None) };
        let Some(summary_id) = thread_doc.payload["summary_id"].as_str() else { return Ok(None) };
        let summary_doc = self.runtime.store.get(Collection::Summaries, summary_id).await.map_err(CoreError::from)?;
        Ok(summary_doc.map(|d| d.payload["citations"].as_array().map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default()))
    }

    async fn fail_thread(&self, thread_id: &str, err: &CoreError) {
        let event = EventEnvelope::new("OrchestrationFailed", json!({"thread_id": thread_id, "error": err.to_string()}));
        let _ = self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::ORCHESTRATION_FAILED, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_bus::InMemoryBus;
    use pipeline_store::InMemoryDocumentStore;
    use pipeline_vectorstore::InMemoryVectorStore;

    #[tokio::test]
    async fn triggers_summarization_when_no_existing_summary() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        bus.declare_queue("summarize.in", routing_key::SUMMARIZATION_REQUESTED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        store
            .insert(Collection::Chunks, "c1", json!({"token_count": 10, "embedding_generated": true, "embedding": [1.0, 0.0]}), Utc::now())
            .await
            .unwrap();
        let vector_store = Arc::new(InMemoryVectorStore::new(2));
        vector_store.upsert(&["c1".to_string()], &[vec![1.0, 0.0]], &[json!({"thread_id": "t1"})]).await.unwrap();

        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = OrchestrateStage::new(runtime, vector_store, 8, 4096, "digest");
        stage.process_thread("t1", &["c1".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn skips_when_all_triggering_chunks_already_cited() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        store
            .insert(Collection::Chunks, "c1", json!({"token_count": 10, "embedding_generated": true, "embedding": [1.0, 0.0]}), Utc::now())
            .await
            .unwrap();
        store.insert(Collection::Threads, "t1", json!({"summary_id": "s1"}), Utc::now()).await.unwrap();
        store.insert(Collection::Summaries, "s1", json!({"citations": ["c1"]}), Utc::now()).await.unwrap();
        let vector_store = Arc::new(InMemoryVectorStore::new(2));
        vector_store.upsert(&["c1".to_string()], &[vec![1.0, 0.0]], &[json!({"thread_id": "t1"})]).await.unwrap();

        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = OrchestrateStage::new(runtime, vector_store, 8, 4096, "digest");
        stage.process_thread("t1", &["c1".to_string()]).await.unwrap();
    }
}
