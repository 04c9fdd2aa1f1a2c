//! Summarize stage: consumes `summarization.requested`, dedupes on
//! `request_id` (inserts a `summaries[key]` placeholder as `pending`
//! before calling the LLM, so the retry supervisor can reconstruct the
//! request if the process dies midway), fetches the text of the cited
//! chunks, calls the `LlmBackend` collaborator with retry, stores the
//! result, and publishes `summary.complete`.

use crate::collaborators::LlmBackend;
use crate::queues;
use crate::runtime::StageRuntime;
use chrono::{DateTime, Utc};
use pipeline_core::event::{routing_key, EventEnvelope};
use pipeline_core::retry::{retry_with_backoff, LoggingRetryHooks};
use pipeline_core::stage_worker::dispatch_safely;
use pipeline_core::status::DocumentStatus;
use pipeline_core::{tags, CoreError};
use pipeline_domain::summary::summary_key;
use pipeline_store::model::{Collection, Filter, MutablePatch};
use serde_json::json;
use std::sync::Arc;

const STAGE: &str = "summarize";

pub struct SummarizeStage {
    runtime: StageRuntime,
    llm: Arc<dyn LlmBackend>,
    stall_threshold_seconds: i64,
}

impl SummarizeStage {
    pub fn new(runtime: StageRuntime, llm: Arc<dyn LlmBackend>, stall_threshold_seconds: i64) -> Self {
        Self { runtime, llm, stall_threshold_seconds }
    }

    pub async fn declare(&self) -> Result<(), CoreError> {
        let bus = &self.runtime.bus;
        bus.declare_queue(&queues::input_queue(STAGE), routing_key::SUMMARIZATION_REQUESTED, pipeline_core::constants::EVENTS_TOPIC).await?;
        bus.declare_queue(&queues::failure_queue(STAGE), routing_key::SUMMARIZATION_FAILED, pipeline_core::constants::EVENTS_TOPIC).await?;
        Ok(())
    }

    pub async fn handle(&self, envelope: EventEnvelope) -> Result<(), CoreError> {
        dispatch_safely(STAGE, &envelope.event_type, &self.runtime.stats, self.runtime.metrics.as_ref(), self.runtime.reporter.as_ref(), || async {
            let thread_id = envelope.data["thread_id"].as_str().ok_or_else(|| CoreError::PermanentError("missing thread_id".into()))?.to_string();
            let summary_type = envelope.data["summary_type"].as_str().unwrap_or("digest").to_string();
            let context_chunk_ids: Vec<String> = envelope.data["context_chunk_ids"]
                .as_array()
                .ok_or_else(|| CoreError::PermanentError("missing context_chunk_ids".into()))?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();

            let key = summary_key(&thread_id, &summary_type);
            if let Err(err) = self.process_request(&key, &thread_id, &summary_type, &context_chunk_ids).await {
                self.fail_summary(&key, &thread_id, &err).await;
                return Err(err);
            }
            Ok(())
        })
        .await
    }

    async fn process_request(&self, key: &str, thread_id: &str, summary_type: &str, context_chunk_ids: &[String]) -> Result<(), CoreError> {
        let now = Utc::now();
        if let Some(existing) = self.runtime.store.get(Collection::Summaries, key).await.map_err(CoreError::from)? {
            if existing.status == DocumentStatus::Completed {
                log::info!("stage={STAGE} summary_id={key} already completed, skipping");
                return Ok(());
            }
        } else {
            self.runtime
                .store
                .insert(
                    Collection::Summaries,
                    key,
                    json!({
                        "thread_id": thread_id,
                        "summary_type": summary_type,
                        "context_chunk_ids": context_chunk_ids,
                        "content": serde_json::Value::Null,
                        "citations": serde_json::Value::Null,
                    }),
                    now,
                )
                .await
                .map_err(CoreError::from)?;
        }

        self.runtime
            .store
            .update(Collection::Summaries, key, MutablePatch::new().with_status(DocumentStatus::Processing), Utc::now())
            .await
            .map_err(CoreError::from)?;

        let mut context_chunks = Vec::with_capacity(context_chunk_ids.len());
        for id in context_chunk_ids {
            if let Some(doc) = self.runtime.store.get(Collection::Chunks, id).await.map_err(CoreError::from)? {
                context_chunks.push((id.clone(), doc.payload["text"].as_str().unwrap_or_default().to_string()));
            }
        }

        let llm = self.llm.clone();
        let summary_type_owned = summary_type.to_string();
        let result = retry_with_backoff(&self.runtime.retry_config, &LoggingRetryHooks, &self.runtime.cancellation, || {
            let llm = llm.clone();
            let chunks = context_chunks.clone();
            let summary_type = summary_type_owned.clone();
            async move { llm.summarize(&chunks, &summary_type).await }
        })
        .await?;

        self.runtime
            .store
            .update(
                Collection::Summaries,
                key,
                MutablePatch::new().with_status(DocumentStatus::Completed).merging_payload(json!({
                    "content": result.content,
                    "citations": result.citations,
                    "generated_by": "llm",
                    "generated_at": Utc::now(),
                })),
                Utc::now(),
            )
            .await
            .map_err(CoreError::from)?;

        self.runtime
            .store
            .update(Collection::Threads, thread_id, MutablePatch::new().merging_payload(json!({"summary_id": key})), Utc::now())
            .await
            .map_err(CoreError::from)?;

        let event = EventEnvelope::new("SummaryComplete", json!({"thread_id": thread_id, "summary_id": key, "citations": result.citations}));
        self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::SUMMARY_COMPLETE, event).await.map_err(CoreError::from)?;
        self.runtime.metrics.increment("summaries_generated_total", &tags! {"stage" => STAGE});
        log::info!("stage={STAGE} thread_id={thread_id} summary_id={key} generated");
        Ok(())
    }

    async fn fail_summary(&self, key: &str, thread_id: &str, err: &CoreError) {
        let _ = self.runtime.store.update(Collection::Summaries, key, MutablePatch::new().with_status(DocumentStatus::Failed), Utc::now()).await;
        let event = EventEnvelope::new("SummarizationFailed", json!({"thread_id": thread_id, "summary_id": key, "error": err.to_string()}));
        let _ = self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::SUMMARIZATION_FAILED, event).await;
    }

    /// Startup requeue: stalled summarization requests republish
    /// `summarization.requested`, reconstructing the payload from the
    /// placeholder inserted before the LLM call.
    pub async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let threshold = now - chrono::Duration::seconds(self.stall_threshold_seconds);
        let mut requeued = 0u64;
        for status in [DocumentStatus::Pending, DocumentStatus::Processing] {
            let filter = Filter::new().status_eq(status).last_updated_lt(threshold);
            let stale = self.runtime.store.query(Collection::Summaries, &filter, None).await.map_err(CoreError::from)?;
            for doc in stale {
                let event = EventEnvelope::new(
                    "SummarizationRequested",
                    json!({
                        "thread_id": doc.payload["thread_id"],
                        "request_id": doc.collection_key,
                        "context_chunk_ids": doc.payload["context_chunk_ids"],
                        "summary_type": doc.payload["summary_type"],
                        "trigger_reason": "Requeued",
                    }),
                );
                self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::SUMMARIZATION_REQUESTED, event).await.map_err(CoreError::from)?;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ExtractiveLlmBackend;
    use pipeline_bus::InMemoryBus;
    use pipeline_store::InMemoryDocumentStore;

    #[tokio::test]
    async fn generates_summary_and_links_thread() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        bus.declare_queue("report.in", routing_key::SUMMARY_COMPLETE, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        store.insert(Collection::Chunks, "c1", json!({"text": "hello"}), Utc::now()).await.unwrap();
        store.insert(Collection::Threads, "t1", json!({}), Utc::now()).await.unwrap();

        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = SummarizeStage::new(runtime, Arc::new(ExtractiveLlmBackend), 300);
        let key = summary_key("t1", "digest");
        stage.process_request(&key, "t1", "digest", &["c1".to_string()]).await.unwrap();

        let doc = store.get(Collection::Summaries, &key).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        let thread = store.get(Collection::Threads, "t1").await.unwrap().unwrap();
        assert_eq!(thread.payload["summary_id"], key);
    }

    #[tokio::test]
    async fn completed_summary_is_skipped() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        let key = summary_key("t1", "digest");
        store.insert(Collection::Summaries, &key, json!({}), Utc::now()).await.unwrap();
        store.update(Collection::Summaries, &key, MutablePatch::new().with_status(DocumentStatus::Completed), Utc::now()).await.unwrap();

        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = SummarizeStage::new(runtime, Arc::new(ExtractiveLlmBackend), 300);
        stage.process_request(&key, "t1", "digest", &[]).await.unwrap();
    }
}
