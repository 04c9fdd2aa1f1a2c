//! Retry supervisor: periodic sweep of `failed` documents across
//! archives/messages/chunks/summaries. Threads are left out of the
//! sweep: they have no originating event of their own to re-trigger,
//! they're only derived as a side effect of processing a message.
//!
//! Retries with exponential backoff (the same scheme as
//! `pipeline_core::retry`, but applied between supervisor passes instead
//! of between calls to a collaborator) based on `attempt_count`, up to
//! `max_retries`. Past that limit the document is left `failed` and
//! marked `retry_exhausted` in the payload so future passes skip it,
//! incrementing `retry_job_documents_max_retries_exceeded_total`.
//!
//! Only touches `attempt_count`/`last_attempt_time`/`last_updated` and
//! the payload's exhaustion flag: it never rewrites stage-specific fields
//! (`embedding_generated`, `summary_id`, etc), those are the exclusive
//! responsibility of the stage that produces them.

use chrono::{DateTime, Utc};
use pipeline_bus::MessageBus;
use pipeline_core::event::{routing_key, EventEnvelope};
use pipeline_core::metrics::MetricsCollector;
use pipeline_core::status::DocumentStatus;
use pipeline_core::{tags, CoreError};
use pipeline_store::model::{Collection, Filter, MutablePatch, StoredDocument};
use pipeline_store::DocumentStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub struct RetrySupervisor {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn DocumentStore>,
    metrics: Arc<dyn MetricsCollector>,
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RetrySupervisor {
    pub fn new(bus: Arc<dyn MessageBus>, store: Arc<dyn DocumentStore>, metrics: Arc<dyn MetricsCollector>, max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self { bus, store, metrics, max_retries, base_backoff, max_backoff }
    }

    /// Runs one sweep pass over the four eligible collections. Returns
    /// `(retried, exhausted)`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<(u64, u64), CoreError> {
        let mut retried = 0u64;
        let mut exhausted = 0u64;

        let (r, e) = self
            .sweep(Collection::Archives, now, routing_key::ARCHIVE_INGESTED, |doc| {
                EventEnvelope::new(
                    "ArchiveIngested",
                    json!({
                        "archive_id": doc.collection_key,
                        "source": doc.payload["source"],
                        "storage_id": doc.payload["storage_id"],
                        "file_hash": doc.payload["file_hash"],
                        "ingestion_date": doc.payload["ingestion_date"],
                        "message_count": doc.payload.get("message_count"),
                    }),
                )
            })
            .await?;
        retried += r;
        exhausted += e;

        let (r, e) = self
            .sweep(Collection::Messages, now, routing_key::JSON_PARSED, |doc| {
                EventEnvelope::new(
                    "JSONParsed",
                    json!({"archive_id": doc.payload["archive_id"], "message_id": doc.collection_key, "thread_id": doc.payload["thread_id"], "parsed_at": doc.last_updated}),
                )
            })
            .await?;
        retried += r;
        exhausted += e;

        let (r, e) = self
            .sweep(Collection::Chunks, now, routing_key::CHUNKS_PREPARED, |doc| {
                EventEnvelope::new(
                    "ChunksPrepared",
                    json!({"archive_id": doc.payload["archive_id"], "message_id": doc.payload["message_id"], "thread_id": doc.payload["thread_id"], "chunk_ids": [doc.collection_key]}),
                )
            })
            .await?;
        retried += r;
        exhausted += e;

        let (r, e) = self
            .sweep(Collection::Summaries, now, routing_key::SUMMARIZATION_REQUESTED, |doc| {
                EventEnvelope::new(
                    "SummarizationRequested",
                    json!({
                        "thread_id": doc.payload["thread_id"],
                        "request_id": doc.collection_key,
                        "context_chunk_ids": doc.payload["context_chunk_ids"],
                        "summary_type": doc.payload["summary_type"],
                        "trigger_reason": "Requeued",
                    }),
                )
            })
            .await?;
        retried += r;
        exhausted += e;

        log::info!("retry_supervisor pass retried={retried} exhausted={exhausted}");
        Ok((retried, exhausted))
    }

    async fn sweep(
        &self,
        collection: Collection,
        now: DateTime<Utc>,
        routing_key: &'static str,
        build_event: impl Fn(&StoredDocument) -> EventEnvelope,
    ) -> Result<(u64, u64), CoreError> {
        let filter = Filter::new().status_eq(DocumentStatus::Failed);
        let failed = self.store.query(collection, &filter, None).await.map_err(CoreError::from)?;

        let mut retried = 0u64;
        let mut exhausted = 0u64;
        for doc in failed {
            if doc.payload.get("retry_exhausted").and_then(|v| v.as_bool()).unwrap_or(false) {
                continue;
            }

            if doc.attempt_count >= self.max_retries {
                self.store
                    .update(collection, &doc.collection_key, MutablePatch::new().merging_payload(json!({"retry_exhausted": true})), now)
                    .await
                    .map_err(CoreError::from)?;
                self.metrics.increment("retry_job_documents_max_retries_exceeded_total", &tags! {"collection" => collection.as_str()});
                log::warn!("retry_supervisor collection={collection} key={} exhausted after {} attempts", doc.collection_key, doc.attempt_count);
                exhausted += 1;
                continue;
            }

            if !self.backoff_elapsed(doc.attempt_count, doc.last_updated, now) {
                continue;
            }

            let event = build_event(&doc);
            self.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key, event).await.map_err(CoreError::from)?;

            self.store
                .update(collection, &doc.collection_key, MutablePatch::new().with_attempt_count(doc.attempt_count + 1).with_last_attempt_time(now), now)
                .await
                .map_err(CoreError::from)?;

            self.metrics.increment("retry_job_documents_retried_total", &tags! {"collection" => collection.as_str()});
            retried += 1;
        }
        Ok((retried, exhausted))
    }

    /// Exponential backoff with a cap, the same scheme as
    /// `RetryConfig::exponential_backoff` but indexed by `attempt_count`
    /// instead of by attempt within a single handler invocation.
    fn backoff_elapsed(&self, attempt_count: u32, last_updated: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let exp = attempt_count.min(20);
        let factor = 2u64.saturating_pow(exp);
        let base_millis = self.base_backoff.as_millis() as u64;
        let backoff_millis = base_millis.saturating_mul(factor).min(self.max_backoff.as_millis() as u64);
        let backoff = chrono::Duration::milliseconds(backoff_millis as i64);
        now - last_updated >= backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_bus::InMemoryBus;
    use pipeline_core::NoopMetricsCollector;
    use pipeline_store::InMemoryDocumentStore;

    fn supervisor(bus: Arc<dyn MessageBus>, store: Arc<dyn DocumentStore>) -> RetrySupervisor {
        RetrySupervisor::new(bus, store, Arc::new(NoopMetricsCollector), 3, Duration::from_secs(0), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn retries_failed_archive_within_max_retries() {
        let bus = Arc::new(InMemoryBus::new());
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        bus.declare_queue("parse.in", routing_key::ARCHIVE_INGESTED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();

        let key = "arc1";
        store
            .insert(Collection::Archives, key, json!({"source": "s1", "file_hash": "h1", "storage_id": "b1", "ingestion_date": Utc::now(), "message_count": null}), Utc::now())
            .await
            .unwrap();
        store.update(Collection::Archives, key, MutablePatch::new().with_status(DocumentStatus::Failed).with_attempt_count(1), Utc::now()).await.unwrap();

        let sup = supervisor(bus, store.clone());
        let (retried, exhausted) = sup.run_once(Utc::now()).await.unwrap();
        assert_eq!(retried, 1);
        assert_eq!(exhausted, 0);

        let doc = store.get(Collection::Archives, key).await.unwrap().unwrap();
        assert_eq!(doc.attempt_count, 2);
    }

    #[tokio::test]
    async fn marks_exhausted_past_max_retries_without_republishing() {
        let bus = Arc::new(InMemoryBus::new());
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());

        let key = "m1";
        store.insert(Collection::Messages, key, json!({"archive_id": "a1", "thread_id": "t1"}), Utc::now()).await.unwrap();
        store.update(Collection::Messages, key, MutablePatch::new().with_status(DocumentStatus::Failed).with_attempt_count(3), Utc::now()).await.unwrap();

        let sup = supervisor(bus, store.clone());
        let (retried, exhausted) = sup.run_once(Utc::now()).await.unwrap();
        assert_eq!(retried, 0);
        assert_eq!(exhausted, 1);

        let doc = store.get(Collection::Messages, key).await.unwrap().unwrap();
        assert_eq!(doc.payload["retry_exhausted"], true);

        let (retried_again, exhausted_again) = sup.run_once(Utc::now()).await.unwrap();
        assert_eq!(retried_again, 0);
        assert_eq!(exhausted_again, 0);
    }

    #[tokio::test]
    async fn completed_documents_are_never_swept() {
        let bus = Arc::new(InMemoryBus::new());
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        store.insert(Collection::Summaries, "s1", json!({"thread_id": "t1"}), Utc::now()).await.unwrap();
        store.update(Collection::Summaries, "s1", MutablePatch::new().with_status(DocumentStatus::Completed), Utc::now()).await.unwrap();

        let sup = supervisor(bus, store.clone());
        let (retried, exhausted) = sup.run_once(Utc::now()).await.unwrap();
        assert_eq!(retried, 0);
        assert_eq!(exhausted, 0);
    }
}
