//! Parse stage: consumes `archive.ingested`, decomposes the archive
//! into RFC-822 messages (via the `ArchiveDecomposer` collaborator,
//! out of scope here), inserts `messages[key]` with thread linkage,
//! updates/creates `threads[root_key]`, transitions the archive to
//! `completed`, and publishes one `json.parsed` per new message.

use crate::collaborators::{ArchiveBytesStore, ArchiveDecomposer, RawParsedMessage};
use crate::queues;
use crate::runtime::StageRuntime;
use chrono::{DateTime, Utc};
use pipeline_core::event::{routing_key, EventEnvelope};
use pipeline_core::stage_worker::dispatch_safely;
use pipeline_core::status::DocumentStatus;
use pipeline_core::{tags, CoreError};
use pipeline_domain::message::{message_key, normalize_message_id};
use pipeline_domain::thread::thread_key;
use pipeline_store::model::{Collection, Filter, MutablePatch};
use serde_json::json;
use std::sync::Arc;

const STAGE: &str = "parse";

pub struct ParseStage {
    runtime: StageRuntime,
    blobs: Arc<dyn ArchiveBytesStore>,
    decomposer: Arc<dyn ArchiveDecomposer>,
    stall_threshold_seconds: i64,
}

impl ParseStage {
    pub fn new(runtime: StageRuntime, blobs: Arc<dyn ArchiveBytesStore>, decomposer: Arc<dyn ArchiveDecomposer>, stall_threshold_seconds: i64) -> Self {
        Self { runtime, blobs, decomposer, stall_threshold_seconds }
    }

    pub async fn declare(&self) -> Result<(), CoreError> {
        let bus = &self.runtime.bus;
        bus.declare_queue(&queues::input_queue(STAGE), routing_key::ARCHIVE_INGESTED, pipeline_core::constants::EVENTS_TOPIC).await?;
        bus.declare_queue(&queues::failure_queue(STAGE), routing_key::PARSING_FAILED, pipeline_core::constants::EVENTS_TOPIC).await?;
        Ok(())
    }

    /// Handles an `archive.ingested` event, already wrapped in the safe
    /// handler.
    pub async fn handle(&self, envelope: EventEnvelope) -> Result<(), CoreError> {
        dispatch_safely(STAGE, &envelope.event_type, &self.runtime.stats, self.runtime.metrics.as_ref(), self.runtime.reporter.as_ref(), || async {
            let archive_id = envelope.data["archive_id"].as_str().ok_or_else(|| CoreError::PermanentError("missing archive_id".into()))?.to_string();
            self.process_archive(&archive_id).await
        })
        .await
    }

    async fn process_archive(&self, archive_id: &str) -> Result<(), CoreError> {
        let now = Utc::now();
        let archive_doc = self
            .runtime
            .store
            .get(Collection::Archives, archive_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::PermanentError(format!("archive {archive_id} not found")))?;

        self.runtime
            .store
            .update(Collection::Archives, archive_id, MutablePatch::new().with_status(DocumentStatus::Processing).with_attempt_count(archive_doc.attempt_count + 1), now)
            .await
            .map_err(CoreError::from)?;

        let storage_id = archive_doc.payload["storage_id"].as_str().ok_or_else(|| CoreError::PermanentError("archive missing storage_id".into()))?;
        let bytes = match self.blobs.get(storage_id).await {
            Ok(b) => b,
            Err(err) => {
                self.fail_archive(archive_id, &err).await;
                return Err(err);
            }
        };

        let messages = match self.decomposer.decompose(&bytes).await {
            Ok(m) => m,
            Err(err) => {
                self.fail_archive(archive_id, &err).await;
                return Err(err);
            }
        };

        let mut message_count = 0u64;
        for raw in &messages {
            match self.insert_message(archive_id, raw, now).await {
                Ok(true) => message_count += 1,
                Ok(false) => {
                    self.runtime.metrics.increment("messages_skipped_total", &tags! {"reason" => "duplicate"});
                }
                Err(_) => {
                    self.runtime.metrics.increment("parsing_failures_total", &tags! {});
                }
            }
        }

        self.runtime
            .store
            .update(
                Collection::Archives,
                archive_id,
                MutablePatch::new().with_status(DocumentStatus::Completed).merging_payload(json!({"message_count": message_count})),
                Utc::now(),
            )
            .await
            .map_err(CoreError::from)?;
        log::info!("stage={STAGE} archive_id={archive_id} parsed message_count={message_count}");
        Ok(())
    }

    /// Inserts a message if new; returns `Ok(true)` if it was inserted
    /// (publishes `json.parsed`), `Ok(false)` if it was a duplicate (no
    /// republish).
    async fn insert_message(&self, archive_id: &str, raw: &RawParsedMessage, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let key = message_key(archive_id, &raw.message_id);
        if self.runtime.store.get(Collection::Messages, &key).await.map_err(CoreError::from)?.is_some() {
            return Ok(false);
        }

        let root_key = self.resolve_root_key(archive_id, raw).await?;

        self.runtime
            .store
            .insert(
                Collection::Messages,
                &key,
                json!({
                    "archive_id": archive_id,
                    "message_id": normalize_message_id(&raw.message_id),
                    "thread_id": root_key,
                    "in_reply_to": raw.in_reply_to,
                    "references": raw.references,
                    "date": raw.date,
                    "participants": raw.participants,
                    "normalized_body": raw.body.trim(),
                }),
                now,
            )
            .await
            .map_err(CoreError::from)?;

        self.merge_thread(archive_id, &root_key, &raw.participants, now).await?;

        let event = EventEnvelope::new("JSONParsed", json!({"archive_id": archive_id, "message_id": key, "thread_id": root_key, "parsed_at": now}));
        self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::JSON_PARSED, event).await.map_err(CoreError::from)?;
        Ok(true)
    }

    /// A thread's "root" is the root message of the `references` chain
    /// (or the message itself if it has no references); resolved via the
    /// key of the first `references` element, since that unambiguously
    /// identifies the original message.
    async fn resolve_root_key(&self, archive_id: &str, raw: &RawParsedMessage) -> Result<String, CoreError> {
        let root_message_id = raw.references.first().or(raw.in_reply_to.as_ref()).unwrap_or(&raw.message_id);
        let root_message_key = message_key(archive_id, root_message_id);
        Ok(thread_key(&root_message_key))
    }

    async fn merge_thread(&self, archive_id: &str, thread_key: &str, participants: &[String], now: DateTime<Utc>) -> Result<(), CoreError> {
        match self.runtime.store.get(Collection::Threads, thread_key).await.map_err(CoreError::from)? {
            Some(doc) => {
                let mut existing: Vec<String> = doc.payload["participants"].as_array().map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default();
                for p in participants {
                    if !existing.contains(p) {
                        existing.push(p.clone());
                    }
                }
                let message_count = doc.payload["message_count"].as_u64().unwrap_or(0) + 1;
                self.runtime
                    .store
                    .update(Collection::Threads, thread_key, MutablePatch::new().merging_payload(json!({"participants": existing, "message_count": message_count})), now)
                    .await
                    .map_err(CoreError::from)?;
            }
            None => {
                self.runtime
                    .store
                    .insert(
                        Collection::Threads,
                        thread_key,
                        json!({"archive_id": archive_id, "participants": participants, "message_count": 1u64, "summary_id": null}),
                        now,
                    )
                    .await
                    .map_err(CoreError::from)?;
            }
        }
        Ok(())
    }

    async fn fail_archive(&self, archive_id: &str, err: &CoreError) {
        let _ = self.runtime.store.update(Collection::Archives, archive_id, MutablePatch::new().with_status(DocumentStatus::Failed), Utc::now()).await;
        let event = EventEnvelope::new("ParsingFailed", json!({"archive_id": archive_id, "error": err.to_string()}));
        let _ = self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::PARSING_FAILED, event).await;
    }

    /// Startup requeue: `pending`/`processing` archives whose
    /// `last_updated` is older than the stall threshold republish
    /// `archive.ingested`.
    pub async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let threshold = now - chrono::Duration::seconds(self.stall_threshold_seconds);
        let mut requeued = 0u64;
        for status in [DocumentStatus::Pending, DocumentStatus::Processing] {
            let filter = Filter::new().status_eq(status).last_updated_lt(threshold);
            let stale = self.runtime.store.query(Collection::Archives, &filter, None).await.map_err(CoreError::from)?;
            for doc in stale {
                let event = EventEnvelope::new(
                    "ArchiveIngested",
                    json!({
                        "archive_id": doc.collection_key,
                        "source": doc.payload["source"],
                        "storage_id": doc.payload["storage_id"],
                        "file_hash": doc.payload["file_hash"],
                        "ingestion_date": doc.payload["ingestion_date"],
                        "message_count": doc.payload.get("message_count"),
                    }),
                );
                self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::ARCHIVE_INGESTED, event).await.map_err(CoreError::from)?;
                requeued += 1;
            }
        }
        log::info!("stage={STAGE} startup_requeue requeued={requeued}");
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryArchiveBytesStore;
    use pipeline_bus::InMemoryBus;
    use pipeline_store::InMemoryDocumentStore;

    fn make_decomposer_with(messages: Vec<RawParsedMessage>) -> Arc<dyn ArchiveDecomposer> {
        struct Fixed(Vec<RawParsedMessage>);
        #[async_trait::async_trait]
        impl ArchiveDecomposer for Fixed {
            async fn decompose(&self, _bytes: &[u8]) -> Result<Vec<RawParsedMessage>, CoreError> {
                Ok(self.0.clone())
            }
        }
        Arc::new(Fixed(messages))
    }

    async fn seed_archive(store: &InMemoryDocumentStore, blobs: &crate::collaborators::InMemoryArchiveBytesStore) -> String {
        let storage_id = blobs.put(b"irrelevant".to_vec()).await.unwrap();
        let key = pipeline_domain::archive::archive_key("s1", "deadbeef");
        store
            .insert(Collection::Archives, &key, json!({"source": "s1", "file_hash": "deadbeef", "storage_id": storage_id, "ingestion_date": Utc::now(), "message_count": null}), Utc::now())
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn empty_archive_completes_with_zero_messages_and_no_events() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        let blobs = Arc::new(crate::collaborators::InMemoryArchiveBytesStore::new());
        let archive_id = seed_archive(&store, &blobs).await;

        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = ParseStage::new(runtime, blobs, make_decomposer_with(vec![]), 300);
        stage.process_archive(&archive_id).await.unwrap();

        let doc = store.get(Collection::Archives, &archive_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert_eq!(doc.payload["message_count"], 0);
    }

    #[tokio::test]
    async fn single_message_produces_one_message_and_one_thread() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        let blobs = Arc::new(crate::collaborators::InMemoryArchiveBytesStore::new());
        let archive_id = seed_archive(&store, &blobs).await;
        bus.declare_queue("chunk.in", routing_key::JSON_PARSED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();

        let raw = RawParsedMessage { message_id: "<a@x>".into(), in_reply_to: None, references: vec![], date: Utc::now(), participants: vec!["a@x".into()], body: "hi".into() };
        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = ParseStage::new(runtime, blobs, make_decomposer_with(vec![raw]), 300);
        stage.process_archive(&archive_id).await.unwrap();

        let doc = store.get(Collection::Archives, &archive_id).await.unwrap().unwrap();
        assert_eq!(doc.payload["message_count"], 1);

        let msg_key = message_key(&archive_id, "<a@x>");
        assert!(store.get(Collection::Messages, &msg_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_message_is_skipped_without_republishing() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        let blobs = Arc::new(crate::collaborators::InMemoryArchiveBytesStore::new());
        let archive_id = seed_archive(&store, &blobs).await;

        let raw = RawParsedMessage { message_id: "<a@x>".into(), in_reply_to: None, references: vec![], date: Utc::now(), participants: vec!["a@x".into()], body: "hi".into() };
        let key = message_key(&archive_id, "<a@x>");
        store.insert(Collection::Messages, &key, json!({"archive_id": archive_id}), Utc::now()).await.unwrap();

        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = ParseStage::new(runtime, blobs, make_decomposer_with(vec![raw]), 300);
        stage.process_archive(&archive_id).await.unwrap();

        let doc = store.get(Collection::Archives, &archive_id).await.unwrap().unwrap();
        assert_eq!(doc.payload["message_count"], 0);
    }
}
