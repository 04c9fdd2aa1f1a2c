//! Ingest stage: on-demand (the external trigger — scheduler/HTTP
//! gateway — is out of scope here), but the handler contract is this
//! pipeline's responsibility. Hashes the archive bytes, derives the
//! key, skips if already `completed`, stores the bytes via the
//! archive-store adapter, inserts `archives[key]` as `pending`, and
//! publishes `archive.ingested`.

use crate::collaborators::ArchiveBytesStore;
use crate::queues;
use crate::runtime::StageRuntime;
use chrono::Utc;
use pipeline_core::event::{routing_key, EventEnvelope};
use pipeline_core::status::DocumentStatus;
use pipeline_core::{tags, CoreError};
use pipeline_domain::archive::{archive_key, file_hash_of, normalize_source_name};
use pipeline_store::model::{Collection, MutablePatch};
use serde_json::json;
use std::sync::Arc;

pub struct IngestStage {
    runtime: StageRuntime,
    blobs: Arc<dyn ArchiveBytesStore>,
}

const STAGE: &str = "ingest";

impl IngestStage {
    pub fn new(runtime: StageRuntime, blobs: Arc<dyn ArchiveBytesStore>) -> Self {
        Self { runtime, blobs }
    }

    /// Predeclares the failure queue; ingest has no input queue of its
    /// own (the trigger is external).
    pub async fn declare(&self) -> Result<(), CoreError> {
        self.runtime
            .bus
            .declare_queue(&queues::failure_queue(STAGE), routing_key::ARCHIVE_INGESTION_FAILED, pipeline_core::constants::EVENTS_TOPIC)
            .await
            .map_err(Into::into)
    }

    /// Ingests an archive: source descriptor (name) + raw bytes.
    /// Idempotent on `(source, file_hash)`.
    pub async fn ingest_file(&self, source: &str, file_bytes: &[u8]) -> Result<String, CoreError> {
        let start = std::time::Instant::now();
        match self.try_ingest(source, file_bytes).await {
            Ok(key) => {
                let elapsed = start.elapsed();
                self.runtime.stats.record_success(elapsed);
                Ok(key)
            }
            Err(err) => {
                let elapsed = start.elapsed();
                self.runtime.stats.record_failure(elapsed);
                self.runtime.reporter.report(STAGE, routing_key::ARCHIVE_INGESTED, &err);
                self.runtime.metrics.increment("failures_total", &tags! {"stage" => STAGE, "error_type" => err.error_type()});
                Err(err)
            }
        }
    }

    async fn try_ingest(&self, source: &str, file_bytes: &[u8]) -> Result<String, CoreError> {
        let file_hash = file_hash_of(file_bytes);
        let key = archive_key(source, &file_hash);
        let now = Utc::now();

        if let Some(existing) = self.runtime.store.get(Collection::Archives, &key).await.map_err(CoreError::from)? {
            if existing.status == DocumentStatus::Completed {
                self.runtime.metrics.increment("ingestion_files_total", &tags! {"status" => "skipped"});
                log::info!("stage={STAGE} archive_id={key} already completed, skipping");
                return Ok(key);
            }
        }

        let storage_id = match self.blobs.put(file_bytes.to_vec()).await {
            Ok(id) => id,
            Err(err) => {
                self.fail_archive(&key, source, &err, now).await;
                return Err(err);
            }
        };

        self.runtime
            .store
            .insert(
                Collection::Archives,
                &key,
                json!({
                    "source": normalize_source_name(source),
                    "file_hash": file_hash,
                    "storage_id": storage_id,
                    "ingestion_date": now,
                    "message_count": null,
                }),
                now,
            )
            .await
            .map_err(CoreError::from)?;

        let event = EventEnvelope::new(
            "ArchiveIngested",
            json!({
                "archive_id": key,
                "source": normalize_source_name(source),
                "storage_id": storage_id,
                "file_hash": file_hash,
                "ingestion_date": now,
                "message_count": null,
            }),
        );
        self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::ARCHIVE_INGESTED, event).await.map_err(CoreError::from)?;
        self.runtime.metrics.increment("ingestion_files_total", &tags! {"status" => "ingested"});
        log::info!("stage={STAGE} archive_id={key} ingested");
        Ok(key)
    }

    async fn fail_archive(&self, key: &str, source: &str, err: &CoreError, now: chrono::DateTime<Utc>) {
        let _ = self
            .runtime
            .store
            .update(Collection::Archives, key, MutablePatch::new().with_status(DocumentStatus::Failed), now)
            .await;
        let event = EventEnvelope::new("ArchiveIngestionFailed", json!({"archive_id": key, "source": source, "error": err.to_string()}));
        let _ = self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::ARCHIVE_INGESTION_FAILED, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryArchiveBytesStore;
    use pipeline_bus::InMemoryBus;
    use pipeline_store::InMemoryDocumentStore;

    fn make_stage() -> IngestStage {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        let runtime = StageRuntime::new(bus, store, Default::default());
        IngestStage::new(runtime, Arc::new(InMemoryArchiveBytesStore::new()))
    }

    #[tokio::test]
    async fn ingesting_same_bytes_twice_is_idempotent() {
        let stage = make_stage();
        stage.declare().await.unwrap();
        stage
            .runtime
            .bus
            .declare_queue("audit.ingested", routing_key::ARCHIVE_INGESTED, pipeline_core::constants::EVENTS_TOPIC)
            .await
            .unwrap();

        let k1 = stage.ingest_file("s1", b"hello world").await.unwrap();
        let k2 = stage.ingest_file("s1", b"hello world").await.unwrap();
        assert_eq!(k1, k2);

        let doc = stage.runtime.store.get(Collection::Archives, &k1).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn completed_archive_is_skipped_without_republishing() {
        let stage = make_stage();
        stage
            .runtime
            .bus
            .declare_queue("audit.ingested", routing_key::ARCHIVE_INGESTED, pipeline_core::constants::EVENTS_TOPIC)
            .await
            .unwrap();
        let key = stage.ingest_file("s1", b"hello world").await.unwrap();
        stage
            .runtime
            .store
            .update(Collection::Archives, &key, MutablePatch::new().with_status(DocumentStatus::Completed), Utc::now())
            .await
            .unwrap();

        let key2 = stage.ingest_file("s1", b"hello world").await.unwrap();
        assert_eq!(key, key2);
    }
}
