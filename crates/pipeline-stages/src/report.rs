//! Report stage: consumes `summary.complete`, fetches the summary
//! content and delivers it to the `ReportSink` collaborator (retried
//! with backoff on transient failures), publishing `report.published`
//! or `report.delivery.failed`.

use crate::collaborators::ReportSink;
use crate::queues;
use crate::runtime::StageRuntime;
use chrono::{DateTime, Utc};
use pipeline_core::event::{routing_key, EventEnvelope};
use pipeline_core::retry::{retry_with_backoff, LoggingRetryHooks};
use pipeline_core::stage_worker::dispatch_safely;
use pipeline_core::status::DocumentStatus;
use pipeline_core::{tags, CoreError};
use pipeline_store::model::{Collection, Filter, MutablePatch};
use serde_json::json;
use std::sync::Arc;

const STAGE: &str = "report";

pub struct ReportStage {
    runtime: StageRuntime,
    sink: Arc<dyn ReportSink>,
    stall_threshold_seconds: i64,
}

impl ReportStage {
    pub fn new(runtime: StageRuntime, sink: Arc<dyn ReportSink>, stall_threshold_seconds: i64) -> Self {
        Self { runtime, sink, stall_threshold_seconds }
    }

    pub async fn declare(&self) -> Result<(), CoreError> {
        let bus = &self.runtime.bus;
        bus.declare_queue(&queues::input_queue(STAGE), routing_key::SUMMARY_COMPLETE, pipeline_core::constants::EVENTS_TOPIC).await?;
        bus.declare_queue(&queues::failure_queue(STAGE), routing_key::REPORT_DELIVERY_FAILED, pipeline_core::constants::EVENTS_TOPIC).await?;
        Ok(())
    }

    pub async fn handle(&self, envelope: EventEnvelope) -> Result<(), CoreError> {
        dispatch_safely(STAGE, &envelope.event_type, &self.runtime.stats, self.runtime.metrics.as_ref(), self.runtime.reporter.as_ref(), || async {
            let thread_id = envelope.data["thread_id"].as_str().ok_or_else(|| CoreError::PermanentError("missing thread_id".into()))?.to_string();
            let summary_id = envelope.data["summary_id"].as_str().ok_or_else(|| CoreError::PermanentError("missing summary_id".into()))?.to_string();
            if let Err(err) = self.process_summary(&thread_id, &summary_id).await {
                self.fail_report(&thread_id, &summary_id, &err).await;
                return Err(err);
            }
            Ok(())
        })
        .await
    }

    async fn process_summary(&self, thread_id: &str, summary_id: &str) -> Result<(), CoreError> {
        let now = Utc::now();
        let doc = self
            .runtime
            .store
            .get(Collection::Summaries, summary_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::PermanentError(format!("summary {summary_id} not found")))?;

        if doc.payload.get("report_delivered").and_then(|v| v.as_bool()).unwrap_or(false) {
            log::info!("stage={STAGE} summary_id={summary_id} already delivered, skipping");
            return Ok(());
        }

        let content = doc.payload["content"].as_str().unwrap_or_default().to_string();

        let sink = self.sink.clone();
        let thread_id_owned = thread_id.to_string();
        let summary_id_owned = summary_id.to_string();
        retry_with_backoff(&self.runtime.retry_config, &LoggingRetryHooks, &self.runtime.cancellation, || {
            let sink = sink.clone();
            let thread_id = thread_id_owned.clone();
            let summary_id = summary_id_owned.clone();
            let content = content.clone();
            async move { sink.deliver(&thread_id, &summary_id, &content).await }
        })
        .await?;

        self.runtime
            .store
            .update(Collection::Summaries, summary_id, MutablePatch::new().merging_payload(json!({"report_delivered": true})), now)
            .await
            .map_err(CoreError::from)?;

        let event = EventEnvelope::new("ReportPublished", json!({"thread_id": thread_id, "summary_id": summary_id}));
        self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::REPORT_PUBLISHED, event).await.map_err(CoreError::from)?;
        self.runtime.metrics.increment("reports_published_total", &tags! {"stage" => STAGE});
        log::info!("stage={STAGE} thread_id={thread_id} summary_id={summary_id} delivered");
        Ok(())
    }

    async fn fail_report(&self, thread_id: &str, summary_id: &str, err: &CoreError) {
        let event = EventEnvelope::new("ReportDeliveryFailed", json!({"thread_id": thread_id, "summary_id": summary_id, "error": err.to_string()}));
        let _ = self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::REPORT_DELIVERY_FAILED, event).await;
    }

    /// Startup requeue: completed summaries with no confirmed delivery
    /// republish `summary.complete`.
    pub async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let threshold = now - chrono::Duration::seconds(self.stall_threshold_seconds);
        let filter = Filter::new().status_eq(DocumentStatus::Completed).last_updated_lt(threshold);
        let candidates = self.runtime.store.query(Collection::Summaries, &filter, None).await.map_err(CoreError::from)?;
        let mut requeued = 0u64;
        for doc in candidates {
            if doc.payload.get("report_delivered").and_then(|v| v.as_bool()).unwrap_or(false) {
                continue;
            }
            let event = EventEnvelope::new("SummaryComplete", json!({"thread_id": doc.payload["thread_id"], "summary_id": doc.collection_key}));
            self.runtime.bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::SUMMARY_COMPLETE, event).await.map_err(CoreError::from)?;
            requeued += 1;
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryReportSink;
    use pipeline_bus::InMemoryBus;
    use pipeline_store::InMemoryDocumentStore;

    #[tokio::test]
    async fn delivers_report_and_marks_delivered() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        bus.declare_queue("audit.published", routing_key::REPORT_PUBLISHED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        store.insert(Collection::Summaries, "s1", json!({"content": "final summary text"}), Utc::now()).await.unwrap();

        let sink = Arc::new(InMemoryReportSink::new());
        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = ReportStage::new(runtime, sink.clone(), 300);
        stage.process_summary("t1", "s1").await.unwrap();

        assert_eq!(sink.delivered().len(), 1);
        let doc = store.get(Collection::Summaries, "s1").await.unwrap().unwrap();
        assert_eq!(doc.payload["report_delivered"], true);
    }

    #[tokio::test]
    async fn already_delivered_summary_is_not_delivered_twice() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert(Collection::Summaries, "s1", json!({"content": "x", "report_delivered": true}), Utc::now()).await.unwrap();

        let sink = Arc::new(InMemoryReportSink::new());
        let runtime = StageRuntime::new(bus, store.clone(), Default::default());
        let stage = ReportStage::new(runtime, sink.clone(), 300);
        stage.process_summary("t1", "s1").await.unwrap();
        assert_eq!(sink.delivered().len(), 0);
    }
}
