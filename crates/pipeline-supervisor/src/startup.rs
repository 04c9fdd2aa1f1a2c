//! Startup requeue: on process start, each stage (except `IngestStage`,
//! whose trigger is external and has no document-store counterpart
//! before ingesting) republishes documents left in `pending`/`processing`
//! past the stall threshold, covering crashes mid-handler.

use chrono::{DateTime, Utc};
use pipeline_core::CoreError;
use pipeline_stages::{ChunkStage, EmbedStage, ParseStage, ReportStage, SummarizeStage};
use std::sync::Arc;

pub struct StartupRequeue {
    parse: Arc<ParseStage>,
    chunk: Arc<ChunkStage>,
    embed: Arc<EmbedStage>,
    summarize: Arc<SummarizeStage>,
    report: Arc<ReportStage>,
}

impl StartupRequeue {
    pub fn new(parse: Arc<ParseStage>, chunk: Arc<ChunkStage>, embed: Arc<EmbedStage>, summarize: Arc<SummarizeStage>, report: Arc<ReportStage>) -> Self {
        Self { parse, chunk, embed, summarize, report }
    }

    /// Runs the startup requeue once, in pipeline order. Returns the
    /// total number of republished documents.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let parse_count = self.parse.requeue_stalled(now).await?;
        let chunk_count = self.chunk.requeue_stalled(now).await?;
        let embed_count = self.embed.requeue_stalled(now).await?;
        let summarize_count = self.summarize.requeue_stalled(now).await?;
        let report_count = self.report.requeue_stalled(now).await?;
        let total = parse_count + chunk_count + embed_count + summarize_count + report_count;
        log::info!(
            "startup_requeue parse={parse_count} chunk={chunk_count} embed={embed_count} summarize={summarize_count} report={report_count} total={total}"
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_bus::InMemoryBus;
    use pipeline_core::config::{ChunkingConfig, ChunkingStrategy};
    use pipeline_stages::collaborators::{ExtractiveLlmBackend, HashingEmbedder, InMemoryReportSink};
    use pipeline_stages::StageRuntime;
    use pipeline_store::InMemoryDocumentStore;
    use pipeline_vectorstore::InMemoryVectorStore;

    fn chunking_config() -> ChunkingConfig {
        ChunkingConfig { strategy: ChunkingStrategy::TokenWindow, chunk_size: 512, chunk_overlap: 64, min_chunk_size: 32, max_chunk_size: 1024, messages_per_chunk: 1 }
    }

    #[tokio::test]
    async fn empty_store_requeues_nothing() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        let runtime = || StageRuntime::new(bus.clone(), store.clone(), Default::default());

        let parse = Arc::new(ParseStage::new(runtime(), Arc::new(pipeline_stages::collaborators::InMemoryArchiveBytesStore::new()), Arc::new(pipeline_stages::collaborators::SimpleMboxDecomposer), 300));
        let chunk = Arc::new(ChunkStage::new(runtime(), chunking_config(), 300));
        let embed = Arc::new(EmbedStage::new(runtime(), Arc::new(HashingEmbedder::new(8)), Arc::new(InMemoryVectorStore::new(8)), 300));
        let summarize = Arc::new(SummarizeStage::new(runtime(), Arc::new(ExtractiveLlmBackend), 300));
        let report = Arc::new(ReportStage::new(runtime(), Arc::new(InMemoryReportSink::new()), 300));

        let startup = StartupRequeue::new(parse, chunk, embed, summarize, report);
        let total = startup.run(Utc::now()).await.unwrap();
        assert_eq!(total, 0);
    }
}
