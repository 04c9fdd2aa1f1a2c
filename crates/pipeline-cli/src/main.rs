//! pipeline-cli: the startup process for the stages of the
//! mailing-list archive ingestion/summarization pipeline.
//!
//! Each subcommand starts a single kind of process — parallel workers
//! across processes, one per stage is typical: `ingest` triggers an
//! on-demand ingestion (the only trigger that isn't a bus consumer),
//! `serve` starts a consumer stage until SIGTERM, and `supervise` runs
//! the startup requeue once and then the retry supervisor's periodic
//! sweep.
//!
//! Builds its collaborators (bus/store/vector store) from
//! `PipelineConfig::from_env`; each adapter's in-memory implementation
//! is available as a demo/development collaborator when no real
//! broker/Postgres/Qdrant is configured in the environment.

use clap::{Parser, Subcommand, ValueEnum};
use pipeline_bus::{BrokerBus, CloudBus, MessageBus, ValidatingBus};
use pipeline_core::config::{DocumentStoreType, MessageBusType, PipelineConfig, VectorStoreType};
use pipeline_core::{CoreError, SchemaRegistry};
use pipeline_stages::collaborators::{
    ExtractiveLlmBackend, HashingEmbedder, InMemoryArchiveBytesStore, InMemoryReportSink, SimpleMboxDecomposer,
};
use pipeline_stages::{ChunkStage, EmbedStage, IngestStage, OrchestrateStage, ParseStage, ReportStage, StageRuntime, SummarizeStage};
use pipeline_store::pg::{build_pool, PoolProvider};
use pipeline_store::{DbConfig, DocumentStore, InMemoryDocumentStore, PgDocumentStore};
use pipeline_supervisor::retry_job::RetrySupervisor;
use pipeline_supervisor::startup::StartupRequeue;
use pipeline_vectorstore::{InMemoryVectorStore, QdrantVectorStore, VectorStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pipeline-cli", about = "mailing-list archive ingestion/summarization pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// On-demand ingestion of an archive; external trigger, no input queue of its own.
    Ingest {
        #[arg(long)]
        source: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Starts a consumer stage until SIGTERM/Ctrl-C (drain protocol).
    Serve {
        #[arg(value_enum)]
        stage: StageName,
    },
    /// Runs the startup requeue once, then the retry supervisor's
    /// periodic sweep until SIGTERM/Ctrl-C.
    Supervise,
}

#[derive(Clone, Copy, ValueEnum)]
enum StageName {
    Parse,
    Chunk,
    Embed,
    Orchestrate,
    Summarize,
    Report,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Ingest { source, file } => run_ingest(&source, &file).await,
        Command::Serve { stage } => run_serve(stage).await,
        Command::Supervise => run_supervise().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("fatal startup/runtime error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_ingest(source: &str, file: &PathBuf) -> Result<(), CoreError> {
    let cfg = PipelineConfig::from_env().map_err(|e| CoreError::Internal(e.to_string()))?;
    let bus = build_bus(&cfg).await?;
    let store = build_store(&cfg).await?;
    let runtime = StageRuntime::new(bus, store, cfg.retry_config());
    let stage = IngestStage::new(runtime, Arc::new(InMemoryArchiveBytesStore::new()));
    stage.declare().await?;

    let bytes = std::fs::read(file).map_err(|e| CoreError::PermanentError(format!("reading {}: {e}", file.display())))?;
    let archive_id = stage.ingest_file(source, &bytes).await?;
    println!("archive_id={archive_id}");
    Ok(())
}

async fn run_serve(stage: StageName) -> Result<(), CoreError> {
    let cfg = PipelineConfig::from_env().map_err(|e| CoreError::Internal(e.to_string()))?;
    let bus = build_bus(&cfg).await?;
    let store = build_store(&cfg).await?;
    let stall = cfg.supervisor.startup_requeue_stall_threshold_seconds;

    match stage {
        StageName::Parse => {
            let runtime = StageRuntime::new(bus.clone(), store, cfg.retry_config());
            let s = Arc::new(ParseStage::new(runtime, Arc::new(InMemoryArchiveBytesStore::new()), Arc::new(SimpleMboxDecomposer), stall));
            s.declare().await?;
            let handler: pipeline_bus::Handler = Arc::new(move |env| {
                let s = s.clone();
                Box::pin(async move { s.handle(env).await })
            });
            subscribe_and_serve(&bus, "parse.in", "ArchiveIngested", handler).await
        }
        StageName::Chunk => {
            let runtime = StageRuntime::new(bus.clone(), store, cfg.retry_config());
            let s = Arc::new(ChunkStage::new(runtime, cfg.chunking.clone(), stall));
            s.declare().await?;
            let handler: pipeline_bus::Handler = Arc::new(move |env| {
                let s = s.clone();
                Box::pin(async move { s.handle(env).await })
            });
            subscribe_and_serve(&bus, "chunk.in", "JSONParsed", handler).await
        }
        StageName::Embed => {
            let vector_store = build_vector_store(&cfg).await?;
            let embedder = Arc::new(HashingEmbedder::new(cfg.embedding.dimension));
            let runtime = StageRuntime::new(bus.clone(), store, cfg.retry_config());
            let s = Arc::new(EmbedStage::new(runtime, embedder, vector_store, stall));
            s.declare().await?;
            let handler: pipeline_bus::Handler = Arc::new(move |env| {
                let s = s.clone();
                Box::pin(async move { s.handle(env).await })
            });
            subscribe_and_serve(&bus, "embed.in", "ChunksPrepared", handler).await
        }
        StageName::Orchestrate => {
            let vector_store = build_vector_store(&cfg).await?;
            let runtime = StageRuntime::new(bus.clone(), store, cfg.retry_config());
            let s = Arc::new(OrchestrateStage::new(runtime, vector_store, cfg.retrieval.top_k, cfg.retrieval.context_window_tokens, "thread_digest"));
            s.declare().await?;
            let handler: pipeline_bus::Handler = Arc::new(move |env| {
                let s = s.clone();
                Box::pin(async move { s.handle(env).await })
            });
            subscribe_and_serve(&bus, "orchestrate.in", "EmbeddingsGenerated", handler).await
        }
        StageName::Summarize => {
            let runtime = StageRuntime::new(bus.clone(), store, cfg.retry_config());
            let s = Arc::new(SummarizeStage::new(runtime, Arc::new(ExtractiveLlmBackend), stall));
            s.declare().await?;
            let handler: pipeline_bus::Handler = Arc::new(move |env| {
                let s = s.clone();
                Box::pin(async move { s.handle(env).await })
            });
            subscribe_and_serve(&bus, "summarize.in", "SummarizationRequested", handler).await
        }
        StageName::Report => {
            let runtime = StageRuntime::new(bus.clone(), store, cfg.retry_config());
            let s = Arc::new(ReportStage::new(runtime, Arc::new(InMemoryReportSink::new()), stall));
            s.declare().await?;
            let handler: pipeline_bus::Handler = Arc::new(move |env| {
                let s = s.clone();
                Box::pin(async move { s.handle(env).await })
            });
            subscribe_and_serve(&bus, "report.in", "SummaryComplete", handler).await
        }
    }
}

async fn subscribe_and_serve(bus: &Arc<dyn MessageBus>, queue: &str, event_type: &str, handler: pipeline_bus::Handler) -> Result<(), CoreError> {
    bus.subscribe(queue, event_type, None, handler).await.map_err(CoreError::from)?;

    let shutdown_bus = bus.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown signal received, draining in-flight message");
        shutdown_bus.stop_consuming().await;
    });

    bus.start_consuming().await.map_err(CoreError::from)
}

async fn run_supervise() -> Result<(), CoreError> {
    let cfg = PipelineConfig::from_env().map_err(|e| CoreError::Internal(e.to_string()))?;
    let bus = build_bus(&cfg).await?;
    let store = build_store(&cfg).await?;
    let vector_store = build_vector_store(&cfg).await?;
    let stall = cfg.supervisor.startup_requeue_stall_threshold_seconds;

    let metrics: Arc<dyn pipeline_core::MetricsCollector> = Arc::new(pipeline_core::RecorderMetricsCollector);

    let parse = Arc::new(ParseStage::new(
        StageRuntime::new(bus.clone(), store.clone(), cfg.retry_config()),
        Arc::new(InMemoryArchiveBytesStore::new()),
        Arc::new(SimpleMboxDecomposer),
        stall,
    ));
    let chunk = Arc::new(ChunkStage::new(StageRuntime::new(bus.clone(), store.clone(), cfg.retry_config()), cfg.chunking.clone(), stall));
    let embed = Arc::new(EmbedStage::new(
        StageRuntime::new(bus.clone(), store.clone(), cfg.retry_config()),
        Arc::new(HashingEmbedder::new(cfg.embedding.dimension)),
        vector_store,
        stall,
    ));
    let summarize = Arc::new(SummarizeStage::new(StageRuntime::new(bus.clone(), store.clone(), cfg.retry_config()), Arc::new(ExtractiveLlmBackend), stall));
    let report = Arc::new(ReportStage::new(StageRuntime::new(bus.clone(), store.clone(), cfg.retry_config()), Arc::new(InMemoryReportSink::new()), stall));

    let startup = StartupRequeue::new(parse, chunk, embed, summarize, report);
    let now = chrono::Utc::now();
    let requeued = startup.run(now).await?;
    log::info!("startup requeue republished {requeued} stalled documents");

    let supervisor = RetrySupervisor::new(
        bus,
        store,
        metrics,
        cfg.supervisor.retry_supervisor_max_retries,
        Duration::from_secs(cfg.retry.backoff_seconds),
        Duration::from_secs(cfg.retry.max_backoff_seconds),
    );

    let interval = Duration::from_secs(cfg.supervisor.retry_supervisor_interval_seconds);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown signal received, stopping retry supervisor loop");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {
                let (retried, exhausted) = supervisor.run_once(chrono::Utc::now()).await?;
                log::info!("retry supervisor pass: retried={retried} exhausted={exhausted}");
            }
        }
    }
}

async fn build_bus(cfg: &PipelineConfig) -> Result<Arc<dyn MessageBus>, CoreError> {
    let registry = Arc::new(SchemaRegistry::canonical(true)?);
    match cfg.message_bus_type {
        MessageBusType::Broker => {
            let uri = std::env::var("AMQP_URL").map_err(|_| CoreError::Internal("AMQP_URL not set for broker message bus".into()))?;
            let heartbeat: u16 = std::env::var("AMQP_HEARTBEAT_SECONDS").ok().and_then(|v| v.parse().ok()).unwrap_or(300);
            let inner = BrokerBus::connect(&uri, pipeline_core::constants::EVENTS_TOPIC, heartbeat).await.map_err(CoreError::from)?;
            Ok(Arc::new(ValidatingBus::new(inner, registry)))
        }
        MessageBusType::Cloud => {
            let url = std::env::var("NATS_URL").map_err(|_| CoreError::Internal("NATS_URL not set for cloud message bus".into()))?;
            let inner = CloudBus::connect(&url, pipeline_core::constants::EVENTS_TOPIC).await.map_err(CoreError::from)?;
            Ok(Arc::new(ValidatingBus::new(inner, registry)))
        }
    }
}

async fn build_store(cfg: &PipelineConfig) -> Result<Arc<dyn DocumentStore>, CoreError> {
    match cfg.document_store_type {
        DocumentStoreType::InMemory => Ok(Arc::new(InMemoryDocumentStore::new())),
        DocumentStoreType::Postgres => {
            let db = DbConfig::from_env();
            let pool = build_pool(&db.url, db.min_connections, db.max_connections).map_err(CoreError::from)?;
            Ok(Arc::new(PgDocumentStore::new(PoolProvider { pool })))
        }
    }
}

async fn build_vector_store(cfg: &PipelineConfig) -> Result<Arc<dyn VectorStore>, CoreError> {
    match cfg.vector_store_type {
        VectorStoreType::InMemory => Ok(Arc::new(InMemoryVectorStore::new(cfg.embedding.dimension))),
        VectorStoreType::Qdrant => {
            let base_url = std::env::var("QDRANT_URL").map_err(|_| CoreError::Internal("QDRANT_URL not set for qdrant vector store".into()))?;
            let collection = std::env::var("QDRANT_COLLECTION").unwrap_or_else(|_| "pipeline_chunks".to_string());
            Ok(Arc::new(QdrantVectorStore::connect(base_url, collection, cfg.embedding.dimension).await.map_err(CoreError::from)?))
        }
    }
}
