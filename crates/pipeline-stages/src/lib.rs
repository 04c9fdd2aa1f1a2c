//! pipeline-stages: the six stages of the mailing-list archive
//! ingest/summarization pipeline, composed over the neutral contracts in
//! `pipeline-core`/`pipeline-store`/`pipeline-bus`/`pipeline-vectorstore`/
//! `pipeline-stage-logic`.
//!
//! Every stage follows the same shape: a shared `StageRuntime` (bus,
//! store, stats/metrics/reporter, retry config, cancellation), a
//! `declare` method that predeclares its queues, a `handle` method that
//! wraps its business logic with `dispatch_safely`, and a
//! `requeue_stalled` method for the startup requeue (except
//! `IngestStage`, whose trigger is external).

pub mod chunk;
pub mod collaborators;
pub mod embed;
pub mod ingest;
pub mod orchestrate;
pub mod parse;
pub mod queues;
pub mod report;
pub mod runtime;
pub mod summarize;

pub use chunk::ChunkStage;
pub use embed::EmbedStage;
pub use ingest::IngestStage;
pub use orchestrate::OrchestrateStage;
pub use parse::ParseStage;
pub use report::ReportStage;
pub use runtime::StageRuntime;
pub use summarize::SummarizeStage;
