//! pipeline-core: shared substrate for the mailing-list archive
//! ingestion/summarization pipeline.
//!
//! Purpose:
//! - Provide the neutral contracts (no dependency on any concrete bus/store
//!   driver) that make the pipeline crash-safe: idempotency via
//!   deterministic keys, the document state machine, the error taxonomy,
//!   the event envelope, the schema validator, the metrics collector, and
//!   the retry-with-backoff helper.
//!
//! Main components:
//! - `hashing`: JSON canonicalization and primary key derivation (SHA-256)
//!   for each collection.
//! - `status`: the `pending -> processing -> {completed, failed}` state
//!   machine.
//! - `errors`: the `ValidationError`/`TransientError`/`PermanentError`/
//!   `PoisonMessage` taxonomy.
//! - `event`: event envelope and the canonical set of routing keys.
//! - `schema_validator`: JSON-Schema registry and publish-time validation.
//! - `metrics`: metrics facade (increment/observe/gauge).
//! - `retry`: retry-with-backoff, distinct from bus redelivery.
//! - `stage_worker`: safe event-handling wrapper + stats tracker.
//! - `config`: typed configuration loaded from the environment.

pub mod config;
pub mod constants;
pub mod errors;
pub mod event;
pub mod hashing;
pub mod metrics;
pub mod retry;
pub mod schema_validator;
pub mod stage_worker;
pub mod status;

pub use config::{ConfigError, PipelineConfig};
pub use errors::CoreError;
pub use event::{routing_key, EventEnvelope};
pub use metrics::{MetricsCollector, NoopMetricsCollector, RecorderMetricsCollector, Tags};
pub use retry::{retry_with_backoff, CancellationToken, LoggingRetryHooks, RetryConfig, RetryHooks};
pub use schema_validator::SchemaRegistry;
pub use stage_worker::{dispatch_safely, ErrorReporter, LoggingErrorReporter, StatsTracker};
pub use status::{DocumentStatus, LifecycleFields};
