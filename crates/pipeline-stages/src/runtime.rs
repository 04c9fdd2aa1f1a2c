//! Support common to every stage: the bus, the document store, the
//! stats/metrics/reporter trio, the retry config, and the cooperative
//! cancellation signal. Each stage is composed with a `StageRuntime`
//! instead of repeating these five fields.

use pipeline_bus::MessageBus;
use pipeline_core::metrics::MetricsCollector;
use pipeline_core::retry::{CancellationToken, RetryConfig};
use pipeline_core::stage_worker::{ErrorReporter, LoggingErrorReporter, StatsTracker};
use pipeline_core::NoopMetricsCollector;
use pipeline_store::DocumentStore;
use std::sync::Arc;

pub struct StageRuntime {
    pub bus: Arc<dyn MessageBus>,
    pub store: Arc<dyn DocumentStore>,
    pub metrics: Arc<dyn MetricsCollector>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub stats: StatsTracker,
    pub retry_config: RetryConfig,
    pub cancellation: CancellationToken,
}

impl StageRuntime {
    pub fn new(bus: Arc<dyn MessageBus>, store: Arc<dyn DocumentStore>, retry_config: RetryConfig) -> Self {
        Self {
            bus,
            store,
            metrics: Arc::new(NoopMetricsCollector),
            reporter: Arc::new(LoggingErrorReporter),
            stats: StatsTracker::new(),
            retry_config,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}
