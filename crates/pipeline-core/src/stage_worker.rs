//! Base stage worker.
//!
//! Every stage is composed of: a subscriber to a single event type (in
//! `pipeline-bus`), a safe event-handling wrapper (this module), the
//! retry helper (`retry.rs`), and a stats tracker + metrics collector.
//! The wrapper (a) logs the event type, (b) dispatches to the stage's
//! business method, (c) on exception reports it, increments
//! `failures_total{error_type}`, and re-raises so the bus nacks with
//! requeue.

use crate::errors::CoreError;
use crate::metrics::{MetricsCollector, Tags};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A stage's counters: processed, failures, accumulated processing time
/// (nanoseconds, to avoid desync between a sum counter and a count
/// counter under concurrency).
#[derive(Default)]
pub struct StatsTracker {
    processed: AtomicU64,
    failures: AtomicU64,
    processing_nanos_total: AtomicU64,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, elapsed: std::time::Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.processing_nanos_total.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, elapsed: std::time::Duration) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.processing_nanos_total.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn processing_nanos_total(&self) -> u64 {
        self.processing_nanos_total.load(Ordering::Relaxed)
    }
}

/// Reports terminal errors to an external channel (structured logs, a
/// Sentry-equivalent, etc). The default implementation only logs; stages
/// that need something richer can substitute it.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, stage: &'static str, event_type: &str, error: &CoreError);
}

pub struct LoggingErrorReporter;

impl ErrorReporter for LoggingErrorReporter {
    fn report(&self, stage: &'static str, event_type: &str, error: &CoreError) {
        log::error!("stage={stage} event_type={event_type} error_type={} error={error}", error.error_type());
    }
}

/// Wraps a business handler's execution with logging, metrics, and error
/// propagation. `handler` must return `Result<(), CoreError>`; on
/// failure the error is re-raised so the caller (the bus driver) can
/// nack-with-requeue.
pub async fn dispatch_safely<F, Fut>(
    stage: &'static str,
    event_type: &str,
    stats: &StatsTracker,
    metrics: &dyn MetricsCollector,
    reporter: &dyn ErrorReporter,
    handler: F,
) -> Result<(), CoreError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), CoreError>>,
{
    log::info!("stage={stage} event_type={event_type} dispatching");
    let start = Instant::now();
    match handler().await {
        Ok(()) => {
            let elapsed = start.elapsed();
            stats.record_success(elapsed);
            metrics.observe("stage_processing_seconds", elapsed.as_secs_f64(), &crate::tags! {"stage" => stage});
            log::info!("stage={stage} event_type={event_type} completed in {:?}", elapsed);
            Ok(())
        }
        Err(err) => {
            let elapsed = start.elapsed();
            stats.record_failure(elapsed);
            reporter.report(stage, event_type, &err);
            metrics.increment(
                "failures_total",
                &crate::tags! {"stage" => stage, "error_type" => err.error_type()},
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsCollector;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct TestReporter(Arc<AtomicBool>);
    impl ErrorReporter for TestReporter {
        fn report(&self, _stage: &'static str, _event_type: &str, _error: &CoreError) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn success_records_stats_and_no_report() {
        let stats = StatsTracker::new();
        let reported = Arc::new(AtomicBool::new(false));
        let reporter = TestReporter(reported.clone());
        let metrics = NoopMetricsCollector;
        let result = dispatch_safely("chunk", "json.parsed", &stats, &metrics, &reporter, || async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(stats.processed(), 1);
        assert_eq!(stats.failures(), 0);
        assert!(!reported.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failure_records_stats_and_reports_then_propagates() {
        let stats = StatsTracker::new();
        let reported = Arc::new(AtomicBool::new(false));
        let reporter = TestReporter(reported.clone());
        let metrics = NoopMetricsCollector;
        let result = dispatch_safely("chunk", "json.parsed", &stats, &metrics, &reporter, || async {
            Err(CoreError::PermanentError("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(stats.failures(), 1);
        assert!(reported.load(Ordering::SeqCst));
    }
}
