//! Metrics collector.
//!
//! The only piece of process-wide mutable state besides the
//! `SchemaRegistry`; it must tolerate concurrent updates. The default
//! implementation delegates to the `metrics` facade, which is lock-free
//! by construction — no exporter is installed here, that is an
//! operational concern out of scope for this core.

use std::collections::HashMap;

pub type Tags = HashMap<&'static str, String>;

pub trait MetricsCollector: Send + Sync {
    fn increment(&self, name: &'static str, tags: &Tags);
    fn observe(&self, name: &'static str, value: f64, tags: &Tags);
    fn gauge(&self, name: &'static str, value: f64, tags: &Tags);
}

/// Builds a `Tags` from `(key, value)` pairs, so stages don't repeat
/// `HashMap::from([...])` at every call site.
#[macro_export]
macro_rules! tags {
    () => {
        ::std::collections::HashMap::new()
    };
    ($($k:expr => $v:expr),+ $(,)?) => {{
        let mut m = ::std::collections::HashMap::new();
        $(m.insert($k, $v.to_string());)+
        m
    }};
}

fn label_pairs(tags: &Tags) -> Vec<(&'static str, String)> {
    let mut pairs: Vec<(&'static str, String)> = tags.iter().map(|(k, v)| (*k, v.clone())).collect();
    pairs.sort_by_key(|(k, _)| *k);
    pairs
}

/// Implementation backed by the `metrics` facade (a process-wide global
/// recorder installable by the operator).
pub struct RecorderMetricsCollector;

impl MetricsCollector for RecorderMetricsCollector {
    fn increment(&self, name: &'static str, tags: &Tags) {
        let labels = label_pairs(tags);
        metrics::counter!(name, &labels).increment(1);
    }

    fn observe(&self, name: &'static str, value: f64, tags: &Tags) {
        let labels = label_pairs(tags);
        metrics::histogram!(name, &labels).record(value);
    }

    fn gauge(&self, name: &'static str, value: f64, tags: &Tags) {
        let labels = label_pairs(tags);
        metrics::gauge!(name, &labels).set(value);
    }
}

/// No-op implementation, used in tests where only panic-freedom of the
/// calls matters.
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn increment(&self, _name: &'static str, _tags: &Tags) {}
    fn observe(&self, _name: &'static str, _value: f64, _tags: &Tags) {}
    fn gauge(&self, _name: &'static str, _value: f64, _tags: &Tags) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_collector_never_panics() {
        let c = NoopMetricsCollector;
        c.increment("x", &tags! {"status" => "ok"});
        c.observe("y", 1.0, &tags! {});
        c.gauge("z", 2.0, &tags! {"a" => "b"});
    }

    #[test]
    fn recorder_collector_does_not_panic_without_installed_recorder() {
        let c = RecorderMetricsCollector;
        c.increment("ingestion_files_total", &tags! {"status" => "skipped"});
    }
}
