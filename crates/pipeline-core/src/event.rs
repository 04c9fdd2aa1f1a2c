//! Envelope for events published on the bus.
//!
//! Every published event is a mapping with `event_type`, `event_id`
//! (UUID v4), `timestamp` (RFC 3339), `version` (currently `"1.0"`) and
//! `data` (payload). Serialization is UTF-8 JSON with content-type
//! `application/json`.

use crate::constants::EVENT_ENVELOPE_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Canonical set of routing keys. Each stage publishes/consumes a
/// subset of these; the bus uses them to route to queues/subscriptions.
pub mod routing_key {
    pub const ARCHIVE_INGESTED: &str = "archive.ingested";
    pub const ARCHIVE_INGESTION_FAILED: &str = "archive.ingestion.failed";
    pub const JSON_PARSED: &str = "json.parsed";
    pub const PARSING_FAILED: &str = "parsing.failed";
    pub const CHUNKS_PREPARED: &str = "chunks.prepared";
    pub const CHUNKING_FAILED: &str = "chunking.failed";
    pub const EMBEDDINGS_GENERATED: &str = "embeddings.generated";
    pub const EMBEDDING_GENERATION_FAILED: &str = "embedding.generation.failed";
    pub const SUMMARIZATION_REQUESTED: &str = "summarization.requested";
    pub const ORCHESTRATION_FAILED: &str = "orchestration.failed";
    pub const SUMMARY_COMPLETE: &str = "summary.complete";
    pub const SUMMARIZATION_FAILED: &str = "summarization.failed";
    pub const REPORT_PUBLISHED: &str = "report.published";
    pub const REPORT_DELIVERY_FAILED: &str = "report.delivery.failed";

    pub const ALL: &[&str] = &[
        ARCHIVE_INGESTED,
        ARCHIVE_INGESTION_FAILED,
        JSON_PARSED,
        PARSING_FAILED,
        CHUNKS_PREPARED,
        CHUNKING_FAILED,
        EMBEDDINGS_GENERATED,
        EMBEDDING_GENERATION_FAILED,
        SUMMARIZATION_REQUESTED,
        ORCHESTRATION_FAILED,
        SUMMARY_COMPLETE,
        SUMMARIZATION_FAILED,
        REPORT_PUBLISHED,
        REPORT_DELIVERY_FAILED,
    ];

    /// Derives a default routing key from an `event_type` in
    /// PascalCase/camelCase: lowercase with dot separators. Used by
    /// `subscribe` when no explicit routing key is passed. Runs of
    /// consecutive uppercase letters are treated as a single acronym
    /// (`JSONParsed` -> `json.parsed`, not `j.s.o.n.parsed`).
    pub fn derive_from_event_type(event_type: &str) -> String {
        let chars: Vec<char> = event_type.chars().collect();
        let mut out = String::with_capacity(chars.len() + 4);
        for (i, &c) in chars.iter().enumerate() {
            if c.is_uppercase() {
                let prev_lower = i > 0 && chars[i - 1].is_lowercase();
                let prev_upper_next_lower =
                    i > 0 && chars[i - 1].is_uppercase() && chars.get(i + 1).is_some_and(|n| n.is_lowercase());
                if i != 0 && (prev_lower || prev_upper_next_lower) {
                    out.push('.');
                }
                out.extend(c.to_lowercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// Generic event envelope. `data` is kept as `Value` so each stage can
/// define its own payload shape without the bus needing to know it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub data: Value,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: EVENT_ENVELOPE_VERSION.to_string(),
            data,
        }
    }

    /// Builds the envelope with an explicit `event_id`/`timestamp`; used
    /// by tests and by the startup requeue, which re-emits while
    /// preserving the original event's causal identity where applicable.
    pub fn with_identity(event_type: impl Into<String>, data: Value, event_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self { event_type: event_type.into(), event_id, timestamp, version: EVENT_ENVELOPE_VERSION.to_string(), data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_routing_key_from_pascal_case() {
        assert_eq!(routing_key::derive_from_event_type("JSONParsed"), "json.parsed");
        assert_eq!(routing_key::derive_from_event_type("ArchiveIngested"), "archive.ingested");
    }

    #[test]
    fn envelope_has_required_fields() {
        let env = EventEnvelope::new("ArchiveIngested", serde_json::json!({"archive_id": "abc"}));
        assert_eq!(env.version, "1.0");
        assert_eq!(env.event_type, "ArchiveIngested");
        assert!(!env.event_id.is_nil());
    }
}
