//! Schema validator.
//!
//! Every outbound event is validated against a versioned JSON-Schema,
//! registered under `{version}.{event_type}`. Validation is strict at
//! publish time (rejects on failure); a non-strict mode logs and proceeds
//! (development only). The registry maps `event_type` to a schema, loaded
//! once at startup and cached.

use crate::errors::CoreError;
use crate::event::EventEnvelope;
use jsonschema::Validator;
use std::collections::HashMap;

/// Schema registry, read-only after startup (the only piece of
/// process-wide state in the pipeline besides the `MetricsCollector`).
pub struct SchemaRegistry {
    schemas: HashMap<String, Validator>,
    strict: bool,
}

impl SchemaRegistry {
    /// Builds the registry from `(version.event_type, schema)` pairs.
    /// Fails if any schema doesn't compile — treated as a startup error,
    /// not a runtime one.
    pub fn build(entries: Vec<(String, serde_json::Value)>, strict: bool) -> Result<Self, CoreError> {
        let mut schemas = HashMap::with_capacity(entries.len());
        for (key, schema) in entries {
            let compiled = jsonschema::validator_for(&schema)
                .map_err(|e| CoreError::Internal(format!("invalid schema for {key}: {e}")))?;
            schemas.insert(key, compiled);
        }
        Ok(Self { schemas, strict })
    }

    pub fn empty(strict: bool) -> Self {
        Self { schemas: HashMap::new(), strict }
    }

    /// The registry a production deployment loads at startup: one
    /// schema per routing key in §4.1, keyed by `{version}.{event_type}`
    /// using this pipeline's PascalCase `event_type` strings. Building
    /// this is what makes the validating publisher an actual gate
    /// instead of a pass-through.
    pub fn canonical(strict: bool) -> Result<Self, CoreError> {
        Self::build(canonical_schemas(), strict)
    }

    fn registry_key(version: &str, event_type: &str) -> String {
        format!("{version}.{event_type}")
    }

    /// Validates an envelope's payload (`data`) against the schema
    /// registered for `{version}.{event_type}`. If no schema is
    /// registered for that pair, validation is considered satisfied
    /// (allows incremental schema onboarding without breaking existing
    /// stages).
    pub fn validate(&self, envelope: &EventEnvelope) -> Result<(), CoreError> {
        let key = Self::registry_key(&envelope.version, &envelope.event_type);
        let Some(validator) = self.schemas.get(&key) else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(&envelope.data)
            .map(|e| format!("{} ({})", e.instance_path, e))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else if self.strict {
            Err(CoreError::ValidationError(errors.join("; ")))
        } else {
            log::warn!("non-strict schema validation failed for {key}: {}", errors.join("; "));
            Ok(())
        }
    }
}

/// One JSON-Schema per canonical routing key (§4.1), covering every
/// event this pipeline actually publishes (`EventEnvelope::new` call
/// sites across `pipeline-stages`). Each requires exactly the fields
/// that stage's "Work"/failure description in §4.6 names; payload
/// fields the spec marks optional (`message_count?`, `citations` on an
/// empty-result summary, …) are left out of `required`.
fn canonical_schemas() -> Vec<(String, serde_json::Value)> {
    fn schema(required: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": required,
        })
    }

    let version = crate::constants::EVENT_ENVELOPE_VERSION;
    let entries: Vec<(&str, serde_json::Value)> = vec![
        ("ArchiveIngested", schema(&["archive_id", "source", "storage_id", "file_hash", "ingestion_date"])),
        ("ArchiveIngestionFailed", schema(&["archive_id", "source", "error"])),
        ("JSONParsed", schema(&["archive_id", "message_id", "thread_id", "parsed_at"])),
        ("ParsingFailed", schema(&["archive_id", "error"])),
        ("ChunksPrepared", schema(&["archive_id", "message_id", "thread_id", "chunk_ids", "chunk_count", "timestamp"])),
        ("ChunkingFailed", schema(&["message_id", "error"])),
        ("EmbeddingsGenerated", schema(&["thread_id", "chunk_ids", "embedding_model", "vector_store_updated", "timestamp"])),
        ("EmbeddingGenerationFailed", schema(&["chunk_ids", "error"])),
        ("SummarizationRequested", schema(&["thread_id", "request_id", "context_chunk_ids", "summary_type"])),
        ("OrchestrationFailed", schema(&["thread_id", "error"])),
        ("SummaryComplete", schema(&["thread_id", "summary_id"])),
        ("SummarizationFailed", schema(&["thread_id", "summary_id", "error"])),
        ("ReportPublished", schema(&["thread_id", "summary_id"])),
        ("ReportDeliveryFailed", schema(&["thread_id", "summary_id", "error"])),
    ];
    entries.into_iter().map(|(event_type, schema)| (format!("{version}.{event_type}"), schema)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn embeddings_generated_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "required": ["chunk_ids", "embedding_model", "vector_store_updated", "timestamp"],
            "properties": {
                "chunk_ids": {"type": "array", "items": {"type": "string"}},
                "embedding_model": {"type": "string"},
                "vector_store_updated": {"type": "boolean"},
                "timestamp": {"type": "string"}
            }
        })
    }

    #[test]
    fn valid_payload_passes() {
        let registry = SchemaRegistry::build(
            vec![("1.0.embeddings.generated".to_string(), embeddings_generated_schema())],
            true,
        )
        .unwrap();
        let env = EventEnvelope::new(
            "embeddings.generated",
            json!({"chunk_ids": ["a"], "embedding_model": "m", "vector_store_updated": true, "timestamp": "2026-01-01T00:00:00Z"}),
        );
        assert!(registry.validate(&env).is_ok());
    }

    #[test]
    fn missing_required_field_is_rejected_with_pointer_in_strict_mode() {
        let registry = SchemaRegistry::build(
            vec![("1.0.embeddings.generated".to_string(), embeddings_generated_schema())],
            true,
        )
        .unwrap();
        let env = EventEnvelope::new("embeddings.generated", json!({"embedding_model": "m"}));
        let err = registry.validate(&env).unwrap_err();
        match err {
            CoreError::ValidationError(msg) => assert!(msg.contains("chunk_ids") || !msg.is_empty()),
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn non_strict_mode_logs_and_proceeds() {
        let registry = SchemaRegistry::build(
            vec![("1.0.embeddings.generated".to_string(), embeddings_generated_schema())],
            false,
        )
        .unwrap();
        let env = EventEnvelope::new("embeddings.generated", json!({}));
        assert!(registry.validate(&env).is_ok());
    }

    #[test]
    fn unregistered_event_type_passes_through() {
        let registry = SchemaRegistry::empty(true);
        let env = EventEnvelope::new("some.unregistered.event", json!({"anything": true}));
        assert!(registry.validate(&env).is_ok());
    }

    #[test]
    fn canonical_registry_accepts_every_stage_emitted_event_type() {
        let registry = SchemaRegistry::canonical(true).unwrap();
        let env = EventEnvelope::new(
            "EmbeddingsGenerated",
            json!({"chunk_ids": ["c1"], "embedding_model": "hashing-embedder", "vector_store_updated": true, "timestamp": "2026-01-01T00:00:00Z"}),
        );
        assert!(registry.validate(&env).is_ok());
    }

    #[test]
    fn canonical_registry_rejects_chunks_prepared_missing_chunk_count() {
        let registry = SchemaRegistry::canonical(true).unwrap();
        let env = EventEnvelope::new(
            "ChunksPrepared",
            json!({"archive_id": "a1", "message_id": "m1", "thread_id": "t1", "chunk_ids": ["c1"]}),
        );
        assert!(matches!(registry.validate(&env), Err(CoreError::ValidationError(_))));
    }
}
