//! Validating decorator: composes the publisher with the schema
//! registry. Every `publish` validates first; on failure the publish
//! fails with `ValidationError` enumerating the offending JSON pointers
//! and nothing reaches the underlying bus.

use crate::bus_trait::{Handler, MessageBus};
use crate::error::BusError;
use pipeline_core::event::EventEnvelope;
use pipeline_core::{CoreError, SchemaRegistry};
use std::sync::Arc;

pub struct ValidatingBus<B: MessageBus> {
    inner: B,
    registry: Arc<SchemaRegistry>,
}

impl<B: MessageBus> ValidatingBus<B> {
    pub fn new(inner: B, registry: Arc<SchemaRegistry>) -> Self {
        Self { inner, registry }
    }
}

#[async_trait::async_trait]
impl<B: MessageBus> MessageBus for ValidatingBus<B> {
    async fn publish(&self, exchange: &str, routing_key: &str, event: EventEnvelope) -> Result<(), BusError> {
        match self.registry.validate(&event) {
            Ok(()) => {}
            Err(CoreError::ValidationError(msg)) => return Err(BusError::ValidationError(msg)),
            Err(other) => return Err(BusError::ValidationError(other.to_string())),
        }
        self.inner.publish(exchange, routing_key, event).await
    }

    async fn declare_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<(), BusError> {
        self.inner.declare_queue(queue, routing_key, exchange).await
    }

    async fn subscribe(&self, queue: &str, event_type: &str, routing_key: Option<&str>, handler: Handler) -> Result<(), BusError> {
        self.inner.subscribe(queue, event_type, routing_key, handler).await
    }

    async fn start_consuming(&self) -> Result<(), BusError> {
        self.inner.start_consuming().await
    }

    async fn stop_consuming(&self) {
        self.inner.stop_consuming().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBus;
    use pipeline_core::event::routing_key;
    use serde_json::json;

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "required": ["chunk_ids"],
            "properties": {"chunk_ids": {"type": "array"}}
        })
    }

    #[tokio::test]
    async fn invalid_payload_never_reaches_inner_bus() {
        let inner = InMemoryBus::new();
        inner.declare_queue("embed.q", routing_key::EMBEDDINGS_GENERATED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        let registry = Arc::new(SchemaRegistry::build(vec![("1.0.embeddings.generated".to_string(), schema())], true).unwrap());
        let bus = ValidatingBus::new(inner, registry);

        let err = bus
            .publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::EMBEDDINGS_GENERATED, EventEnvelope::new("embeddings.generated", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::ValidationError(_)));
    }

    #[tokio::test]
    async fn valid_payload_passes_through_to_inner_bus() {
        let inner = InMemoryBus::new();
        inner.declare_queue("embed.q", routing_key::EMBEDDINGS_GENERATED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        let registry = Arc::new(SchemaRegistry::build(vec![("1.0.embeddings.generated".to_string(), schema())], true).unwrap());
        let bus = ValidatingBus::new(inner, registry);

        let result = bus
            .publish(
                pipeline_core::constants::EVENTS_TOPIC,
                routing_key::EMBEDDINGS_GENERATED,
                EventEnvelope::new("embeddings.generated", json!({"chunk_ids": ["a"]})),
            )
            .await;
        assert!(result.is_ok());
    }
}
