//! The `MessageBus` trait: publish and subscribe to events routed by
//! stable routing keys, without the rest of the pipeline knowing whether
//! the underlying driver is a topic-exchange broker or a cloud
//! topic/subscription service.

use crate::error::BusError;
use async_trait::async_trait;
use pipeline_core::event::EventEnvelope;
use pipeline_core::CoreError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send>>;

/// Subscriber callback: receives the deserialized envelope and returns
/// `Err` so the driver can nack-with-requeue.
pub type Handler = Arc<dyn Fn(EventEnvelope) -> HandlerFuture + Send + Sync>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `event` under `routing_key` on `exchange`. Returns only
    /// after broker confirmation; never silently drops a failure.
    async fn publish(&self, exchange: &str, routing_key: &str, event: EventEnvelope) -> Result<(), BusError>;

    /// Pre-declares a durable queue/subscription bound to `routing_key`.
    /// Idempotent.
    async fn declare_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<(), BusError>;

    /// Registers `handler` for `event_type` on the queue named by
    /// `queue`, with an explicit routing key or one derived from
    /// `event_type` (see
    /// `pipeline_core::event::routing_key::derive_from_event_type`).
    async fn subscribe(&self, queue: &str, event_type: &str, routing_key: Option<&str>, handler: Handler) -> Result<(), BusError>;

    /// Blocks, dispatching one message at a time per subscription until
    /// `stop_consuming` is requested. Acknowledgment is manual: issued
    /// after the handler completes successfully.
    async fn start_consuming(&self) -> Result<(), BusError>;

    /// Cooperative shutdown: the in-flight message finishes (or is
    /// nacked on exception) before `start_consuming` returns.
    async fn stop_consuming(&self);
}
