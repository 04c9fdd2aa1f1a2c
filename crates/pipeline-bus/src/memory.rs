//! In-memory bus, used by every test in the pipeline. Reproduces a
//! topic-exchange's fan-out semantics (one copy of the event per queue
//! bound to the routing key) and the failure policy: nack with requeue
//! once, and on recurrence the message routes to `<queue>.failed` with
//! `error` and `attempt_count` added to the original payload.

use crate::bus_trait::{Handler, MessageBus};
use crate::error::BusError;
use pipeline_core::event::EventEnvelope;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Clone)]
struct Binding {
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
pub struct InMemoryBus {
    bindings: Mutex<HashMap<String, Binding>>,
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<EventEnvelope>>>,
    receivers: Mutex<HashMap<String, mpsc::UnboundedReceiver<EventEnvelope>>>,
    handlers: Mutex<HashMap<String, Handler>>,
    cancellation: pipeline_core::CancellationToken,
    once_failed: Arc<Mutex<HashSet<Uuid>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stage's failure queue is named from the stage, not the input
    /// queue string: `queues::input_queue(stage)` is `"{stage}.in"` but
    /// `queues::failure_queue(stage)` is `"{stage}.failed"`, so the
    /// `.in` suffix (if present) is stripped before appending `.failed`.
    fn failure_queue_name(queue: &str) -> String {
        let stage = queue.strip_suffix(".in").unwrap_or(queue);
        format!("{stage}.failed")
    }

    fn ensure_queue(&self, queue: &str, routing_key: &str, exchange: &str) {
        let mut senders = self.senders.lock().expect("bus mutex poisoned");
        if senders.contains_key(queue) {
            return;
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        senders.insert(queue.to_string(), sender);
        self.receivers.lock().expect("bus mutex poisoned").insert(queue.to_string(), receiver);
        self.bindings.lock().expect("bus mutex poisoned").insert(queue.to_string(), Binding { exchange: exchange.to_string(), routing_key: routing_key.to_string() });
    }
}

#[async_trait::async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, exchange: &str, routing_key: &str, event: EventEnvelope) -> Result<(), BusError> {
        let matching_queues: Vec<String> = self
            .bindings
            .lock()
            .expect("bus mutex poisoned")
            .iter()
            .filter(|(_, b)| b.exchange == exchange && b.routing_key == routing_key)
            .map(|(q, _)| q.clone())
            .collect();
        if matching_queues.is_empty() {
            return Err(BusError::Unroutable(routing_key.to_string()));
        }
        let senders = self.senders.lock().expect("bus mutex poisoned");
        for queue in matching_queues {
            if let Some(sender) = senders.get(&queue) {
                sender.send(event.clone()).map_err(|e| BusError::PersistenceFailure(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<(), BusError> {
        self.ensure_queue(queue, routing_key, exchange);
        Ok(())
    }

    async fn subscribe(&self, queue: &str, event_type: &str, routing_key: Option<&str>, handler: Handler) -> Result<(), BusError> {
        let routing_key = routing_key.map(str::to_string).unwrap_or_else(|| pipeline_core::event::routing_key::derive_from_event_type(event_type));
        self.ensure_queue(queue, &routing_key, pipeline_core::constants::EVENTS_TOPIC);
        self.handlers.lock().expect("bus mutex poisoned").insert(queue.to_string(), handler);
        Ok(())
    }

    async fn start_consuming(&self) -> Result<(), BusError> {
        struct Task {
            queue: String,
            receiver: mpsc::UnboundedReceiver<EventEnvelope>,
            handler: Handler,
            own_sender: mpsc::UnboundedSender<EventEnvelope>,
            failure_sender: Option<mpsc::UnboundedSender<EventEnvelope>>,
        }

        let tasks: Vec<Task> = {
            let handlers = self.handlers.lock().expect("bus mutex poisoned");
            let senders = self.senders.lock().expect("bus mutex poisoned");
            let mut receivers = self.receivers.lock().expect("bus mutex poisoned");
            let mut out = Vec::new();
            let queues: Vec<String> = handlers.keys().cloned().collect();
            for queue in queues {
                let Some(receiver) = receivers.remove(&queue) else { continue };
                let Some(handler) = handlers.get(&queue).cloned() else { continue };
                let own_sender = senders.get(&queue).expect("sender exists for declared queue").clone();
                let failure_sender = senders.get(&Self::failure_queue_name(&queue)).cloned();
                out.push(Task { queue, receiver, handler, own_sender, failure_sender });
            }
            out
        };

        let mut join_set = tokio::task::JoinSet::new();
        for task in tasks {
            let Task { queue, mut receiver, handler, own_sender, failure_sender } = task;
            let cancellation = self.cancellation.clone();
            let once_failed = self.once_failed.clone();
            join_set.spawn(async move {
                loop {
                    let event = tokio::select! {
                        biased;
                        _ = wait_cancelled(&cancellation) => break,
                        maybe = receiver.recv() => match maybe {
                            Some(e) => e,
                            None => break,
                        },
                    };
                    if let Err(err) = handler(event.clone()).await {
                        let already_failed_once = {
                            let mut seen = once_failed.lock().expect("once_failed mutex poisoned");
                            !seen.insert(event.event_id)
                        };
                        if already_failed_once {
                            log::error!("queue={queue} poison message event_id={} routing to failure queue: {err}", event.event_id);
                            if let Some(failure_sender) = &failure_sender {
                                let mut data = event.data.clone();
                                if let serde_json::Value::Object(map) = &mut data {
                                    map.insert("error".to_string(), serde_json::Value::String(err.to_string()));
                                    map.insert("attempt_count".to_string(), serde_json::Value::from(2));
                                }
                                let _ = failure_sender.send(EventEnvelope::new(event.event_type.clone(), data));
                            }
                        } else {
                            log::warn!("queue={queue} nack-requeue event_id={} (first failure): {err}", event.event_id);
                            let _ = own_sender.send(event);
                        }
                    }
                }
            });
        }
        while join_set.join_next().await.is_some() {}
        Ok(())
    }

    async fn stop_consuming(&self) {
        self.cancellation.cancel();
    }
}

async fn wait_cancelled(token: &pipeline_core::CancellationToken) {
    while !token.is_cancelled() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::event::routing_key;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn run_briefly(bus: &Arc<InMemoryBus>) {
        let consuming = bus.clone();
        let handle = tokio::spawn(async move { consuming.start_consuming().await });
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        bus.stop_consuming().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_bound_queues() {
        let bus = Arc::new(InMemoryBus::new());
        bus.declare_queue("chunk.json_parsed", routing_key::JSON_PARSED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        bus.declare_queue("audit.json_parsed", routing_key::JSON_PARSED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();

        let count = Arc::new(AtomicU32::new(0));
        for queue in ["chunk.json_parsed", "audit.json_parsed"] {
            let c = count.clone();
            bus.subscribe(queue, "JSONParsed", None, Arc::new(move |_e| {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await
            .unwrap();
        }

        bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::JSON_PARSED, EventEnvelope::new("JSONParsed", json!({}))).await.unwrap();
        run_briefly(&bus).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_to_unbound_routing_key_is_unroutable() {
        let bus = InMemoryBus::new();
        let err = bus.publish(pipeline_core::constants::EVENTS_TOPIC, "nothing.bound", EventEnvelope::new("X", json!({}))).await.unwrap_err();
        assert!(matches!(err, BusError::Unroutable(_)));
    }

    #[tokio::test]
    async fn failing_handler_requeues_once_then_routes_to_failure_queue() {
        let bus = Arc::new(InMemoryBus::new());
        bus.declare_queue("chunk.q", routing_key::JSON_PARSED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        bus.declare_queue("chunk.q.failed", "chunk.q.failed", pipeline_core::constants::EVENTS_TOPIC).await.unwrap();

        let failures_seen = Arc::new(Mutex::new(Vec::<EventEnvelope>::new()));
        let seen = failures_seen.clone();
        bus.subscribe("chunk.q.failed", "chunk.q.failed", Some("chunk.q.failed"), Arc::new(move |e| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(e);
                Ok(())
            })
        }))
        .await
        .unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        bus.subscribe("chunk.q", "JSONParsed", None, Arc::new(move |_e| {
            let a = a.clone();
            Box::pin(async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(pipeline_core::CoreError::PermanentError("boom".into()))
            })
        }))
        .await
        .unwrap();

        bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::JSON_PARSED, EventEnvelope::new("JSONParsed", json!({}))).await.unwrap();
        run_briefly(&bus).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2, "handler runs on original delivery and the one requeue");
        let failed = failures_seen.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].data["error"], "permanent error: boom");
        assert_eq!(failed[0].data["attempt_count"], 2);
    }

    /// Same scenario using the real `<stage>.in` / `<stage>.failed`
    /// naming convention the stage workers declare (`queues::input_queue`/
    /// `queues::failure_queue`), not the `chunk.q`/`chunk.q.failed` pair
    /// above that coincidentally matches any naive suffix rule.
    #[tokio::test]
    async fn poison_message_on_an_in_suffixed_queue_reaches_its_stage_failure_queue() {
        let bus = Arc::new(InMemoryBus::new());
        bus.declare_queue("chunk.in", routing_key::JSON_PARSED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        bus.declare_queue("chunk.failed", routing_key::CHUNKING_FAILED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();

        let failures_seen = Arc::new(Mutex::new(Vec::<EventEnvelope>::new()));
        let seen = failures_seen.clone();
        bus.subscribe("chunk.failed", "ChunkingFailed", Some(routing_key::CHUNKING_FAILED), Arc::new(move |e| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(e);
                Ok(())
            })
        }))
        .await
        .unwrap();

        bus.subscribe("chunk.in", "JSONParsed", None, Arc::new(|_e| Box::pin(async { Err(pipeline_core::CoreError::PermanentError("boom".into())) })))
            .await
            .unwrap();

        bus.publish(pipeline_core::constants::EVENTS_TOPIC, routing_key::JSON_PARSED, EventEnvelope::new("JSONParsed", json!({}))).await.unwrap();
        run_briefly(&bus).await;

        let failed = failures_seen.lock().unwrap();
        assert_eq!(failed.len(), 1, "poison message must land on chunk.failed, not be silently dropped");
        assert_eq!(failed[0].data["attempt_count"], 2);
    }

    #[tokio::test]
    async fn subscribe_derives_routing_key_from_event_type_when_absent() {
        let bus = InMemoryBus::new();
        bus.declare_queue("chunk.q", routing_key::JSON_PARSED, pipeline_core::constants::EVENTS_TOPIC).await.unwrap();
        bus.subscribe("chunk.q", "JSONParsed", None, Arc::new(|_e| Box::pin(async { Ok(()) }))).await.unwrap();
        assert!(bus.publish(pipeline_core::constants::EVENTS_TOPIC, "json.parsed", EventEnvelope::new("JSONParsed", json!({}))).await.is_ok());
    }
}
