//! Cloud topic/subscription driver (NATS JetStream via `async-nats`): a
//! single stream backing the `copilot.events` topic, one durable
//! subscription (JetStream consumer) per consuming stage, with a
//! routing-key filter placed in the message subject
//! (`copilot.events.<routing_key>`). The named `EventTypeFilter` filter is
//! modeled as the consumer's `filter_subject`.

use crate::bus_trait::{Handler, MessageBus};
use crate::error::BusError;
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, Context};
use futures_util::StreamExt;
use pipeline_core::event::EventEnvelope;
use std::sync::Mutex;

pub struct CloudBus {
    jetstream: Context,
    topic: String,
    subscriptions: Mutex<Vec<Subscription>>,
    cancellation: pipeline_core::CancellationToken,
}

struct Subscription {
    consumer_name: String,
    routing_key: String,
    handler: Handler,
}

fn subject_for(topic: &str, routing_key: &str) -> String {
    format!("{topic}.{routing_key}")
}

impl CloudBus {
    pub async fn connect(nats_url: &str, topic: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(nats_url).await.map_err(|e| BusError::TransientConnection(format!("nats connect: {e}")))?;
        let jetstream = jetstream::new(client);
        jetstream
            .get_or_create_stream(StreamConfig { name: topic.to_string(), subjects: vec![format!("{topic}.>")], ..Default::default() })
            .await
            .map_err(|e| BusError::SubscribeFailed(format!("get_or_create_stream: {e}")))?;
        Ok(Self { jetstream, topic: topic.to_string(), subscriptions: Mutex::new(Vec::new()), cancellation: pipeline_core::CancellationToken::new() })
    }
}

#[async_trait::async_trait]
impl MessageBus for CloudBus {
    async fn publish(&self, _exchange: &str, routing_key: &str, event: EventEnvelope) -> Result<(), BusError> {
        let payload = serde_json::to_vec(&event).map_err(|e| BusError::PublishRejected(format!("serialize: {e}")))?;
        let ack = self
            .jetstream
            .publish(subject_for(&self.topic, routing_key), payload.into())
            .await
            .map_err(|e| BusError::PublishRejected(e.to_string()))?;
        ack.await.map_err(|e| BusError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, routing_key: &str, _exchange: &str) -> Result<(), BusError> {
        let stream = self.jetstream.get_stream(&self.topic).await.map_err(|e| BusError::SubscribeFailed(format!("get_stream: {e}")))?;
        stream
            .get_or_create_consumer(
                queue,
                PullConfig {
                    durable_name: Some(queue.to_string()),
                    name: Some(queue.to_string()),
                    filter_subject: subject_for(&self.topic, routing_key),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeFailed(format!("get_or_create_consumer: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, event_type: &str, routing_key: Option<&str>, handler: Handler) -> Result<(), BusError> {
        let routing_key = routing_key.map(str::to_string).unwrap_or_else(|| pipeline_core::event::routing_key::derive_from_event_type(event_type));
        self.declare_queue(queue, &routing_key, &self.topic).await?;
        self.subscriptions.lock().expect("cloud bus mutex poisoned").push(Subscription { consumer_name: queue.to_string(), routing_key, handler });
        Ok(())
    }

    async fn start_consuming(&self) -> Result<(), BusError> {
        let subscriptions: Vec<(String, String, Handler)> = {
            let guard = self.subscriptions.lock().expect("cloud bus mutex poisoned");
            guard.iter().map(|s| (s.consumer_name.clone(), s.routing_key.clone(), s.handler.clone())).collect()
        };

        let mut join_set = tokio::task::JoinSet::new();
        for (consumer_name, routing_key, handler) in subscriptions {
            let stream = self.jetstream.get_stream(&self.topic).await.map_err(|e| BusError::SubscribeFailed(format!("get_stream: {e}")))?;
            let cancellation = self.cancellation.clone();
            let failure_subject = subject_for(&self.topic, &format!("{consumer_name}.failed"));
            let jetstream = self.jetstream.clone();
            join_set.spawn(async move {
                let consumer: async_nats::jetstream::consumer::PullConsumer =
                    stream.get_consumer(&consumer_name).await.map_err(|e| BusError::SubscribeFailed(format!("get_consumer: {e}")))?;
                let mut messages = consumer.messages().await.map_err(|e| BusError::SubscribeFailed(format!("messages(): {e}")))?;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = wait_cancelled(&cancellation) => break,
                        next = messages.next() => next,
                    };
                    let Some(message) = next else { break };
                    let message = match message {
                        Ok(m) => m,
                        Err(e) => {
                            log::error!("consumer={consumer_name} pull error: {e}");
                            continue;
                        }
                    };
                    let info = message.info().ok();
                    let delivered_before = info.map(|i| i.delivered > 1).unwrap_or(false);
                    let envelope: Result<EventEnvelope, _> = serde_json::from_slice(&message.payload);
                    match envelope {
                        Ok(event) => match handler(event.clone()).await {
                            Ok(()) => {
                                let _ = message.ack().await;
                            }
                            Err(err) if delivered_before => {
                                log::error!("consumer={consumer_name} poison message event_id={} routing to {failure_subject}: {err}", event.event_id);
                                let mut data = event.data.clone();
                                if let serde_json::Value::Object(map) = &mut data {
                                    map.insert("error".to_string(), serde_json::Value::String(err.to_string()));
                                    map.insert("attempt_count".to_string(), serde_json::Value::from(2));
                                }
                                let failed_event = EventEnvelope::new(event.event_type.clone(), data);
                                if let Ok(payload) = serde_json::to_vec(&failed_event) {
                                    let _ = jetstream.publish(failure_subject.clone(), payload.into()).await;
                                }
                                let _ = message.ack().await;
                            }
                            Err(err) => {
                                log::warn!("consumer={consumer_name} nack (redelivery) event_id={} (first failure): {err}", event.event_id);
                                let _ = message.ack_with(async_nats::jetstream::AckKind::Nak(None)).await;
                            }
                        },
                        Err(e) => {
                            log::error!("consumer={consumer_name} malformed message: {e}");
                            let _ = message.ack_with(async_nats::jetstream::AckKind::Term).await;
                        }
                    }
                }
                Ok::<(), BusError>(())
            });
        }
        while let Some(result) = join_set.join_next().await {
            if let Ok(Err(e)) = result {
                log::error!("consumer task terminated with error: {e}");
            }
        }
        Ok(())
    }

    async fn stop_consuming(&self) {
        self.cancellation.cancel();
    }
}

async fn wait_cancelled(token: &pipeline_core::CancellationToken) {
    while !token.is_cancelled() {
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}
