//! Topic-exchange driver (RabbitMQ/AMQP via `lapin`): a single exchange
//! `copilot.events`, durable non-exclusive non-auto-delete queues,
//! persistent messages (`delivery_mode=2`), publisher confirms and the
//! `mandatory` flag enabled, 300s heartbeat with a 600s blocked-connection
//! timeout (both overridable from the environment).

use crate::bus_trait::{Handler, MessageBus};
use crate::error::BusError;
use futures_util::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use pipeline_core::event::EventEnvelope;
use std::sync::Mutex;

pub const DEFAULT_HEARTBEAT_SECONDS: u16 = 300;
pub const DEFAULT_BLOCKED_CONNECTION_TIMEOUT_SECONDS: u64 = 600;

pub struct BrokerBus {
    channel: Channel,
    exchange: String,
    subscriptions: Mutex<Vec<Subscription>>,
    cancellation: pipeline_core::CancellationToken,
}

struct Subscription {
    queue: String,
    handler: Handler,
}

impl BrokerBus {
    /// Connects using an AMQP URI; `heartbeat` defaults to 300s, with
    /// the blocked-connection timeout set to ≥ 2x the heartbeat.
    pub async fn connect(amqp_uri: &str, exchange: &str, heartbeat: u16) -> Result<Self, BusError> {
        let uri = if amqp_uri.contains("heartbeat=") { amqp_uri.to_string() } else { append_query(amqp_uri, &format!("heartbeat={heartbeat}")) };
        let connection = Connection::connect(
            &uri,
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current()).with_reactor(tokio_reactor_trait::Tokio),
        )
        .await
        .map_err(|e| BusError::TransientConnection(format!("amqp connect: {e}")))?;
        let channel = connection.create_channel().await.map_err(|e| BusError::TransientConnection(format!("amqp channel: {e}")))?;
        channel
            .exchange_declare(exchange, ExchangeKind::Topic, ExchangeDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await
            .map_err(|e| BusError::SubscribeFailed(format!("exchange_declare: {e}")))?;
        Ok(Self { channel, exchange: exchange.to_string(), subscriptions: Mutex::new(Vec::new()), cancellation: pipeline_core::CancellationToken::new() })
    }
}

fn append_query(uri: &str, param: &str) -> String {
    if uri.contains('?') {
        format!("{uri}&{param}")
    } else {
        format!("{uri}?{param}")
    }
}

#[async_trait::async_trait]
impl MessageBus for BrokerBus {
    async fn publish(&self, exchange: &str, routing_key: &str, event: EventEnvelope) -> Result<(), BusError> {
        let payload = serde_json::to_vec(&event).map_err(|e| BusError::PublishRejected(format!("serialize: {e}")))?;
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions { mandatory: true, ..Default::default() },
                &payload,
                BasicProperties::default().with_delivery_mode(2).with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| BusError::PublishRejected(e.to_string()))?;
        confirm.await.map_err(|e| BusError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<(), BusError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions { durable: true, exclusive: false, auto_delete: false, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::SubscribeFailed(format!("queue_declare: {e}")))?;
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BusError::SubscribeFailed(format!("queue_bind: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, event_type: &str, routing_key: Option<&str>, handler: Handler) -> Result<(), BusError> {
        let routing_key = routing_key.map(str::to_string).unwrap_or_else(|| pipeline_core::event::routing_key::derive_from_event_type(event_type));
        self.declare_queue(queue, &routing_key, &self.exchange).await?;
        self.subscriptions.lock().expect("broker mutex poisoned").push(Subscription { queue: queue.to_string(), handler });
        Ok(())
    }

    async fn start_consuming(&self) -> Result<(), BusError> {
        let subscriptions: Vec<(String, Handler)> = {
            let guard = self.subscriptions.lock().expect("broker mutex poisoned");
            guard.iter().map(|s| (s.queue.clone(), s.handler.clone())).collect()
        };

        let mut join_set = tokio::task::JoinSet::new();
        for (queue, handler) in subscriptions {
            let channel = self.channel.clone();
            let cancellation = self.cancellation.clone();
            let failure_queue = format!("{queue}.failed");
            let exchange = self.exchange.clone();
            join_set.spawn(async move {
                let consumer_tag = format!("pipeline-{queue}");
                let mut consumer = channel
                    .basic_consume(&queue, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
                    .await
                    .map_err(|e| BusError::SubscribeFailed(format!("basic_consume({queue}): {e}")))?;
                loop {
                    let delivery = tokio::select! {
                        biased;
                        _ = wait_cancelled(&cancellation) => break,
                        next = consumer.next() => match next {
                            Some(d) => d,
                            None => break,
                        },
                    };
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(e) => {
                            log::error!("queue={queue} consume error: {e}");
                            continue;
                        }
                    };
                    let redelivered = delivery.redelivered;
                    let envelope: Result<EventEnvelope, _> = serde_json::from_slice(&delivery.data);
                    match envelope {
                        Ok(event) => match handler(event.clone()).await {
                            Ok(()) => {
                                let _ = delivery.ack(BasicAckOptions::default()).await;
                            }
                            Err(err) if redelivered => {
                                log::error!("queue={queue} poison message event_id={} routing to {failure_queue}: {err}", event.event_id);
                                let mut data = event.data.clone();
                                if let serde_json::Value::Object(map) = &mut data {
                                    map.insert("error".to_string(), serde_json::Value::String(err.to_string()));
                                    map.insert("attempt_count".to_string(), serde_json::Value::from(2));
                                }
                                let failed_event = EventEnvelope::new(event.event_type.clone(), data);
                                if let Ok(payload) = serde_json::to_vec(&failed_event) {
                                    let _ = channel
                                        .basic_publish(&exchange, &failure_queue, BasicPublishOptions::default(), &payload, BasicProperties::default().with_delivery_mode(2))
                                        .await;
                                }
                                let _ = delivery.ack(BasicAckOptions::default()).await;
                            }
                            Err(err) => {
                                log::warn!("queue={queue} nack-requeue event_id={} (first failure): {err}", event.event_id);
                                let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
                            }
                        },
                        Err(e) => {
                            log::error!("queue={queue} malformed envelope: {e}");
                            let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
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
