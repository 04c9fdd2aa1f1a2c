//! pipeline-bus
//!
//! The `MessageBus` trait and three functionally equivalent
//! implementations: `InMemoryBus` (used by every test), `BrokerBus`
//! (AMQP topic-exchange via `lapin`), and `CloudBus` (NATS JetStream via
//! `async-nats`). `ValidatingBus` decorates any of the three with the
//! schema registry.

pub mod broker;
pub mod bus_trait;
pub mod cloud;
pub mod error;
pub mod memory;
pub mod validating;

pub use broker::BrokerBus;
pub use bus_trait::{Handler, HandlerFuture, MessageBus};
pub use cloud::CloudBus;
pub use error::BusError;
pub use memory::InMemoryBus;
pub use validating::ValidatingBus;
