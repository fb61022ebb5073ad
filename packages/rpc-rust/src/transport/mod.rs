//! Broker abstraction: connections, channels, queues, publish and consume.
//!
//! Two implementations ship with the crate:
//! - [`amqp`]: AMQP 0-9-1 via `lapin`, publishing through the default exchange
//! - [`memory`]: an in-process broker with the same queue semantics, used by
//!   tests and the `--in-memory` demo mode
//!
//! Only the default-exchange subset is modelled: publishing to a queue name
//! routes directly to that queue, and a message for a queue that does not
//! exist is dropped.

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use mqrpc_core::WireMessage;

use crate::error::TransportError;

pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;

/// Stream of deliveries from one consumer, acknowledged on receipt.
pub type DeliveryStream = BoxStream<'static, Result<WireMessage, TransportError>>;

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Only the declaring connection may use the queue; deleted when it closes.
    pub exclusive: bool,
    /// Survives a broker restart.
    pub durable: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for a private, connection-scoped reply queue.
    #[must_use]
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::default()
        }
    }

    /// Options for a well-known queue shared by competing consumers.
    #[must_use]
    pub fn shared() -> Self {
        Self::default()
    }
}

/// Entry point to a broker: produces live connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

/// A live broker connection multiplexing channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Closes the connection and every channel opened on it.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel: the unit that declares queues, publishes and consumes.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue and returns its name. An empty `name` asks the broker
    /// to generate one. Re-declaring an existing queue is a no-op.
    async fn declare_queue(&self, name: &str, options: QueueOptions)
        -> Result<String, TransportError>;

    /// Publishes a message directly to `queue`.
    async fn publish(&self, queue: &str, message: WireMessage) -> Result<(), TransportError>;

    /// Starts consuming `queue` with automatic acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, TransportError>;

    /// Closes the channel; its consumers' streams end.
    async fn close(&self) -> Result<(), TransportError>;
}
