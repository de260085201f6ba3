/// Message broker plumbing.
///
/// ├── connection — AMQP connection lifecycle, topology, consume and publish
/// └── (this file) — topology naming, acknowledgement decisions, errors
///
/// Topology for the ingestion side:
///
/// ```text
///  <exchange> (topic) ──<routing_key>──▶ <queue>  (ttl, dead-letter args)
///                                           │ expired / rejected
///                                           ▼
///  <exchange>.dlx (topic) ──<routing_key>.dead──▶ <queue>.dead
/// ```

pub mod connection;

pub use connection::BrokerConnection;

use thiserror::Error;

use crate::config::BrokerSettings;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] amiquip::Error),

    #[error("not connected to broker")]
    NotConnected,

    #[error("topology has no queue to consume from")]
    NoQueue,

    #[error("channel closed by broker: {0}")]
    ChannelClosed(String),

    #[error("consumer cancelled by broker")]
    ConsumerCancelled,
}

/// What to tell the broker about a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Negative-acknowledge and put it back for redelivery.
    Requeue,
}

/// Why a consume session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeEnd {
    /// Shutdown was requested; the in-flight message was settled first.
    Shutdown,
    /// The consumer was cancelled without a shutdown request, e.g. the
    /// queue was deleted. Fatal.
    Cancelled,
    /// Broker closed the channel. Not retried.
    ChannelClosed(String),
    /// Connection-level failure. Reconnect and resubscribe.
    ConnectionLost(String),
}

/// Declared primary queue with its dead-letter companions.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueTopology {
    pub name: String,
    pub routing_key: String,
    pub message_ttl_ms: u32,
}

impl QueueTopology {
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dead", self.name)
    }

    pub fn dead_letter_routing_key(&self) -> String {
        format!("{}.dead", self.routing_key)
    }
}

/// Everything a connection declares after connecting.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub exchange: String,
    /// `None` for publish-only connections.
    pub queue: Option<QueueTopology>,
}

impl Topology {
    /// Exchange, primary queue and dead-letter exchange/queue.
    pub fn consumer(settings: &BrokerSettings) -> Self {
        Self {
            exchange: settings.exchange.clone(),
            queue: Some(QueueTopology {
                name: settings.queue.clone(),
                routing_key: settings.routing_key.clone(),
                message_ttl_ms: settings.message_ttl_ms,
            }),
        }
    }

    /// Exchange only.
    pub fn publisher(settings: &BrokerSettings) -> Self {
        Self {
            exchange: settings.exchange.clone(),
            queue: None,
        }
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.exchange)
    }
}

/// Publishing capability, implemented by `BrokerConnection`.
pub trait Publisher {
    /// Publishes a persistent JSON message to the topology's exchange.
    fn publish(&mut self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// One reconnect attempt, no retry loop.
    fn reconnect(&mut self) -> Result<(), BrokerError>;
}
