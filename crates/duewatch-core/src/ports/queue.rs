//! Queue port - durable point-to-point message queue.
//!
//! The shape follows an AMQP client: a connector opens connections, a
//! connection opens channels, and a channel declares queues, publishes,
//! consumes, and acknowledges.
//!
//! # 設計原則
//! - At-least-once: a delivery leaves the queue only on `ack`.
//! - Manual acknowledgment only; there is no auto-ack mode.
//! - A channel never holds more unacknowledged deliveries than its prefetch.
//! - Closing or dropping a channel requeues whatever it still holds, at the
//!   front of the queue.
//! - A nack with requeue puts the message at the back, so one bad message
//!   cannot starve the rest.

use async_trait::async_trait;

use crate::domain::{CONTENT_TYPE_JSON, ChannelId, DeliveryTag, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue transport unavailable: {0}")]
    Unavailable(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("queue not declared: {0}")]
    QueueNotFound(String),

    #[error("channel is not consuming from any queue")]
    NotConsuming,

    #[error("prefetch limit of {limit} unacknowledged deliveries reached")]
    PrefetchExceeded { limit: u16 },

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Unavailable(_)
            | QueueError::ConnectionClosed
            | QueueError::ChannelClosed
            | QueueError::Backend(_) => ErrorKind::Transient,
            QueueError::QueueNotFound(_)
            | QueueError::NotConsuming
            | QueueError::PrefetchExceeded { .. }
            | QueueError::UnknownDeliveryTag(_) => ErrorKind::Permanent,
        }
    }
}

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// Survives a broker restart.
    pub persistent: bool,
}

impl OutboundMessage {
    /// Durable JSON message (what every reminder is published as).
    pub fn persistent_json(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            persistent: true,
        }
    }
}

/// A message handed to a consumer, pending ack/nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// Set when the message was handed out before and came back.
    pub redelivered: bool,
}

#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn QueueConnection>, QueueError>;

    /// Human readable target for logs (never includes credentials).
    fn describe(&self) -> String;
}

#[async_trait]
pub trait QueueConnection: Send {
    async fn open_channel(&mut self) -> Result<Box<dyn QueueChannel>, QueueError>;

    async fn close(self: Box<Self>) -> Result<(), QueueError>;
}

#[async_trait]
pub trait QueueChannel: Send {
    fn id(&self) -> ChannelId;

    /// Idempotent.
    async fn declare_durable_queue(&mut self, name: &str) -> Result<(), QueueError>;

    /// Cap on unacknowledged deliveries held by this channel.
    async fn set_prefetch(&mut self, count: u16) -> Result<(), QueueError>;

    async fn publish(&mut self, queue: &str, message: OutboundMessage) -> Result<(), QueueError>;

    /// Start consuming `queue` on this channel.
    async fn consume(&mut self, queue: &str) -> Result<(), QueueError>;

    /// Wait for the next delivery.
    ///
    /// Cancel safe: dropping the future before it resolves loses nothing;
    /// anything already claimed for this channel is requeued when the
    /// channel closes.
    async fn next_delivery(&mut self) -> Result<Delivery, QueueError>;

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError>;

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError>;

    async fn close(self: Box<Self>) -> Result<(), QueueError>;
}
