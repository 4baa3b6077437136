//! ReminderSink port - what the consumer does with a decoded reminder.

use async_trait::async_trait;

use crate::domain::ReminderMessage;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("reminder rejected: {0}")]
    Rejected(String),
}

/// Receives each reminder the consumer decodes.
///
/// An `Err` makes the consumer nack the delivery with requeue.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn deliver(&self, reminder: &ReminderMessage) -> Result<(), SinkError>;
}
