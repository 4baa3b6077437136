//! ReminderConsumer - reminder queue の購読ループ
//!
//! # 状態遷移
//! ```text
//! Connecting --(connected, queue declared, prefetch=1)--> Consuming
//! Connecting --(connect failed)--> wait backoff --> Connecting
//! Consuming  --(transport lost)--> wait backoff --> Connecting
//! any        --(shutdown)--> Stopping --> exit
//! ```
//!
//! Deliveries are handled one at a time: decode, hand to the sink, then ack.
//! A payload that does not decode, or a sink that refuses it, gets a nack
//! with requeue and the loop moves on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::app::shutdown::Shutdown;
use crate::domain::ReminderMessage;
use crate::ports::{
    Delivery, QueueChannel, QueueConnection, QueueConnector, QueueError, ReminderSink,
};

/// Unacknowledged deliveries a consumer may hold.
pub const PREFETCH: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Consuming,
    Stopping,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Connecting => f.write_str("connecting"),
            ConsumerState::Consuming => f.write_str("consuming"),
            ConsumerState::Stopping => f.write_str("stopping"),
        }
    }
}

/// How a consumer's `run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// Shut down after having consumed.
    Stopped,
    /// Shut down before a connection ever succeeded.
    NeverConnected,
}

/// Open connection plus the channel consuming on it.
struct Session {
    connection: Box<dyn QueueConnection>,
    channel: Box<dyn QueueChannel>,
}

impl Session {
    async fn close(self) {
        if let Err(err) = self.channel.close().await {
            tracing::debug!(error = %err, "closing consumer channel failed");
        }
        if let Err(err) = self.connection.close().await {
            tracing::debug!(error = %err, "closing consumer connection failed");
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(QueueError),
}

pub struct ReminderConsumer {
    name: String,
    queue: Arc<dyn QueueConnector>,
    sink: Arc<dyn ReminderSink>,
    queue_name: String,
    retry_backoff: Duration,
    state: watch::Sender<ConsumerState>,
}

impl ReminderConsumer {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn QueueConnector>,
        sink: Arc<dyn ReminderSink>,
        queue_name: impl Into<String>,
        retry_backoff: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Connecting);
        Self {
            name: name.into(),
            queue,
            sink,
            queue_name: queue_name.into(),
            retry_backoff,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Follow state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn enter(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(consumer = %self.name, from = %previous, to = %state, "consumer state");
        }
    }

    /// Consume until shutdown.
    pub async fn run(&self, mut shutdown: Shutdown) -> ConsumerExit {
        tracing::info!(
            consumer = %self.name,
            target = %self.queue.describe(),
            queue = %self.queue_name,
            "reminder consumer starting"
        );
        let mut connected_once = false;

        let exit = loop {
            self.enter(ConsumerState::Connecting);
            let Some(session) = self.connect(&mut shutdown).await else {
                break if connected_once {
                    ConsumerExit::Stopped
                } else {
                    ConsumerExit::NeverConnected
                };
            };
            connected_once = true;

            self.enter(ConsumerState::Consuming);
            match self.consume(session, &mut shutdown).await {
                SessionEnd::Shutdown => break ConsumerExit::Stopped,
                SessionEnd::Lost(err) => {
                    self.enter(ConsumerState::Connecting);
                    tracing::warn!(
                        consumer = %self.name,
                        error = %err,
                        retry_in_secs = self.retry_backoff.as_secs(),
                        "lost queue connection; reconnecting"
                    );
                    if !shutdown.sleep(self.retry_backoff).await {
                        break ConsumerExit::Stopped;
                    }
                }
            }
        };

        self.enter(ConsumerState::Stopping);
        match exit {
            ConsumerExit::Stopped => {
                tracing::info!(consumer = %self.name, "reminder consumer stopped");
            }
            ConsumerExit::NeverConnected => {
                tracing::error!(
                    consumer = %self.name,
                    target = %self.queue.describe(),
                    "reminder consumer stopped without ever connecting"
                );
            }
        }
        exit
    }

    /// Retry until a session is up. `None` means shutdown came first.
    async fn connect(&self, shutdown: &mut Shutdown) -> Option<Session> {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_requested() {
                return None;
            }
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = shutdown.requested() => return None,
                result = self.open_session() => result,
            };
            match result {
                Ok(session) => {
                    tracing::info!(
                        consumer = %self.name,
                        queue = %self.queue_name,
                        attempt,
                        "connected; consuming reminders"
                    );
                    return Some(session);
                }
                Err(err) => {
                    tracing::warn!(
                        consumer = %self.name,
                        attempt,
                        error = %err,
                        retry_in_secs = self.retry_backoff.as_secs(),
                        "queue connection failed; retrying"
                    );
                }
            }
            if !shutdown.sleep(self.retry_backoff).await {
                return None;
            }
        }
    }

    async fn open_session(&self) -> Result<Session, QueueError> {
        let mut connection = self.queue.connect().await?;
        let mut channel = connection.open_channel().await?;
        channel.declare_durable_queue(&self.queue_name).await?;
        channel.set_prefetch(PREFETCH).await?;
        channel.consume(&self.queue_name).await?;
        Ok(Session {
            connection,
            channel,
        })
    }

    async fn consume(&self, mut session: Session, shutdown: &mut Shutdown) -> SessionEnd {
        let end = loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.requested() => break SessionEnd::Shutdown,
                delivery = session.channel.next_delivery() => delivery,
            };
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => break SessionEnd::Lost(err),
            };
            if let Err(err) = self.handle(session.channel.as_mut(), delivery).await {
                break SessionEnd::Lost(err);
            }
        };
        session.close().await;
        end
    }

    /// Process one delivery and settle it.
    async fn handle(
        &self,
        channel: &mut dyn QueueChannel,
        delivery: Delivery,
    ) -> Result<(), QueueError> {
        let tag = delivery.tag;
        let processed = match ReminderMessage::decode_with_content_type(
            &delivery.body,
            delivery.content_type.as_deref(),
        ) {
            Ok(reminder) => self
                .sink
                .deliver(&reminder)
                .await
                .map(|()| reminder)
                .map_err(|e| e.to_string()),
            Err(err) => Err(err.to_string()),
        };

        match processed {
            Ok(reminder) => {
                channel.ack(tag).await?;
                tracing::debug!(
                    consumer = %self.name,
                    delivery_tag = %tag,
                    task_id = %reminder.task_id(),
                    "reminder acknowledged"
                );
            }
            Err(reason) => {
                tracing::warn!(
                    consumer = %self.name,
                    delivery_tag = %tag,
                    redelivered = delivery.redelivered,
                    reason = %reason,
                    "reminder not processed; requeueing"
                );
                channel.nack(tag, true).await?;
            }
        }
        Ok(())
    }
}
