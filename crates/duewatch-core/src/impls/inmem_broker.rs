//! InMemoryBroker - 開発用の message broker
//!
//! # 学習ポイント
//! - `std::sync::Mutex` for short critical sections, `Notify` for wakeups
//! - `Notified::enable()` before checking state, so a publish between the
//!   check and the `.await` is never missed
//! - Drop impls that hand unacknowledged deliveries back to the queue
//!
//! A nack with requeue sends the message to the back of its queue; a
//! closed channel's deliveries go back to the front.
//!
//! Messages live only as long as the broker value; the `persistent` flag
//! only shows up in [`InMemoryBroker::published`].

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::domain::{ChannelId, DeliveryTag};
use crate::ports::{
    Delivery, OutboundMessage, QueueChannel, QueueConnection, QueueConnector, QueueError,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    content_type: Option<String>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    channel: ChannelId,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<DeliveryTag, Unacked>,
}

/// Every message the broker accepted, in publish order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub persistent: bool,
}

#[derive(Debug)]
struct BrokerState {
    online: bool,
    /// Bumped on every outage; connections from an older epoch are dead.
    epoch: u64,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    published: Vec<PublishedMessage>,
    connection_attempts: usize,
    open_connections: usize,
    max_in_flight: usize,
}

impl BrokerState {
    fn claim(&mut self, queue: &str, channel: ChannelId) -> Option<Delivery> {
        let state = self.queues.get_mut(queue)?;
        let message = state.ready.pop_front()?;
        self.next_tag += 1;
        let tag = DeliveryTag::new(self.next_tag);
        let delivery = Delivery {
            tag,
            body: message.body.clone(),
            content_type: message.content_type.clone(),
            redelivered: message.redelivered,
        };
        state.unacked.insert(tag, Unacked { channel, message });
        Some(delivery)
    }

    /// Put everything `channel` still holds back at the head of its queue.
    fn requeue_channel(&mut self, channel: ChannelId) -> usize {
        let mut requeued = 0;
        for state in self.queues.values_mut() {
            let mut tags: Vec<DeliveryTag> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.channel == channel)
                .map(|(tag, _)| *tag)
                .collect();
            // newest first, so push_front leaves them in delivery order
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some(Unacked { mut message, .. }) = state.unacked.remove(&tag) {
                    message.redelivered = true;
                    state.ready.push_front(message);
                    requeued += 1;
                }
            }
        }
        requeued
    }

    fn requeue_all(&mut self) {
        for state in self.queues.values_mut() {
            let mut held: Vec<(DeliveryTag, Unacked)> = state.unacked.drain().collect();
            held.sort_unstable_by(|a, b| b.0.cmp(&a.0));
            for (_, Unacked { mut message, .. }) in held {
                message.redelivered = true;
                state.ready.push_front(message);
            }
        }
    }
}

#[derive(Debug)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker implementing the queue ports.
///
/// Cloning shares the broker; every clone is a connector to the same queues.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    online: true,
                    epoch: 0,
                    queues: HashMap::new(),
                    next_tag: 0,
                    published: Vec::new(),
                    connection_attempts: 0,
                    open_connections: 0,
                    max_in_flight: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Take the broker down or bring it back.
    ///
    /// Going offline kills every open connection and requeues whatever they
    /// held, as a broker restart would.
    pub fn set_online(&self, online: bool) {
        {
            let mut state = self.inner.lock();
            if state.online && !online {
                state.epoch += 1;
                state.requeue_all();
            }
            state.online = online;
        }
        self.inner.notify.notify_waiters();
    }

    /// Declare `queue` and push a message straight into it.
    pub fn inject(&self, queue: &str, message: OutboundMessage) {
        {
            let mut state = self.inner.lock();
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(StoredMessage {
                    body: message.body,
                    content_type: message.content_type,
                    redelivered: false,
                });
        }
        self.inner.notify.notify_waiters();
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn published(&self, queue: &str) -> Vec<PublishedMessage> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|m| m.queue == queue)
            .cloned()
            .collect()
    }

    pub fn connection_attempts(&self) -> usize {
        self.inner.lock().connection_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.inner.lock().open_connections
    }

    /// Highest number of unacknowledged deliveries any single channel held.
    pub fn max_in_flight_observed(&self) -> usize {
        self.inner.lock().max_in_flight
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn QueueConnection>, QueueError> {
        let mut state = self.inner.lock();
        state.connection_attempts += 1;
        if !state.online {
            return Err(QueueError::Unavailable("in-memory broker is offline".to_string()));
        }
        state.open_connections += 1;
        Ok(Box::new(InMemoryConnection {
            broker: Arc::clone(&self.inner),
            epoch: state.epoch,
            channels: Vec::new(),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}

struct InMemoryConnection {
    broker: Arc<BrokerInner>,
    epoch: u64,
    channels: Vec<ChannelId>,
    closed: bool,
}

impl InMemoryConnection {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        {
            let mut state = self.broker.lock();
            state.open_connections = state.open_connections.saturating_sub(1);
            if state.epoch == self.epoch {
                for channel in &self.channels {
                    state.requeue_channel(*channel);
                }
            }
        }
        self.broker.notify.notify_waiters();
    }
}

#[async_trait]
impl QueueConnection for InMemoryConnection {
    async fn open_channel(&mut self) -> Result<Box<dyn QueueChannel>, QueueError> {
        if self.closed {
            return Err(QueueError::ConnectionClosed);
        }
        {
            let state = self.broker.lock();
            if !state.online || state.epoch != self.epoch {
                return Err(QueueError::ConnectionClosed);
            }
        }
        let id = ChannelId::generate();
        self.channels.push(id);
        Ok(Box::new(InMemoryChannel {
            id,
            broker: Arc::clone(&self.broker),
            epoch: self.epoch,
            prefetch: None,
            consuming: None,
            in_flight: HashSet::new(),
            closed: false,
        }))
    }

    async fn close(mut self: Box<Self>) -> Result<(), QueueError> {
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}

struct InMemoryChannel {
    id: ChannelId,
    broker: Arc<BrokerInner>,
    epoch: u64,
    prefetch: Option<u16>,
    consuming: Option<String>,
    in_flight: HashSet<DeliveryTag>,
    closed: bool,
}

impl InMemoryChannel {
    fn check_alive(&self, state: &BrokerState) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::ChannelClosed);
        }
        if !state.online || state.epoch != self.epoch {
            return Err(QueueError::ConnectionClosed);
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.in_flight.clear();
        {
            let mut state = self.broker.lock();
            if state.epoch == self.epoch {
                state.requeue_channel(self.id);
            }
        }
        self.broker.notify.notify_waiters();
    }

    fn settle(&mut self, tag: DeliveryTag, requeue: Option<bool>) -> Result<(), QueueError> {
        if !self.in_flight.contains(&tag) {
            return Err(QueueError::UnknownDeliveryTag(tag));
        }
        let queue = self.consuming.clone().ok_or(QueueError::NotConsuming)?;
        {
            let mut state = self.broker.lock();
            self.check_alive(&state)?;
            let held = state
                .queues
                .get_mut(&queue)
                .and_then(|q| q.unacked.remove(&tag))
                .ok_or(QueueError::UnknownDeliveryTag(tag))?;
            if requeue == Some(true) {
                let mut message = held.message;
                message.redelivered = true;
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.ready.push_back(message);
                }
            }
        }
        self.in_flight.remove(&tag);
        if requeue == Some(true) {
            self.broker.notify.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl QueueChannel for InMemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn declare_durable_queue(&mut self, name: &str) -> Result<(), QueueError> {
        let mut state = self.broker.lock();
        self.check_alive(&state)?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), QueueError> {
        let state = self.broker.lock();
        self.check_alive(&state)?;
        // AMQP: 0 means unlimited
        self.prefetch = (count > 0).then_some(count);
        Ok(())
    }

    async fn publish(&mut self, queue: &str, message: OutboundMessage) -> Result<(), QueueError> {
        {
            let mut state = self.broker.lock();
            self.check_alive(&state)?;
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(QueueError::QueueNotFound(queue.to_string()));
            };
            target.ready.push_back(StoredMessage {
                body: message.body.clone(),
                content_type: message.content_type.clone(),
                redelivered: false,
            });
            state.published.push(PublishedMessage {
                queue: queue.to_string(),
                body: message.body,
                content_type: message.content_type,
                persistent: message.persistent,
            });
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<(), QueueError> {
        let state = self.broker.lock();
        self.check_alive(&state)?;
        if !state.queues.contains_key(queue) {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        self.consuming = Some(queue.to_string());
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Delivery, QueueError> {
        let queue = self.consuming.clone().ok_or(QueueError::NotConsuming)?;
        self.check_alive(&self.broker.lock())?;
        if let Some(limit) = self.prefetch
            && self.in_flight.len() >= usize::from(limit)
        {
            return Err(QueueError::PrefetchExceeded { limit });
        }

        // one suspension per delivery, as a network round-trip would have
        tokio::task::yield_now().await;

        loop {
            let mut notified = std::pin::pin!(self.broker.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.broker.lock();
                self.check_alive(&state)?;
                if let Some(delivery) = state.claim(&queue, self.id) {
                    self.in_flight.insert(delivery.tag);
                    state.max_in_flight = state.max_in_flight.max(self.in_flight.len());
                    return Ok(delivery);
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.settle(tag, None)
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        self.settle(tag, Some(requeue))
    }

    async fn close(mut self: Box<Self>) -> Result<(), QueueError> {
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const QUEUE: &str = "task-reminders";

    async fn consuming_channel(broker: &InMemoryBroker, prefetch: u16) -> Box<dyn QueueChannel> {
        let mut conn = broker.connect().await.unwrap();
        let mut channel = conn.open_channel().await.unwrap();
        channel.declare_durable_queue(QUEUE).await.unwrap();
        channel.set_prefetch(prefetch).await.unwrap();
        channel.consume(QUEUE).await.unwrap();
        // keep the connection alive for the channel's lifetime
        std::mem::forget(conn);
        channel
    }

    #[tokio::test]
    async fn publish_then_consume_and_ack() {
        let broker = InMemoryBroker::new();
        let mut conn = broker.connect().await.unwrap();
        let mut channel = conn.open_channel().await.unwrap();
        channel.declare_durable_queue(QUEUE).await.unwrap();
        channel
            .publish(QUEUE, OutboundMessage::persistent_json(b"{}".to_vec()))
            .await
            .unwrap();
        channel.consume(QUEUE).await.unwrap();

        let delivery = channel.next_delivery().await.unwrap();
        assert_eq!(delivery.body, b"{}");
        assert_eq!(delivery.content_type.as_deref(), Some("application/json"));
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count(QUEUE), 1);

        channel.ack(delivery.tag).await.unwrap();
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.ready_count(QUEUE), 0);

        let published = broker.published(QUEUE);
        assert_eq!(published.len(), 1);
        assert!(published[0].persistent);
    }

    #[tokio::test]
    async fn publish_to_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        let mut conn = broker.connect().await.unwrap();
        let mut channel = conn.open_channel().await.unwrap();

        let err = channel
            .publish("nowhere", OutboundMessage::persistent_json(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::QueueNotFound(q) if q == "nowhere"));
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"1".to_vec()));

        let mut conn = broker.connect().await.unwrap();
        let mut channel = conn.open_channel().await.unwrap();
        channel.declare_durable_queue(QUEUE).await.unwrap();
        channel.declare_durable_queue(QUEUE).await.unwrap();
        assert_eq!(broker.ready_count(QUEUE), 1);
    }

    #[tokio::test]
    async fn prefetch_caps_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"1".to_vec()));
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"2".to_vec()));
        let mut channel = consuming_channel(&broker, 1).await;

        let first = channel.next_delivery().await.unwrap();
        let err = channel.next_delivery().await.unwrap_err();
        assert!(matches!(err, QueueError::PrefetchExceeded { limit: 1 }));

        channel.ack(first.tag).await.unwrap();
        let second = channel.next_delivery().await.unwrap();
        assert_eq!(second.body, b"2");
        assert_eq!(broker.max_in_flight_observed(), 1);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"1".to_vec()));
        let mut channel = consuming_channel(&broker, 1).await;

        let first = channel.next_delivery().await.unwrap();
        channel.nack(first.tag, true).await.unwrap();

        let again = channel.next_delivery().await.unwrap();
        assert_eq!(again.body, b"1");
        assert!(again.redelivered);
        assert_ne!(again.tag, first.tag);
    }

    #[tokio::test]
    async fn nacked_message_goes_behind_waiting_ones() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"bad".to_vec()));
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"good".to_vec()));
        let mut channel = consuming_channel(&broker, 1).await;

        let bad = channel.next_delivery().await.unwrap();
        channel.nack(bad.tag, true).await.unwrap();

        let next = channel.next_delivery().await.unwrap();
        assert_eq!(next.body, b"good");
        channel.ack(next.tag).await.unwrap();
        assert_eq!(channel.next_delivery().await.unwrap().body, b"bad");
    }

    #[tokio::test]
    async fn nack_without_requeue_drops() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"1".to_vec()));
        let mut channel = consuming_channel(&broker, 1).await;

        let first = channel.next_delivery().await.unwrap();
        channel.nack(first.tag, false).await.unwrap();
        assert_eq!(broker.ready_count(QUEUE), 0);
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let broker = InMemoryBroker::new();
        let mut channel = consuming_channel(&broker, 1).await;
        let err = channel.ack(DeliveryTag::new(99)).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownDeliveryTag(_)));
    }

    #[tokio::test]
    async fn dropping_channel_requeues_held_messages() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"1".to_vec()));
        let mut channel = consuming_channel(&broker, 1).await;
        let _held = channel.next_delivery().await.unwrap();
        assert_eq!(broker.ready_count(QUEUE), 0);

        drop(channel);
        assert_eq!(broker.ready_count(QUEUE), 1);
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let mut channel = consuming_channel(&broker, 1).await;

        let waiter = tokio::spawn(async move { channel.next_delivery().await.map(|d| d.body) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"late".to_vec()));

        let body = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(body, b"late");
    }

    #[tokio::test]
    async fn outage_fails_connects_and_kills_open_channels() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, OutboundMessage::persistent_json(b"1".to_vec()));
        let mut channel = consuming_channel(&broker, 1).await;
        let _held = channel.next_delivery().await.unwrap();

        broker.set_online(false);
        assert!(matches!(
            broker.connect().await.err().unwrap(),
            QueueError::Unavailable(_)
        ));
        let err = channel.next_delivery().await.unwrap_err();
        assert!(matches!(err, QueueError::ConnectionClosed));
        assert!(err.kind().is_transient());
        // the held delivery went back to the queue
        assert_eq!(broker.ready_count(QUEUE), 1);

        broker.set_online(true);
        let mut fresh = consuming_channel(&broker, 1).await;
        let delivery = fresh.next_delivery().await.unwrap();
        assert!(delivery.redelivered);
        assert_eq!(broker.connection_attempts(), 3);
    }

    #[tokio::test]
    async fn closing_connection_is_counted() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        assert_eq!(broker.open_connections(), 1);
        conn.close().await.unwrap();
        assert_eq!(broker.open_connections(), 0);
    }
}
