//! SqliteBroker - a durable queue in a SQLite file.
//!
//! Several processes can share one queue file: the scanner publishes from
//! one, consumers claim from others. WAL mode and a busy timeout keep the
//! writers out of each other's way.
//!
//! # 実装詳細
//! - Claiming is a single `UPDATE .. RETURNING` on the oldest ready row, so
//!   two channels can never claim the same message.
//! - Consumers poll at `poll_interval` when the queue is empty.
//! - Delivery tags are message row ids.
//! - Messages are handed out in `seq` order. A nack with requeue gives the
//!   message a fresh `seq` (back of the queue); a closed channel's messages
//!   keep theirs (front of the queue).
//! - A crashed process leaves its deliveries in `unacked`;
//!   [`SqliteBroker::recover_unacked`] puts them back.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::domain::{ChannelId, DeliveryTag};
use crate::ports::{
    Delivery, OutboundMessage, QueueChannel, QueueConnection, QueueConnector, QueueError,
};

const SCHEMA: &str = include_str!("sql/queue.sql");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn backend(err: rusqlite::Error) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn open_connection(path: &Path) -> Result<Connection, QueueError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            QueueError::Unavailable(format!("create {}: {e}", parent.display()))
        })?;
    }
    let conn = Connection::open(path)
        .map_err(|e| QueueError::Unavailable(format!("open {}: {e}", path.display())))?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(backend)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .map_err(backend)?;
    Ok(conn)
}

async fn blocking<T, F>(db: &Arc<Mutex<Connection>>, f: F) -> Result<T, QueueError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, QueueError> + Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    })
    .await
    .map_err(|e| QueueError::Backend(format!("blocking task failed: {e}")))?
}

fn channel_key(channel: ChannelId) -> String {
    channel.as_ulid().to_string()
}

fn tag_to_row_id(tag: DeliveryTag) -> Result<i64, QueueError> {
    i64::try_from(tag.get()).map_err(|_| QueueError::UnknownDeliveryTag(tag))
}

fn requeue_channel(conn: &Connection, channel: ChannelId) -> Result<usize, QueueError> {
    conn.execute(
        "UPDATE messages SET state = 'ready', channel_id = NULL, redelivered = 1
         WHERE state = 'unacked' AND channel_id = ?1",
        params![channel_key(channel)],
    )
    .map_err(backend)
}

fn claim(conn: &Connection, queue: &str, channel: ChannelId) -> Result<Option<Delivery>, QueueError> {
    let row = conn
        .query_row(
            "UPDATE messages SET state = 'unacked', channel_id = ?2
             WHERE id = (SELECT id FROM messages
                         WHERE queue = ?1 AND state = 'ready'
                         ORDER BY seq LIMIT 1)
             RETURNING id, body, content_type, redelivered",
            params![queue, channel_key(channel)],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            },
        )
        .optional()
        .map_err(backend)?;

    row.map(|(id, body, content_type, redelivered)| {
        let tag = u64::try_from(id)
            .map(DeliveryTag::new)
            .map_err(|_| QueueError::Backend(format!("negative message id {id}")))?;
        Ok(Delivery {
            tag,
            body,
            content_type,
            redelivered,
        })
    })
    .transpose()
}

/// Connector for a SQLite-backed queue file.
#[derive(Debug, Clone)]
pub struct SqliteBroker {
    path: PathBuf,
    poll_interval: Duration,
}

impl SqliteBroker {
    /// Create the queue file (and schema) if needed.
    pub fn open(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, QueueError> {
        let path = path.into();
        let conn = open_connection(&path)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            path,
            poll_interval,
        })
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| QueueError::Backend(format!("blocking task failed: {e}")))?
    }

    /// Return every unacknowledged message to its queue.
    ///
    /// Only call this when no other process is consuming from the file:
    /// their in-flight deliveries would be handed out a second time.
    pub async fn recover_unacked(&self) -> Result<usize, QueueError> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE messages SET state = 'ready', channel_id = NULL, redelivered = 1
                 WHERE state = 'unacked'",
                [],
            )
            .map_err(backend)
        })
        .await
    }

    pub async fn ready_count(&self, queue: &str) -> Result<usize, QueueError> {
        self.count(queue, "ready").await
    }

    pub async fn unacked_count(&self, queue: &str) -> Result<usize, QueueError> {
        self.count(queue, "unacked").await
    }

    async fn count(&self, queue: &str, state: &'static str) -> Result<usize, QueueError> {
        let queue = queue.to_string();
        self.with_connection(move |conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages WHERE queue = ?1 AND state = ?2",
                    params![queue, state],
                    |row| row.get(0),
                )
                .map_err(backend)?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
        .await
    }
}

#[async_trait]
impl QueueConnector for SqliteBroker {
    async fn connect(&self) -> Result<Box<dyn QueueConnection>, QueueError> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&path))
            .await
            .map_err(|e| QueueError::Backend(format!("blocking task failed: {e}")))??;
        Ok(Box::new(SqliteConnection {
            db: Arc::new(Mutex::new(conn)),
            poll_interval: self.poll_interval,
            alive: Arc::new(AtomicBool::new(true)),
            channels: Vec::new(),
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }
}

struct SqliteConnection {
    db: Arc<Mutex<Connection>>,
    poll_interval: Duration,
    alive: Arc<AtomicBool>,
    channels: Vec<ChannelId>,
}

impl SqliteConnection {
    fn release(&mut self) -> Result<(), QueueError> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        for channel in self.channels.drain(..) {
            requeue_channel(&conn, channel)?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueConnection for SqliteConnection {
    async fn open_channel(&mut self) -> Result<Box<dyn QueueChannel>, QueueError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionClosed);
        }
        let id = ChannelId::generate();
        self.channels.push(id);
        Ok(Box::new(SqliteChannel {
            id,
            db: Arc::clone(&self.db),
            poll_interval: self.poll_interval,
            alive: Arc::clone(&self.alive),
            prefetch: None,
            consuming: None,
            in_flight: HashSet::new(),
            closed: false,
        }))
    }

    async fn close(mut self: Box<Self>) -> Result<(), QueueError> {
        let db = Arc::clone(&self.db);
        let channels = std::mem::take(&mut self.channels);
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        blocking(&db, move |conn| {
            for channel in channels {
                requeue_channel(conn, channel)?;
            }
            Ok(())
        })
        .await
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "failed to requeue deliveries on connection drop");
        }
    }
}

struct SqliteChannel {
    id: ChannelId,
    db: Arc<Mutex<Connection>>,
    poll_interval: Duration,
    alive: Arc<AtomicBool>,
    prefetch: Option<u16>,
    consuming: Option<String>,
    in_flight: HashSet<DeliveryTag>,
    closed: bool,
}

impl SqliteChannel {
    fn check_alive(&self) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::ChannelClosed);
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionClosed);
        }
        Ok(())
    }

    async fn settle(&mut self, tag: DeliveryTag, requeue: Option<bool>) -> Result<(), QueueError> {
        self.check_alive()?;
        if !self.in_flight.contains(&tag) {
            return Err(QueueError::UnknownDeliveryTag(tag));
        }
        let row_id = tag_to_row_id(tag)?;
        let channel = channel_key(self.id);
        let changed = blocking(&self.db, move |conn| {
            let sql = if requeue == Some(true) {
                "UPDATE messages SET state = 'ready', channel_id = NULL, redelivered = 1,
                        seq = (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages)
                 WHERE id = ?1 AND channel_id = ?2 AND state = 'unacked'"
            } else {
                "DELETE FROM messages WHERE id = ?1 AND channel_id = ?2 AND state = 'unacked'"
            };
            conn.execute(sql, params![row_id, channel]).map_err(backend)
        })
        .await?;
        self.in_flight.remove(&tag);
        if changed == 0 {
            return Err(QueueError::UnknownDeliveryTag(tag));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueChannel for SqliteChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn declare_durable_queue(&mut self, name: &str) -> Result<(), QueueError> {
        self.check_alive()?;
        let name = name.to_string();
        blocking(&self.db, move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO queues (name, declared_at_ms) VALUES (?1, ?2)",
                params![name, Utc::now().timestamp_millis()],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), QueueError> {
        self.check_alive()?;
        self.prefetch = (count > 0).then_some(count);
        Ok(())
    }

    async fn publish(&mut self, queue: &str, message: OutboundMessage) -> Result<(), QueueError> {
        self.check_alive()?;
        let queue = queue.to_string();
        blocking(&self.db, move |conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO messages (queue, body, content_type, persistent, published_at_ms, seq)
                     SELECT ?1, ?2, ?3, ?4, ?5, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages)
                     WHERE EXISTS (SELECT 1 FROM queues WHERE name = ?1)",
                    params![
                        queue,
                        message.body,
                        message.content_type,
                        message.persistent,
                        Utc::now().timestamp_millis(),
                    ],
                )
                .map_err(backend)?;
            if inserted == 0 {
                return Err(QueueError::QueueNotFound(queue));
            }
            Ok(())
        })
        .await
    }

    async fn consume(&mut self, queue: &str) -> Result<(), QueueError> {
        self.check_alive()?;
        let name = queue.to_string();
        let declared = blocking(&self.db, move |conn| {
            conn.query_row(
                "SELECT 1 FROM queues WHERE name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
            .map_err(backend)
        })
        .await?;
        if declared.is_none() {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        self.consuming = Some(queue.to_string());
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Delivery, QueueError> {
        let queue = self.consuming.clone().ok_or(QueueError::NotConsuming)?;
        self.check_alive()?;
        if let Some(limit) = self.prefetch
            && self.in_flight.len() >= usize::from(limit)
        {
            return Err(QueueError::PrefetchExceeded { limit });
        }

        loop {
            self.check_alive()?;
            let queue = queue.clone();
            let channel = self.id;
            if let Some(delivery) = blocking(&self.db, move |conn| claim(conn, &queue, channel)).await? {
                self.in_flight.insert(delivery.tag);
                return Ok(delivery);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.settle(tag, None).await
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        self.settle(tag, Some(requeue)).await
    }

    async fn close(mut self: Box<Self>) -> Result<(), QueueError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.in_flight.clear();
        let channel = self.id;
        blocking(&self.db, move |conn| requeue_channel(conn, channel).map(drop)).await
    }
}

impl Drop for SqliteChannel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let conn = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = requeue_channel(&conn, self.id) {
            tracing::warn!(channel = %self.id, error = %err, "failed to requeue deliveries on channel drop");
        }
    }
}
