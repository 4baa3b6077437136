//! ServiceBuilder - 設定からのワイヤリング
//!
//! # 学習ポイント
//! - Config を検証してから adapters を組み立てる（Fail-fast）
//! - sink と clock は差し替え可能

use std::sync::Arc;

use crate::app::consumer::ReminderConsumer;
use crate::app::scanner::DueDateScanner;
use crate::config::{Config, ConfigError, Transport};
use crate::impls::{InMemoryBroker, LogReminderSink, SqliteBroker, SqliteTaskStoreFactory};
use crate::ports::{Clock, QueueConnector, QueueError, ReminderSink, SystemClock, TaskStoreFactory};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("queue transport: {0}")]
    Queue(#[from] QueueError),
}

pub struct ServiceBuilder {
    config: Config,
    sink: Arc<dyn ReminderSink>,
    clock: Arc<dyn Clock>,
}

/// Everything the reminder pipeline needs, wired from one [`Config`].
pub struct Wiring {
    pub store: Arc<dyn TaskStoreFactory>,
    pub queue: Arc<dyn QueueConnector>,
    /// Set for the sqlite transport.
    pub sqlite_broker: Option<SqliteBroker>,
    pub scanner: DueDateScanner,
    pub consumers: Vec<ReminderConsumer>,
}

impl ServiceBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sink: Arc::new(LogReminderSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReminderSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Wiring, BuildError> {
        self.config.validate()?;
        let cfg = &self.config;

        let store: Arc<dyn TaskStoreFactory> =
            Arc::new(SqliteTaskStoreFactory::new(cfg.store.database.clone()));

        let (queue, sqlite_broker): (Arc<dyn QueueConnector>, Option<SqliteBroker>) =
            match cfg.queue.transport {
                Transport::Sqlite => {
                    let broker =
                        SqliteBroker::open(cfg.queue.database.clone(), cfg.queue.poll_interval())?;
                    (Arc::new(broker.clone()), Some(broker))
                }
                Transport::Memory => (Arc::new(InMemoryBroker::new()), None),
            };

        let scanner = DueDateScanner::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&self.clock),
            cfg.queue.name.clone(),
            cfg.scanner.interval(),
        );

        let consumers = (0..cfg.consumer.instances)
            .map(|i| {
                ReminderConsumer::new(
                    format!("consumer-{i}"),
                    Arc::clone(&queue),
                    Arc::clone(&self.sink),
                    cfg.queue.name.clone(),
                    cfg.queue.connect_retry(),
                )
            })
            .collect();

        tracing::debug!(
            store = %cfg.store.database.display(),
            queue = %queue.describe(),
            transport = %cfg.queue.transport,
            consumers = cfg.consumer.instances,
            "pipeline wired"
        );

        Ok(Wiring {
            store,
            queue,
            sqlite_broker,
            scanner,
            consumers,
        })
    }
}
