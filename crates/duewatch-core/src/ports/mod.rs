//! Ports - 抽象化レイヤー
//!
//! Hexagonal "ports" between the reminder pipeline and the systems it talks
//! to. The task table and the queue are external; the pipeline only sees
//! these traits.

pub mod clock;
pub mod queue;
pub mod sink;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::queue::{
    Delivery, OutboundMessage, QueueChannel, QueueConnection, QueueConnector, QueueError,
};
pub use self::sink::{ReminderSink, SinkError};
pub use self::task_store::{MarkOutcome, StoreError, TaskStore, TaskStoreFactory};
