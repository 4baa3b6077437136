//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore / InMemoryBroker**: 開発用・テスト用
//! - **SqliteTaskStore / SqliteBroker**: rusqlite による永続実装
//! - **LogReminderSink**: reminder を warn ログに出す
//! - **RecordingReminderSink**: テスト用

pub mod inmem_broker;
pub mod inmem_store;
pub mod log_sink;
pub mod sqlite_broker;
pub mod sqlite_store;

pub use self::inmem_broker::{InMemoryBroker, PublishedMessage};
pub use self::inmem_store::InMemoryTaskStore;
pub use self::log_sink::{LogReminderSink, RecordingReminderSink};
pub use self::sqlite_broker::SqliteBroker;
pub use self::sqlite_store::{SqliteTaskStore, SqliteTaskStoreFactory};
