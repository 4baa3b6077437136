//! duewatch-core
//!
//! Overdue-task reminder pipeline: a scanner that publishes one reminder per
//! overdue task and a consumer that drains them.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, message, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Queue, ReminderSink, Clock）
//! - **impls**: 実装（InMemory / SQLite）
//! - **app**: アプリケーションロジック（scanner, consumer, service, builder）
//! - **config**: `duewatch.toml` と環境変数

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
