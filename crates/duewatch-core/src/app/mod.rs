//! App - アプリケーション層
//!
//! ports を組み合わせて reminder pipeline を実装します。
//!
//! # 主要コンポーネント
//! - **DueDateScanner**: 期限切れタスクを検出し reminder を発行
//! - **ReminderConsumer**: reminder queue を prefetch=1 で購読
//! - **ReminderService**: scanner と consumer 群の起動と停止
//! - **ServiceBuilder**: Config からのワイヤリング

pub mod builder;
pub mod consumer;
pub mod scanner;
pub mod service;
pub mod shutdown;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, ServiceBuilder, Wiring};
pub use self::consumer::{ConsumerExit, ConsumerState, PREFETCH, ReminderConsumer};
pub use self::scanner::{DueDateScanner, ScanError, ScanOutcome, ScanReport};
pub use self::service::{ReminderService, ServiceReport};
pub use self::shutdown::{Shutdown, ShutdownTrigger};
