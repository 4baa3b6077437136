use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::app::consumer::{ConsumerExit, ReminderConsumer};
use crate::app::scanner::DueDateScanner;
use crate::app::shutdown::{self, ShutdownTrigger};

/// Scanner + consumer task group.
/// - dropping the service (and with it the trigger) stops every task
/// - `shutdown_and_join()` で全タスクの終了を待てる
pub struct ReminderService {
    trigger: ShutdownTrigger,
    scanner: Option<JoinHandle<()>>,
    consumers: Vec<(String, JoinHandle<ConsumerExit>)>,
}

/// How each consumer ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceReport {
    pub consumers: Vec<(String, Option<ConsumerExit>)>,
}

impl ServiceReport {
    pub fn never_connected(&self) -> usize {
        self.consumers
            .iter()
            .filter(|(_, exit)| *exit == Some(ConsumerExit::NeverConnected))
            .count()
    }
}

impl ReminderService {
    /// Spawn the scanner (if any) and every consumer on the current runtime.
    pub fn spawn(scanner: Option<DueDateScanner>, consumers: Vec<ReminderConsumer>) -> Self {
        let (trigger, shutdown) = shutdown::channel();

        let scanner = scanner.map(|scanner| {
            let rx = shutdown.clone();
            tokio::spawn(async move { scanner.run(rx).await })
        });

        let mut joins = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            let consumer = Arc::new(consumer);
            let rx = shutdown.clone();
            let name = consumer.name().to_string();
            let join = tokio::spawn(async move { consumer.run(rx).await });
            joins.push((name, join));
        }

        tracing::info!(
            scanner = scanner.is_some(),
            consumers = joins.len(),
            "reminder service started"
        );
        Self {
            trigger,
            scanner,
            consumers: joins,
        }
    }

    /// Ask every task to stop. Tasks finish their current step first.
    pub fn request_shutdown(&self) {
        self.trigger.trigger();
    }

    /// Shutdown and wait for all tasks.
    ///
    /// A panicked task is logged and reported with no exit.
    pub async fn shutdown_and_join(self) -> ServiceReport {
        self.request_shutdown();

        if let Some(scanner) = self.scanner
            && let Err(err) = scanner.await
        {
            tracing::error!(error = %err, "scanner task ended abnormally");
        }

        let mut report = ServiceReport::default();
        for (name, join) in self.consumers {
            let exit = match join.await {
                Ok(exit) => Some(exit),
                Err(err) => {
                    tracing::error!(consumer = %name, error = %err, "consumer task ended abnormally");
                    None
                }
            };
            report.consumers.push((name, exit));
        }
        tracing::info!("reminder service stopped");
        report
    }
}
