//! DueDateScanner - 期限切れタスクの検出と reminder 発行
//!
//! # 処理フロー
//! 1. open a fresh store handle
//! 2. read eligible rows (`due_at < now`, not completed, not reminded)
//! 3. nothing found: done, no queue connection is made
//! 4. publish one persistent message per row
//! 5. mark every published row sent, each guarded by the row version it was
//!    read with
//!
//! Publish happens before mark. A crash in between republishes on the next
//! scan; the other order could lose a reminder.
//!
//! A version conflict on step 5 means someone else wrote the row since it
//! was read. The row is skipped for this pass; the next scan reads it fresh
//! and picks it up again only if it is still eligible.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::app::shutdown::Shutdown;
use crate::domain::{ErrorKind, MessageError, ReminderMessage, RowVersion, TaskId, TaskRef};
use crate::ports::{
    Clock, MarkOutcome, OutboundMessage, QueueConnection, QueueConnector, QueueError, StoreError,
    TaskStoreFactory,
};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("reminder for {task_id}: {source}")]
    Encode {
        task_id: TaskId,
        #[source]
        source: MessageError,
    },
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Store(e) => e.kind(),
            ScanError::Queue(e) => e.kind(),
            ScanError::Encode { .. } => ErrorKind::Permanent,
        }
    }
}

/// What one dispatching scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Eligible rows read from the store.
    pub selected: usize,
    pub published: usize,
    pub marked: usize,
    /// Rows whose mark lost to a concurrent writer.
    pub conflicts: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Nothing was due.
    Idle,
    Dispatched(ScanReport),
}

/// Floor for the scan interval; `tokio::time::interval` rejects zero.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct DueDateScanner {
    store: Arc<dyn TaskStoreFactory>,
    queue: Arc<dyn QueueConnector>,
    clock: Arc<dyn Clock>,
    queue_name: String,
    interval: Duration,
}

impl DueDateScanner {
    pub fn new(
        store: Arc<dyn TaskStoreFactory>,
        queue: Arc<dyn QueueConnector>,
        clock: Arc<dyn Clock>,
        queue_name: impl Into<String>,
        interval: Duration,
    ) -> Self {
        if interval < MIN_INTERVAL {
            tracing::warn!(?interval, min = ?MIN_INTERVAL, "scan interval too small; clamped");
        }
        Self {
            store,
            queue,
            clock,
            queue_name: queue_name.into(),
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One scan pass.
    pub async fn scan_and_dispatch(&self) -> Result<ScanOutcome, ScanError> {
        let mut store = self.store.open().await?;
        let now = self.clock.now();
        let eligible = store.find_eligible_for_reminder(now).await?;
        if eligible.is_empty() {
            tracing::debug!(queue = %self.queue_name, "no overdue tasks");
            return Ok(ScanOutcome::Idle);
        }

        let mut connection = self.queue.connect().await?;
        let (published, publish_result) =
            self.publish_batch(connection.as_mut(), &eligible, now).await;
        if let Err(err) = connection.close().await {
            tracing::debug!(error = %err, "closing publisher connection failed");
        }

        let mut report = ScanReport {
            selected: eligible.len(),
            published: published.len(),
            ..ScanReport::default()
        };

        if !published.is_empty() {
            let outcomes = match store.mark_reminders_sent(&published).await {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    if let Err(publish_err) = &publish_result {
                        tracing::error!(error = %publish_err, "publishing stopped early");
                    }
                    return Err(err.into());
                }
            };
            for (task_id, outcome) in outcomes {
                match outcome {
                    MarkOutcome::Marked => report.marked += 1,
                    MarkOutcome::Conflict => {
                        tracing::warn!(
                            task_id = %task_id,
                            kind = %ErrorKind::Conflict,
                            "task changed since it was read; reminder published but not marked sent"
                        );
                        report.conflicts.push(task_id);
                    }
                }
            }
        }

        publish_result?;

        tracing::info!(
            queue = %self.queue_name,
            selected = report.selected,
            published = report.published,
            marked = report.marked,
            conflicts = report.conflicts.len(),
            "reminders dispatched"
        );
        Ok(ScanOutcome::Dispatched(report))
    }

    /// Publish one reminder per task until done or the first failure.
    ///
    /// Returns the tasks that made it onto the queue either way.
    async fn publish_batch(
        &self,
        connection: &mut dyn QueueConnection,
        tasks: &[TaskRef],
        sent_at: chrono::DateTime<chrono::Utc>,
    ) -> (Vec<(TaskId, RowVersion)>, Result<(), ScanError>) {
        let mut published = Vec::with_capacity(tasks.len());

        let mut channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => return (published, Err(err.into())),
        };
        if let Err(err) = channel.declare_durable_queue(&self.queue_name).await {
            return (published, Err(err.into()));
        }

        let mut result = Ok(());
        for task in tasks {
            let body = match ReminderMessage::for_task(task, sent_at).encode() {
                Ok(body) => body,
                Err(source) => {
                    result = Err(ScanError::Encode {
                        task_id: task.id,
                        source,
                    });
                    break;
                }
            };
            if let Err(err) = channel
                .publish(&self.queue_name, OutboundMessage::persistent_json(body))
                .await
            {
                tracing::error!(
                    task_id = %task.id,
                    published = published.len(),
                    remaining = tasks.len() - published.len(),
                    error = %err,
                    "publish failed; remaining tasks wait for the next scan"
                );
                result = Err(err.into());
                break;
            }
            tracing::debug!(task_id = %task.id, queue = %self.queue_name, "reminder published");
            published.push((task.id, task.row_version));
        }

        if let Err(err) = channel.close().await {
            tracing::debug!(error = %err, "closing publisher channel failed");
        }
        (published, result)
    }

    /// Scan on every tick until shutdown.
    ///
    /// The first scan runs immediately. A scan that overruns the interval
    /// pushes the schedule back instead of bursting. Failed scans are logged
    /// and the loop carries on.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            queue = %self.queue_name,
            interval_secs = self.interval.as_secs(),
            "due-date scanner started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.scan_and_dispatch().await {
                tracing::error!(error = %err, kind = %err.kind(), "reminder scan failed");
            }
        }

        tracing::info!(queue = %self.queue_name, "due-date scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::shutdown;
    use crate::domain::{NewTask, TaskRecord};
    use crate::impls::{InMemoryBroker, InMemoryTaskStore};
    use crate::ports::{FixedClock, QueueChannel, TaskStore};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    const QUEUE: &str = "task-reminders";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap()
    }

    fn due_yesterday(title: &str) -> NewTask {
        NewTask::new(title, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
            .assigned_to("Dana Levi", "dana@example.com")
    }

    fn scanner(
        store: Arc<dyn TaskStoreFactory>,
        queue: Arc<dyn QueueConnector>,
    ) -> DueDateScanner {
        DueDateScanner::new(
            store,
            queue,
            Arc::new(FixedClock::new(now())),
            QUEUE,
            Duration::from_secs(60),
        )
    }

    fn decoded(broker: &InMemoryBroker) -> Vec<ReminderMessage> {
        broker
            .published(QUEUE)
            .iter()
            .map(|m| ReminderMessage::decode(&m.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn overdue_task_is_published_once_and_marked() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(due_yesterday("Submit report"));
        let broker = InMemoryBroker::new();
        let scanner = scanner(Arc::new(store.clone()), Arc::new(broker.clone()));

        let outcome = scanner.scan_and_dispatch().await.unwrap();
        assert_eq!(
            outcome,
            ScanOutcome::Dispatched(ScanReport {
                selected: 1,
                published: 1,
                marked: 1,
                conflicts: vec![],
            })
        );
        assert!(store.get(task.id).unwrap().reminder_sent);

        let published = broker.published(QUEUE);
        assert_eq!(published.len(), 1);
        assert!(published[0].persistent);
        assert_eq!(published[0].content_type.as_deref(), Some("application/json"));

        let message = ReminderMessage::decode(&published[0].body).unwrap();
        assert_eq!(message.task_id(), task.id);
        assert_eq!(message.title(), "Submit report");
        assert_eq!(message.user_email(), "dana@example.com");
        assert_eq!(message.sent_at(), now());

        // second pass: nothing left to do
        assert_eq!(scanner.scan_and_dispatch().await.unwrap(), ScanOutcome::Idle);
        assert_eq!(broker.published(QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn already_reminded_and_future_tasks_are_left_alone() {
        let store = InMemoryTaskStore::new();
        store.insert(due_yesterday("reminded").reminder_already_sent());
        store.insert(due_yesterday("done").completed());
        store.insert(NewTask::new("future", Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()));
        let broker = InMemoryBroker::new();
        let scanner = scanner(Arc::new(store), Arc::new(broker.clone()));

        assert_eq!(scanner.scan_and_dispatch().await.unwrap(), ScanOutcome::Idle);
        assert!(broker.published(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn idle_scan_never_touches_the_queue() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let scanner = scanner(Arc::new(InMemoryTaskStore::new()), Arc::new(broker.clone()));

        assert_eq!(scanner.scan_and_dispatch().await.unwrap(), ScanOutcome::Idle);
        assert_eq!(broker.connection_attempts(), 0);
    }

    #[tokio::test]
    async fn every_eligible_task_gets_exactly_one_message() {
        let store = InMemoryTaskStore::new();
        let ids: Vec<TaskId> = (0..5)
            .map(|i| store.insert(due_yesterday(&format!("task {i}"))).id)
            .collect();
        let broker = InMemoryBroker::new();
        let scanner = scanner(Arc::new(store.clone()), Arc::new(broker.clone()));

        scanner.scan_and_dispatch().await.unwrap();

        let mut sent: Vec<TaskId> = decoded(&broker).iter().map(|m| m.task_id()).collect();
        sent.sort();
        assert_eq!(sent, ids);
        assert!(store.all().iter().all(|row| row.reminder_sent));
    }

    /// Lets a test run a foreign write between the read and the mark.
    struct InterferingStore {
        inner: InMemoryTaskStore,
        on_read: Mutex<Option<Box<dyn FnOnce(&InMemoryTaskStore) + Send>>>,
    }

    struct InterferingHandle {
        inner: InMemoryTaskStore,
        hook: Option<Box<dyn FnOnce(&InMemoryTaskStore) + Send>>,
    }

    #[async_trait]
    impl TaskStoreFactory for InterferingStore {
        async fn open(&self) -> Result<Box<dyn TaskStore>, StoreError> {
            let hook = self.on_read.lock().unwrap().take();
            Ok(Box::new(InterferingHandle {
                inner: self.inner.clone(),
                hook,
            }))
        }
    }

    #[async_trait]
    impl TaskStore for InterferingHandle {
        async fn find_eligible_for_reminder(
            &mut self,
            now: DateTime<Utc>,
        ) -> Result<Vec<TaskRef>, StoreError> {
            let rows = self.inner.find_eligible_for_reminder(now).await?;
            if let Some(hook) = self.hook.take() {
                hook(&self.inner);
            }
            Ok(rows)
        }

        async fn update_reminder_sent(
            &mut self,
            task_id: TaskId,
            expected: RowVersion,
        ) -> Result<MarkOutcome, StoreError> {
            self.inner.update_reminder_sent(task_id, expected).await
        }

        async fn insert_task(&mut self, task: NewTask) -> Result<TaskRecord, StoreError> {
            self.inner.insert_task(task).await
        }

        async fn get_task(&mut self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
            self.inner.get_task(task_id).await
        }
    }

    #[tokio::test]
    async fn conflicting_row_is_still_published_and_others_are_marked() {
        let store = InMemoryTaskStore::new();
        let edited = store.insert(due_yesterday("edited elsewhere"));
        let plain = store.insert(due_yesterday("plain"));
        let edited_id = edited.id;

        let factory = InterferingStore {
            inner: store.clone(),
            on_read: Mutex::new(Some(Box::new(move |s: &InMemoryTaskStore| {
                s.update_with(edited_id, |row| row.title = "edited elsewhere (v2)".to_string());
            }))),
        };
        let broker = InMemoryBroker::new();
        let scanner = scanner(Arc::new(factory), Arc::new(broker.clone()));

        let outcome = scanner.scan_and_dispatch().await.unwrap();
        assert_eq!(
            outcome,
            ScanOutcome::Dispatched(ScanReport {
                selected: 2,
                published: 2,
                marked: 1,
                conflicts: vec![edited.id],
            })
        );

        // published anyway: duplicates are acceptable, loss is not
        let sent: Vec<TaskId> = decoded(&broker).iter().map(|m| m.task_id()).collect();
        assert!(sent.contains(&edited.id));
        assert!(store.get(plain.id).unwrap().reminder_sent);
        assert!(!store.get(edited.id).unwrap().reminder_sent);

        // the next scan reads the row fresh and it is still eligible
        let again = scanner.scan_and_dispatch().await.unwrap();
        assert_eq!(
            again,
            ScanOutcome::Dispatched(ScanReport {
                selected: 1,
                published: 1,
                marked: 1,
                conflicts: vec![],
            })
        );
        assert!(store.get(edited.id).unwrap().reminder_sent);
    }

    #[tokio::test]
    async fn conflict_from_a_completing_writer_is_not_retried() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(due_yesterday("finished meanwhile"));
        let id = task.id;
        let factory = InterferingStore {
            inner: store.clone(),
            on_read: Mutex::new(Some(Box::new(move |s: &InMemoryTaskStore| {
                s.update_with(id, |row| row.is_completed = true);
            }))),
        };
        let broker = InMemoryBroker::new();
        let scanner = scanner(Arc::new(factory), Arc::new(broker.clone()));

        scanner.scan_and_dispatch().await.unwrap();
        assert_eq!(scanner.scan_and_dispatch().await.unwrap(), ScanOutcome::Idle);
        assert_eq!(broker.published(QUEUE).len(), 1);
    }

    /// Connector whose channels refuse to publish after `budget` messages.
    struct FlakyConnector {
        broker: InMemoryBroker,
        budget: usize,
    }

    struct FlakyConnection {
        inner: Box<dyn QueueConnection>,
        budget: usize,
    }

    struct FlakyChannel {
        inner: Box<dyn QueueChannel>,
        budget: usize,
    }

    #[async_trait]
    impl QueueConnector for FlakyConnector {
        async fn connect(&self) -> Result<Box<dyn QueueConnection>, QueueError> {
            Ok(Box::new(FlakyConnection {
                inner: self.broker.connect().await?,
                budget: self.budget,
            }))
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    #[async_trait]
    impl QueueConnection for FlakyConnection {
        async fn open_channel(&mut self) -> Result<Box<dyn QueueChannel>, QueueError> {
            Ok(Box::new(FlakyChannel {
                inner: self.inner.open_channel().await?,
                budget: self.budget,
            }))
        }

        async fn close(self: Box<Self>) -> Result<(), QueueError> {
            self.inner.close().await
        }
    }

    #[async_trait]
    impl QueueChannel for FlakyChannel {
        fn id(&self) -> crate::domain::ChannelId {
            self.inner.id()
        }

        async fn declare_durable_queue(&mut self, name: &str) -> Result<(), QueueError> {
            self.inner.declare_durable_queue(name).await
        }

        async fn set_prefetch(&mut self, count: u16) -> Result<(), QueueError> {
            self.inner.set_prefetch(count).await
        }

        async fn publish(&mut self, queue: &str, message: OutboundMessage) -> Result<(), QueueError> {
            if self.budget == 0 {
                return Err(QueueError::ConnectionClosed);
            }
            self.budget -= 1;
            self.inner.publish(queue, message).await
        }

        async fn consume(&mut self, queue: &str) -> Result<(), QueueError> {
            self.inner.consume(queue).await
        }

        async fn next_delivery(&mut self) -> Result<crate::ports::Delivery, QueueError> {
            self.inner.next_delivery().await
        }

        async fn ack(&mut self, tag: crate::domain::DeliveryTag) -> Result<(), QueueError> {
            self.inner.ack(tag).await
        }

        async fn nack(
            &mut self,
            tag: crate::domain::DeliveryTag,
            requeue: bool,
        ) -> Result<(), QueueError> {
            self.inner.nack(tag, requeue).await
        }

        async fn close(self: Box<Self>) -> Result<(), QueueError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn publish_failure_marks_only_what_was_published() {
        let store = InMemoryTaskStore::new();
        let first = store.insert(due_yesterday("first"));
        let second = store.insert(due_yesterday("second"));
        let broker = InMemoryBroker::new();
        let scanner = scanner(
            Arc::new(store.clone()),
            Arc::new(FlakyConnector {
                broker: broker.clone(),
                budget: 1,
            }),
        );

        let err = scanner.scan_and_dispatch().await.unwrap_err();
        assert!(matches!(err, ScanError::Queue(QueueError::ConnectionClosed)));
        assert!(err.kind().is_transient());

        assert_eq!(broker.published(QUEUE).len(), 1);
        assert!(store.get(first.id).unwrap().reminder_sent);
        assert!(!store.get(second.id).unwrap().reminder_sent);
    }

    #[tokio::test]
    async fn queue_outage_leaves_tasks_eligible() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(due_yesterday("waiting"));
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let scanner = scanner(Arc::new(store.clone()), Arc::new(broker.clone()));

        let err = scanner.scan_and_dispatch().await.unwrap_err();
        assert!(matches!(err, ScanError::Queue(QueueError::Unavailable(_))));
        assert!(!store.get(task.id).unwrap().reminder_sent);

        broker.set_online(true);
        scanner.scan_and_dispatch().await.unwrap();
        assert!(store.get(task.id).unwrap().reminder_sent);
    }

    #[tokio::test]
    async fn store_outage_is_a_transient_error() {
        let store = InMemoryTaskStore::new();
        store.set_available(false);
        let scanner = scanner(Arc::new(store), Arc::new(InMemoryBroker::new()));

        let err = scanner.scan_and_dispatch().await.unwrap_err();
        assert!(matches!(err, ScanError::Store(StoreError::Unavailable(_))));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn concurrent_scanners_mark_each_task_once() {
        let store = InMemoryTaskStore::new();
        for i in 0..10 {
            store.insert(due_yesterday(&format!("task {i}")));
        }
        let broker = InMemoryBroker::new();
        let a = scanner(Arc::new(store.clone()), Arc::new(broker.clone()));
        let b = scanner(Arc::new(store.clone()), Arc::new(broker.clone()));

        let (ra, rb) = tokio::join!(a.scan_and_dispatch(), b.scan_and_dispatch());
        let marked = |o: ScanOutcome| match o {
            ScanOutcome::Dispatched(r) => r.marked,
            ScanOutcome::Idle => 0,
        };
        assert_eq!(marked(ra.unwrap()) + marked(rb.unwrap()), 10);
        assert!(store.all().iter().all(|row| row.reminder_sent));
        assert!(broker.published(QUEUE).len() >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn run_scans_immediately_then_on_every_tick() {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        let clock = Arc::new(FixedClock::new(now()));
        let scanner = DueDateScanner::new(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            clock.clone(),
            QUEUE,
            Duration::from_secs(60),
        );
        store.insert(due_yesterday("first"));

        let (trigger, shutdown) = shutdown::channel();
        let handle = tokio::spawn(async move { scanner.run(shutdown).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.published(QUEUE).len(), 1);

        store.insert(due_yesterday("second"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.published(QUEUE).len(), 2);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_clamped_and_runs() {
        let store = InMemoryTaskStore::new();
        let broker = InMemoryBroker::new();
        let scanner = DueDateScanner::new(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            Arc::new(FixedClock::new(now())),
            QUEUE,
            Duration::ZERO,
        );
        assert_eq!(scanner.interval(), MIN_INTERVAL);
        store.insert(due_yesterday("tight loop"));

        let (trigger, shutdown) = shutdown::channel();
        let handle = tokio::spawn(async move { scanner.run(shutdown).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.published(QUEUE).len(), 1);

        trigger.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_survives_failing_scans() {
        let store = InMemoryTaskStore::new();
        store.insert(due_yesterday("patient"));
        store.set_available(false);
        let broker = InMemoryBroker::new();
        let scanner = scanner(Arc::new(store.clone()), Arc::new(broker.clone()));

        let (trigger, shutdown) = shutdown::channel();
        let handle = tokio::spawn(async move { scanner.run(shutdown).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(broker.published(QUEUE).is_empty());

        store.set_available(true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.published(QUEUE).len(), 1);

        drop(trigger);
        handle.await.unwrap();
    }
}
