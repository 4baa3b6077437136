//! TaskStore port - the persistent task table (source of truth).
//!
//! The reminder pipeline only reads eligible rows and flips `reminder_sent`.
//! Serialization between concurrent scanners is the row-version precondition
//! on that flip; there is no application-level lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ErrorKind, NewTask, RowVersion, TaskId, TaskRecord, TaskRef};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("task store backend error: {0}")]
    Backend(String),

    #[error("corrupt row for {task_id}: {reason}")]
    CorruptRow { task_id: TaskId, reason: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unavailable(_) | StoreError::Backend(_) => ErrorKind::Transient,
            StoreError::CorruptRow { .. } => ErrorKind::Permanent,
        }
    }
}

/// Result of a version-checked `reminder_sent` update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkOutcome {
    /// The row still had the expected version and is now marked sent.
    Marked,
    /// The row changed (or disappeared) since it was read; nothing written.
    Conflict,
}

/// A scoped handle on the task table.
///
/// # 設計原則
/// - Handles are short-lived: acquire one per scan via [`TaskStoreFactory`],
///   use it, drop it.
/// - `update_reminder_sent` never writes without the version check.
#[async_trait]
pub trait TaskStore: Send {
    /// Rows where `due_at < now AND NOT is_completed AND NOT reminder_sent`.
    async fn find_eligible_for_reminder(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRef>, StoreError>;

    /// Set `reminder_sent = true` if the row still carries `expected`.
    async fn update_reminder_sent(
        &mut self,
        task_id: TaskId,
        expected: RowVersion,
    ) -> Result<MarkOutcome, StoreError>;

    /// Batch form of [`TaskStore::update_reminder_sent`].
    ///
    /// Every row is checked on its own; a conflicting row never undoes the
    /// rows that were marked.
    async fn mark_reminders_sent(
        &mut self,
        claims: &[(TaskId, RowVersion)],
    ) -> Result<Vec<(TaskId, MarkOutcome)>, StoreError> {
        let mut outcomes = Vec::with_capacity(claims.len());
        for &(task_id, expected) in claims {
            let outcome = self.update_reminder_sent(task_id, expected).await?;
            outcomes.push((task_id, outcome));
        }
        Ok(outcomes)
    }

    async fn insert_task(&mut self, task: NewTask) -> Result<TaskRecord, StoreError>;

    async fn get_task(&mut self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError>;
}

/// Hands out fresh [`TaskStore`] handles.
#[async_trait]
pub trait TaskStoreFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn TaskStore>, StoreError>;
}
