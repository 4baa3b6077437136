//! Reminder sinks: where a decoded reminder ends up.

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

use crate::domain::ReminderMessage;
use crate::ports::{ReminderSink, SinkError};

/// Writes each reminder to the log at `warn`, so it stands out among the
/// pipeline's `info` chatter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReminderSink;

#[async_trait]
impl ReminderSink for LogReminderSink {
    async fn deliver(&self, reminder: &ReminderMessage) -> Result<(), SinkError> {
        tracing::warn!(
            task_id = %reminder.task_id(),
            title = reminder.title(),
            due_date = %reminder.due_date().to_rfc3339(),
            user = reminder.user_full_name(),
            email = reminder.user_email(),
            "Hi your Task is due {{Task {}}} - ID: {}, Due: {}, Assigned to: {} ({})",
            reminder.title(),
            reminder.task_id(),
            reminder.due_date().format("%Y-%m-%d %H:%M UTC"),
            reminder.user_full_name(),
            reminder.user_email(),
        );
        Ok(())
    }
}

/// Keeps every reminder in memory; can be told to reject the next few.
#[derive(Debug, Default)]
pub struct RecordingReminderSink {
    state: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    received: Vec<ReminderMessage>,
    reject_next: usize,
    rejected: usize,
}

impl RecordingReminderSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` deliveries with [`SinkError::Rejected`].
    pub fn reject_next(&self, n: usize) {
        self.lock().reject_next = n;
    }

    pub fn received(&self) -> Vec<ReminderMessage> {
        self.lock().received.clone()
    }

    pub fn rejected(&self) -> usize {
        self.lock().rejected
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ReminderSink for RecordingReminderSink {
    async fn deliver(&self, reminder: &ReminderMessage) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.reject_next > 0 {
            state.reject_next -= 1;
            state.rejected += 1;
            return Err(SinkError::Rejected(format!(
                "{} refused by recording sink",
                reminder.task_id()
            )));
        }
        state.received.push(reminder.clone());
        Ok(())
    }
}
