//! Task rows as the reminder pipeline sees them.
//!
//! The CRUD service owns the task table; this module only models the columns
//! the reminder pipeline reads, plus the concurrency token every write bumps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TaskId;

/// Concurrency token assigned by the store on every row write.
///
/// Callers only compare tokens for equality; the numeric value carries no
/// meaning outside the store that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowVersion(u64);

impl RowVersion {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The token a store assigns on the next write.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for RowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Eligibility predicate for reminder dispatch.
///
/// A task is eligible when it is overdue, not completed, and no reminder has
/// been sent for it yet. Stores that filter in their own query language must
/// express exactly this predicate.
pub fn is_due_for_reminder(
    due_at: DateTime<Utc>,
    is_completed: bool,
    reminder_sent: bool,
    now: DateTime<Utc>,
) -> bool {
    due_at < now && !is_completed && !reminder_sent
}

/// A full task row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub title: String,
    pub description: Option<String>,
    pub due_at: DateTime<Utc>,

    pub user_full_name: String,
    pub user_telephone: String,
    pub user_email: String,

    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,

    /// Flips false -> true once, after the reminder was published.
    pub reminder_sent: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,

    pub row_version: RowVersion,
}

impl TaskRecord {
    pub fn is_due_for_reminder(&self, now: DateTime<Utc>) -> bool {
        is_due_for_reminder(self.due_at, self.is_completed, self.reminder_sent, now)
    }

    /// Projection handed to the scanner.
    pub fn to_ref(&self) -> TaskRef {
        TaskRef {
            id: self.id,
            title: self.title.clone(),
            due_at: self.due_at,
            user_full_name: self.user_full_name.clone(),
            user_email: self.user_email.clone(),
            row_version: self.row_version,
        }
    }
}

/// What the scanner needs to publish a reminder and claim the row afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub id: TaskId,
    pub title: String,
    pub due_at: DateTime<Utc>,
    pub user_full_name: String,
    pub user_email: String,
    /// Token read together with the row; the precondition for marking it sent.
    pub row_version: RowVersion,
}

/// Insert form of a task (seeding and tests; CRUD lives elsewhere).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub due_at: DateTime<Utc>,
    pub user_full_name: String,
    pub user_telephone: String,
    pub user_email: String,
    pub is_completed: bool,
    pub reminder_sent: bool,
}

impl NewTask {
    pub fn new(title: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            description: None,
            due_at,
            user_full_name: String::new(),
            user_telephone: String::new(),
            user_email: String::new(),
            is_completed: false,
            reminder_sent: false,
        }
    }

    pub fn assigned_to(mut self, full_name: impl Into<String>, email: impl Into<String>) -> Self {
        self.user_full_name = full_name.into();
        self.user_email = email.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_telephone(mut self, telephone: impl Into<String>) -> Self {
        self.user_telephone = telephone.into();
        self
    }

    pub fn completed(mut self) -> Self {
        self.is_completed = true;
        self
    }

    pub fn reminder_already_sent(mut self) -> Self {
        self.reminder_sent = true;
        self
    }
}
