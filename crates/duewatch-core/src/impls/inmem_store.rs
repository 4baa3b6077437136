//! InMemoryTaskStore - 開発用・テスト用の task table
//!
//! # 実装詳細
//! - `BTreeMap<TaskId, TaskRecord>` behind a `std::sync::Mutex`; no lock is
//!   held across an `.await`.
//! - One store-wide version counter, bumped on every row write (like a
//!   database rowversion column).
//! - Cloning the store clones the handle, not the data: every handle the
//!   factory returns sees the same rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::domain::{NewTask, RowVersion, TaskId, TaskRecord, TaskRef};
use crate::ports::{MarkOutcome, StoreError, TaskStore, TaskStoreFactory};

#[derive(Debug)]
struct StoreState {
    rows: BTreeMap<TaskId, TaskRecord>,
    next_id: i64,
    last_version: u64,
    available: bool,
}

impl StoreState {
    fn bump_version(&mut self) -> RowVersion {
        self.last_version += 1;
        RowVersion::new(self.last_version)
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                rows: BTreeMap::new(),
                next_id: 1,
                last_version: 0,
                available: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_available(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        let state = self.lock();
        if !state.available {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(state)
    }

    /// Simulate the database going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn insert(&self, task: NewTask) -> TaskRecord {
        let mut state = self.lock();
        let id = TaskId::new(state.next_id);
        state.next_id += 1;
        let row_version = state.bump_version();
        let record = TaskRecord {
            id,
            title: task.title,
            description: task.description,
            due_at: task.due_at,
            user_full_name: task.user_full_name,
            user_telephone: task.user_telephone,
            user_email: task.user_email,
            is_completed: task.is_completed,
            completed_at: task.is_completed.then(Utc::now),
            reminder_sent: task.reminder_sent,
            created_at: Utc::now(),
            updated_at: None,
            row_version,
        };
        state.rows.insert(id, record.clone());
        record
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.lock().rows.get(&task_id).cloned()
    }

    pub fn all(&self) -> Vec<TaskRecord> {
        self.lock().rows.values().cloned().collect()
    }

    /// Apply an external write (what the CRUD service would do).
    ///
    /// Bumps the row version. Returns `false` if the row does not exist.
    pub fn update_with(&self, task_id: TaskId, f: impl FnOnce(&mut TaskRecord)) -> bool {
        let mut state = self.lock();
        let version = state.bump_version();
        let Some(row) = state.rows.get_mut(&task_id) else {
            return false;
        };
        f(row);
        row.updated_at = Some(Utc::now());
        row.row_version = version;
        true
    }

    fn eligible(&self, now: DateTime<Utc>) -> Result<Vec<TaskRef>, StoreError> {
        let state = self.lock_available()?;
        Ok(state
            .rows
            .values()
            .filter(|row| row.is_due_for_reminder(now))
            .map(TaskRecord::to_ref)
            .collect())
    }

    fn mark(&self, task_id: TaskId, expected: RowVersion) -> Result<MarkOutcome, StoreError> {
        let mut state = self.lock_available()?;
        match state.rows.get(&task_id) {
            Some(row) if row.row_version == expected => {}
            _ => return Ok(MarkOutcome::Conflict),
        }
        let version = state.bump_version();
        if let Some(row) = state.rows.get_mut(&task_id) {
            row.reminder_sent = true;
            row.row_version = version;
        }
        Ok(MarkOutcome::Marked)
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn find_eligible_for_reminder(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRef>, StoreError> {
        self.eligible(now)
    }

    async fn update_reminder_sent(
        &mut self,
        task_id: TaskId,
        expected: RowVersion,
    ) -> Result<MarkOutcome, StoreError> {
        self.mark(task_id, expected)
    }

    async fn insert_task(&mut self, task: NewTask) -> Result<TaskRecord, StoreError> {
        drop(self.lock_available()?);
        Ok(self.insert(task))
    }

    async fn get_task(&mut self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.lock_available()?;
        Ok(state.rows.get(&task_id).cloned())
    }
}

#[async_trait]
impl TaskStoreFactory for InMemoryTaskStore {
    async fn open(&self) -> Result<Box<dyn TaskStore>, StoreError> {
        drop(self.lock_available()?);
        Ok(Box::new(self.clone()))
    }
}
