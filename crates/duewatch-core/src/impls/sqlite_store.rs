//! SqliteTaskStore - rusqlite implementation of the task table.
//!
//! # 実装詳細
//! - Schema (`sql/tasks.sql`) is applied on every open; it is idempotent.
//! - `row_version` is bumped by an `AFTER UPDATE` trigger, so writers that
//!   know nothing about it (the CRUD service) still invalidate stale reads.
//! - `rusqlite::Connection` is blocking: calls go through `spawn_blocking`
//!   with the connection behind a `Mutex`.
//! - [`SqliteTaskStoreFactory`] opens one connection per handle, which is
//!   what the scanner asks for on every scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::domain::{NewTask, RowVersion, TaskId, TaskRecord, TaskRef};
use crate::ports::{MarkOutcome, StoreError, TaskStore, TaskStoreFactory};

const SCHEMA: &str = include_str!("sql/tasks.sql");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_COLUMNS: &str = "id, title, description, due_at_ms, user_full_name, user_telephone, \
     user_email, is_completed, completed_at_ms, reminder_sent, created_at_ms, updated_at_ms, \
     row_version";

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("open {}: {e}", path.display())))?;
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("open in-memory database: {e}")))?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(backend)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn find_eligible_for_reminder(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRef>, StoreError> {
        self.run(move |conn| find_eligible(conn, now)).await
    }

    async fn update_reminder_sent(
        &mut self,
        task_id: TaskId,
        expected: RowVersion,
    ) -> Result<MarkOutcome, StoreError> {
        self.run(move |conn| mark_sent(conn, task_id, expected)).await
    }

    async fn mark_reminders_sent(
        &mut self,
        claims: &[(TaskId, RowVersion)],
    ) -> Result<Vec<(TaskId, MarkOutcome)>, StoreError> {
        let claims = claims.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let mut outcomes = Vec::with_capacity(claims.len());
            for (task_id, expected) in claims {
                outcomes.push((task_id, mark_sent(&tx, task_id, expected)?));
            }
            tx.commit().map_err(backend)?;
            Ok(outcomes)
        })
        .await
    }

    async fn insert_task(&mut self, task: NewTask) -> Result<TaskRecord, StoreError> {
        self.run(move |conn| {
            let now = Utc::now().timestamp_millis();
            conn.execute(
                "INSERT INTO tasks (title, description, due_at_ms, user_full_name, user_telephone,
                                    user_email, is_completed, completed_at_ms, reminder_sent, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task.title,
                    task.description,
                    task.due_at.timestamp_millis(),
                    task.user_full_name,
                    task.user_telephone,
                    task.user_email,
                    task.is_completed,
                    task.is_completed.then_some(now),
                    task.reminder_sent,
                    now,
                ],
            )
            .map_err(backend)?;
            let id = TaskId::new(conn.last_insert_rowid());
            get_task(conn, id)?.ok_or_else(|| StoreError::CorruptRow {
                task_id: id,
                reason: "row vanished right after insert".to_string(),
            })
        })
        .await
    }

    async fn get_task(&mut self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.run(move |conn| get_task(conn, task_id)).await
    }
}

fn find_eligible(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<TaskRef>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, due_at_ms, user_full_name, user_email, row_version
             FROM tasks
             WHERE due_at_ms < ?1 AND is_completed = 0 AND reminder_sent = 0
             ORDER BY due_at_ms, id",
        )
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![now.timestamp_millis()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .map_err(backend)?;

    let mut tasks = Vec::new();
    for row in rows {
        let (id, title, due_at_ms, user_full_name, user_email, row_version) =
            row.map_err(backend)?;
        let id = TaskId::new(id);
        let converted = from_millis(id, "due_at_ms", due_at_ms).and_then(|due_at| {
            Ok(TaskRef {
                id,
                title,
                due_at,
                user_full_name,
                user_email,
                row_version: to_row_version(id, row_version)?,
            })
        });
        // one bad row must not hold back the healthy ones
        match converted {
            Ok(task) => tasks.push(task),
            Err(err) => tracing::error!(task_id = %id, error = %err, "skipping unreadable task row"),
        }
    }
    Ok(tasks)
}

fn mark_sent(
    conn: &Connection,
    task_id: TaskId,
    expected: RowVersion,
) -> Result<MarkOutcome, StoreError> {
    let expected = i64::try_from(expected.get()).map_err(|_| StoreError::CorruptRow {
        task_id,
        reason: format!("row version {expected} out of range"),
    })?;
    let changed = conn
        .execute(
            "UPDATE tasks SET reminder_sent = 1 WHERE id = ?1 AND row_version = ?2",
            params![task_id.get(), expected],
        )
        .map_err(backend)?;
    Ok(if changed == 1 {
        MarkOutcome::Marked
    } else {
        MarkOutcome::Conflict
    })
}

fn get_task(conn: &Connection, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id.get()],
            RawTask::from_row,
        )
        .optional()
        .map_err(backend)?;
    raw.map(RawTask::into_record).transpose()
}

/// Row as SQLite hands it back, before timestamp conversion.
struct RawTask {
    id: i64,
    title: String,
    description: Option<String>,
    due_at_ms: i64,
    user_full_name: String,
    user_telephone: String,
    user_email: String,
    is_completed: bool,
    completed_at_ms: Option<i64>,
    reminder_sent: bool,
    created_at_ms: i64,
    updated_at_ms: Option<i64>,
    row_version: i64,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            due_at_ms: row.get(3)?,
            user_full_name: row.get(4)?,
            user_telephone: row.get(5)?,
            user_email: row.get(6)?,
            is_completed: row.get(7)?,
            completed_at_ms: row.get(8)?,
            reminder_sent: row.get(9)?,
            created_at_ms: row.get(10)?,
            updated_at_ms: row.get(11)?,
            row_version: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        let id = TaskId::new(self.id);
        Ok(TaskRecord {
            id,
            title: self.title,
            description: self.description,
            due_at: from_millis(id, "due_at_ms", self.due_at_ms)?,
            user_full_name: self.user_full_name,
            user_telephone: self.user_telephone,
            user_email: self.user_email,
            is_completed: self.is_completed,
            completed_at: self
                .completed_at_ms
                .map(|ms| from_millis(id, "completed_at_ms", ms))
                .transpose()?,
            reminder_sent: self.reminder_sent,
            created_at: from_millis(id, "created_at_ms", self.created_at_ms)?,
            updated_at: self
                .updated_at_ms
                .map(|ms| from_millis(id, "updated_at_ms", ms))
                .transpose()?,
            row_version: to_row_version(id, self.row_version)?,
        })
    }
}

fn from_millis(task_id: TaskId, column: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::CorruptRow {
        task_id,
        reason: format!("{column} = {ms} is not a valid timestamp"),
    })
}

fn to_row_version(task_id: TaskId, raw: i64) -> Result<RowVersion, StoreError> {
    u64::try_from(raw)
        .map(RowVersion::new)
        .map_err(|_| StoreError::CorruptRow {
            task_id,
            reason: format!("negative row_version {raw}"),
        })
}

/// Opens a fresh [`SqliteTaskStore`] per call.
#[derive(Debug, Clone)]
pub struct SqliteTaskStoreFactory {
    path: PathBuf,
}

impl SqliteTaskStoreFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TaskStoreFactory for SqliteTaskStoreFactory {
    async fn open(&self) -> Result<Box<dyn TaskStore>, StoreError> {
        let path = self.path.clone();
        let store = tokio::task::spawn_blocking(move || SqliteTaskStore::open(&path))
            .await
            .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))??;
        Ok(Box::new(store))
    }
}
