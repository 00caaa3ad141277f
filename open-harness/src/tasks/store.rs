//! SQLite-backed task store.
//!
//! Single table, WAL journaling, one writer. Status transitions are
//! enforced in SQL: a task never moves backward (`running → queued` is
//! impossible by construction).

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::message::epoch_secs;

/// Errors from the task store.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    /// Underlying SQLite failure.
    #[error("task store: {0}")]
    Storage(String),
    /// An update targeted a task in the wrong state.
    #[error("task {id}: invalid transition to {to}")]
    InvalidTransition {
        /// Task id.
        id: String,
        /// Attempted target state.
        to: &'static str,
    },
}

impl From<rusqlite::Error> for TaskStoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting in the FIFO queue.
    Queued,
    /// Picked up by the worker.
    Running,
    /// Finished with a successful goal outcome.
    Succeeded,
    /// Finished with a failure.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Stable string form, stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(text: &str) -> Self {
        match text {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted background task.
#[derive(Debug, Clone)]
pub struct Task {
    /// Short hex id.
    pub id: String,
    /// Goal text.
    pub goal: String,
    /// Current status.
    pub status: TaskStatus,
    /// Submission time (epoch seconds).
    pub created_at: i64,
    /// Pickup time.
    pub started_at: Option<i64>,
    /// Completion time.
    pub finished_at: Option<i64>,
    /// Per-task log file.
    pub log_path: String,
    /// Final summary, for terminal states.
    pub result: Option<String>,
}

/// The store. Cloneable; clones share one connection.
#[derive(Debug, Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TaskStoreError> {
        Self::from_connection(Connection::open(path.as_ref())?)
    }

    /// Ephemeral in-memory store for tests.
    pub fn in_memory() -> Result<Self, TaskStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, TaskStoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id          TEXT PRIMARY KEY,
                goal        TEXT NOT NULL,
                status      TEXT NOT NULL
                            CHECK (status IN ('queued','running','succeeded','failed','cancelled')),
                created_at  INTEGER NOT NULL,
                started_at  INTEGER,
                finished_at INTEGER,
                log_path    TEXT NOT NULL,
                result      TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status, created_at);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, TaskStoreError> {
        self.conn
            .lock()
            .map_err(|_| TaskStoreError::Storage("connection lock poisoned".into()))
    }

    /// Insert a new queued task and return it.
    pub fn submit(&self, goal: &str, log_path: &str) -> Result<Task, TaskStoreError> {
        let id = short_id();
        let created_at = epoch_secs() as i64;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (id, goal, status, created_at, log_path)
             VALUES (?1, ?2, 'queued', ?3, ?4)",
            params![id, goal, created_at, log_path],
        )?;
        Ok(Task {
            id,
            goal: goal.to_string(),
            status: TaskStatus::Queued,
            created_at,
            started_at: None,
            finished_at: None,
            log_path: log_path.to_string(),
            result: None,
        })
    }

    /// Crash recovery: any task left `running` by a dead process becomes
    /// `failed`. Returns how many were scrubbed.
    pub fn recover_crashed(&self) -> Result<usize, TaskStoreError> {
        let now = epoch_secs() as i64;
        let conn = self.lock()?;
        let scrubbed = conn.execute(
            "UPDATE tasks SET status = 'failed', finished_at = ?1,
                    result = 'process crashed while this task was running'
             WHERE status = 'running'",
            params![now],
        )?;
        Ok(scrubbed)
    }

    /// The oldest queued task, FIFO by submission time.
    pub fn next_queued(&self) -> Result<Option<Task>, TaskStoreError> {
        let conn = self.lock()?;
        let task = conn
            .query_row(
                "SELECT id, goal, status, created_at, started_at, finished_at, log_path, result
                 FROM tasks WHERE status = 'queued'
                 ORDER BY rowid ASC LIMIT 1",
                [],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Move a queued task to `running`.
    pub fn mark_running(&self, id: &str) -> Result<(), TaskStoreError> {
        let now = epoch_secs() as i64;
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'queued'",
            params![now, id],
        )?;
        if updated == 0 {
            return Err(TaskStoreError::InvalidTransition {
                id: id.to_string(),
                to: "running",
            });
        }
        Ok(())
    }

    /// Move a running task to a terminal state.
    pub fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        result: &str,
    ) -> Result<(), TaskStoreError> {
        debug_assert!(matches!(
            status,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        ));
        let now = epoch_secs() as i64;
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE tasks SET status = ?1, finished_at = ?2, result = ?3
             WHERE id = ?4 AND status IN ('running', 'queued')",
            params![status.as_str(), now, result, id],
        )?;
        if updated == 0 {
            return Err(TaskStoreError::InvalidTransition {
                id: id.to_string(),
                to: status.as_str(),
            });
        }
        Ok(())
    }

    /// All tasks, newest first.
    pub fn list(&self) -> Result<Vec<Task>, TaskStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, goal, status, created_at, started_at, finished_at, log_path, result
             FROM tasks ORDER BY rowid DESC",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// One task by id.
    pub fn get(&self, id: &str) -> Result<Option<Task>, TaskStoreError> {
        let conn = self.lock()?;
        let task = conn
            .query_row(
                "SELECT id, goal, status, created_at, started_at, finished_at, log_path, result
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Number of tasks currently marked running (0 or 1 in a healthy store).
    pub fn running_count(&self) -> Result<usize, TaskStoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        goal: row.get(1)?,
        status: TaskStatus::parse(&row.get::<_, String>(2)?),
        created_at: row.get(3)?,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        log_path: row.get(6)?,
        result: row.get(7)?,
    })
}

/// Short hex id: the first eight hex digits of a v4 uuid.
fn short_id() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..8].to_string()
}
