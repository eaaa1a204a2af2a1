//! Durable task queue
//!
//! Tasks live in the `tasks` table next to the rest of the state:
//!
//! ```text
//! pending --dequeue--> active --complete--> completed
//!    ^                   |
//!    +------retry--------+--archive--> archived
//! ```
//!
//! Finished rows are kept for the retention of their kind and purged
//! afterwards. Rows left `active` by a crashed process are put back to
//! `pending` at start-up.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;

use super::tasks::Task;
use crate::data::EntityId;
use crate::error::AppError;
use crate::metrics::TASKS_ENQUEUED_TOTAL;

/// A task claimed by a consumer
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedTask {
    pub id: String,
    pub kind: String,
    pub queue: String,
    pub payload: Vec<u8>,
    /// Number of executions so far, this one included
    pub attempt: i64,
    pub max_retry: i64,
    pub timeout_secs: i64,
}

impl QueuedTask {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1) as u64)
    }

    /// Whether another execution is allowed after this one fails.
    pub fn can_retry(&self) -> bool {
        self.attempt <= self.max_retry
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Store a task; returns its id.
    async fn enqueue(&self, task: &Task) -> Result<String, AppError>;

    /// Claim the next runnable task, if any.
    async fn dequeue(&self) -> Result<Option<QueuedTask>, AppError>;

    async fn complete(&self, task: &QueuedTask) -> Result<(), AppError>;

    /// Schedule another execution after `delay`.
    async fn retry(&self, task: &QueuedTask, error: &str, delay: Duration) -> Result<(), AppError>;

    /// Give up on the task.
    async fn archive(&self, task: &QueuedTask, error: &str) -> Result<(), AppError>;
}

/// Task counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub active: i64,
    pub completed: i64,
    pub archived: i64,
}

/// [`TaskQueue`] stored in SQLite
#[derive(Clone)]
pub struct SqliteTaskQueue {
    pool: SqlitePool,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl SqliteTaskQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Put tasks left `active` by a previous process back in line.
    pub async fn recover_stale(&self) -> Result<u64, AppError> {
        let result = sqlx::query("UPDATE tasks SET state = 'pending' WHERE state = 'active'")
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            tracing::warn!(count = result.rows_affected(), "recovered interrupted tasks");
        }
        Ok(result.rows_affected())
    }

    /// Drop finished tasks whose retention has elapsed.
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE state IN ('completed', 'archived')
              AND finished_at + retention_secs * 1000 <= ?
            "#,
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats, AppError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            match state.as_str() {
                "pending" => stats.pending = count,
                "active" => stats.active = count,
                "completed" => stats.completed = count,
                "archived" => stats.archived = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn finish(&self, task: &QueuedTask, state: &str, error: Option<&str>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE tasks SET state = ?, last_error = COALESCE(?, last_error), finished_at = ? WHERE id = ?",
        )
        .bind(state)
        .bind(error)
        .bind(now_millis())
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, task: &Task) -> Result<String, AppError> {
        let payload = task
            .encode()
            .map_err(|e| AppError::Queue(format!("unable to encode {} task: {}", task.kind(), e)))?;
        let options = task.options();
        let id = EntityId::new().0;
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO tasks (id, kind, queue, payload, max_retry, timeout_secs, retention_secs,
                               next_attempt_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(task.kind())
        .bind(options.queue)
        .bind(payload)
        .bind(i64::from(options.max_retry))
        .bind(options.timeout.as_secs() as i64)
        .bind(options.retention.as_secs() as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        TASKS_ENQUEUED_TOTAL.with_label_values(&[task.kind()]).inc();
        tracing::debug!(task_id = %id, kind = task.kind(), trace_id = task.trace_id(), "task enqueued");
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, AppError> {
        let task = sqlx::query_as::<_, QueuedTask>(
            r#"
            UPDATE tasks SET state = 'active', attempt = attempt + 1
            WHERE id = (
                SELECT id FROM tasks
                WHERE state = 'pending' AND next_attempt_at <= ?
                ORDER BY next_attempt_at, created_at
                LIMIT 1
            )
            RETURNING id, kind, queue, payload, attempt, max_retry, timeout_secs
            "#,
        )
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn complete(&self, task: &QueuedTask) -> Result<(), AppError> {
        self.finish(task, "completed", None).await
    }

    async fn retry(&self, task: &QueuedTask, error: &str, delay: Duration) -> Result<(), AppError> {
        let next_attempt_at = now_millis() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        sqlx::query(
            "UPDATE tasks SET state = 'pending', last_error = ?, next_attempt_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(next_attempt_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn archive(&self, task: &QueuedTask, error: &str) -> Result<(), AppError> {
        self.finish(task, "archived", Some(error)).await
    }
}
