//! Task consumer
//!
//! Claims tasks from the queue and runs them through a [`Handler`]. A task
//! that cannot be decoded is archived right away; handler failures are
//! retried with exponential backoff while they are transient and the task
//! has attempts left.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::errors::TaskError;
use super::queue::{QueuedTask, TaskQueue};
use super::tasks::Task;
use crate::error::{AppError, panic_message};
use crate::metrics::TASKS_PROCESSED_TOTAL;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<(), TaskError>;
}

pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn Handler>,
    idle_poll: Duration,
    backoff_base: Duration,
}

impl Worker {
    pub fn new(queue: Arc<dyn TaskQueue>, handler: Arc<dyn Handler>, idle_poll: Duration) -> Self {
        Self {
            queue,
            handler,
            idle_poll,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    /// Consume tasks until `shutdown` fires. A running task is allowed to
    /// finish; its own timeout bounds the wait.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::debug!("task worker started");

        while !shutdown.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(processed) => !processed,
                Err(e) => {
                    tracing::error!(error = %e, "task queue unavailable");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_poll) => {}
                }
            }
        }

        tracing::debug!("task worker stopped");
    }

    /// Run the next runnable task, if any.
    ///
    /// Returns whether a task was claimed.
    pub async fn process_next(&self) -> Result<bool, AppError> {
        let Some(queued) = self.queue.dequeue().await? else {
            return Ok(false);
        };

        let task = match Task::decode(&queued.kind, &queued.payload) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id = %queued.id, kind = %queued.kind, error = %e, "dropping malformed task");
                TASKS_PROCESSED_TOTAL
                    .with_label_values(&[queued.kind.as_str(), "malformed"])
                    .inc();
                self.queue.archive(&queued, &e.to_string()).await?;
                return Ok(true);
            }
        };

        let span = tracing::info_span!(
            "task",
            kind = %queued.kind,
            trace_id = %task.trace_id(),
            task_id = %queued.id,
            attempt = queued.attempt,
        );
        async {
            let result = self.execute(&queued, task).await;
            self.settle(&queued, result).await
        }
        .instrument(span)
        .await?;

        Ok(true)
    }

    async fn execute(&self, queued: &QueuedTask, task: Task) -> Result<(), TaskError> {
        let run = AssertUnwindSafe(self.handler.handle(task)).catch_unwind();
        match tokio::time::timeout(queued.timeout(), run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(TaskError::transient(anyhow::anyhow!(
                "task panicked: {}",
                panic_message(panic)
            ))),
            Err(_) => Err(TaskError::transient(anyhow::anyhow!(
                "task timed out after {:?}",
                queued.timeout()
            ))),
        }
    }

    async fn settle(&self, queued: &QueuedTask, result: Result<(), TaskError>) -> Result<(), AppError> {
        let outcome = match result {
            Ok(()) => {
                self.queue.complete(queued).await?;
                tracing::debug!("task completed");
                "completed"
            }
            Err(e) if e.retry && queued.can_retry() => {
                let delay = self.backoff(queued.attempt);
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "task failed, retrying");
                self.queue.retry(queued, &e.to_string(), delay).await?;
                "retried"
            }
            Err(e) if e.retry => {
                tracing::error!(error = %e, "task failed, no retry left");
                self.queue.archive(queued, &e.to_string()).await?;
                "exhausted"
            }
            Err(e) => {
                tracing::error!(error = %e, "task failed permanently");
                self.queue.archive(queued, &e.to_string()).await?;
                "failed"
            }
        };

        TASKS_PROCESSED_TOTAL
            .with_label_values(&[queued.kind.as_str(), outcome])
            .inc();
        Ok(())
    }

    fn backoff(&self, attempt: i64) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(MAX_BACKOFF)
    }
}
