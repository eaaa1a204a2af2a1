use thiserror::Error;

/// Failure of a task handler
///
/// `retry` tells the consumer whether running the task again may succeed.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct TaskError {
    source: anyhow::Error,
    pub retry: bool,
}

impl TaskError {
    /// A failure that will not go away by retrying.
    pub fn permanent(source: impl Into<anyhow::Error>) -> Self {
        Self {
            source: source.into(),
            retry: false,
        }
    }

    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        Self {
            source: source.into(),
            retry: true,
        }
    }

    pub fn new(source: impl Into<anyhow::Error>, retry: bool) -> Self {
        Self {
            source: source.into(),
            retry,
        }
    }

    /// Add context to the underlying error, keeping the retry decision.
    pub fn context(self, context: &'static str) -> Self {
        Self {
            source: self.source.context(context),
            retry: self.retry,
        }
    }
}
