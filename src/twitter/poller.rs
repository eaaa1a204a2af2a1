//! Timeline poller
//!
//! Walks the users that have followers in round robin, one timeline
//! request per tick, and fans every new post out as one `post:send` task
//! per follower. The tick is sized so a full quota window is spread evenly
//! (`period / max_requests`).
//!
//! A user's cursor is the newest post id seen. Users entering the list
//! start from the time they entered it, never from their full history.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::backend::{TimelineOptions, UpstreamError};
use super::client::TwitterClient;
use crate::config::PollerConfig;
use crate::data::{LocalUser, UserRepository};
use crate::error::{AppError, panic_message};
use crate::metrics::{POLL_ITERATIONS_TOTAL, POLLED_USERS, POSTS_DISCOVERED_TOTAL};
use crate::trace::TraceId;
use crate::worker::{Task, TaskQueue};

const TIMELINE_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("unable to list users to poll: {0}")]
    Users(#[source] AppError),

    #[error("unable to fetch timeline of {username}: {source}")]
    Timeline {
        username: String,
        source: UpstreamError,
    },

    #[error("unable to schedule post {post_id}: {source}")]
    Schedule { post_id: String, source: AppError },

    #[error("poll iteration panicked: {0}")]
    Panic(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    SinceId(String),
    StartTime(DateTime<Utc>),
}

/// Result of one iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nobody has followers yet
    NoUsers,
    Polled { username: String, posts: usize },
}

pub struct Poller {
    users: Arc<dyn UserRepository>,
    twitter: Arc<TwitterClient>,
    queue: Arc<dyn TaskQueue>,
    tick: Duration,
    empty_backoff: Duration,
    polled: Vec<LocalUser>,
    index: usize,
    cursors: HashMap<String, Cursor>,
    /// Users without a since-id are polled from here
    started_at: DateTime<Utc>,
}

impl Poller {
    pub fn new(
        users: Arc<dyn UserRepository>,
        twitter: Arc<TwitterClient>,
        queue: Arc<dyn TaskQueue>,
        config: &PollerConfig,
    ) -> Self {
        Self {
            users,
            twitter,
            queue,
            tick: config.tick(),
            empty_backoff: config.empty_backoff(),
            polled: Vec::new(),
            index: 0,
            cursors: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Poll until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            tick_ms = self.tick.as_millis() as u64,
            "starting timeline poller"
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let trace_id = TraceId::new();
            let span = tracing::debug_span!("poll", trace_id = %trace_id);
            let iteration = AssertUnwindSafe(self.poll_once(&trace_id))
                .catch_unwind()
                .instrument(span);

            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = iteration => result.unwrap_or_else(|panic| Err(PollError::Panic(panic_message(panic)))),
            };

            match result {
                Ok(PollOutcome::NoUsers) => {
                    POLL_ITERATIONS_TOTAL.with_label_values(&["idle"]).inc();
                    tracing::debug!("no user to poll, waiting");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.empty_backoff) => {}
                    }
                }
                Ok(PollOutcome::Polled { username, posts }) => {
                    POLL_ITERATIONS_TOTAL.with_label_values(&["polled"]).inc();
                    if posts > 0 {
                        tracing::info!(user = %username, posts, trace_id = %trace_id, "scheduled new posts");
                    }
                }
                Err(error) => {
                    let outcome = if matches!(error, PollError::Panic(_)) { "panic" } else { "error" };
                    POLL_ITERATIONS_TOTAL.with_label_values(&[outcome]).inc();
                    tracing::error!(error = %error, trace_id = %trace_id, "timeline polling failed");
                }
            }
        }

        tracing::info!("stopping timeline poller");
    }

    /// Reload the users to poll. Returns whether there is anyone to poll.
    async fn refresh(&mut self) -> Result<bool, PollError> {
        let users = self.users.get_with_followers().await.map_err(PollError::Users)?;
        let started_at = self.started_at;

        self.cursors
            .retain(|username, _| users.iter().any(|user| &user.username == username));
        for user in &users {
            self.cursors
                .entry(user.username.clone())
                .or_insert(Cursor::StartTime(started_at));
        }

        POLLED_USERS.set(users.len() as i64);
        tracing::trace!(count = users.len(), "refreshed users to poll");
        self.polled = users;
        Ok(!self.polled.is_empty())
    }

    /// Poll the current user. The index only moves past a user once its
    /// timeline was fetched and every post was scheduled.
    async fn poll_once(&mut self, trace_id: &TraceId) -> Result<PollOutcome, PollError> {
        if self.index >= self.polled.len() {
            self.index = 0;
            if !self.refresh().await? {
                return Ok(PollOutcome::NoUsers);
            }
        }

        let user = self.polled[self.index].clone();
        let mut options = TimelineOptions {
            max_results: TIMELINE_PAGE_SIZE,
            ..Default::default()
        };
        match self.cursors.get(&user.username) {
            Some(Cursor::SinceId(since_id)) => options.since_id = Some(since_id.clone()),
            Some(Cursor::StartTime(start_time)) => options.start_time = Some(*start_time),
            None => options.start_time = Some(self.started_at),
        }

        tracing::trace!(user = %user.username, since_id = ?options.since_id, "fetching timeline");
        let timeline = self
            .twitter
            .timeline(user.upstream_id, &options)
            .await
            .map_err(|source| PollError::Timeline {
                username: user.username.clone(),
                source,
            })?;

        for post in &timeline.data {
            self.schedule(&user, &post.id, trace_id).await?;
            POSTS_DISCOVERED_TOTAL.inc();
        }

        let newest = timeline
            .meta
            .newest_id
            .clone()
            .or_else(|| timeline.data.first().map(|post| post.id.clone()));
        if let Some(newest) = newest {
            self.cursors
                .insert(user.username.clone(), Cursor::SinceId(newest));
        }

        self.index += 1;
        Ok(PollOutcome::Polled {
            username: user.username,
            posts: timeline.data.len(),
        })
    }

    async fn schedule(
        &self,
        user: &LocalUser,
        post_id: &str,
        trace_id: &TraceId,
    ) -> Result<(), PollError> {
        let schedule_error = |source| PollError::Schedule {
            post_id: post_id.to_string(),
            source,
        };

        let followers = self.users.get_followers(user).await.map_err(schedule_error)?;
        for follower in followers {
            let task = Task::send_post(trace_id.as_str(), &user.username, &follower.url, post_id);
            self.queue.enqueue(&task).await.map_err(schedule_error)?;
        }
        Ok(())
    }
}
