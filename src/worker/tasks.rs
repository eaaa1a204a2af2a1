//! Task definitions
//!
//! A task is stored as its kind string plus a JSON payload. Payloads stay
//! minimal: posts travel by id and are rematerialized by the consumer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const KIND_ACCEPT_FOLLOW: &str = "follow:accept";
pub const KIND_REJECT_FOLLOW: &str = "follow:reject";
pub const KIND_SEND_POST: &str = "post:send";

pub const QUEUE_FOLLOWS: &str = "follows";
pub const QUEUE_POSTS: &str = "posts";

/// Payload of an Accept or Reject answer to a Follow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowPayload {
    pub trace_id: String,
    /// Local user being followed
    pub username: String,
    /// The Follow activity as received
    pub activity: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPostPayload {
    pub trace_id: String,
    /// Local username of the author
    pub from: String,
    /// Follower actor IRI
    pub to: String,
    pub post_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    AcceptFollow(FollowPayload),
    RejectFollow(FollowPayload),
    SendPost(SendPostPayload),
}

/// Scheduling options attached to a task at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: &'static str,
    pub max_retry: u32,
    pub timeout: Duration,
    /// How long a finished task is kept before being purged
    pub retention: Duration,
}

const FOLLOW_OPTIONS: TaskOptions = TaskOptions {
    queue: QUEUE_FOLLOWS,
    max_retry: 5,
    timeout: Duration::from_secs(30),
    retention: Duration::from_secs(24 * 60 * 60),
};

const POST_OPTIONS: TaskOptions = TaskOptions {
    queue: QUEUE_POSTS,
    max_retry: 5,
    timeout: Duration::from_secs(10),
    retention: Duration::from_secs(60 * 60),
};

/// Why a stored task could not be turned back into a [`Task`]
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown task kind {0}")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: String,
        source: serde_json::Error,
    },
}

impl Task {
    pub fn accept_follow(trace_id: &str, username: &str, activity: serde_json::Value) -> Self {
        Task::AcceptFollow(FollowPayload {
            trace_id: trace_id.to_string(),
            username: username.to_string(),
            activity,
        })
    }

    pub fn reject_follow(trace_id: &str, username: &str, activity: serde_json::Value) -> Self {
        Task::RejectFollow(FollowPayload {
            trace_id: trace_id.to_string(),
            username: username.to_string(),
            activity,
        })
    }

    pub fn send_post(trace_id: &str, from: &str, to: &str, post_id: &str) -> Self {
        Task::SendPost(SendPostPayload {
            trace_id: trace_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            post_id: post_id.to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::AcceptFollow(_) => KIND_ACCEPT_FOLLOW,
            Task::RejectFollow(_) => KIND_REJECT_FOLLOW,
            Task::SendPost(_) => KIND_SEND_POST,
        }
    }

    pub fn options(&self) -> TaskOptions {
        match self {
            Task::AcceptFollow(_) | Task::RejectFollow(_) => FOLLOW_OPTIONS,
            Task::SendPost(_) => POST_OPTIONS,
        }
    }

    pub fn trace_id(&self) -> &str {
        match self {
            Task::AcceptFollow(payload) | Task::RejectFollow(payload) => &payload.trace_id,
            Task::SendPost(payload) => &payload.trace_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Task::AcceptFollow(payload) | Task::RejectFollow(payload) => serde_json::to_vec(payload),
            Task::SendPost(payload) => serde_json::to_vec(payload),
        }
    }

    pub fn decode(kind: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let malformed = |source| DecodeError::Payload {
            kind: kind.to_string(),
            source,
        };
        match kind {
            KIND_ACCEPT_FOLLOW => serde_json::from_slice(payload)
                .map(Task::AcceptFollow)
                .map_err(malformed),
            KIND_REJECT_FOLLOW => serde_json::from_slice(payload)
                .map(Task::RejectFollow)
                .map_err(malformed),
            KIND_SEND_POST => serde_json::from_slice(payload)
                .map(Task::SendPost)
                .map_err(malformed),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}
