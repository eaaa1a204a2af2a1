//! Upstream API surface
//!
//! [`Backend`] is the seam towards the social API. The raw response types
//! mirror the v2 JSON payloads; everything is optional on the wire so
//! they default liberally.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Problem type returned for unknown users and posts
pub const PROBLEM_NOT_FOUND: &str = "https://api.twitter.com/2/problems/resource-not-found";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream answered HTTP {status}")]
    Status { status: u16 },

    #[error("upstream rate limit reached for {0}")]
    RateLimited(&'static str),

    #[error("upstream user {0} not found")]
    UserNotFound(String),

    #[error("unexpected upstream response: {0}")]
    Invalid(String),
}

impl UpstreamError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Transport(_) | UpstreamError::RateLimited(_) => true,
            UpstreamError::Status { status } => *status >= 500,
            UpstreamError::UserNotFound(_) | UpstreamError::Invalid(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiProblem {
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublicMetrics {
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub following_count: u64,
    #[serde(default)]
    pub tweet_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub public_metrics: Option<PublicMetrics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReference {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAttachments {
    #[serde(default)]
    pub media_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPost {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub possibly_sensitive: bool,
    #[serde(default)]
    pub referenced_tweets: Vec<RawReference>,
    #[serde(default)]
    pub attachments: Option<RawAttachments>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMedia {
    pub media_key: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Includes {
    #[serde(default)]
    pub media: Vec<RawMedia>,
    #[serde(default)]
    pub users: Vec<RawUser>,
    #[serde(default)]
    pub tweets: Vec<RawPost>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserLookupResponse {
    #[serde(default)]
    pub data: Vec<RawUser>,
    #[serde(default)]
    pub errors: Vec<ApiProblem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineMeta {
    #[serde(default)]
    pub result_count: u32,
    #[serde(default)]
    pub newest_id: Option<String>,
    #[serde(default)]
    pub oldest_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineResponse {
    #[serde(default)]
    pub data: Vec<RawPost>,
    #[serde(default)]
    pub meta: TimelineMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostLookupResponse {
    #[serde(default)]
    pub data: Vec<RawPost>,
    #[serde(default)]
    pub includes: Includes,
    #[serde(default)]
    pub errors: Vec<ApiProblem>,
}

/// Which users to look up
#[derive(Debug, Clone)]
pub enum UserQuery {
    Usernames(Vec<String>),
    Ids(Vec<String>),
}

/// Timeline window; `since_id` wins over `start_time` when both are set.
#[derive(Debug, Clone, Default)]
pub struct TimelineOptions {
    pub since_id: Option<String>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub max_results: u32,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn user_lookup(&self, query: UserQuery) -> Result<UserLookupResponse, UpstreamError>;

    async fn user_timeline(
        &self,
        user_id: &str,
        options: &TimelineOptions,
    ) -> Result<TimelineResponse, UpstreamError>;

    /// Look posts up with media, referenced posts and their authors expanded.
    async fn post_lookup(&self, ids: &[String]) -> Result<PostLookupResponse, UpstreamError>;
}
