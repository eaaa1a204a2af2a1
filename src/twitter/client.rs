//! Upstream API client
//!
//! [`HttpBackend`] talks to the v2 REST API through the shared
//! [`RateLimiter`]; [`TwitterClient`] adds profile caching and the
//! conversions the rest of the crate works with.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::backend::*;
use super::models::TwitterUser;
use super::rate_limit::{EndpointClass, RateLimiter};
use crate::data::Cache;
use crate::metrics::UPSTREAM_REQUESTS_TOTAL;

const USER_FIELDS: &str = "created_at,description,name,profile_image_url,public_metrics";
const POST_FIELDS: &str = "id,author_id,text,created_at,possibly_sensitive,referenced_tweets,attachments";
const MEDIA_FIELDS: &str = "type,url,width,height";
const POST_EXPANSIONS: &str = "attachments.media_keys,referenced_tweets.id,referenced_tweets.id.author_id,author_id";

/// reqwest implementation of [`Backend`]
pub struct HttpBackend {
    http_client: reqwest::Client,
    base_url: String,
    bearer_token: String,
    limiter: RateLimiter,
}

impl HttpBackend {
    pub fn new(
        http_client: reqwest::Client,
        base_url: &str,
        bearer_token: &str,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: bearer_token.to_string(),
            limiter,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let class = EndpointClass::from_path(path);
        self.limiter.acquire(class).await;

        let response = self
            .http_client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.bearer_token)
            .query(query)
            .send()
            .await?;

        let status = response.status().as_u16();
        self.limiter.update(class, status, response.headers()).await;
        UPSTREAM_REQUESTS_TOTAL
            .with_label_values(&[class.as_str(), &status.to_string()])
            .inc();

        if status == 429 {
            return Err(UpstreamError::RateLimited(class.as_str()));
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Status { status });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::Invalid(e.to_string()))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn user_lookup(&self, query: UserQuery) -> Result<UserLookupResponse, UpstreamError> {
        let fields = ("user.fields", USER_FIELDS.to_string());
        match query {
            UserQuery::Usernames(usernames) => {
                self.get(
                    "/2/users/by",
                    &[("usernames", usernames.join(",")), fields],
                )
                .await
            }
            UserQuery::Ids(ids) => self.get("/2/users", &[("ids", ids.join(",")), fields]).await,
        }
    }

    async fn user_timeline(
        &self,
        user_id: &str,
        options: &TimelineOptions,
    ) -> Result<TimelineResponse, UpstreamError> {
        let mut query = vec![
            ("tweet.fields", "id,created_at".to_string()),
            ("exclude", "replies".to_string()),
            ("max_results", options.max_results.clamp(5, 100).to_string()),
        ];
        match (&options.since_id, options.start_time) {
            (Some(since_id), _) => query.push(("since_id", since_id.clone())),
            (None, Some(start_time)) => query.push((
                "start_time",
                start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            )),
            (None, None) => {}
        }

        self.get(&format!("/2/users/{user_id}/tweets"), &query).await
    }

    async fn post_lookup(&self, ids: &[String]) -> Result<PostLookupResponse, UpstreamError> {
        self.get(
            "/2/tweets",
            &[
                ("ids", ids.join(",")),
                ("tweet.fields", POST_FIELDS.to_string()),
                ("media.fields", MEDIA_FIELDS.to_string()),
                ("user.fields", "username".to_string()),
                ("expansions", POST_EXPANSIONS.to_string()),
            ],
        )
        .await
    }
}

/// Profile lookups with caching on top of a [`Backend`]
pub struct TwitterClient {
    backend: Arc<dyn Backend>,
    users: Arc<dyn Cache<TwitterUser>>,
}

impl TwitterClient {
    pub fn new(backend: Arc<dyn Backend>, users: Arc<dyn Cache<TwitterUser>>) -> Self {
        Self { backend, users }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Fetch a profile by username, cache first.
    ///
    /// # Errors
    /// [`UpstreamError::UserNotFound`] when the account does not exist.
    pub async fn get_user(&self, username: &str) -> Result<TwitterUser, UpstreamError> {
        let username = username.to_ascii_lowercase();
        let cache_key = format!("twitter/user/{username}");
        if let Some(user) = self.users.get(&cache_key).await {
            tracing::trace!(key = %cache_key, "twitter user cache hit");
            return Ok(user);
        }
        tracing::trace!(key = %cache_key, "twitter user cache miss");

        let users = self
            .lookup(UserQuery::Usernames(vec![username.clone()]))
            .await?;
        let user = users
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::UserNotFound(username.clone()))?;

        self.users.set(&cache_key, user.clone()).await;
        Ok(user)
    }

    /// Look several users up at once. Unknown entries are skipped.
    pub async fn lookup(&self, query: UserQuery) -> Result<Vec<TwitterUser>, UpstreamError> {
        let single_username = match &query {
            UserQuery::Usernames(names) if names.len() == 1 => Some(names[0].clone()),
            _ => None,
        };

        let response = self.backend.user_lookup(query).await?;

        if response.data.is_empty() {
            if let Some(problem) = response.errors.first() {
                if problem.problem_type == PROBLEM_NOT_FOUND {
                    let name = single_username.or_else(|| problem.value.clone()).unwrap_or_default();
                    return Err(UpstreamError::UserNotFound(name));
                }
                return Err(UpstreamError::Invalid(format!(
                    "{}: {}",
                    problem.title, problem.detail
                )));
            }
        }

        response.data.iter().map(convert_user).collect()
    }

    pub async fn timeline(
        &self,
        user_id: i64,
        options: &TimelineOptions,
    ) -> Result<TimelineResponse, UpstreamError> {
        self.backend
            .user_timeline(&user_id.to_string(), options)
            .await
    }
}

/// Build a [`TwitterUser`] from its wire representation.
pub fn convert_user(raw: &RawUser) -> Result<TwitterUser, UpstreamError> {
    let id = raw
        .id
        .parse::<i64>()
        .map_err(|_| UpstreamError::Invalid(format!("user id {} is not numeric", raw.id)))?;

    let created_at = match raw.created_at.as_deref() {
        Some(created_at) => DateTime::parse_from_rfc3339(created_at)
            .map(|date| date.with_timezone(&Utc))
            .map_err(|e| UpstreamError::Invalid(format!("user creation date: {e}")))?,
        None => DateTime::<Utc>::UNIX_EPOCH,
    };

    let metrics = raw.public_metrics.clone().unwrap_or_default();

    Ok(TwitterUser {
        id,
        username: raw.username.to_ascii_lowercase(),
        name: raw.name.clone(),
        description: raw.description.clone(),
        profile_image_url: raw
            .profile_image_url
            .as_ref()
            .map(|url| url.replace("_normal", "")),
        created_at,
        followers: metrics.followers_count,
        following: metrics.following_count,
        posts: metrics.tweet_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MokaCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct LookupBackend {
        calls: AtomicUsize,
        response: UserLookupResponse,
    }

    #[async_trait]
    impl Backend for LookupBackend {
        async fn user_lookup(&self, _query: UserQuery) -> Result<UserLookupResponse, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }

        async fn user_timeline(
            &self,
            _user_id: &str,
            _options: &TimelineOptions,
        ) -> Result<TimelineResponse, UpstreamError> {
            Ok(TimelineResponse::default())
        }

        async fn post_lookup(&self, _ids: &[String]) -> Result<PostLookupResponse, UpstreamError> {
            Ok(PostLookupResponse::default())
        }
    }

    fn client(response: UserLookupResponse) -> (TwitterClient, Arc<LookupBackend>) {
        let backend = Arc::new(LookupBackend {
            calls: AtomicUsize::new(0),
            response,
        });
        let cache = Arc::new(MokaCache::<TwitterUser>::new("twitter_users", 10, Duration::from_secs(60)));
        (TwitterClient::new(backend.clone(), cache), backend)
    }

    #[tokio::test]
    async fn test_get_user_is_cached() {
        let (client, backend) = client(UserLookupResponse {
            data: vec![RawUser {
                id: "42".to_string(),
                username: "Alice".to_string(),
                name: "Alice".to_string(),
                profile_image_url: Some("https://pbs.example/alice_normal.jpg".to_string()),
                created_at: Some("2010-01-01T00:00:00Z".to_string()),
                public_metrics: Some(PublicMetrics {
                    followers_count: 10,
                    following_count: 2,
                    tweet_count: 99,
                }),
                ..Default::default()
            }],
            errors: Vec::new(),
        });

        let user = client.get_user("ALICE").await.unwrap();
        assert_eq!(user.id, 42);
        assert_eq!(user.username, "alice");
        assert_eq!(user.profile_image_url.as_deref(), Some("https://pbs.example/alice.jpg"));
        assert_eq!(user.posts, 99);

        client.get_user("alice").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_user_reports_not_found() {
        let (client, _) = client(UserLookupResponse {
            data: Vec::new(),
            errors: vec![ApiProblem {
                problem_type: PROBLEM_NOT_FOUND.to_string(),
                ..Default::default()
            }],
        });

        match client.get_user("ghost").await {
            Err(UpstreamError::UserNotFound(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected not found, got: {other:?}"),
        }
    }

    #[test]
    fn test_convert_user_rejects_non_numeric_id() {
        let raw = RawUser {
            id: "abc".to_string(),
            username: "x".to_string(),
            ..Default::default()
        };
        assert!(matches!(convert_user(&raw), Err(UpstreamError::Invalid(_))));
    }

    #[test]
    fn test_transient_classification() {
        assert!(UpstreamError::RateLimited("user_tweets").is_transient());
        assert!(UpstreamError::Status { status: 503 }.is_transient());
        assert!(!UpstreamError::Status { status: 404 }.is_transient());
        assert!(!UpstreamError::UserNotFound("x".to_string()).is_transient());
    }
}
