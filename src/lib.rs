//! birdbridge - lets Fediverse users follow Twitter accounts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actor, inbox, collections)        │
//! │  - WebFinger / host-meta                                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │             Federation / Service Layer                       │
//! │  - Signature verification and signing                       │
//! │  - Follow / Undo processing                                 │
//! │  - Users and posts                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────────┐ ┌────────────────────────────┐
//! │   Workers (task queue)       │ │   Timeline poller          │
//! │  - Accept / Reject           │ │  - rate-limited API client │
//! │  - Post delivery             │ │  - per-user cursors        │
//! └──────────────────────────────┘ └────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): users, actors, follow edges, tasks        │
//! │  - Moka caches: profiles, posts, remote keys                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `service`: Users and posts
//! - `twitter`: Upstream API client and timeline poller
//! - `worker`: Durable task queue and consumers
//! - `data`: Database and cache layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;
pub mod trace;
pub mod twitter;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use federation::{
    ActivityPubClient, ActivityVoter, AuthorizationChecker, HttpActivityPubClient, InboxService,
    KeyManager, SignatureVerifier, Signer, Urls,
};
use twitter::{Backend, HttpBackend, RateLimiter, TwitterClient};

/// Profile cache size; one entry per bridged or referenced account
const USER_CACHE_CAPACITY: u64 = 10_000;

/// Largest accepted request body
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Every collaborator is built once here and handed to its users
/// explicitly.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// URLs of served documents
    pub urls: Urls,

    /// Upstream API client with its profile cache
    pub twitter: Arc<TwitterClient>,

    pub users: Arc<service::UserService>,

    pub posts: Arc<service::PostService>,

    pub inbox: Arc<InboxService>,

    /// Durable task queue
    pub queue: Arc<worker::SqliteTaskQueue>,

    /// Remote public keys
    pub keys: Arc<KeyManager>,

    pub verifier: Arc<SignatureVerifier>,

    /// Signed outbound deliveries
    pub client: Arc<dyn ActivityPubClient>,
}

impl AppState {
    /// Initialize application state against the real upstream API.
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let http_client = build_http_client(&config)?;
        let backend = HttpBackend::new(
            http_client,
            &config.twitter.api_base_url,
            &config.twitter.bearer_token,
            RateLimiter::new(),
        );
        Self::with_backend(config, Arc::new(backend)).await
    }

    /// Initialize application state on top of `backend`.
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Initialize caches and the upstream client
    /// 3. Wire federation (keys, signatures, inbox, delivery)
    pub async fn with_backend(
        config: config::AppConfig,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        let queue = Arc::new(worker::SqliteTaskQueue::new(db.pool().clone()));

        // 2. Initialize caches and the upstream client
        let user_cache = Arc::new(data::MokaCache::<twitter::TwitterUser>::new(
            "twitter_users",
            USER_CACHE_CAPACITY,
            Duration::from_secs(config.twitter.user_cache_ttl_secs),
        ));
        let twitter = Arc::new(TwitterClient::new(backend, user_cache));
        let users = Arc::new(service::UserService::new(db.clone(), twitter.clone()));
        let post_cache = Arc::new(data::MokaCache::<twitter::Post>::new(
            "posts",
            config.twitter.post_cache_capacity,
            Duration::from_secs(config.twitter.post_cache_ttl_secs),
        ));
        let posts = Arc::new(service::PostService::new(
            twitter.clone(),
            users.clone(),
            post_cache,
        ));
        tracing::info!("Caches initialized");

        // 3. Wire federation
        let http_client = build_http_client(&config)?;
        let urls = Urls::new(&config.server.base_url());
        let keys = Arc::new(KeyManager::new(
            http_client.clone(),
            config.federation.key_cache_capacity,
            config.federation.allow_private_hosts,
        ));
        let verifier = Arc::new(SignatureVerifier::new(
            keys.clone(),
            Duration::from_secs(config.federation.max_clock_skew_secs),
            config.federation.disable_signature_verification,
        ));
        let authorization = AuthorizationChecker::new(vec![Arc::new(ActivityVoter::new(
            config.federation.allowed_actors.clone(),
        ))]);
        let inbox = Arc::new(InboxService::new(
            &config.server.domain,
            db.clone(),
            db.clone(),
            queue.clone(),
            keys.clone(),
            authorization,
        ));
        let client: Arc<dyn ActivityPubClient> = Arc::new(HttpActivityPubClient::new(
            http_client,
            Arc::new(Signer::new()),
            urls.clone(),
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            urls,
            twitter,
            users,
            posts,
            inbox,
            queue,
            keys,
            verifier,
            client,
        })
    }

    /// Make sure every allow-listed account is bridged.
    pub async fn bootstrap_users(&self) -> Result<(), error::AppError> {
        let allowed = &self.config.twitter.allowed_users;
        self.users.batch_create_users(allowed).await?;
        tracing::info!(count = allowed.len(), "Allowed users bootstrapped");
        Ok(())
    }

    /// A task consumer wired to this state.
    pub fn worker(&self) -> worker::Worker {
        let handlers = worker::TaskHandlers::new(
            self.db.clone(),
            self.db.clone(),
            self.posts.clone(),
            self.client.clone(),
            self.urls.clone(),
        );
        worker::Worker::new(
            self.queue.clone(),
            Arc::new(handlers),
            Duration::from_millis(self.config.worker.idle_poll_millis),
        )
    }

    pub fn poller(&self) -> twitter::Poller {
        twitter::Poller::new(
            self.db.clone(),
            self.twitter.clone(),
            self.queue.clone(),
            &self.config.poller,
        )
    }

    /// Spawn the embedded workers and the poller, as configured.
    pub fn spawn_background(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.worker.embedded {
            for _ in 0..self.config.worker.concurrency {
                handles.push(tokio::spawn(self.worker().run(shutdown.clone())));
            }
            tracing::info!(concurrency = self.config.worker.concurrency, "Task workers spawned");
        }

        if self.config.poller.enabled {
            handles.push(tokio::spawn(self.poller().run(shutdown.clone())));
            tracing::info!("Timeline poller spawned");
        }

        handles
    }
}

fn build_http_client(config: &config::AppConfig) -> Result<reqwest::Client, error::AppError> {
    reqwest::Client::builder()
        .user_agent(concat!("birdbridge/", env!("CARGO_PKG_VERSION")))
        .timeout(config.twitter.request_timeout())
        .build()
        .map_err(|e| error::AppError::Internal(e.into()))
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{Router, middleware};
    use tower_http::{
        catch_panic::CatchPanicLayer, compression::CompressionLayer, limit::RequestBodyLimitLayer,
        trace::TraceLayer,
    };

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router(&state))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(api::track_http))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
        .merge(api::metrics_router())
}

fn handle_panic(payload: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    use axum::response::IntoResponse;

    let message = error::panic_message(payload);
    error::AppError::Internal(anyhow::anyhow!("handler panicked: {message}")).into_response()
}

async fn health_check() -> &'static str {
    "OK"
}
