//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use birdbridge::federation::Signer;
use birdbridge::federation::keys::format_pub_key;
use birdbridge::twitter::backend::{
    ApiProblem, PROBLEM_NOT_FOUND, PostLookupResponse, PublicMetrics, RawUser, TimelineResponse,
    UserLookupResponse,
};
use birdbridge::twitter::{Backend, TimelineOptions, UpstreamError, UserQuery};
use birdbridge::{AppState, config};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Public authority of the bridge under test
pub const DOMAIN: &str = "bridge.test";

/// Upstream accounts known to [`FakeBackend`]
pub fn upstream_users() -> Vec<RawUser> {
    vec![
        RawUser {
            id: "1001".to_string(),
            username: "Alice".to_string(),
            name: "Alice A.".to_string(),
            description: "posting <things>".to_string(),
            profile_image_url: Some("https://pbs.example/alice_normal.jpg".to_string()),
            created_at: Some("2010-03-01T12:00:00Z".to_string()),
            public_metrics: Some(PublicMetrics {
                followers_count: 42,
                following_count: 7,
                tweet_count: 1234,
            }),
        },
        RawUser {
            id: "1002".to_string(),
            username: "dave".to_string(),
            name: "Dave".to_string(),
            ..Default::default()
        },
    ]
}

/// Upstream API answering from a fixed list of users
pub struct FakeBackend {
    users: Vec<RawUser>,
}

impl FakeBackend {
    pub fn new(users: Vec<RawUser>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn user_lookup(&self, query: UserQuery) -> Result<UserLookupResponse, UpstreamError> {
        let data: Vec<RawUser> = match &query {
            UserQuery::Usernames(names) => self
                .users
                .iter()
                .filter(|u| names.iter().any(|n| n.eq_ignore_ascii_case(&u.username)))
                .cloned()
                .collect(),
            UserQuery::Ids(ids) => self
                .users
                .iter()
                .filter(|u| ids.contains(&u.id))
                .cloned()
                .collect(),
        };

        let errors = if data.is_empty() {
            vec![ApiProblem {
                problem_type: PROBLEM_NOT_FOUND.to_string(),
                title: "Not Found Error".to_string(),
                ..Default::default()
            }]
        } else {
            Vec::new()
        };

        Ok(UserLookupResponse { data, errors })
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

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a test server with "alice" bridged and no allowed actors.
    pub async fn new() -> Self {
        Self::with_allowed_actors(Vec::new()).await
    }

    /// Create a test server letting `allowed_actors` follow its users.
    pub async fn with_allowed_actors(allowed_actors: Vec<String>) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: DOMAIN.to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            twitter: config::TwitterConfig {
                bearer_token: "test-token".to_string(),
                api_base_url: "http://127.0.0.1:9".to_string(),
                allowed_users: vec!["alice".to_string()],
                request_timeout_secs: 5,
                user_cache_ttl_secs: 60,
                post_cache_ttl_secs: 60,
                post_cache_capacity: 100,
            },
            federation: config::FederationConfig {
                allowed_actors,
                allow_private_hosts: true,
                ..Default::default()
            },
            worker: config::WorkerConfig {
                embedded: false,
                ..Default::default()
            },
            poller: config::PollerConfig {
                enabled: false,
                ..Default::default()
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        birdbridge::metrics::init_metrics();

        // Initialize app state on the fake upstream and bridge alice
        let state = AppState::with_backend(config, Arc::new(FakeBackend::new(upstream_users())))
            .await
            .unwrap();
        state.bootstrap_users().await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = birdbridge::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Public IRI of a bridged user
    pub fn user_iri(&self, username: &str) -> String {
        format!("https://{DOMAIN}/users/{username}")
    }

    /// POST `activity` to a user's inbox, signed by `remote`.
    pub async fn post_signed_inbox(
        &self,
        remote: &RemoteServer,
        username: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let url = self.url(&format!("/users/{username}/inbox"));
        let body = serde_json::to_vec(activity).unwrap();
        let signed = Signer::new()
            .sign("POST", &url, &body, &remote.private_key, &remote.key_id())
            .unwrap();

        self.client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/activity+json")
            .header("Date", signed.date)
            .header("Digest", signed.digest)
            .header("Signature", signed.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

#[derive(Clone)]
struct RemoteState {
    username: String,
    base_url: String,
    public_key_pem: String,
    /// Owner announced for the key instead of the actor itself
    claimed_owner: Option<String>,
    received: Arc<Mutex<Vec<Value>>>,
}

/// A remote Fediverse server hosting a single actor
///
/// Serves the actor document with its public key and records every
/// activity delivered to the actor's inbox.
pub struct RemoteServer {
    pub addr: String,
    pub username: String,
    pub private_key: RsaPrivateKey,
    received: Arc<Mutex<Vec<Value>>>,
}

impl RemoteServer {
    pub async fn start(username: &str) -> Self {
        Self::start_with_owner(username, None).await
    }

    /// Start a server whose key document names `claimed_owner` as owner.
    pub async fn start_with_owner(username: &str, claimed_owner: Option<String>) -> Self {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public_key_pem = format_pub_key(&RsaPublicKey::from(&private_key));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));

        let state = RemoteState {
            username: username.to_string(),
            base_url: addr.clone(),
            public_key_pem,
            claimed_owner,
            received: received.clone(),
        };
        let app = Router::new()
            .route("/users/:name", get(remote_actor))
            .route("/users/:name/inbox", post(remote_inbox))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        Self {
            addr,
            username: username.to_string(),
            private_key,
            received,
        }
    }

    /// Actor IRI
    pub fn actor_iri(&self) -> String {
        format!("{}/users/{}", self.addr, self.username)
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor_iri())
    }

    /// Allow-list entry matching this actor
    pub fn handle(&self) -> String {
        format!("{}@127.0.0.1", self.username)
    }

    /// Activities delivered to the actor's inbox so far
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn follow(&self, object: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/follows/1", self.actor_iri()),
            "type": "Follow",
            "actor": self.actor_iri(),
            "object": object,
        })
    }

    pub fn undo_follow(&self, object: &str) -> Value {
        let mut follow = self.follow(object);
        if let Some(fields) = follow.as_object_mut() {
            fields.remove("@context");
        }
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/undo/1", self.actor_iri()),
            "type": "Undo",
            "actor": self.actor_iri(),
            "object": follow,
        })
    }
}

async fn remote_actor(
    State(state): State<RemoteState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if name != state.username {
        return StatusCode::NOT_FOUND.into_response();
    }

    let id = format!("{}/users/{}", state.base_url, state.username);
    let owner = state.claimed_owner.clone().unwrap_or_else(|| id.clone());
    let document = json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": id,
        "type": "Person",
        "preferredUsername": state.username,
        "inbox": format!("{id}/inbox"),
        "publicKey": {
            "id": format!("{id}#main-key"),
            "owner": owner,
            "publicKeyPem": state.public_key_pem,
        },
    });

    (
        [(header::CONTENT_TYPE, "application/activity+json")],
        Json(document),
    )
        .into_response()
}

async fn remote_inbox(State(state): State<RemoteState>, body: Bytes) -> StatusCode {
    match serde_json::from_slice::<Value>(&body) {
        Ok(activity) => {
            state.received.lock().unwrap().push(activity);
            StatusCode::ACCEPTED
        }
        Err(_) => StatusCode::BAD_REQUEST,
    }
}
