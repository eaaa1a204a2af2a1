//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default, config/local)
//! 3. Environment variables (override, `BIRDBRIDGE__SECTION__KEY`)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub twitter: TwitterConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public authority actors are served under (e.g., "bridge.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://bridge.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Upstream social API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TwitterConfig {
    /// App-only bearer token
    pub bearer_token: String,
    /// API root, overridable for tests
    #[serde(default = "default_twitter_api")]
    pub api_base_url: String,
    /// Accounts bridged by this instance, created at start-up
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_cache_ttl")]
    pub user_cache_ttl_secs: u64,
    #[serde(default = "default_post_cache_ttl")]
    pub post_cache_ttl_secs: u64,
    #[serde(default = "default_post_cache_capacity")]
    pub post_cache_capacity: u64,
}

impl TwitterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_twitter_api() -> String {
    "https://api.twitter.com".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_user_cache_ttl() -> u64 {
    3600
}

fn default_post_cache_ttl() -> u64 {
    86_400
}

fn default_post_cache_capacity() -> u64 {
    10_000
}

/// Federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Fediverse handles (or `@host` suffixes) allowed to follow
    #[serde(default)]
    pub allowed_actors: Vec<String>,
    /// Treat every inbox request as signed. Development only.
    #[serde(default)]
    pub disable_signature_verification: bool,
    /// Remote public keys kept in memory
    #[serde(default = "default_key_cache_capacity")]
    pub key_cache_capacity: u64,
    /// Allow key fetches towards loopback and private networks
    #[serde(default)]
    pub allow_private_hosts: bool,
    /// Accepted distance between a signed `Date` header and now
    #[serde(default = "default_clock_skew")]
    pub max_clock_skew_secs: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            allowed_actors: Vec::new(),
            disable_signature_verification: false,
            key_cache_capacity: default_key_cache_capacity(),
            allow_private_hosts: false,
            max_clock_skew_secs: default_clock_skew(),
        }
    }
}

fn default_key_cache_capacity() -> u64 {
    1000
}

fn default_clock_skew() -> u64 {
    300
}

/// Task consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Run task consumers inside the server process
    #[serde(default = "default_true")]
    pub embedded: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sleep between dequeue attempts when every queue is empty
    #[serde(default = "default_idle_poll")]
    pub idle_poll_millis: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            embedded: true,
            concurrency: default_concurrency(),
            idle_poll_millis: default_idle_poll(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_idle_poll() -> u64 {
    500
}

/// Timeline poller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Timeline requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Quota window length
    #[serde(default = "default_period")]
    pub period_secs: u64,
    /// Wait before refreshing an empty user list again
    #[serde(default = "default_empty_backoff")]
    pub empty_backoff_secs: u64,
}

impl PollerConfig {
    /// Interval between two timeline fetches.
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.period_secs) / self.max_requests.max(1)
    }

    pub fn empty_backoff(&self) -> Duration {
        Duration::from_secs(self.empty_backoff_secs)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            period_secs: default_period(),
            empty_backoff_secs: default_empty_backoff(),
        }
    }
}

fn default_max_requests() -> u32 {
    1500
}

fn default_period() -> u64 {
    15 * 60
}

fn default_empty_backoff() -> u64 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format ("json" or "pretty")
    pub format: String,
}

impl AppConfig {
    /// Load configuration from files and environment
    ///
    /// # Errors
    /// Returns error if required configuration is missing or invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/birdbridge.db")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (BIRDBRIDGE__*)
            .add_source(
                Environment::with_prefix("BIRDBRIDGE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("twitter.allowed_users")
                    .with_list_parse_key("federation.allowed_actors")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.twitter.bearer_token.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "twitter.bearer_token must be set".to_string(),
            ));
        }

        if self.poller.max_requests == 0 || self.poller.period_secs == 0 {
            return Err(crate::error::AppError::Config(
                "poller.max_requests and poller.period_secs must be greater than 0".to_string(),
            ));
        }

        if self.worker.concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "worker.concurrency must be greater than 0".to_string(),
            ));
        }

        if self.federation.disable_signature_verification {
            tracing::warn!("HTTP signature verification is disabled, every inbox request is trusted");
        }

        if is_local_server_domain(&self.server.domain) {
            let host = normalized_server_host(&self.server.domain);
            tracing::warn!(
                host = %host,
                protocol = %self.server.protocol,
                "Serving actors from a local domain, remote servers will not reach them"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
