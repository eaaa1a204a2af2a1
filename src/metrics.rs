//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_http_requests_total", "Total number of HTTP requests"),
        &["method", "status"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref INBOX_ACTIVITIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_inbox_activities_total", "Inbound activities by type and outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_CHECKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_signature_checks_total", "Inbound HTTP signature evaluations"),
        &["result"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_activities_sent_total", "Outbound activities by type and status"),
        &["activity_type", "status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "birdbridge_delivery_duration_seconds",
            "Outbound inbox delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["activity_type"]
    ).expect("metric can be created");

    // Task Metrics
    pub static ref TASKS_ENQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_tasks_enqueued_total", "Tasks enqueued by kind"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref TASKS_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_tasks_processed_total", "Task executions by kind and outcome"),
        &["kind", "outcome"]
    ).expect("metric can be created");

    // Poller Metrics
    pub static ref POLL_ITERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_poll_iterations_total", "Poller iterations by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref POSTS_DISCOVERED_TOTAL: IntCounter = IntCounter::new(
        "birdbridge_posts_discovered_total",
        "Posts discovered by the timeline poller"
    ).expect("metric can be created");
    pub static ref POLLED_USERS: IntGauge = IntGauge::new(
        "birdbridge_polled_users",
        "Users with at least one follower in the current poll round"
    ).expect("metric can be created");

    // Upstream Metrics
    pub static ref UPSTREAM_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_upstream_requests_total", "Upstream API requests by endpoint class and status"),
        &["endpoint", "status"]
    ).expect("metric can be created");
    pub static ref RATE_LIMIT_WAITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_rate_limit_waits_total", "Calls delayed by the upstream rate budget"),
        &["endpoint"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("birdbridge_errors_total", "Total number of errors"),
        &["error_type", "source"]
    ).expect("metric can be created");
}

/// Initialize metrics registry. Later calls are no-ops.
pub fn init_metrics() {
    static INIT: std::sync::Once = std::sync::Once::new();

    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
            .expect("HTTP_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(INBOX_ACTIVITIES_TOTAL.clone()))
            .expect("INBOX_ACTIVITIES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(SIGNATURE_CHECKS_TOTAL.clone()))
            .expect("SIGNATURE_CHECKS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ACTIVITIES_SENT_TOTAL.clone()))
            .expect("ACTIVITIES_SENT_TOTAL can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
            .expect("DELIVERY_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(TASKS_ENQUEUED_TOTAL.clone()))
            .expect("TASKS_ENQUEUED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(TASKS_PROCESSED_TOTAL.clone()))
            .expect("TASKS_PROCESSED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(POLL_ITERATIONS_TOTAL.clone()))
            .expect("POLL_ITERATIONS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(POSTS_DISCOVERED_TOTAL.clone()))
            .expect("POSTS_DISCOVERED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(POLLED_USERS.clone()))
            .expect("POLLED_USERS can be registered");
        REGISTRY
            .register(Box::new(UPSTREAM_REQUESTS_TOTAL.clone()))
            .expect("UPSTREAM_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(RATE_LIMIT_WAITS_TOTAL.clone()))
            .expect("RATE_LIMIT_WAITS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_HITS_TOTAL.clone()))
            .expect("CACHE_HITS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_MISSES_TOTAL.clone()))
            .expect("CACHE_MISSES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}
