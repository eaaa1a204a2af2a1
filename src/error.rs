//! Error types for birdbridge
//!
//! Everything surfaced by an HTTP handler is converted to `AppError`,
//! which maps itself to a [`HandlerError`] and from there to a response.
//! Lower layers (keys, signatures, delivery, tasks, upstream API) keep
//! their own error enums and convert into `AppError` at the boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::federation::{DeliveryError, KeyError};
use crate::twitter::UpstreamError;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The username targeted by an activity is not bridged here (400)
    #[error("user {0} does not exist")]
    UserDoesNotExist(String),

    /// The followed object lives on another domain (400)
    #[error("follow object {object} does not belong to this domain")]
    FollowMismatchDomain { object: String },

    /// Authorization voters refused the actor (403)
    #[error("actor {actor} is not allowed to follow")]
    ActorNotAllowed { actor: String },

    /// Undo wrapping something other than a single Follow (400)
    #[error("unsupported undo object: {0}")]
    UnsupportedUndoObject(String),

    /// Activity type the inbox does not handle (400)
    #[error("unsupported activity type: {0}")]
    UnsupportedActivity(String),

    /// Actor IRI unknown to the actor repository (400)
    #[error("actor {0} not found")]
    ActorNotFound(String),

    /// Username unknown to the upstream API (404)
    #[error("upstream user {0} not found")]
    UpstreamUserNotFound(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Upstream API error (502)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task could not be queued (500)
    #[error("Queue error: {0}")]
    Queue(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<KeyError> for AppError {
    fn from(err: KeyError) -> Self {
        AppError::Federation(err.to_string())
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        AppError::Federation(err.to_string())
    }
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::UserNotFound(username) => AppError::UpstreamUserNotFound(username),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

/// What an HTTP caller gets to see about a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub status: StatusCode,
    /// Safe, short message; `None` for server-side failures
    pub user_message: Option<String>,
    /// Expected client-caused outcome, not worth an error log
    pub quiet: bool,
    /// Label used for metrics
    pub kind: &'static str,
}

impl HandlerError {
    fn client(status: StatusCode, message: String, kind: &'static str) -> Self {
        Self {
            status,
            user_message: Some(message),
            quiet: true,
            kind,
        }
    }

    fn server(status: StatusCode, kind: &'static str) -> Self {
        Self {
            status,
            user_message: None,
            quiet: false,
            kind,
        }
    }
}

impl AppError {
    /// Map the error to its HTTP-facing representation.
    pub fn handler_error(&self) -> HandlerError {
        match self {
            AppError::NotFound => {
                HandlerError::client(StatusCode::NOT_FOUND, self.to_string(), "not_found")
            }
            AppError::UpstreamUserNotFound(_) => {
                HandlerError::client(StatusCode::NOT_FOUND, "user not found".to_string(), "not_found")
            }
            AppError::Forbidden => {
                HandlerError::client(StatusCode::FORBIDDEN, self.to_string(), "forbidden")
            }
            AppError::ActorNotAllowed { .. } => {
                HandlerError::client(StatusCode::FORBIDDEN, self.to_string(), "actor_not_allowed")
            }
            AppError::Validation(msg) => {
                HandlerError::client(StatusCode::BAD_REQUEST, msg.clone(), "validation")
            }
            AppError::UserDoesNotExist(_) => {
                HandlerError::client(StatusCode::BAD_REQUEST, self.to_string(), "user_does_not_exist")
            }
            AppError::FollowMismatchDomain { .. } => HandlerError::client(
                StatusCode::BAD_REQUEST,
                self.to_string(),
                "follow_mismatch_domain",
            ),
            AppError::UnsupportedUndoObject(_) => HandlerError::client(
                StatusCode::BAD_REQUEST,
                self.to_string(),
                "unsupported_undo_object",
            ),
            AppError::UnsupportedActivity(_) => HandlerError::client(
                StatusCode::BAD_REQUEST,
                self.to_string(),
                "unsupported_activity",
            ),
            AppError::ActorNotFound(_) => {
                HandlerError::client(StatusCode::BAD_REQUEST, self.to_string(), "actor_not_found")
            }
            AppError::Federation(_) => HandlerError::server(StatusCode::BAD_GATEWAY, "federation"),
            AppError::Upstream(_) => HandlerError::server(StatusCode::BAD_GATEWAY, "upstream"),
            AppError::HttpClient(_) => HandlerError::server(StatusCode::BAD_GATEWAY, "http_client"),
            AppError::Database(_) => {
                HandlerError::server(StatusCode::INTERNAL_SERVER_ERROR, "database")
            }
            AppError::Config(_) => HandlerError::server(StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Queue(_) => HandlerError::server(StatusCode::INTERNAL_SERVER_ERROR, "queue"),
            AppError::Internal(_) => {
                HandlerError::server(StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Client errors carry a short message, server errors never leak
    /// their cause.
    fn into_response(self) -> Response {
        use axum::Json;

        let handler_error = self.handler_error();
        if handler_error.quiet {
            tracing::debug!(error = %self, status = %handler_error.status, "request rejected");
        } else {
            tracing::error!(error = %self, status = %handler_error.status, "request failed");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL
            .with_label_values(&[handler_error.kind, "http"])
            .inc();

        let message = handler_error.user_message.unwrap_or_else(|| {
            handler_error
                .status
                .canonical_reason()
                .unwrap_or("error")
                .to_string()
        });
        let body = Json(serde_json::json!({
            "error": message,
        }));

        (handler_error.status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Text of a caught panic payload.
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
