//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{generate_webfinger_response, host_meta as host_meta_document, parse_resource};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/host-meta
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/host-meta", get(host_meta))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let domain = &state.config.server.domain;
    let username = parse_resource(&query.resource, domain)?;

    let user = state
        .users
        .get_full_user(&username)
        .await
        .map_err(|e| match e {
            AppError::UserDoesNotExist(_) => AppError::NotFound,
            other => other,
        })?;

    let response = generate_webfinger_response(&user.username, domain, &state.urls);
    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json")],
        Json(response),
    )
        .into_response())
}

/// GET /.well-known/host-meta
async fn host_meta(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/xrd+xml")],
        host_meta_document(&state.urls),
    )
        .into_response()
}
