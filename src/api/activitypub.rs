//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (Follow / Undo)
//! - Outbox, followers and following collections
//! - Statuses

use axum::body::Bytes;
use axum::{
    Extension, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::Value;

use crate::AppState;
use crate::error::AppError;
use crate::federation::vocab::{self, ACTIVITY_JSON, ACTIVITY_STREAMS_CONTEXT};
use crate::federation::{SignatureStatus, verify_signature};
use crate::service::FullUser;
use crate::trace::TraceId;

/// JSON body served as `application/activity+json`
pub struct ActivityJson(pub Value);

impl IntoResponse for ActivityJson {
    fn into_response(self) -> Response {
        (
            [(header::CONTENT_TYPE, ACTIVITY_JSON)],
            axum::Json(self.0),
        )
            .into_response()
    }
}

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Inbox, behind signature evaluation
/// - GET /users/:username/outbox - Outbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
/// - GET /users/:username/statuses/:id - Note of a delivered post
pub fn activitypub_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route(
            "/users/:username/inbox",
            post(inbox).layer(middleware::from_fn_with_state(
                state.verifier.clone(),
                verify_signature,
            )),
        )
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
        .route("/users/:username/statuses/:id", get(status))
}

/// Bridged user, or 404.
async fn full_user(state: &AppState, username: &str) -> Result<FullUser, AppError> {
    state
        .users
        .get_full_user(username)
        .await
        .map_err(|e| match e {
            AppError::UserDoesNotExist(_) => AppError::NotFound,
            other => other,
        })
}

/// GET /users/:username
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson, AppError> {
    let user = full_user(&state, &username).await?;
    Ok(ActivityJson(vocab::actor(&state.urls, &user)))
}

/// GET /users/:username/outbox
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson, AppError> {
    let user = full_user(&state, &username).await?;
    Ok(ActivityJson(vocab::ordered_collection(
        &state.urls.outbox(&user.username),
        user.posts,
    )))
}

/// GET /users/:username/followers
///
/// Totals are the upstream account's, not the bridged followers.
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson, AppError> {
    let user = full_user(&state, &username).await?;
    Ok(ActivityJson(vocab::ordered_collection(
        &state.urls.followers(&user.username),
        user.followers,
    )))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson, AppError> {
    let user = full_user(&state, &username).await?;
    Ok(ActivityJson(vocab::ordered_collection(
        &state.urls.following(&user.username),
        user.following,
    )))
}

/// GET /users/:username/statuses/:id
///
/// Only posts still in the post cache are served.
async fn status(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
) -> Result<ActivityJson, AppError> {
    let post = state.posts.cached(&id).await.ok_or(AppError::NotFound)?;
    if !post.author_username.eq_ignore_ascii_case(&username) {
        return Err(AppError::NotFound);
    }

    let mut note = vocab::note(&state.urls, &post.author_username, &post);
    if let Some(object) = note.as_object_mut() {
        object.insert("@context".to_string(), Value::from(ACTIVITY_STREAMS_CONTEXT));
    }
    Ok(ActivityJson(note))
}

/// Actor IRI a signature must belong to, when known.
fn signing_actor(status: &SignatureStatus) -> Option<String> {
    match status {
        SignatureStatus::Signed {
            owner: Some(owner), ..
        } => Some(owner.clone()),
        SignatureStatus::Signed { key_id, owner: None } if !key_id.is_empty() => key_id
            .split('#')
            .next()
            .map(str::to_string),
        _ => None,
    }
}

/// POST /users/:username/inbox
///
/// Requires a valid signature whose key belongs to the activity's actor.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    trace_id: Option<Extension<TraceId>>,
    signature: SignatureStatus,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if !signature.is_signed() {
        tracing::debug!(signature = ?signature, "rejecting unsigned inbox request");
        return Err(AppError::Forbidden);
    }

    state.twitter.get_user(&username).await?;

    let activity: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("invalid activity: {e}")))?;

    if let Some(signer) = signing_actor(&signature) {
        let actors = vocab::iris(activity.get("actor"));
        if !actors.iter().any(|actor| actor == &signer) {
            tracing::info!(signer = %signer, actors = ?actors, "signature does not belong to the activity actor");
            return Err(AppError::Forbidden);
        }
    }

    let trace_id = trace_id.map(|Extension(id)| id).unwrap_or_default();
    state.inbox.handle(&activity, &trace_id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_actor() {
        let signed = SignatureStatus::Signed {
            key_id: "https://b.example/users/bob#main-key".to_string(),
            owner: None,
        };
        assert_eq!(
            signing_actor(&signed).as_deref(),
            Some("https://b.example/users/bob")
        );

        let owned = SignatureStatus::Signed {
            key_id: "https://b.example/keys/1".to_string(),
            owner: Some("https://b.example/users/bob".to_string()),
        };
        assert_eq!(
            signing_actor(&owned).as_deref(),
            Some("https://b.example/users/bob")
        );

        let disabled = SignatureStatus::Signed {
            key_id: String::new(),
            owner: None,
        };
        assert_eq!(signing_actor(&disabled), None);
        assert_eq!(signing_actor(&SignatureStatus::Unsigned), None);
    }
}
