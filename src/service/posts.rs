//! Post service
//!
//! Materializes upstream posts with their media, referenced posts and
//! authors. Each post id is fetched at most once while it stays cached,
//! however many deliveries ask for it at the same time.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use super::users::UserService;
use crate::data::{Cache, MokaCache};
use crate::error::AppError;
use crate::twitter::backend::{Includes, PROBLEM_NOT_FOUND, RawPost};
use crate::twitter::models::strip_trailing_short_link;
use crate::twitter::{Media, Post, ReferenceKind, TwitterClient, UpstreamError};

#[derive(Debug, Error)]
pub enum PostError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("post {0} was not returned by upstream")]
    Missing(String),

    #[error("post {id} is invalid: {reason}")]
    Invalid { id: String, reason: String },

    #[error("unable to create post authors: {0}")]
    Authors(#[source] AppError),
}

impl PostError {
    /// Whether fetching the post again later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PostError::Upstream(error) => error.is_transient(),
            PostError::Authors(AppError::UpstreamUserNotFound(_)) => false,
            PostError::Authors(_) => true,
            PostError::Missing(_) | PostError::Invalid { .. } => false,
        }
    }
}

pub struct PostService {
    twitter: Arc<TwitterClient>,
    users: Arc<UserService>,
    cache: Arc<MokaCache<Post>>,
}

impl PostService {
    pub fn new(twitter: Arc<TwitterClient>, users: Arc<UserService>, cache: Arc<MokaCache<Post>>) -> Self {
        Self {
            twitter,
            users,
            cache,
        }
    }

    /// A post already materialized, if still cached.
    pub async fn cached(&self, post_id: &str) -> Option<Post> {
        self.cache.get(post_id).await
    }

    /// Return the post, fetching it with its references on a cache miss.
    ///
    /// Concurrent callers for the same id share a single fetch.
    pub async fn save_post_and_references(&self, post_id: &str) -> Result<Post, Arc<PostError>> {
        self.cache
            .get_or_try_insert_with(post_id, self.fetch(post_id))
            .await
    }

    async fn fetch(&self, post_id: &str) -> Result<Post, PostError> {
        let response = self
            .twitter
            .backend()
            .post_lookup(&[post_id.to_string()])
            .await?;

        let raw = response
            .data
            .iter()
            .find(|raw| raw.id == post_id)
            .ok_or_else(|| PostError::Missing(post_id.to_string()))?;
        let mut post = convert_post(raw, None, &response.includes)?;

        if !raw.referenced_tweets.is_empty() {
            post.references = self.fetch_references(raw).await?;
        }

        let mut author_ids: Vec<String> = post
            .references
            .iter()
            .map(|reference| reference.author_id.clone())
            .collect();
        author_ids.push(post.author_id.clone());
        self.users
            .batch_create_users_from_ids(&author_ids)
            .await
            .map_err(PostError::Authors)?;

        tracing::debug!(post_id = %post.id, references = post.references.len(), "materialized post");
        Ok(post)
    }

    /// Referenced posts, cached ones first, the rest in a single lookup.
    async fn fetch_references(&self, raw: &RawPost) -> Result<Vec<Post>, PostError> {
        let mut references = Vec::with_capacity(raw.referenced_tweets.len());
        let mut missing = Vec::new();

        for reference in &raw.referenced_tweets {
            let kind = reference_kind(&reference.kind);
            match self.cache.get(&reference.id).await {
                Some(mut cached) => {
                    cached.reference_kind = Some(kind);
                    cached.references.clear();
                    references.push(cached);
                }
                None => missing.push(reference.id.clone()),
            }
        }

        if missing.is_empty() {
            return Ok(references);
        }

        let response = self.twitter.backend().post_lookup(&missing).await?;
        for problem in &response.errors {
            if problem.problem_type == PROBLEM_NOT_FOUND {
                tracing::warn!(post_id = %raw.id, reference = ?problem.value, "referenced post is gone");
            }
        }

        for referenced in &response.data {
            let Some(reference) = raw
                .referenced_tweets
                .iter()
                .find(|reference| reference.id == referenced.id)
            else {
                continue;
            };
            let mut post = convert_post(referenced, None, &response.includes)?;
            self.cache.set(&post.id, post.clone()).await;
            post.reference_kind = Some(reference_kind(&reference.kind));
            references.push(post);
        }

        Ok(references)
    }
}

fn reference_kind(kind: &str) -> ReferenceKind {
    serde_json::from_value(serde_json::Value::String(kind.to_string()))
        .unwrap_or(ReferenceKind::Unknown)
}

/// Build a [`Post`] from its wire representation and the lookup includes.
fn convert_post(
    raw: &RawPost,
    reference_kind: Option<ReferenceKind>,
    includes: &Includes,
) -> Result<Post, PostError> {
    let invalid = |reason: String| PostError::Invalid {
        id: raw.id.clone(),
        reason,
    };

    let published = raw
        .created_at
        .as_deref()
        .ok_or_else(|| invalid("missing creation date".to_string()))
        .and_then(|created_at| {
            DateTime::parse_from_rfc3339(created_at)
                .map(|date| date.with_timezone(&Utc))
                .map_err(|e| invalid(format!("creation date: {e}")))
        })?;

    let author_id = raw
        .author_id
        .clone()
        .ok_or_else(|| invalid("missing author".to_string()))?;
    let author_username = includes
        .users
        .iter()
        .find(|user| user.id == author_id)
        .map(|user| user.username.to_ascii_lowercase())
        .unwrap_or_default();

    let media = raw
        .attachments
        .iter()
        .flat_map(|attachments| attachments.media_keys.iter())
        .filter_map(|key| includes.media.iter().find(|media| &media.media_key == key))
        .map(|media| Media {
            kind: media.kind.clone(),
            url: media.url.clone(),
            width: media.width,
            height: media.height,
        })
        .collect();

    Ok(Post {
        id: raw.id.clone(),
        author_id,
        author_username,
        text: strip_trailing_short_link(&raw.text),
        published,
        sensitive: raw.possibly_sensitive,
        media,
        reference_kind,
        references: Vec::new(),
    })
}
