//! Upstream models
//!
//! Domain types built from the raw API responses in [`super::backend`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A profile of an upstream account, cached for rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwitterUser {
    pub id: i64,
    /// Lowercase handle
    pub username: String,
    pub name: String,
    pub description: String,
    /// Full size avatar (the `_normal` thumbnail suffix is dropped)
    pub profile_image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub followers: u64,
    pub following: u64,
    pub posts: u64,
}

/// How a post points at another one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Retweeted,
    Quoted,
    RepliedTo,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    /// "photo", "video" or "animated_gif"
    pub kind: String,
    /// Only photos expose a direct URL
    pub url: Option<String>,
    pub width: u32,
    pub height: u32,
}

/// A materialized post
///
/// `references` holds the posts this one points at, each tagged with
/// its `reference_kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub author_username: String,
    pub text: String,
    pub published: DateTime<Utc>,
    pub sensitive: bool,
    #[serde(default)]
    pub media: Vec<Media>,
    #[serde(default)]
    pub reference_kind: Option<ReferenceKind>,
    #[serde(default)]
    pub references: Vec<Post>,
}

impl Post {
    /// The retweeted post, if this post is a retweet.
    pub fn retweet(&self) -> Option<&Post> {
        self.references
            .iter()
            .find(|post| post.reference_kind == Some(ReferenceKind::Retweeted))
    }
}

/// Drop the trailing `t.co` link the upstream API appends to posts
/// carrying media or quotes.
pub fn strip_trailing_short_link(text: &str) -> String {
    const PREFIX: &str = "https://t.co/";
    const SLUG_CHARS: usize = 10;

    if let Some(position) = text.rfind(PREFIX) {
        let slug = &text[position + PREFIX.len()..];
        let preceded_by_space = text[..position]
            .chars()
            .next_back()
            .is_some_and(char::is_whitespace);
        if preceded_by_space && slug.chars().count() == SLUG_CHARS && !slug.contains('\n') {
            let head = &text[..position];
            let mut trimmed = head.char_indices();
            if let Some((last, _)) = trimmed.next_back() {
                return head[..last].to_string();
            }
        }
    }
    text.to_string()
}
