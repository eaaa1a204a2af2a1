//! User service
//!
//! Bridges local users (keys, follow edges) with their upstream profile.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::data::{LocalUser, UserRepository};
use crate::error::AppError;
use crate::federation::keys::{encode_private_key, generate_key, user_public_key_pem};
use crate::twitter::{TwitterClient, TwitterUser, UserQuery};

/// A local user with its upstream profile, as rendered in actor documents
#[derive(Debug, Clone)]
pub struct FullUser {
    pub username: String,
    pub name: String,
    pub description: String,
    pub profile_image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub followers: u64,
    pub following: u64,
    pub posts: u64,
    pub public_key_pem: String,
}

pub struct UserService {
    users: Arc<dyn UserRepository>,
    twitter: Arc<TwitterClient>,
}

impl UserService {
    pub fn new(users: Arc<dyn UserRepository>, twitter: Arc<TwitterClient>) -> Self {
        Self { users, twitter }
    }

    /// Local user merged with its upstream profile.
    ///
    /// # Errors
    /// - [`AppError::UserDoesNotExist`] when the user is not bridged
    /// - [`AppError::UpstreamUserNotFound`] when the upstream account is gone
    pub async fn get_full_user(&self, username: &str) -> Result<FullUser, AppError> {
        let user = self
            .users
            .get(username)
            .await?
            .ok_or_else(|| AppError::UserDoesNotExist(username.to_string()))?;

        let profile = self.twitter.get_user(&user.username).await?;

        Ok(FullUser {
            public_key_pem: user_public_key_pem(&user),
            username: user.username,
            name: profile.name,
            description: profile.description,
            profile_image_url: profile.profile_image_url,
            created_at: user.created_at,
            followers: profile.followers,
            following: profile.following,
            posts: profile.posts,
        })
    }

    /// Make sure every username is bridged, creating missing users.
    ///
    /// # Errors
    /// [`AppError::UpstreamUserNotFound`] for a username unknown upstream.
    pub async fn batch_create_users(&self, usernames: &[String]) -> Result<(), AppError> {
        for username in usernames {
            let existing = self.users.get(username).await?;
            let profile = self.twitter.get_user(username).await?;
            if existing.is_none() {
                tracing::debug!(username = %username, "user not found in database, creating it");
                self.create_user(&profile).await?;
            }
        }
        Ok(())
    }

    /// Bridge the upstream accounts behind `ids`, e.g. authors of
    /// referenced posts. Already bridged ids are left untouched.
    pub async fn batch_create_users_from_ids(&self, ids: &[String]) -> Result<(), AppError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Ok(());
        }

        let profiles = self.twitter.lookup(UserQuery::Ids(ids)).await?;
        for profile in profiles {
            if self.users.get_by_upstream_id(profile.id).await?.is_none() {
                tracing::debug!(upstream_id = profile.id, "user not found in database, creating it");
                self.create_user(&profile).await?;
            }
        }
        Ok(())
    }

    async fn create_user(&self, profile: &TwitterUser) -> Result<(), AppError> {
        let private_key_pem = tokio::task::spawn_blocking(|| {
            generate_key().and_then(|key| encode_private_key(&key))
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))??;

        let user = LocalUser {
            username: profile.username.to_ascii_lowercase(),
            upstream_id: profile.id,
            private_key_pem,
            created_at: profile.created_at,
        };
        self.users.create_user(&user).await?;
        tracing::info!(username = %user.username, "new user created with new keypair");
        Ok(())
    }
}
