//! Persistence seams
//!
//! Services depend on these traits rather than on [`super::Database`],
//! so tests can swap in their own stores.

use async_trait::async_trait;

use super::models::{LocalUser, RemoteActor};
use crate::error::AppError;

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Look a user up by username (case-insensitive).
    async fn get(&self, username: &str) -> Result<Option<LocalUser>, AppError>;

    /// Look a user up by upstream numeric id.
    async fn get_by_upstream_id(&self, upstream_id: i64) -> Result<Option<LocalUser>, AppError>;

    /// Insert a user; an existing username is left untouched.
    async fn create_user(&self, user: &LocalUser) -> Result<(), AppError>;

    /// Record `actor` as a follower of `user`. Idempotent.
    async fn follow(&self, user: &LocalUser, actor: &RemoteActor) -> Result<(), AppError>;

    /// Remove the follow edge. Removing a missing edge succeeds.
    async fn unfollow(&self, user: &LocalUser, actor: &RemoteActor) -> Result<(), AppError>;

    /// Users with at least one follower, in a stable order.
    async fn get_with_followers(&self) -> Result<Vec<LocalUser>, AppError>;

    async fn get_followers(&self, user: &LocalUser) -> Result<Vec<RemoteActor>, AppError>;
}

#[async_trait]
pub trait ActorRepository: Send + Sync {
    async fn get(&self, url: &str) -> Result<Option<RemoteActor>, AppError>;

    /// Insert the actor, or refresh its public key when it already exists.
    async fn create(&self, url: &str, public_key_pem: &str) -> Result<RemoteActor, AppError>;
}
