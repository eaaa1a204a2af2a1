//! SQLite database operations
//!
//! All persistent state goes through this module: users, actors,
//! follow edges and (through [`Database::pool`]) the task queue.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use super::repository::{ActorRepository, UserRepository};
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Shared pool, used by the task queue.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl UserRepository for Database {
    async fn get(&self, username: &str) -> Result<Option<LocalUser>, AppError> {
        let user = sqlx::query_as::<_, LocalUser>(
            "SELECT username, upstream_id, private_key_pem, created_at FROM users WHERE username = ?",
        )
        .bind(username.to_ascii_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn get_by_upstream_id(&self, upstream_id: i64) -> Result<Option<LocalUser>, AppError> {
        let user = sqlx::query_as::<_, LocalUser>(
            "SELECT username, upstream_id, private_key_pem, created_at FROM users WHERE upstream_id = ?",
        )
        .bind(upstream_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn create_user(&self, user: &LocalUser) -> Result<(), AppError> {
        sqlx::query(
            "INSERT OR IGNORE INTO users (username, upstream_id, private_key_pem, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user.username.to_ascii_lowercase())
        .bind(user.upstream_id)
        .bind(&user.private_key_pem)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn follow(&self, user: &LocalUser, actor: &RemoteActor) -> Result<(), AppError> {
        sqlx::query(
            "INSERT OR IGNORE INTO followers (username, actor_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(&user.username)
        .bind(&actor.id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn unfollow(&self, user: &LocalUser, actor: &RemoteActor) -> Result<(), AppError> {
        sqlx::query("DELETE FROM followers WHERE username = ? AND actor_id = ?")
            .bind(&user.username)
            .bind(&actor.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_with_followers(&self) -> Result<Vec<LocalUser>, AppError> {
        let users = sqlx::query_as::<_, LocalUser>(
            "SELECT u.username, u.upstream_id, u.private_key_pem, u.created_at FROM users u \
             WHERE EXISTS (SELECT 1 FROM followers f WHERE f.username = u.username) \
             ORDER BY u.username",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    async fn get_followers(&self, user: &LocalUser) -> Result<Vec<RemoteActor>, AppError> {
        let actors = sqlx::query_as::<_, RemoteActor>(
            "SELECT a.id, a.url, a.public_key_pem, a.created_at FROM actors a \
             JOIN followers f ON f.actor_id = a.id \
             WHERE f.username = ? ORDER BY f.created_at",
        )
        .bind(&user.username)
        .fetch_all(&self.pool)
        .await?;

        Ok(actors)
    }
}

#[async_trait]
impl ActorRepository for Database {
    async fn get(&self, url: &str) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>(
            "SELECT id, url, public_key_pem, created_at FROM actors WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    async fn create(&self, url: &str, public_key_pem: &str) -> Result<RemoteActor, AppError> {
        sqlx::query(
            "INSERT INTO actors (id, url, public_key_pem, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(url) DO UPDATE SET public_key_pem = excluded.public_key_pem",
        )
        .bind(EntityId::new().0)
        .bind(url)
        .bind(public_key_pem)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        ActorRepository::get(self, url)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("actor {url} vanished after insert")))
    }
}
