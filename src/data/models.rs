//! Data models
//!
//! Rust structs representing database entities.
//! Actors use ULID for IDs; all models use chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Local user
// =============================================================================

/// A bridged upstream account served as an ActivityPub actor
///
/// The keypair is generated once at creation and never rotated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalUser {
    /// Lowercase upstream handle, also the actor path segment
    pub username: String,
    /// Upstream numeric account id
    pub upstream_id: i64,
    /// RSA private key (PKCS#8 PEM)
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Remote actor
// =============================================================================

/// A Fediverse actor known to this instance
///
/// Rows are never deleted; unfollowing only removes the edge.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteActor {
    pub id: String,
    /// Actor IRI
    pub url: String,
    /// Public key (SPKI PEM) as published by the actor
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

impl RemoteActor {
    /// Inbox deliveries go to `{actor}/inbox`.
    pub fn inbox_url(&self) -> String {
        format!("{}/inbox", self.url.trim_end_matches('/'))
    }
}
