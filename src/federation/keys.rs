//! Key management
//!
//! - Generates the RSA keypair of every bridged user
//! - Fetches and caches remote actor public keys
//! - Formats public keys for served actor documents
//!
//! Remote keys may be RSA, ECDSA P-256 or Ed25519. The verification
//! algorithm is always taken from the decoded key, see [`PublicKey::verify`].

use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::Verifier;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use super::vocab::ACTIVITY_JSON;
use crate::data::LocalUser;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

/// Size of generated user keys
pub const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unable to generate key: {0}")]
    Generate(String),

    #[error("unable to decode key: {0}")]
    Decode(String),

    #[error("unable to fetch key {key_id}: {reason}")]
    Fetch { key_id: String, reason: String },

    #[error("refusing to fetch key from {0}")]
    DisallowedHost(String),
}

/// Signature algorithm implied by a public key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    RsaSha256,
    EcdsaP256Sha256,
    Ed25519,
}

impl KeyAlgorithm {
    /// Name as used in the `algorithm` signature parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::RsaSha256 => "rsa-sha256",
            KeyAlgorithm::EcdsaP256Sha256 => "ecdsa-sha256",
            KeyAlgorithm::Ed25519 => "ed25519",
        }
    }
}

/// A decoded remote public key
#[derive(Debug, Clone)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    Ecdsa(p256::ecdsa::VerifyingKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl PublicKey {
    /// Decode a PEM public key (SPKI, or PKCS#1 for RSA).
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let pem = pem.trim();
        if !pem.starts_with("-----BEGIN") {
            return Err(KeyError::Decode("missing PEM block".to_string()));
        }

        if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
            return Ok(PublicKey::Rsa(key));
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_pem(pem) {
            return Ok(PublicKey::Rsa(key));
        }
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            return Ok(PublicKey::Ecdsa(key));
        }
        if let Ok(key) = ed25519_dalek::VerifyingKey::from_public_key_pem(pem) {
            return Ok(PublicKey::Ed25519(key));
        }

        Err(KeyError::Decode(
            "PEM block is not an RSA, P-256 or Ed25519 public key".to_string(),
        ))
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            PublicKey::Rsa(_) => KeyAlgorithm::RsaSha256,
            PublicKey::Ecdsa(_) => KeyAlgorithm::EcdsaP256Sha256,
            PublicKey::Ed25519(_) => KeyAlgorithm::Ed25519,
        }
    }

    /// Verify `signature` over `message` with the algorithm of this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self {
            PublicKey::Rsa(key) => {
                let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                rsa::pkcs1v15::Signature::try_from(signature)
                    .map(|sig| verifier.verify(message, &sig).is_ok())
                    .unwrap_or(false)
            }
            PublicKey::Ecdsa(key) => {
                let sig = p256::ecdsa::Signature::from_der(signature)
                    .or_else(|_| p256::ecdsa::Signature::from_slice(signature));
                match sig {
                    Ok(sig) => key.verify(message, &sig).is_ok(),
                    Err(_) => false,
                }
            }
            PublicKey::Ed25519(key) => ed25519_dalek::Signature::from_slice(signature)
                .map(|sig| key.verify(message, &sig).is_ok())
                .unwrap_or(false),
        }
    }
}

/// A remote key as published by its owner
#[derive(Debug, Clone)]
pub struct FetchedKey {
    pub key_id: String,
    /// Actor the key belongs to, when the document says so
    pub owner: Option<String>,
    pub pem: String,
    pub key: PublicKey,
}

/// Generate a fresh RSA keypair for a new user.
pub fn generate_key() -> Result<RsaPrivateKey, KeyError> {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, RSA_KEY_BITS).map_err(|e| KeyError::Generate(e.to_string()))
}

/// PKCS#8 PEM of a private key, as persisted in the users table.
pub fn encode_private_key(key: &RsaPrivateKey) -> Result<String, KeyError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|e| KeyError::Generate(e.to_string()))
}

/// Decode the persisted private key of a user.
pub fn user_private_key(user: &LocalUser) -> Result<RsaPrivateKey, KeyError> {
    RsaPrivateKey::from_pkcs8_pem(&user.private_key_pem)
        .map_err(|e| KeyError::Decode(format!("private key of {}: {}", user.username, e)))
}

/// SPKI PEM of a public key; empty when encoding fails.
pub fn format_pub_key(key: &RsaPublicKey) -> String {
    key.to_public_key_pem(LineEnding::LF).unwrap_or_default()
}

/// Public key PEM served in a user's actor document.
pub fn user_public_key_pem(user: &LocalUser) -> String {
    user_private_key(user)
        .map(|key| format_pub_key(&RsaPublicKey::from(&key)))
        .unwrap_or_default()
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Fetches remote keys through a bounded LRU cache.
pub struct KeyManager {
    http_client: reqwest::Client,
    cache: Cache<String, Arc<FetchedKey>>,
    allow_private_hosts: bool,
}

impl KeyManager {
    /// # Arguments
    /// * `capacity` - Maximum number of cached keys
    /// * `allow_private_hosts` - Permit fetches towards loopback/private networks
    pub fn new(http_client: reqwest::Client, capacity: u64, allow_private_hosts: bool) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            http_client,
            cache,
            allow_private_hosts,
        }
    }

    /// Return the public key identified by `key_id`.
    ///
    /// Cache first; on a miss the document behind the key id (fragment
    /// stripped) is fetched as ActivityPub JSON and its
    /// `publicKey.publicKeyPem` decoded.
    pub async fn fetch_key(&self, key_id: &str) -> Result<Arc<FetchedKey>, KeyError> {
        if let Some(key) = self.cache.get(key_id).await {
            CACHE_HITS_TOTAL.with_label_values(&["public_keys"]).inc();
            return Ok(key);
        }
        CACHE_MISSES_TOTAL.with_label_values(&["public_keys"]).inc();

        let fetched = Arc::new(self.fetch_remote(key_id).await?);
        self.cache.insert(key_id.to_string(), fetched.clone()).await;
        tracing::debug!(key_id = %key_id, algorithm = fetched.key.algorithm().as_str(), "cached remote key");
        Ok(fetched)
    }

    /// Drop a cached key, e.g. after the owner rotated it.
    pub async fn invalidate(&self, key_id: &str) {
        self.cache.invalidate(key_id).await;
    }

    async fn fetch_remote(&self, key_id: &str) -> Result<FetchedKey, KeyError> {
        let fetch_error = |reason: String| KeyError::Fetch {
            key_id: key_id.to_string(),
            reason,
        };

        let document_url = key_id.split('#').next().unwrap_or(key_id);
        let parsed = url::Url::parse(document_url).map_err(|e| fetch_error(e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => return Err(fetch_error(format!("unsupported scheme {scheme}"))),
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| fetch_error("missing host".to_string()))?;
        if !self.allow_private_hosts {
            self.check_public_host(host, parsed.port_or_known_default().unwrap_or(443))
                .await?;
        }

        let response = self
            .http_client
            .get(document_url)
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }

        let document: serde_json::Value = response
            .json()
            .await
            .map_err(|e| KeyError::Decode(format!("actor document: {e}")))?;

        extract_public_key(key_id, &document)
    }

    async fn check_public_host(&self, host: &str, port: u16) -> Result<(), KeyError> {
        if is_disallowed_host(host) {
            return Err(KeyError::DisallowedHost(host.to_string()));
        }

        let lookup = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| KeyError::Fetch {
                key_id: host.to_string(),
                reason: format!("DNS lookup failed: {e}"),
            })?;
        for addr in lookup {
            if is_disallowed_ip(addr.ip()) {
                return Err(KeyError::DisallowedHost(host.to_string()));
            }
        }

        Ok(())
    }
}

/// Source of remote public keys, implemented by [`KeyManager`].
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch_key(&self, key_id: &str) -> Result<Arc<FetchedKey>, KeyError>;

    async fn invalidate(&self, key_id: &str);
}

#[async_trait]
impl KeyFetcher for KeyManager {
    async fn fetch_key(&self, key_id: &str) -> Result<Arc<FetchedKey>, KeyError> {
        KeyManager::fetch_key(self, key_id).await
    }

    async fn invalidate(&self, key_id: &str) {
        KeyManager::invalidate(self, key_id).await
    }
}

/// Whether both IRIs share scheme, host and port.
fn same_origin(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin().is_tuple() && a.origin() == b.origin(),
        _ => false,
    }
}

/// Find the key matching `key_id` in an actor (or bare key) document.
fn extract_public_key(key_id: &str, document: &serde_json::Value) -> Result<FetchedKey, KeyError> {
    // Bare key documents carry publicKeyPem at the root
    let candidates: Vec<&serde_json::Value> = match document.get("publicKey") {
        Some(serde_json::Value::Array(keys)) => keys.iter().collect(),
        Some(key) => vec![key],
        None if document.get("publicKeyPem").is_some() => vec![document],
        None => Vec::new(),
    };

    let entry = candidates
        .iter()
        .find(|key| key.get("id").and_then(|id| id.as_str()) == Some(key_id))
        .or_else(|| candidates.first())
        .ok_or_else(|| KeyError::Decode("document has no publicKey".to_string()))?;

    let pem = entry
        .get("publicKeyPem")
        .and_then(|pem| pem.as_str())
        .ok_or_else(|| KeyError::Decode("publicKeyPem is missing".to_string()))?;

    // A document only speaks for actors on its own origin
    let owner = entry
        .get("owner")
        .and_then(|owner| owner.as_str())
        .or_else(|| document.get("id").and_then(|id| id.as_str()))
        .filter(|owner| same_origin(owner, key_id))
        .map(str::to_string);

    Ok(FetchedKey {
        key_id: key_id.to_string(),
        owner,
        pem: pem.to_string(),
        key: PublicKey::from_pem(pem)?,
    })
}
