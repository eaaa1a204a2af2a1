//! Inbound signature verification
//!
//! The middleware never rejects a request. It records a [`SignatureStatus`]
//! in the request extensions and handlers decide whether a signature is
//! required.

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use super::keys::KeyFetcher;
use super::signature::{SignatureError, SignedRequest, parse_signature_header, verify_request};
use crate::error::AppError;
use crate::metrics::SIGNATURE_CHECKS_TOTAL;

/// Largest body buffered for digest verification
const MAX_SIGNED_BODY: usize = 1024 * 1024;

/// A key is refetched after a failed verification at most once per interval
const REFETCH_INTERVAL: Duration = Duration::from_secs(60);

/// Key ids tracked for refetch throttling
const REFETCH_TRACKED: u64 = 10_000;

/// Outcome of the signature check of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Signed {
        key_id: String,
        /// Actor owning the key, when known
        owner: Option<String>,
    },
    Unsigned,
    Invalid,
}

impl SignatureStatus {
    pub fn is_signed(&self) -> bool {
        matches!(self, SignatureStatus::Signed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            SignatureStatus::Signed { .. } => "signed",
            SignatureStatus::Unsigned => "unsigned",
            SignatureStatus::Invalid => "invalid",
        }
    }
}

/// Requests that never went through the middleware count as unsigned.
#[async_trait]
impl<S> FromRequestParts<S> for SignatureStatus
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<SignatureStatus>()
            .cloned()
            .unwrap_or(SignatureStatus::Unsigned))
    }
}

pub struct SignatureVerifier {
    keys: Arc<dyn KeyFetcher>,
    max_clock_skew: Duration,
    /// Trust every request. Development only.
    disabled: bool,
    /// Key ids refetched within the last [`REFETCH_INTERVAL`]
    refetched: Cache<String, ()>,
}

impl SignatureVerifier {
    pub fn new(keys: Arc<dyn KeyFetcher>, max_clock_skew: Duration, disabled: bool) -> Self {
        Self {
            keys,
            max_clock_skew,
            disabled,
            refetched: Cache::builder()
                .max_capacity(REFETCH_TRACKED)
                .time_to_live(REFETCH_INTERVAL)
                .build(),
        }
    }

    /// Evaluate the `Signature` header of a request.
    pub async fn verify(&self, request: &SignedRequest<'_>) -> SignatureStatus {
        let header = request
            .headers
            .get("signature")
            .and_then(|value| value.to_str().ok());

        if self.disabled {
            let key_id = header
                .and_then(|header| parse_signature_header(header).ok())
                .map(|parsed| parsed.key_id)
                .unwrap_or_default();
            return SignatureStatus::Signed { key_id, owner: None };
        }

        let Some(header) = header else {
            return SignatureStatus::Unsigned;
        };

        match self.check(request, header).await {
            Ok(status) => status,
            Err(e) => {
                tracing::info!(error = %e, "invalid request signature");
                SignatureStatus::Invalid
            }
        }
    }

    async fn check(
        &self,
        request: &SignedRequest<'_>,
        header: &str,
    ) -> Result<SignatureStatus, AppError> {
        let parsed = parse_signature_header(header).map_err(invalid)?;

        let key = self.keys.fetch_key(&parsed.key_id).await?;
        let mut verified = verify_request(request, &parsed, &key.key, self.max_clock_skew);

        // The owner may have rotated its key since it was cached
        let key = if matches!(verified, Err(SignatureError::Invalid))
            && self.may_refetch(&parsed.key_id).await
        {
            self.keys.invalidate(&parsed.key_id).await;
            let fresh = self.keys.fetch_key(&parsed.key_id).await?;
            verified = verify_request(request, &parsed, &fresh.key, self.max_clock_skew);
            fresh
        } else {
            key
        };
        verified.map_err(invalid)?;

        Ok(SignatureStatus::Signed {
            key_id: parsed.key_id,
            owner: key.owner.clone(),
        })
    }

    /// Claim the refetch slot of `key_id` for the current interval.
    async fn may_refetch(&self, key_id: &str) -> bool {
        let claimed = self
            .refetched
            .entry(key_id.to_string())
            .or_insert(())
            .await
            .is_fresh();
        if !claimed {
            tracing::debug!(key_id = %key_id, "key refetched recently, not fetching again");
        }
        claimed
    }
}

fn invalid(error: SignatureError) -> AppError {
    AppError::Validation(error.to_string())
}

/// Buffer the body, evaluate the signature and record the result in the
/// request extensions.
pub async fn verify_signature(
    State(verifier): State<Arc<SignatureVerifier>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_SIGNED_BODY).await {
        Ok(body) => body,
        Err(e) => {
            return AppError::Validation(format!("unreadable body: {e}")).into_response();
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let status = verifier
        .verify(&SignedRequest {
            method: parts.method.as_str(),
            path_and_query,
            headers: &parts.headers,
            body: &body,
        })
        .await;

    SIGNATURE_CHECKS_TOTAL
        .with_label_values(&[status.label()])
        .inc();
    tracing::debug!(signature = status.label(), "signature evaluated");

    parts.extensions.insert(status);
    next.run(Request::from_parts(parts, Body::from(body))).await
}
