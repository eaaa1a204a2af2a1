//! Activity delivery
//!
//! Signs and POSTs activities to remote inboxes on behalf of local users.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use super::keys::{KeyError, user_private_key};
use super::signature::{SignatureError, Signer};
use super::vocab::{ACTIVITY_JSON, Urls};
use crate::data::{LocalUser, RemoteActor};
use crate::metrics::{ACTIVITIES_SENT_TOTAL, DELIVERY_DURATION_SECONDS};

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The inbox answered anything but 202 Accepted
    #[error("inbox did not accept the activity: HTTP {status}")]
    InboxNotAccepted { status: u16 },

    #[error("delivery failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("signing failed: {0}")]
    Signing(#[from] SignatureError),

    #[error("invalid user key: {0}")]
    Key(#[from] KeyError),

    #[error("activity serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Remote server errors and transport failures are worth retrying;
    /// any other answer is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::InboxNotAccepted { status } => *status >= 500,
            DeliveryError::Transport(_) => true,
            DeliveryError::Signing(_) | DeliveryError::Key(_) | DeliveryError::Serialization(_) => {
                false
            }
        }
    }
}

#[async_trait]
pub trait ActivityPubClient: Send + Sync {
    /// Deliver `activity` from `from` to the inbox of `to`.
    async fn post_inbox(
        &self,
        from: &LocalUser,
        to: &RemoteActor,
        activity: &Value,
    ) -> Result<(), DeliveryError>;
}

pub struct HttpActivityPubClient {
    http_client: reqwest::Client,
    signer: Arc<Signer>,
    urls: Urls,
}

impl HttpActivityPubClient {
    pub fn new(http_client: reqwest::Client, signer: Arc<Signer>, urls: Urls) -> Self {
        Self {
            http_client,
            signer,
            urls,
        }
    }
}

fn activity_type(activity: &Value) -> &str {
    activity
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

#[async_trait]
impl ActivityPubClient for HttpActivityPubClient {
    async fn post_inbox(
        &self,
        from: &LocalUser,
        to: &RemoteActor,
        activity: &Value,
    ) -> Result<(), DeliveryError> {
        let inbox = to.inbox_url();
        let kind = activity_type(activity).to_string();
        let body = serde_json::to_vec(activity)?;

        let private_key = user_private_key(from)?;
        let headers = self.signer.sign(
            "POST",
            &inbox,
            &body,
            &private_key,
            &self.urls.key_id(&from.username),
        )?;

        let started = Instant::now();
        let response = self
            .http_client
            .post(&inbox)
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .header("Date", headers.date)
            .header("Digest", headers.digest)
            .header("Signature", headers.signature)
            .body(body)
            .send()
            .await;
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[kind.as_str()])
            .observe(started.elapsed().as_secs_f64());

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                ACTIVITIES_SENT_TOTAL
                    .with_label_values(&[kind.as_str(), "transport_error"])
                    .inc();
                return Err(e.into());
            }
        };

        let status = response.status();
        ACTIVITIES_SENT_TOTAL
            .with_label_values(&[kind.as_str(), status.as_str()])
            .inc();

        if status != reqwest::StatusCode::ACCEPTED {
            tracing::debug!(inbox = %inbox, status = status.as_u16(), activity_type = %kind, "inbox refused activity");
            return Err(DeliveryError::InboxNotAccepted {
                status: status.as_u16(),
            });
        }

        tracing::debug!(inbox = %inbox, activity_type = %kind, from = %from.username, "activity delivered");
        Ok(())
    }
}
