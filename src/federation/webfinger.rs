//! WebFinger and host-meta documents
//!
//! Lets remote servers discover the actor behind `acct:user@domain`.

use serde::{Deserialize, Serialize};

use super::vocab::{ACTIVITY_JSON, Urls};
use crate::error::AppError;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Username addressed by a WebFinger `resource`.
///
/// # Errors
/// - [`AppError::Validation`] unless the resource reads `acct:user@domain`
/// - [`AppError::NotFound`] when the domain is not ours
pub fn parse_resource(resource: &str, domain: &str) -> Result<String, AppError> {
    let invalid = || AppError::Validation(format!("invalid resource {resource}"));

    let account = resource.strip_prefix("acct:").ok_or_else(invalid)?;
    let account = account.strip_prefix('@').unwrap_or(account);
    let (username, host) = account.split_once('@').ok_or_else(invalid)?;
    if username.is_empty() || host.is_empty() {
        return Err(invalid());
    }
    if !host.eq_ignore_ascii_case(domain) {
        return Err(AppError::NotFound);
    }

    Ok(username.to_ascii_lowercase())
}

/// Generate WebFinger response for a bridged user.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `urls` - Instance URLs
pub fn generate_webfinger_response(username: &str, domain: &str, urls: &Urls) -> WebFingerResponse {
    let actor_url = urls.user(username);

    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_url),
                template: None,
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(format!("https://twitter.com/{username}")),
                template: None,
            },
        ],
    }
}

/// XRD document pointing at the WebFinger endpoint.
pub fn host_meta(urls: &Urls) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" type="application/xrd+xml" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>
"#,
        urls.base_url()
    )
}
