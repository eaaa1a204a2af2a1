//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per draft-cavage-http-signatures
//! as used by Mastodon: https://docs.joinmastodon.org/spec/security/
//!
//! The `algorithm` parameter of an inbound signature is advisory. The
//! verifier always uses the algorithm of the fetched key.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rsa::RsaPrivateKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use super::keys::PublicKey;

/// Headers covered by outbound signatures
pub const SIGNED_HEADERS: [&str; 4] = ["(request-target)", "date", "host", "digest"];

/// Validity announced by outbound signatures
pub const SIGNATURE_VALIDITY: Duration = Duration::from_secs(30);

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("malformed signature header: {0}")]
    Malformed(String),

    #[error("missing header: {0}")]
    MissingHeader(String),

    #[error("signed headers must include: {0}")]
    HeaderNotSigned(String),

    #[error("signature expired or not yet valid")]
    Expired,

    #[error("digest mismatch")]
    DigestMismatch,

    #[error("signature verification failed")]
    Invalid,

    #[error("unable to sign request: {0}")]
    Signing(String),
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm announced by the sender, never trusted
    pub algorithm: Option<String>,
    /// Signed header names, lowercase
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
    pub created: Option<i64>,
    pub expires: Option<i64>,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;
    let mut created = None;
    let mut expires = None;

    for (key, value) in signature_params(header)? {
        match key.as_str() {
            "keyId" => key_id = Some(value),
            "algorithm" => algorithm = Some(value),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect(),
                )
            }
            "signature" => signature = Some(value),
            "created" => created = value.parse().ok(),
            "expires" => expires = value.parse().ok(),
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| SignatureError::Malformed("missing keyId".to_string()))?,
        algorithm,
        // Absent headers parameter means only (created), per the draft
        headers: headers.unwrap_or_else(|| vec!["(created)".to_string()]),
        signature: signature
            .ok_or_else(|| SignatureError::Malformed("missing signature".to_string()))?,
        created,
        expires,
    })
}

/// Split `name=value` pairs; quoted values may contain commas and
/// backslash escapes.
fn signature_params(header: &str) -> Result<Vec<(String, String)>, SignatureError> {
    let malformed = |reason: &str| SignatureError::Malformed(reason.to_string());
    let mut params = Vec::new();
    let mut chars = header.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',') {
            key.push(c);
        }
        if chars.next() != Some('=') {
            return Err(malformed("parameter without value"));
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => return Err(malformed("unterminated quoted value")),
                    },
                    Some(c) => value.push(c),
                    None => return Err(malformed("unterminated quoted value")),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
        }

        params.push((key.trim().to_string(), value.trim().to_string()));
    }

    Ok(params)
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// The parts of an inbound request a signature can cover
pub struct SignedRequest<'a> {
    pub method: &'a str,
    /// Path plus query, as sent on the request line
    pub path_and_query: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

impl SignedRequest<'_> {
    fn header(&self, name: &str) -> Result<String, SignatureError> {
        let values: Vec<&str> = self
            .headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::trim)
            .collect();
        if values.is_empty() {
            return Err(SignatureError::MissingHeader(name.to_string()));
        }
        Ok(values.join(", "))
    }
}

fn signing_string(
    request: &SignedRequest<'_>,
    parsed: &ParsedSignature,
) -> Result<String, SignatureError> {
    let mut lines = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!(
                "{} {}",
                request.method.to_ascii_lowercase(),
                request.path_and_query
            ),
            "(created)" => parsed
                .created
                .ok_or_else(|| SignatureError::Malformed("missing created".to_string()))?
                .to_string(),
            "(expires)" => parsed
                .expires
                .ok_or_else(|| SignatureError::Malformed("missing expires".to_string()))?
                .to_string(),
            other => request.header(other)?,
        };
        lines.push(format!("{name}: {value}"));
    }
    Ok(lines.join("\n"))
}

/// Verify the signature of an inbound request against `key`.
///
/// # Errors
/// Any structural problem (missing or unsigned headers, stale date,
/// wrong digest) or a signature that does not verify.
pub fn verify_request(
    request: &SignedRequest<'_>,
    parsed: &ParsedSignature,
    key: &PublicKey,
    max_clock_skew: Duration,
) -> Result<(), SignatureError> {
    let now = Utc::now().timestamp();

    if !parsed.headers.iter().any(|h| h == "(request-target)") {
        return Err(SignatureError::HeaderNotSigned("(request-target)".to_string()));
    }

    if let Some(expires) = parsed.expires {
        if expires < now {
            return Err(SignatureError::Expired);
        }
    }

    if parsed.headers.iter().any(|h| h == "date") {
        let date = request.header("date")?;
        let date = DateTime::parse_from_rfc2822(&date)
            .map_err(|_| SignatureError::Malformed("invalid Date header".to_string()))?;
        if (now - date.timestamp()).unsigned_abs() > max_clock_skew.as_secs() {
            return Err(SignatureError::Expired);
        }
    } else if !parsed.headers.iter().any(|h| h == "(created)") {
        return Err(SignatureError::HeaderNotSigned("date".to_string()));
    }

    if !request.body.is_empty() {
        if !parsed.headers.iter().any(|h| h == "digest") {
            return Err(SignatureError::HeaderNotSigned("digest".to_string()));
        }
        let digest = request.header("digest")?;
        let expected = generate_digest(request.body);
        let expected = expected.trim_start_matches("SHA-256=");
        let matches = digest.split(',').map(str::trim).any(|candidate| {
            candidate
                .split_once('=')
                .is_some_and(|(alg, value)| alg.eq_ignore_ascii_case("sha-256") && value == expected)
        });
        if !matches {
            return Err(SignatureError::DigestMismatch);
        }
    }

    let signing_string = signing_string(request, parsed)?;
    let signature = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::Malformed("signature is not base64".to_string()))?;

    if let Some(announced) = parsed.algorithm.as_deref() {
        if announced != "hs2019" && announced != key.algorithm().as_str() {
            tracing::debug!(
                key_id = %parsed.key_id,
                announced,
                actual = key.algorithm().as_str(),
                "ignoring announced signature algorithm"
            );
        }
    }

    if key.verify(signing_string.as_bytes(), &signature) {
        Ok(())
    } else {
        Err(SignatureError::Invalid)
    }
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value
    pub digest: String,
    /// Host header value the signature covers
    pub host: String,
}

/// Outbound request signer
///
/// The RNG used for RSA blinding is the signer's only state; every
/// signature goes through the same mutex.
pub struct Signer {
    rng: Mutex<StdRng>,
    validity: Duration,
}

impl Signer {
    pub fn new() -> Self {
        Self::with_validity(SIGNATURE_VALIDITY)
    }

    pub fn with_validity(validity: Duration) -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            validity,
        }
    }

    /// Sign a request with RSA-SHA256 over [`SIGNED_HEADERS`].
    ///
    /// # Arguments
    /// * `method` - HTTP method (e.g., "POST")
    /// * `url` - Full URL being requested
    /// * `body` - Request body (for digest)
    /// * `private_key` - Key of the sending user
    /// * `key_id` - Full URL to the public key (actor#main-key)
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        body: &[u8],
        private_key: &RsaPrivateKey,
        key_id: &str,
    ) -> Result<SignatureHeaders, SignatureError> {
        let parsed_url =
            url::Url::parse(url).map_err(|e| SignatureError::Signing(format!("invalid URL: {e}")))?;

        let host = match (parsed_url.host_str(), parsed_url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(SignatureError::Signing("missing host in URL".to_string())),
        };

        let path_and_query = match parsed_url.query() {
            Some(query) => format!("{}?{}", parsed_url.path(), query),
            None => parsed_url.path().to_string(),
        };

        let now = Utc::now();
        let date = now.format(HTTP_DATE_FORMAT).to_string();
        let digest = generate_digest(body);
        let created = now.timestamp();
        let expires = created + self.validity.as_secs() as i64;

        let signing_string = [
            format!("(request-target): {} {}", method.to_ascii_lowercase(), path_and_query),
            format!("date: {date}"),
            format!("host: {host}"),
            format!("digest: {digest}"),
        ]
        .join("\n");

        let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key.clone());
        let signature = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            signing_key.sign_with_rng(&mut *rng, signing_string.as_bytes())
        };

        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\",created={},expires={}",
            key_id,
            SIGNED_HEADERS.join(" "),
            BASE64.encode(signature.to_bytes()),
            created,
            expires,
        );

        Ok(SignatureHeaders {
            signature: signature_header,
            date,
            digest,
            host,
        })
    }
}

impl Default for Signer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::keys::format_pub_key;
    use http::{HeaderMap, HeaderValue};
    use rsa::RsaPublicKey;

    fn generate_test_keypair() -> (RsaPrivateKey, PublicKey) {
        let private_key =
            RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key generation should work");
        let public_key = PublicKey::from_pem(&format_pub_key(&RsaPublicKey::from(&private_key)))
            .expect("public key");
        (private_key, public_key)
    }

    fn build_signed_header_map(
        url: &str,
        body: &[u8],
        private_key: &RsaPrivateKey,
    ) -> (HeaderMap, String, ParsedSignature) {
        let key_id = "https://remote.example/users/alice#main-key";
        let signed = Signer::new()
            .sign("POST", url, body, private_key, key_id)
            .expect("signed");
        let parsed_url = url::Url::parse(url).expect("valid test url");
        let path_and_query = match parsed_url.query() {
            Some(query) => format!("{}?{}", parsed_url.path(), query),
            None => parsed_url.path().to_string(),
        };

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&signed.host).expect("host header"));
        headers.insert("date", HeaderValue::from_str(&signed.date).expect("date header"));
        headers.insert("digest", HeaderValue::from_str(&signed.digest).expect("digest header"));
        headers.insert(
            "signature",
            HeaderValue::from_str(&signed.signature).expect("signature header"),
        );

        let parsed = parse_signature_header(&signed.signature).expect("parsed");
        (headers, path_and_query, parsed)
    }

    #[test]
    fn test_verify_accepts_valid_signed_request() {
        let (private_key, public_key) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path, parsed) =
            build_signed_header_map("https://remote.example/inbox?foo=bar", body, &private_key);

        let request = SignedRequest {
            method: "POST",
            path_and_query: &path,
            headers: &headers,
            body,
        };
        let result = verify_request(&request, &parsed, &public_key, Duration::from_secs(300));
        assert!(result.is_ok(), "valid signature should verify: {result:?}");
        assert_eq!(parsed.headers, SIGNED_HEADERS.to_vec());
        assert!(parsed.expires.unwrap() - parsed.created.unwrap() == 30);
    }

    #[test]
    fn test_verify_includes_explicit_port_in_host() {
        let (private_key, public_key) = generate_test_keypair();
        let body = br#"{}"#;
        let (headers, path, parsed) =
            build_signed_header_map("http://remote.example:8080/inbox", body, &private_key);
        assert_eq!(headers.get("host").unwrap(), "remote.example:8080");

        let request = SignedRequest {
            method: "POST",
            path_and_query: &path,
            headers: &headers,
            body,
        };
        assert!(verify_request(&request, &parsed, &public_key, Duration::from_secs(300)).is_ok());
    }

    #[test]
    fn test_verify_rejects_missing_date_header() {
        let (private_key, public_key) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path, parsed) =
            build_signed_header_map("https://remote.example/inbox", body, &private_key);
        headers.remove("date");

        let request = SignedRequest {
            method: "POST",
            path_and_query: &path,
            headers: &headers,
            body,
        };
        match verify_request(&request, &parsed, &public_key, Duration::from_secs(300)) {
            Err(SignatureError::MissingHeader(name)) => assert_eq!(name, "date"),
            other => panic!("expected missing date header error, got: {other:?}"),
        }
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let (private_key, public_key) = generate_test_keypair();
        let (headers, path, parsed) = build_signed_header_map(
            "https://remote.example/inbox",
            br#"{"type":"Follow"}"#,
            &private_key,
        );

        let request = SignedRequest {
            method: "POST",
            path_and_query: &path,
            headers: &headers,
            body: br#"{"type":"Undo"}"#,
        };
        assert!(matches!(
            verify_request(&request, &parsed, &public_key, Duration::from_secs(300)),
            Err(SignatureError::DigestMismatch)
        ));
    }

    #[test]
    fn test_verify_rejects_when_digest_not_in_signed_headers() {
        let (private_key, public_key) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path, mut parsed) =
            build_signed_header_map("https://remote.example/inbox", body, &private_key);
        parsed.headers.retain(|h| h != "digest");

        let request = SignedRequest {
            method: "POST",
            path_and_query: &path,
            headers: &headers,
            body,
        };
        match verify_request(&request, &parsed, &public_key, Duration::from_secs(300)) {
            Err(SignatureError::HeaderNotSigned(name)) => assert_eq!(name, "digest"),
            other => panic!("expected unsigned digest error, got: {other:?}"),
        }
    }

    #[test]
    fn test_verify_ignores_forged_algorithm_parameter() {
        let (private_key, public_key) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path, mut parsed) =
            build_signed_header_map("https://remote.example/inbox", body, &private_key);

        // An Ed25519 key with a forged announcement still fails: the RSA
        // signature is checked with the algorithm of the fetched key.
        parsed.algorithm = Some("ed25519".to_string());
        let ed_key = PublicKey::Ed25519(
            ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]).verifying_key(),
        );
        let request = SignedRequest {
            method: "POST",
            path_and_query: &path,
            headers: &headers,
            body,
        };
        assert!(matches!(
            verify_request(&request, &parsed, &ed_key, Duration::from_secs(300)),
            Err(SignatureError::Invalid)
        ));

        // The genuine RSA key verifies no matter what the header announces.
        parsed.algorithm = Some("hmac-sha256".to_string());
        assert!(verify_request(&request, &parsed, &public_key, Duration::from_secs(300)).is_ok());
    }

    #[test]
    fn test_verify_rejects_expired_signature() {
        let (private_key, public_key) = generate_test_keypair();
        let body = br#"{}"#;
        let (headers, path, mut parsed) =
            build_signed_header_map("https://remote.example/inbox", body, &private_key);
        parsed.expires = Some(Utc::now().timestamp() - 1);

        let request = SignedRequest {
            method: "POST",
            path_and_query: &path,
            headers: &headers,
            body,
        };
        assert!(matches!(
            verify_request(&request, &parsed, &public_key, Duration::from_secs(300)),
            Err(SignatureError::Expired)
        ));
    }

    #[test]
    fn test_parse_signature_header_requires_key_id() {
        match parse_signature_header("algorithm=\"rsa-sha256\",signature=\"abc\"") {
            Err(SignatureError::Malformed(msg)) => assert!(msg.contains("keyId")),
            other => panic!("expected malformed header, got: {other:?}"),
        }
    }

    #[test]
    fn test_parse_signature_header_keeps_commas_in_quoted_values() {
        let parsed = parse_signature_header(
            r#"keyId="https://b.example/keys?ids=1,2",algorithm="hs2019", headers="(request-target) date",signature="YWJj\"ZA==",created=1700000000"#,
        )
        .expect("parsed");

        assert_eq!(parsed.key_id, "https://b.example/keys?ids=1,2");
        assert_eq!(parsed.algorithm.as_deref(), Some("hs2019"));
        assert_eq!(parsed.headers, vec!["(request-target)", "date"]);
        assert_eq!(parsed.signature, "YWJj\"ZA==");
        assert_eq!(parsed.created, Some(1_700_000_000));
        assert_eq!(parsed.expires, None);
    }

    #[test]
    fn test_parse_signature_header_rejects_unterminated_value() {
        assert!(matches!(
            parse_signature_header(r#"signature="abc",keyId="https://b.example/key"#),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn test_generate_digest_matches_known_value() {
        assert_eq!(
            generate_digest(b""),
            "SHA-256=47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }
}
