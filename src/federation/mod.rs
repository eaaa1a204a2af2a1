//! ActivityPub federation module
//!
//! Handles:
//! - Inbox processing (Follow / Undo)
//! - Authorization voters
//! - Activity delivery
//! - HTTP Signatures (signing and verification)
//! - Key management
//! - WebFinger

mod authorization;
mod client;
mod inbox;
pub mod keys;
mod signature;
mod verify;
pub mod vocab;
mod webfinger;

pub use authorization::{ActivityVoter, Attribute, AuthorizationChecker, Voter, handle_of};
pub use client::{ActivityPubClient, DeliveryError, HttpActivityPubClient};
pub use inbox::InboxService;
pub use keys::{KeyError, KeyFetcher, KeyManager};
pub use signature::{
    SignatureError, SignatureHeaders, SignedRequest, Signer, generate_digest,
    parse_signature_header, verify_request,
};
pub use verify::{SignatureStatus, SignatureVerifier, verify_signature};
pub use vocab::{ACTIVITY_JSON, Urls};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, generate_webfinger_response, host_meta, parse_resource,
};
