//! Upstream social API
//!
//! - Raw API surface and the [`Backend`] seam
//! - Rate budget shared by every caller
//! - Cached profile lookups
//! - Timeline poller

pub mod backend;
mod client;
pub mod models;
mod poller;
mod rate_limit;

pub use backend::{Backend, TimelineOptions, UpstreamError, UserQuery};
pub use client::{HttpBackend, TwitterClient, convert_user};
pub use models::{Media, Post, ReferenceKind, TwitterUser};
pub use poller::{PollError, PollOutcome, Poller};
pub use rate_limit::{BudgetSnapshot, EndpointClass, RateLimiter};
