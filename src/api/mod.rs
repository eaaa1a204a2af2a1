//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - WebFinger / host-meta discovery
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;
mod wellknown;

pub use activitypub::{ActivityJson, activitypub_router};
pub use metrics::{metrics_router, track_http};
pub use wellknown::wellknown_router;
