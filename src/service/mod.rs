//! Service layer
//!
//! Business logic shared by HTTP handlers, task handlers and start-up.

mod posts;
mod users;

pub use posts::{PostError, PostService};
pub use users::{FullUser, UserService};
