//! Data layer module
//!
//! Handles all data persistence and caching:
//! - SQLite database operations (users, actors, follow edges)
//! - Repository traits consumed by services
//! - Volatile TTL caches

mod cache;
mod database;
mod models;
mod repository;

pub use cache::{Cache, MokaCache};
pub use database::Database;
pub use models::*;
pub use repository::{ActorRepository, UserRepository};

#[cfg(test)]
mod database_test;
