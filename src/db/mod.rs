//! Database module: row models and SQL repositories.
//!
//! - `model`: plain row structs returned by the queries.
//! - `repo`: SQL-only functions for the `repositories` and `outbox` tables.
//!
//! Callers import from `release_watch::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{OutboxMessageRow, RepositoryRow};
