//! High-level Database API.
//!
//! A [`Database`] opens the configured backing store once and exposes both
//! revision engines over it.

mod api;

pub use api::{Backend, Database, DatabaseConfig, DatabaseError, DatabaseResult, DatabaseStats};
