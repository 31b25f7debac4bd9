//! PostgreSQL persistence backend for the gleitzeit core.
//!
//! Implements the core `Store` contract over `sqlx` with runtime-checked
//! queries and a runtime migrator, so no database is needed at compile time.

pub mod config;
pub mod models;
pub mod pool;
pub mod store;

pub use config::DbConfig;
pub use store::PgStore;
