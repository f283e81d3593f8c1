//! Storage layer - SQLite connection pools
//!
//! Provides the per-alias database engine the facility coordinates over.
//! The facility owns no schema of its own; applications create and migrate
//! their own tables against the pools opened here.
//!
//! # Usage
//!
//! ```ignore
//! use castellan_core::storage::{Database, DatabaseConfig};
//!
//! // Create an in-memory database for testing
//! let db = Database::in_memory().await?;
//!
//! // Or open a file-backed database
//! let db = Database::new(DatabaseConfig::with_path("app.db")).await?;
//! ```

pub mod database;

// Re-export commonly used types
pub use database::{Database, DatabaseConfig};
