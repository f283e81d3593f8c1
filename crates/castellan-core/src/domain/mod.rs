//! Domain layer
//!
//! Contains the core session and transaction coordination logic.

pub mod activity;
pub mod session;
pub mod transaction;
