//! Castellan Core Library
//!
//! This crate provides the core functionality for Castellan, including:
//! - Alias-keyed session management over SQLite pools
//! - Activity- and request-scoped session stores
//! - Session delegates with single-owner teardown
//! - Ambient transactions with two-phase completion
//! - Session interceptors with alias-specific precedence
//! - Configuration builders and file-backed configuration

pub mod config;
pub mod domain;
pub mod error;
pub mod facility;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{AliasConfig, FacilityConfig, StoreKind};
    pub use crate::domain::activity;
    pub use crate::domain::session::{
        FlushMode, Interceptor, Session, SessionManager, SqlParam, StatelessSession,
        DEFAULT_ALIAS,
    };
    pub use crate::domain::transaction::{Transaction, TransactionStatus};
    pub use crate::error::{Error, Result};
    pub use crate::facility::{FacilityBuilder, SessionFacility};
}
