//! Alias-keyed database sessions
//!
//! This module provides the session layer of the facility: sessions are
//! opened through a manager, keyed by a database alias, and shared within
//! the current activity so that repeated opens observe the same underlying
//! connection state.
//!
//! # Architecture
//!
//! - **Native sessions**: `NativeSession` and `NativeStatelessSession` own
//!   the pool handle, the pending-statement buffer, and the native
//!   transaction
//! - **Delegates**: `Session` and `StatelessSession` forward to a shared
//!   native session; only the first delegate per activity may tear it down
//! - **Store**: `SessionStore` implementations keep the alias-to-session
//!   registry scoped to the current activity or request
//! - **Manager**: `SessionManager` resolves factories, attaches
//!   interceptors, and enlists sessions in the ambient transaction
//!
//! # Example
//!
//! ```ignore
//! use castellan_core::facility::FacilityBuilder;
//!
//! let facility = FacilityBuilder::new()
//!     .in_memory_database("default")
//!     .build()
//!     .await?;
//!
//! let session = facility.open_session().await?;
//! session.save("INSERT INTO blogs (name) VALUES (?)", vec!["hammett".into()]).await?;
//! session.flush().await?;
//! session.close().await?;
//! ```

pub mod delegate;
pub mod factory;
pub mod interceptor;
pub mod manager;
pub mod session;
pub mod stateless;
pub mod store;

// Re-export main types
pub use delegate::{Session, StatelessSession};
pub use factory::{
    ConfigurationBuilder, DefaultConfigurationBuilder, SessionFactory, SessionFactoryResolver,
};
pub use interceptor::{Interceptor, InterceptorRegistry, INTERCEPTOR_KEY};
pub use manager::SessionManager;
pub use session::{FlushMode, NativeSession, SqlParam};
pub use stateless::NativeStatelessSession;
pub use store::{
    RequestSessionStore, SessionStore, StoredSession, StoredStatelessSession,
    TaskLocalSessionStore,
};

/// Alias used when a session is opened without naming a database
pub const DEFAULT_ALIAS: &str = "default";
