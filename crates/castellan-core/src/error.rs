//! Error types for Castellan

use crate::domain::transaction::TransactionError;
use thiserror::Error;

/// Result type alias using Castellan's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Castellan error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Alias errors (E001-E099)
    #[error("No session factory registered for alias '{0}'. Run `castellan aliases` to see configured aliases.")]
    UnknownAlias(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("No request scope is active. Session storage is configured per-request; enter a request scope first.")]
    NoActiveRequest,

    // Transaction errors (E300-E399)
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownAlias(_) => "E001",
            Self::SessionClosed => "E002",
            Self::NoActiveRequest => "E003",
            Self::Transaction(e) => e.code(),
            Self::DatabaseError(_) => "E400",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::UnknownAlias(_) => Some("castellan aliases".to_string()),
            Self::ConfigError(_) => Some("castellan check".to_string()),
            Self::NoActiveRequest => {
                Some("wrap the call in activity::request_scope(..)".to_string())
            }
            _ => None,
        }
    }
}
