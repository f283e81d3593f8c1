//! Transaction types and error definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Result type for transaction operations
pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// Transaction errors
#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    /// A participant failed during the prepare phase; the transaction was
    /// rolled back
    #[error("Prepare phase failed for session {session_id}: {message}")]
    PrepareFailed {
        session_id: Uuid,
        message: String,
    },

    /// A participant failed while committing; the outcome is unknown
    #[error("Commit failed, outcome in doubt for session {session_id}: {message}")]
    CommitFailed {
        session_id: Uuid,
        message: String,
    },

    /// The native database transaction could not be started
    #[error("Failed to begin native transaction: {0}")]
    BeginFailed(String),

    /// Rollback of a participant failed (reported, not retried)
    #[error("Rollback failed for session {session_id}: {message}")]
    RollbackFailed {
        session_id: Uuid,
        message: String,
    },

    /// Operation is not valid for the transaction's current status
    #[error("Invalid transaction state: expected {expected}, found {found}")]
    InvalidState {
        expected: String,
        found: String,
    },
}

impl TransactionError {
    /// Get error code for this transaction error
    pub fn code(&self) -> &'static str {
        match self {
            Self::PrepareFailed { .. } => "E300",
            Self::CommitFailed { .. } => "E301",
            Self::BeginFailed(_) => "E302",
            Self::RollbackFailed { .. } => "E303",
            Self::InvalidState { .. } => "E304",
        }
    }
}

/// Status of an ambient transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Transaction is open and accepting enlistments
    Active,
    /// All participants prepared and committed
    Committed,
    /// Transaction was rolled back (explicitly or after a prepare failure)
    RolledBack,
    /// A commit-phase failure left the outcome unknown
    InDoubt,
}

impl TransactionStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::InDoubt => "in_doubt",
        }
    }

    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Whether the transaction completed successfully
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of one volatile enlistment within an ambient transaction
///
/// Created -> Enlisted -> { Prepared -> Committed } | RolledBack | InDoubt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnlistmentState {
    /// Enlistment record exists but is not yet registered
    Created,
    /// Registered as a volatile participant
    Enlisted,
    /// Prepare phase succeeded (pending writes flushed)
    Prepared,
    /// Native transaction committed
    Committed,
    /// Native transaction rolled back
    RolledBack,
    /// Outcome unknown
    InDoubt,
}

impl EnlistmentState {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Enlisted => "enlisted",
            Self::Prepared => "prepared",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::InDoubt => "in_doubt",
        }
    }

    /// Whether this state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::InDoubt)
    }
}

impl fmt::Display for EnlistmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
