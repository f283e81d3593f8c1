//! Ambient transactions with two-phase session enlistment
//!
//! A transaction created here is *ambient*: installed into a task-local scope
//! with [`Transaction::wrap`], it is visible to every session opened inside
//! that scope without being passed around. Sessions enlist as volatile
//! participants and are driven through prepare, commit or rollback, and a
//! final completion notification.
//!
//! # Architecture
//!
//! - **Transaction**: cloneable handle over the shared transaction state,
//!   with `begin`/`wrap`/`current`/`commit`/`rollback`
//! - **Participant**: volatile two-phase participant trait
//! - **Enlistments**: session-backed participants that flush on prepare and
//!   tear the session down on completion
//!
//! # Example
//!
//! ```ignore
//! use castellan_core::domain::transaction::Transaction;
//!
//! let txn = Transaction::begin();
//! txn.wrap(async {
//!     let session = manager.open_session_for("db1").await?;
//!     session.save("INSERT INTO blogs (name) VALUES (?)", vec!["castle".into()]).await?;
//!     Ok::<_, castellan_core::Error>(())
//! })
//! .await?;
//! txn.commit().await?;
//! ```

pub mod enlistment;
pub mod transaction;
pub mod types;

// Re-export main types
pub use enlistment::{enlist_session_if_needed, enlist_stateless_session_if_needed};
pub use transaction::{Participant, Transaction};
pub use types::{EnlistmentState, TransactionError, TransactionResult, TransactionStatus};
