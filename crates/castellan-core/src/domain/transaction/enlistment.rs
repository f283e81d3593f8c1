//! Enlisting sessions in the ambient transaction
//!
//! Enlistment begins a native transaction on the session when it does not
//! already hold one, then registers the session as a participant so the
//! coordinator drives flush, commit and rollback. Sessions whose native
//! transaction was begun here are closed when the ambient transaction
//! completes; sessions that brought their own native transaction stay open.

use crate::domain::session::session::NativeSession;
use crate::domain::session::stateless::NativeStatelessSession;
use crate::domain::transaction::transaction::{Participant, Transaction};
use crate::domain::transaction::types::{
    EnlistmentState, TransactionError, TransactionResult, TransactionStatus,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

fn into_transaction_error(
    error: Error,
    fallback: impl FnOnce(String) -> TransactionError,
) -> TransactionError {
    match error {
        Error::Transaction(e) => e,
        other => fallback(other.to_string()),
    }
}

/// Guarded state machine for one enlistment
struct EnlistmentProgress {
    state: std::sync::Mutex<EnlistmentState>,
}

impl EnlistmentProgress {
    fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(EnlistmentState::Created),
        }
    }

    #[cfg(test)]
    fn get(&self) -> EnlistmentState {
        *self.lock()
    }

    fn set(&self, next: EnlistmentState) {
        *self.lock() = next;
    }

    /// Move to `next` only from one of the expected states
    fn advance(
        &self,
        expected: &[EnlistmentState],
        next: EnlistmentState,
    ) -> TransactionResult<()> {
        let mut state = self.lock();
        if !expected.contains(&state) {
            return Err(TransactionError::InvalidState {
                expected: expected
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" or "),
                found: state.as_str().to_string(),
            });
        }
        *state = next;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EnlistmentState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct SessionEnlistment {
    transaction_id: Uuid,
    session_id: Uuid,
    session: Arc<Mutex<NativeSession>>,
    close_on_completion: bool,
    progress: EnlistmentProgress,
}

#[async_trait]
impl Participant for SessionEnlistment {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    async fn prepare(&self) -> TransactionResult<()> {
        let mut session = self.session.lock().await;
        if let Some(interceptor) = session.interceptor() {
            interceptor.before_transaction_completion(self.transaction_id);
        }
        if session.flush_mode().flushes_on_commit() && !session.is_closed() {
            session
                .flush()
                .await
                .map_err(|e| TransactionError::PrepareFailed {
                    session_id: self.session_id,
                    message: e.to_string(),
                })?;
        }
        self.progress
            .advance(&[EnlistmentState::Enlisted], EnlistmentState::Prepared)
    }

    async fn commit(&self) -> TransactionResult<()> {
        let mut session = self.session.lock().await;
        session.commit_transaction().await.map_err(|e| {
            into_transaction_error(e, |message| TransactionError::CommitFailed {
                session_id: self.session_id,
                message,
            })
        })?;
        self.progress
            .advance(&[EnlistmentState::Prepared], EnlistmentState::Committed)
    }

    async fn rollback(&self) -> TransactionResult<()> {
        let mut session = self.session.lock().await;
        session.rollback_transaction().await.map_err(|e| {
            into_transaction_error(e, |message| TransactionError::RollbackFailed {
                session_id: self.session_id,
                message,
            })
        })?;
        self.progress.advance(
            &[EnlistmentState::Enlisted, EnlistmentState::Prepared],
            EnlistmentState::RolledBack,
        )
    }

    async fn in_doubt(&self) {
        warn!(
            session_id = %self.session_id,
            transaction_id = %self.transaction_id,
            "Transaction outcome unknown, abandoning session"
        );
        self.progress.set(EnlistmentState::InDoubt);
        self.session.lock().await.abandon();
    }

    async fn completed(&self, status: TransactionStatus) {
        let mut session = self.session.lock().await;
        if let Some(interceptor) = session.interceptor() {
            interceptor.after_transaction_completion(status.is_committed(), self.transaction_id);
        }
        session.set_transaction_context(None);
        if self.close_on_completion && !session.is_closed() {
            if let Err(e) = session.close().await {
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "Error closing session after transaction"
                );
            }
        }
    }
}

/// Enlist a session in the ambient transaction, once
///
/// A session already carrying a transaction context is left alone. The
/// native transaction is begun here when the session has none; in that case
/// the session is closed when the ambient transaction completes.
pub async fn enlist_session_if_needed(
    transaction: &Transaction,
    session: Arc<Mutex<NativeSession>>,
) -> Result<()> {
    let (session_id, began) = {
        let mut guard = session.lock().await;
        if guard.transaction_context().is_some() {
            return Ok(());
        }
        let began = if guard.has_active_transaction() {
            false
        } else {
            guard.begin_transaction().await?;
            if let Some(interceptor) = guard.interceptor() {
                interceptor.after_transaction_begin(transaction.id());
            }
            true
        };
        guard.set_transaction_context(Some(transaction.id()));
        (guard.id(), began)
    };

    let enlistment = Arc::new(SessionEnlistment {
        transaction_id: transaction.id(),
        session_id,
        session: session.clone(),
        close_on_completion: began,
        progress: EnlistmentProgress::new(),
    });
    if let Err(e) = transaction.enlist(enlistment.clone()) {
        session.lock().await.set_transaction_context(None);
        return Err(e.into());
    }
    enlistment.progress.set(EnlistmentState::Enlisted);
    debug!(
        session_id = %session_id,
        transaction_id = %transaction.id(),
        close_on_completion = began,
        "Session enlisted in ambient transaction"
    );
    Ok(())
}

struct StatelessEnlistment {
    transaction_id: Uuid,
    session_id: Uuid,
    session: Arc<Mutex<NativeStatelessSession>>,
    close_on_completion: bool,
    progress: EnlistmentProgress,
}

#[async_trait]
impl Participant for StatelessEnlistment {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    // Stateless sessions buffer nothing, so there is nothing to flush
    async fn prepare(&self) -> TransactionResult<()> {
        self.progress
            .advance(&[EnlistmentState::Enlisted], EnlistmentState::Prepared)
    }

    async fn commit(&self) -> TransactionResult<()> {
        let mut session = self.session.lock().await;
        session.commit_transaction().await.map_err(|e| {
            into_transaction_error(e, |message| TransactionError::CommitFailed {
                session_id: self.session_id,
                message,
            })
        })?;
        self.progress
            .advance(&[EnlistmentState::Prepared], EnlistmentState::Committed)
    }

    async fn rollback(&self) -> TransactionResult<()> {
        let mut session = self.session.lock().await;
        session.rollback_transaction().await.map_err(|e| {
            into_transaction_error(e, |message| TransactionError::RollbackFailed {
                session_id: self.session_id,
                message,
            })
        })?;
        self.progress.advance(
            &[EnlistmentState::Enlisted, EnlistmentState::Prepared],
            EnlistmentState::RolledBack,
        )
    }

    async fn in_doubt(&self) {
        warn!(
            session_id = %self.session_id,
            transaction_id = %self.transaction_id,
            "Transaction outcome unknown, abandoning stateless session"
        );
        self.progress.set(EnlistmentState::InDoubt);
        self.session.lock().await.abandon();
    }

    async fn completed(&self, _status: TransactionStatus) {
        let mut session = self.session.lock().await;
        session.set_transaction_context(None);
        if self.close_on_completion && !session.is_closed() {
            if let Err(e) = session.close().await {
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "Error closing stateless session after transaction"
                );
            }
        }
    }
}

/// Enlist a stateless session in the ambient transaction, once
pub async fn enlist_stateless_session_if_needed(
    transaction: &Transaction,
    session: Arc<Mutex<NativeStatelessSession>>,
) -> Result<()> {
    let (session_id, began) = {
        let mut guard = session.lock().await;
        if guard.transaction_context().is_some() {
            return Ok(());
        }
        let began = if guard.has_active_transaction() {
            false
        } else {
            guard.begin_transaction().await?;
            true
        };
        guard.set_transaction_context(Some(transaction.id()));
        (guard.id(), began)
    };

    let enlistment = Arc::new(StatelessEnlistment {
        transaction_id: transaction.id(),
        session_id,
        session: session.clone(),
        close_on_completion: began,
        progress: EnlistmentProgress::new(),
    });
    if let Err(e) = transaction.enlist(enlistment.clone()) {
        session.lock().await.set_transaction_context(None);
        return Err(e.into());
    }
    enlistment.progress.set(EnlistmentState::Enlisted);
    debug!(
        session_id = %session_id,
        transaction_id = %transaction.id(),
        close_on_completion = began,
        "Stateless session enlisted in ambient transaction"
    );
    Ok(())
}
