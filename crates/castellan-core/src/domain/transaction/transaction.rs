//! Ambient transaction handle and two-phase completion driver

use super::types::{TransactionError, TransactionResult, TransactionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_TRANSACTION: Transaction;
}

/// A volatile participant in an ambient transaction
///
/// Participants are notified in enlistment order: every participant is asked
/// to prepare; only when all prepared does the coordinator commit them. A
/// prepare failure rolls every participant back. After the terminal outcome,
/// each participant receives exactly one `completed` notification.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Id of the session backing this participant, for error attribution
    fn session_id(&self) -> Uuid;

    /// Prepare phase: flush pending work, vote on the outcome
    async fn prepare(&self) -> TransactionResult<()>;

    /// Commit the native transaction
    async fn commit(&self) -> TransactionResult<()>;

    /// Roll back the native transaction
    async fn rollback(&self) -> TransactionResult<()>;

    /// The outcome is unknown; release resources without deciding it
    async fn in_doubt(&self);

    /// Terminal notification, fired once per participant after the outcome
    async fn completed(&self, status: TransactionStatus);
}

/// Callback invoked once when the transaction reaches a terminal status
pub type CompletionCallback = Box<dyn FnOnce(TransactionStatus) + Send + 'static>;

struct TransactionState {
    status: TransactionStatus,
    /// Set once completion claims the participants; the status stays
    /// `Active` until the outcome is known, but no new work is accepted
    completing: bool,
    participants: Vec<Arc<dyn Participant>>,
    callbacks: Vec<CompletionCallback>,
}

impl TransactionState {
    fn accepting_work(&self) -> bool {
        self.status == TransactionStatus::Active && !self.completing
    }

    fn invalid_state(&self) -> TransactionError {
        let found = if self.status == TransactionStatus::Active {
            "completing"
        } else {
            self.status.as_str()
        };
        TransactionError::InvalidState {
            expected: TransactionStatus::Active.as_str().to_string(),
            found: found.to_string(),
        }
    }
}

struct TransactionInner {
    id: Uuid,
    started_at: DateTime<Utc>,
    state: Mutex<TransactionState>,
}

/// Handle to an ambient transaction
///
/// Cheap to clone; all clones share the same state. Install the transaction
/// into the current task with [`Transaction::wrap`] so that sessions opened
/// inside the wrapped future can find it via [`Transaction::current`].
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    /// Begin a new transaction
    pub fn begin() -> Self {
        let txn = Self {
            inner: Arc::new(TransactionInner {
                id: Uuid::new_v4(),
                started_at: Utc::now(),
                state: Mutex::new(TransactionState {
                    status: TransactionStatus::Active,
                    completing: false,
                    participants: Vec::new(),
                    callbacks: Vec::new(),
                }),
            }),
        };
        debug!(transaction_id = %txn.inner.id, "Transaction started");
        txn
    }

    /// The ambient transaction of the current task, if any
    pub fn current() -> Option<Transaction> {
        CURRENT_TRANSACTION.try_with(|txn| txn.clone()).ok()
    }

    /// Run a future with this transaction installed as the ambient one
    pub async fn wrap<F>(&self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        CURRENT_TRANSACTION.scope(self.clone(), fut).await
    }

    /// Transaction id
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// When the transaction was started
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        self.lock_state().status
    }

    /// Whether the transaction is still accepting work
    pub fn is_active(&self) -> bool {
        self.lock_state().accepting_work()
    }

    /// Number of enlisted participants
    pub fn participant_count(&self) -> usize {
        self.lock_state().participants.len()
    }

    /// Enlist a volatile participant
    pub fn enlist(&self, participant: Arc<dyn Participant>) -> TransactionResult<()> {
        let mut state = self.lock_state();
        if !state.accepting_work() {
            return Err(state.invalid_state());
        }
        state.participants.push(participant);
        debug!(
            transaction_id = %self.inner.id,
            participants = state.participants.len(),
            "Participant enlisted"
        );
        Ok(())
    }

    /// Register a callback fired once when the transaction completes
    pub fn on_completed<F>(&self, callback: F) -> TransactionResult<()>
    where
        F: FnOnce(TransactionStatus) + Send + 'static,
    {
        let mut state = self.lock_state();
        if !state.accepting_work() {
            return Err(state.invalid_state());
        }
        state.callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Commit the transaction: prepare all participants, then commit them
    ///
    /// A prepare failure rolls every participant back and surfaces the
    /// failure. A commit-phase failure leaves the outcome unknown: remaining
    /// participants are notified in-doubt and the transaction ends `InDoubt`.
    pub async fn commit(&self) -> TransactionResult<()> {
        let (participants, callbacks) = self.take_for_completion()?;

        for participant in &participants {
            if let Err(e) = participant.prepare().await {
                warn!(
                    transaction_id = %self.inner.id,
                    session_id = %participant.session_id(),
                    error = %e,
                    "Prepare failed, rolling back"
                );
                self.rollback_participants(&participants).await;
                self.finish(TransactionStatus::RolledBack, &participants, callbacks)
                    .await;
                return Err(e);
            }
        }

        let mut commit_failure: Option<TransactionError> = None;
        for (idx, participant) in participants.iter().enumerate() {
            if let Err(e) = participant.commit().await {
                error!(
                    transaction_id = %self.inner.id,
                    session_id = %participant.session_id(),
                    error = %e,
                    "Commit failed, outcome unknown"
                );
                for remaining in &participants[idx..] {
                    remaining.in_doubt().await;
                }
                commit_failure = Some(e);
                break;
            }
        }

        match commit_failure {
            Some(e) => {
                self.finish(TransactionStatus::InDoubt, &participants, callbacks)
                    .await;
                Err(e)
            }
            None => {
                self.finish(TransactionStatus::Committed, &participants, callbacks)
                    .await;
                Ok(())
            }
        }
    }

    /// Roll back the transaction and every enlisted participant
    pub async fn rollback(&self) -> TransactionResult<()> {
        let (participants, callbacks) = self.take_for_completion()?;

        let first_failure = self.rollback_participants(&participants).await;
        self.finish(TransactionStatus::RolledBack, &participants, callbacks)
            .await;

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TransactionState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim participants and callbacks for completion; the lock is not held
    /// across the notification awaits
    ///
    /// Claiming marks the transaction as completing. Enlistments and callback
    /// registrations arriving after this point are refused.
    fn take_for_completion(
        &self,
    ) -> TransactionResult<(Vec<Arc<dyn Participant>>, Vec<CompletionCallback>)> {
        let mut state = self.lock_state();
        if !state.accepting_work() {
            return Err(state.invalid_state());
        }
        state.completing = true;
        let participants = std::mem::take(&mut state.participants);
        let callbacks = std::mem::take(&mut state.callbacks);
        Ok((participants, callbacks))
    }

    async fn rollback_participants(
        &self,
        participants: &[Arc<dyn Participant>],
    ) -> Option<TransactionError> {
        let mut first_failure = None;
        for participant in participants {
            if let Err(e) = participant.rollback().await {
                error!(
                    transaction_id = %self.inner.id,
                    session_id = %participant.session_id(),
                    error = %e,
                    "Rollback of participant failed"
                );
                first_failure.get_or_insert(e);
            }
        }
        first_failure
    }

    async fn finish(
        &self,
        status: TransactionStatus,
        participants: &[Arc<dyn Participant>],
        callbacks: Vec<CompletionCallback>,
    ) {
        self.lock_state().status = status;

        for participant in participants {
            participant.completed(status).await;
        }
        for callback in callbacks {
            callback(status);
        }

        info!(
            transaction_id = %self.inner.id,
            status = %status,
            participants = participants.len(),
            "Transaction completed"
        );
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transaction[{}:{}]", self.inner.id, self.status())
    }
}
