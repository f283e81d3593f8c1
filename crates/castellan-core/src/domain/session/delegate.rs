//! Session delegates
//!
//! A delegate forwards every operation to a shared native session. The first
//! delegate handed out for an alias within an activity owns the session
//! (`can_close`); closing any later delegate only retires that handle and
//! leaves the native session in place for the owner, or for the ambient
//! transaction, to tear down.

use crate::domain::session::session::{FlushMode, NativeSession, SqlParam};
use crate::domain::session::stateless::NativeStatelessSession;
use crate::domain::session::store::SessionStore;
use crate::error::{Error, Result};
use sqlx::sqlite::SqliteRow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionKind {
    Stateful,
    Stateless,
}

/// Ties a delegate to its store entry for idempotent unregistration
///
/// The store is held weakly; once the facility is gone, unregistration
/// quietly becomes a no-op.
pub(crate) struct StoreBinding {
    store: Weak<dyn SessionStore>,
    alias: String,
    session_id: Uuid,
    kind: SessionKind,
    unregistered: AtomicBool,
}

impl StoreBinding {
    pub(crate) fn new(
        store: &Arc<dyn SessionStore>,
        alias: impl Into<String>,
        session_id: Uuid,
        kind: SessionKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::downgrade(store),
            alias: alias.into(),
            session_id,
            kind,
            unregistered: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::Acquire)
    }

    /// Remove the session from the store; later calls are no-ops
    pub(crate) fn unregister(&self) -> Result<()> {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(store) = self.store.upgrade() else {
            return Ok(());
        };
        match self.kind {
            SessionKind::Stateful => store.remove_session(&self.alias, self.session_id),
            SessionKind::Stateless => store.remove_stateless_session(&self.alias, self.session_id),
        }
    }
}

/// Handle to a stateful session shared within the current activity
pub struct Session {
    session_id: Uuid,
    alias: String,
    inner: Arc<Mutex<NativeSession>>,
    binding: Arc<StoreBinding>,
    can_close: bool,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        session_id: Uuid,
        alias: impl Into<String>,
        inner: Arc<Mutex<NativeSession>>,
        binding: Arc<StoreBinding>,
        can_close: bool,
    ) -> Self {
        Self {
            session_id,
            alias: alias.into(),
            inner,
            binding,
            can_close,
            closed: AtomicBool::new(false),
        }
    }

    /// Id of the underlying native session
    pub fn id(&self) -> Uuid {
        self.session_id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Whether this delegate owns the native session's teardown
    pub fn can_close(&self) -> bool {
        self.can_close
    }

    /// Whether this handle has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the session has been removed from the store
    pub fn is_unregistered(&self) -> bool {
        self.binding.is_unregistered()
    }

    /// Whether two handles forward to the same native session
    pub fn shares_session_with(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn flush_mode(&self) -> FlushMode {
        self.inner.lock().await.flush_mode()
    }

    pub async fn set_flush_mode(&self, mode: FlushMode) {
        self.inner.lock().await.set_flush_mode(mode);
    }

    pub async fn is_dirty(&self) -> bool {
        self.inner.lock().await.is_dirty()
    }

    pub async fn has_active_transaction(&self) -> bool {
        self.inner.lock().await.has_active_transaction()
    }

    /// Buffer a write statement for the next flush
    pub async fn save(&self, sql: impl Into<String>, params: Vec<SqlParam>) -> Result<()> {
        self.ensure_usable()?;
        self.inner.lock().await.save(sql, params)
    }

    /// Send every buffered write to the database
    pub async fn flush(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.lock().await.flush().await
    }

    /// Run a write statement immediately, returning the affected row count
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<SqlParam>) -> Result<u64> {
        self.ensure_usable()?;
        self.inner.lock().await.execute(sql, params).await
    }

    pub async fn fetch_all(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<Vec<SqliteRow>> {
        self.ensure_usable()?;
        self.inner.lock().await.fetch_all(sql, params).await
    }

    pub async fn fetch_optional(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<Option<SqliteRow>> {
        self.ensure_usable()?;
        self.inner.lock().await.fetch_optional(sql, params).await
    }

    pub async fn fetch_scalar(&self, sql: impl Into<String>, params: Vec<SqlParam>) -> Result<i64> {
        self.ensure_usable()?;
        self.inner.lock().await.fetch_scalar(sql, params).await
    }

    pub async fn begin_transaction(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.lock().await.begin_transaction().await
    }

    pub async fn commit_transaction(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.lock().await.commit_transaction().await
    }

    pub async fn rollback_transaction(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.lock().await.rollback_transaction().await
    }

    /// Close this handle
    ///
    /// Only the owning delegate tears the native session down and removes it
    /// from the store; closing any other delegate retires just that handle.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.can_close {
            debug!(
                session_id = %self.session_id,
                alias = %self.alias,
                "Close deferred to the owning delegate"
            );
            return Ok(());
        }
        self.binding.unregister()?;
        self.inner.lock().await.close().await
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.can_close && !self.closed.load(Ordering::Acquire) {
            warn!(
                session_id = %self.session_id,
                alias = %self.alias,
                "Session delegate dropped without close"
            );
            if let Err(e) = self.binding.unregister() {
                warn!(session_id = %self.session_id, error = %e, "Unregistration on drop failed");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.session_id)
            .field("alias", &self.alias)
            .field("can_close", &self.can_close)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to a stateless session shared within the current activity
pub struct StatelessSession {
    session_id: Uuid,
    alias: String,
    inner: Arc<Mutex<NativeStatelessSession>>,
    binding: Arc<StoreBinding>,
    can_close: bool,
    closed: AtomicBool,
}

impl StatelessSession {
    pub(crate) fn new(
        session_id: Uuid,
        alias: impl Into<String>,
        inner: Arc<Mutex<NativeStatelessSession>>,
        binding: Arc<StoreBinding>,
        can_close: bool,
    ) -> Self {
        Self {
            session_id,
            alias: alias.into(),
            inner,
            binding,
            can_close,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.session_id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn can_close(&self) -> bool {
        self.can_close
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_unregistered(&self) -> bool {
        self.binding.is_unregistered()
    }

    pub fn shares_session_with(&self, other: &StatelessSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn has_active_transaction(&self) -> bool {
        self.inner.lock().await.has_active_transaction()
    }

    /// Run a write statement, returning the affected row count
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<SqlParam>) -> Result<u64> {
        self.ensure_usable()?;
        self.inner.lock().await.execute(sql, params).await
    }

    pub async fn fetch_all(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<Vec<SqliteRow>> {
        self.ensure_usable()?;
        self.inner.lock().await.fetch_all(sql, params).await
    }

    pub async fn fetch_optional(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<Option<SqliteRow>> {
        self.ensure_usable()?;
        self.inner.lock().await.fetch_optional(sql, params).await
    }

    pub async fn fetch_scalar(&self, sql: impl Into<String>, params: Vec<SqlParam>) -> Result<i64> {
        self.ensure_usable()?;
        self.inner.lock().await.fetch_scalar(sql, params).await
    }

    pub async fn begin_transaction(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.lock().await.begin_transaction().await
    }

    pub async fn commit_transaction(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.lock().await.commit_transaction().await
    }

    pub async fn rollback_transaction(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.lock().await.rollback_transaction().await
    }

    /// Close this handle; see [`Session::close`] for ownership rules
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.can_close {
            debug!(
                session_id = %self.session_id,
                alias = %self.alias,
                "Close deferred to the owning delegate"
            );
            return Ok(());
        }
        self.binding.unregister()?;
        self.inner.lock().await.close().await
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for StatelessSession {
    fn drop(&mut self) {
        if self.can_close && !self.closed.load(Ordering::Acquire) {
            warn!(
                session_id = %self.session_id,
                alias = %self.alias,
                "Stateless session delegate dropped without close"
            );
            if let Err(e) = self.binding.unregister() {
                warn!(session_id = %self.session_id, error = %e, "Unregistration on drop failed");
            }
        }
    }
}

impl fmt::Debug for StatelessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatelessSession")
            .field("id", &self.session_id)
            .field("alias", &self.alias)
            .field("can_close", &self.can_close)
            .field("closed", &self.is_closed())
            .finish()
    }
}
