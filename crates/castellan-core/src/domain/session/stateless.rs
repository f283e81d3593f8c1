//! Native stateless session
//!
//! The stateless variant keeps no pending-statement buffer and attaches no
//! interceptor. Every operation goes to the database immediately, through
//! the native transaction when one is active.

use crate::domain::session::session::{bind_params, SqlParam};
use crate::domain::transaction::TransactionError;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteQueryResult, SqliteRow};
use sqlx::Row;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Stateless session bound to one database alias
pub struct NativeStatelessSession {
    id: Uuid,
    alias: String,
    pool: SqlitePool,
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
    transaction_context: Option<Uuid>,
    opened_at: DateTime<Utc>,
    closed: bool,
}

impl NativeStatelessSession {
    pub(crate) fn new(alias: impl Into<String>, pool: SqlitePool) -> Self {
        Self {
            id: Uuid::new_v4(),
            alias: alias.into(),
            pool,
            tx: None,
            transaction_context: None,
            opened_at: Utc::now(),
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_active_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Id of the ambient transaction this session is enlisted in, if any
    pub fn transaction_context(&self) -> Option<Uuid> {
        self.transaction_context
    }

    pub(crate) fn set_transaction_context(&mut self, context: Option<Uuid>) {
        self.transaction_context = context;
    }

    /// Run a write statement, returning the affected row count
    pub async fn execute(&mut self, sql: impl Into<String>, params: Vec<SqlParam>) -> Result<u64> {
        self.ensure_open()?;
        let sql = sql.into();
        let result = self.run(&sql, &params).await?;
        Ok(result.rows_affected())
    }

    /// Fetch all rows for a query
    pub async fn fetch_all(
        &mut self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<Vec<SqliteRow>> {
        self.ensure_open()?;
        let sql = sql.into();
        let query = bind_params(sqlx::query(&sql), &params);
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    /// Fetch at most one row for a query
    pub async fn fetch_optional(
        &mut self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<Option<SqliteRow>> {
        self.ensure_open()?;
        let sql = sql.into();
        let query = bind_params(sqlx::query(&sql), &params);
        let row = match self.tx.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(row)
    }

    /// Fetch a single integer scalar, such as a COUNT
    pub async fn fetch_scalar(
        &mut self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<i64> {
        let row = self
            .fetch_optional(sql, params)
            .await?
            .ok_or_else(|| Error::Other("scalar query returned no rows".to_string()))?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Begin a native transaction; all session work routes through it
    pub async fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.tx.is_some() {
            return Err(TransactionError::BeginFailed(
                "a native transaction is already active".to_string(),
            )
            .into());
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TransactionError::BeginFailed(e.to_string()))?;
        self.tx = Some(tx);
        debug!(session_id = %self.id, alias = %self.alias, "Native transaction started");
        Ok(())
    }

    /// Commit the native transaction
    pub async fn commit_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        let tx = self.tx.take().ok_or_else(|| TransactionError::InvalidState {
            expected: "active".to_string(),
            found: "none".to_string(),
        })?;
        tx.commit().await.map_err(|e| TransactionError::CommitFailed {
            session_id: self.id,
            message: e.to_string(),
        })?;
        debug!(session_id = %self.id, alias = %self.alias, "Native transaction committed");
        Ok(())
    }

    /// Roll back the native transaction
    pub async fn rollback_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        let tx = self.tx.take().ok_or_else(|| TransactionError::InvalidState {
            expected: "active".to_string(),
            found: "none".to_string(),
        })?;
        tx.rollback()
            .await
            .map_err(|e| TransactionError::RollbackFailed {
                session_id: self.id,
                message: e.to_string(),
            })?;
        debug!(session_id = %self.id, alias = %self.alias, "Native transaction rolled back");
        Ok(())
    }

    /// Close the session; an open native transaction is rolled back
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(session_id = %self.id, error = %e, "Rollback during close failed");
            }
        }
        self.closed = true;
        debug!(session_id = %self.id, alias = %self.alias, "Stateless session closed");
        Ok(())
    }

    /// Release the session without deciding the outcome of its transaction
    pub(crate) fn abandon(&mut self) {
        self.tx = None;
        self.closed = true;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    async fn run(&mut self, sql: &str, params: &[SqlParam]) -> Result<SqliteQueryResult> {
        let query = bind_params(sqlx::query(sql), params);
        let result = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result)
    }
}

impl fmt::Debug for NativeStatelessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeStatelessSession")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("in_transaction", &self.tx.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}
