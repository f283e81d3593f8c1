//! Native stateful session
//!
//! A `NativeSession` owns a pool handle, a buffer of pending write
//! statements, and at most one native transaction. Writes issued through
//! `save` are buffered and sent on flush; queries run either against the
//! native transaction, when one is active, or straight against the pool.

use crate::domain::session::interceptor::Interceptor;
use crate::domain::transaction::TransactionError;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteQueryResult, SqliteRow};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// When buffered writes are sent to the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Flush only when `flush` is called explicitly
    #[serde(alias = "never")]
    Manual,
    /// Flush when a transaction commits
    Commit,
    /// Flush before queries and on commit
    #[default]
    Auto,
    /// Flush eagerly before every query and on commit
    Always,
}

impl FlushMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushMode::Manual => "manual",
            FlushMode::Commit => "commit",
            FlushMode::Auto => "auto",
            FlushMode::Always => "always",
        }
    }

    /// Whether pending writes are flushed when a transaction completes
    pub fn flushes_on_commit(&self) -> bool {
        !matches!(self, FlushMode::Manual)
    }

    /// Whether pending writes are flushed before running a query
    pub fn flushes_before_query(&self) -> bool {
        matches!(self, FlushMode::Auto | FlushMode::Always)
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FlushMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" | "never" => Ok(FlushMode::Manual),
            "commit" => Ok(FlushMode::Commit),
            "auto" => Ok(FlushMode::Auto),
            "always" => Ok(FlushMode::Always),
            other => Err(Error::InvalidInput(format!(
                "unknown flush mode '{other}', expected manual, commit, auto or always"
            ))),
        }
    }
}

/// A positional statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Integer(value)
    }
}

impl From<i32> for SqlParam {
    fn from(value: i32) -> Self {
        SqlParam::Integer(value as i64)
    }
}

impl From<u32> for SqlParam {
    fn from(value: u32) -> Self {
        SqlParam::Integer(value as i64)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Real(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Integer(value as i64)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<Vec<u8>> for SqlParam {
    fn from(value: Vec<u8>) -> Self {
        SqlParam::Blob(value)
    }
}

impl From<Uuid> for SqlParam {
    fn from(value: Uuid) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<DateTime<Utc>> for SqlParam {
    fn from(value: DateTime<Utc>) -> Self {
        SqlParam::Text(value.to_rfc3339())
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => SqlParam::Null,
        }
    }
}

pub(crate) fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(Option::<i64>::None),
            SqlParam::Integer(v) => query.bind(*v),
            SqlParam::Real(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::Blob(v) => query.bind(v.as_slice()),
        };
    }
    query
}

struct PendingStatement {
    sql: String,
    params: Vec<SqlParam>,
}

/// Stateful session bound to one database alias
pub struct NativeSession {
    id: Uuid,
    alias: String,
    pool: SqlitePool,
    flush_mode: FlushMode,
    interceptor: Option<Arc<dyn Interceptor>>,
    pending: Vec<PendingStatement>,
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
    transaction_context: Option<Uuid>,
    opened_at: DateTime<Utc>,
    closed: bool,
}

impl NativeSession {
    pub(crate) fn new(
        alias: impl Into<String>,
        pool: SqlitePool,
        flush_mode: FlushMode,
        interceptor: Option<Arc<dyn Interceptor>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alias: alias.into(),
            pool,
            flush_mode,
            interceptor,
            pending: Vec::new(),
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

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.flush_mode = mode;
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the session holds buffered writes
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
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

    pub(crate) fn interceptor(&self) -> Option<Arc<dyn Interceptor>> {
        self.interceptor.clone()
    }

    /// Buffer a write statement for the next flush
    pub fn save(&mut self, sql: impl Into<String>, params: Vec<SqlParam>) -> Result<()> {
        self.ensure_open()?;
        self.pending.push(PendingStatement {
            sql: sql.into(),
            params,
        });
        Ok(())
    }

    /// Send every buffered write to the database, in order
    ///
    /// On failure the failed statement and everything after it stay
    /// buffered, so a later flush picks up where this one stopped.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let count = self.pending.len();
        let mut pending = std::mem::take(&mut self.pending).into_iter();
        while let Some(statement) = pending.next() {
            let sql = self.prepare_sql(statement.sql.clone());
            if let Err(e) = self.run(&sql, &statement.params).await {
                // Re-queued in original form; the interceptor rewrite
                // runs again on the retry
                self.pending.push(statement);
                self.pending.extend(pending);
                return Err(e);
            }
        }
        debug!(session_id = %self.id, statements = count, "Session flushed");
        Ok(())
    }

    /// Run a write statement immediately, returning the affected row count
    pub async fn execute(&mut self, sql: impl Into<String>, params: Vec<SqlParam>) -> Result<u64> {
        self.ensure_open()?;
        self.flush_before_query().await?;
        let sql = self.prepare_sql(sql.into());
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
        self.flush_before_query().await?;
        let sql = self.prepare_sql(sql.into());
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
        self.flush_before_query().await?;
        let sql = self.prepare_sql(sql.into());
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

    /// Commit the native transaction, flushing first unless manual
    pub async fn commit_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.tx.is_none() {
            return Err(TransactionError::InvalidState {
                expected: "active".to_string(),
                found: "none".to_string(),
            }
            .into());
        }
        if self.flush_mode.flushes_on_commit() {
            self.flush().await?;
        }
        // Checked above; flush keeps the transaction in place
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        tx.commit().await.map_err(|e| TransactionError::CommitFailed {
            session_id: self.id,
            message: e.to_string(),
        })?;
        debug!(session_id = %self.id, alias = %self.alias, "Native transaction committed");
        Ok(())
    }

    /// Roll back the native transaction and discard buffered writes
    pub async fn rollback_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        let tx = self.tx.take().ok_or_else(|| TransactionError::InvalidState {
            expected: "active".to_string(),
            found: "none".to_string(),
        })?;
        if !self.pending.is_empty() {
            debug!(
                session_id = %self.id,
                discarded = self.pending.len(),
                "Discarding buffered writes on rollback"
            );
            self.pending.clear();
        }
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
        if !self.pending.is_empty() {
            debug!(
                session_id = %self.id,
                discarded = self.pending.len(),
                "Discarding unflushed statements on close"
            );
            self.pending.clear();
        }
        self.closed = true;
        debug!(session_id = %self.id, alias = %self.alias, "Session closed");
        Ok(())
    }

    /// Release the session without deciding the outcome of its transaction
    ///
    /// Dropping the native handle returns the connection to the pool, which
    /// rolls the transaction back before reuse.
    pub(crate) fn abandon(&mut self) {
        self.tx = None;
        self.pending.clear();
        self.closed = true;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn prepare_sql(&self, sql: String) -> String {
        match &self.interceptor {
            Some(interceptor) => interceptor.on_prepare_statement(sql),
            None => sql,
        }
    }

    async fn flush_before_query(&mut self) -> Result<()> {
        if self.flush_mode.flushes_before_query() && !self.pending.is_empty() {
            self.flush().await?;
        }
        Ok(())
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

impl fmt::Debug for NativeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSession")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("flush_mode", &self.flush_mode)
            .field("pending", &self.pending.len())
            .field("in_transaction", &self.tx.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    async fn open_session(flush_mode: FlushMode) -> NativeSession {
        let db = Database::in_memory().await.expect("in-memory database");
        let mut session = NativeSession::new("default", db.pool().clone(), flush_mode, None);
        session
            .execute(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
                vec![],
            )
            .await
            .expect("create table");
        session
    }

    async fn count_items(session: &mut NativeSession) -> i64 {
        session
            .fetch_scalar("SELECT COUNT(*) FROM items", vec![])
            .await
            .expect("count")
    }

    #[tokio::test]
    async fn test_manual_mode_buffers_until_flush() {
        let mut session = open_session(FlushMode::Manual).await;
        session
            .save("INSERT INTO items (name) VALUES (?)", vec!["one".into()])
            .expect("save");
        assert!(session.is_dirty());
        assert_eq!(count_items(&mut session).await, 0);

        session.flush().await.expect("flush");
        assert!(!session.is_dirty());
        assert_eq!(count_items(&mut session).await, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_unexecuted_statements() {
        let mut session = open_session(FlushMode::Manual).await;
        session
            .save("INSERT INTO items (name) VALUES (?)", vec!["first".into()])
            .expect("save first");
        session
            .save("INSERT INTO missing (name) VALUES (?)", vec!["second".into()])
            .expect("save second");
        session
            .save("INSERT INTO items (name) VALUES (?)", vec!["third".into()])
            .expect("save third");

        let err = session.flush().await.expect_err("flush should fail");
        assert_eq!(err.code(), "E400");

        // The first insert went through; the failed statement and the
        // tail are still buffered
        assert_eq!(session.pending_count(), 2);
        assert_eq!(count_items(&mut session).await, 1);

        session
            .execute("CREATE TABLE missing (name TEXT NOT NULL)", vec![])
            .await
            .expect("create missing table");
        session.flush().await.expect("retry flush");
        assert!(!session.is_dirty());
        assert_eq!(count_items(&mut session).await, 2);
    }

    #[tokio::test]
    async fn test_auto_mode_flushes_before_query() {
        let mut session = open_session(FlushMode::Auto).await;
        session
            .save("INSERT INTO items (name) VALUES (?)", vec!["one".into()])
            .expect("save");
        assert_eq!(count_items(&mut session).await, 1);
        assert!(!session.is_dirty());
    }

    #[tokio::test]
    async fn test_interceptor_rewrites_statements_on_flush() {
        struct Redirect;
        impl Interceptor for Redirect {
            fn on_prepare_statement(&self, sql: String) -> String {
                sql.replace("items", "audit")
            }
        }

        let db = Database::in_memory().await.expect("in-memory database");
        let mut plain = NativeSession::new("default", db.pool().clone(), FlushMode::Manual, None);
        plain
            .execute("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)", vec![])
            .await
            .expect("create items");
        plain
            .execute("CREATE TABLE audit (id INTEGER PRIMARY KEY, name TEXT)", vec![])
            .await
            .expect("create audit");

        let mut session = NativeSession::new(
            "default",
            db.pool().clone(),
            FlushMode::Manual,
            Some(Arc::new(Redirect)),
        );
        session
            .save("INSERT INTO items (name) VALUES (?)", vec!["x".into()])
            .expect("save");
        session.flush().await.expect("flush");

        let audited = plain
            .fetch_scalar("SELECT COUNT(*) FROM audit", vec![])
            .await
            .expect("count audit");
        let direct = plain
            .fetch_scalar("SELECT COUNT(*) FROM items", vec![])
            .await
            .expect("count items");
        assert_eq!(audited, 1);
        assert_eq!(direct, 0);
    }

    #[tokio::test]
    async fn test_native_transaction_rollback_discards_writes() {
        let mut session = open_session(FlushMode::Manual).await;

        session.begin_transaction().await.expect("begin");
        session
            .execute("INSERT INTO items (name) VALUES (?)", vec!["tx".into()])
            .await
            .expect("insert");
        session.rollback_transaction().await.expect("rollback");
        assert_eq!(count_items(&mut session).await, 0);

        session.begin_transaction().await.expect("begin again");
        session
            .execute("INSERT INTO items (name) VALUES (?)", vec!["tx".into()])
            .await
            .expect("insert again");
        session.commit_transaction().await.expect("commit");
        assert_eq!(count_items(&mut session).await, 1);
    }

    #[tokio::test]
    async fn test_commit_flushes_buffered_writes() {
        let mut session = open_session(FlushMode::Commit).await;

        session.begin_transaction().await.expect("begin");
        session
            .save("INSERT INTO items (name) VALUES (?)", vec!["buffered".into()])
            .expect("save");
        session.commit_transaction().await.expect("commit");
        assert_eq!(count_items(&mut session).await, 1);
    }

    #[tokio::test]
    async fn test_double_begin_is_rejected() {
        let mut session = open_session(FlushMode::Auto).await;
        session.begin_transaction().await.expect("begin");
        let err = session.begin_transaction().await.expect_err("second begin");
        assert_eq!(err.code(), "E302");
    }

    #[tokio::test]
    async fn test_commit_without_transaction_is_invalid() {
        let mut session = open_session(FlushMode::Auto).await;
        let err = session.commit_transaction().await.expect_err("commit");
        assert_eq!(err.code(), "E304");
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let mut session = open_session(FlushMode::Auto).await;
        session.close().await.expect("close");
        assert!(session.is_closed());

        let err = session
            .save("INSERT INTO items (name) VALUES (?)", vec!["x".into()])
            .expect_err("save after close");
        assert!(matches!(err, Error::SessionClosed));

        let err = session.flush().await.expect_err("flush after close");
        assert!(matches!(err, Error::SessionClosed));

        // Closing twice is fine
        session.close().await.expect("second close");
    }

    #[tokio::test]
    async fn test_fetch_optional_and_params() {
        let mut session = open_session(FlushMode::Auto).await;
        session
            .execute(
                "INSERT INTO items (name) VALUES (?), (?)",
                vec!["a".into(), "b".into()],
            )
            .await
            .expect("insert");

        let row = session
            .fetch_optional("SELECT name FROM items WHERE name = ?", vec!["a".into()])
            .await
            .expect("fetch")
            .expect("row present");
        let name: String = row.try_get("name").expect("name column");
        assert_eq!(name, "a");

        let missing = session
            .fetch_optional("SELECT name FROM items WHERE name = ?", vec!["z".into()])
            .await
            .expect("fetch missing");
        assert!(missing.is_none());
    }

    #[test]
    fn test_flush_mode_parsing() {
        assert_eq!("manual".parse::<FlushMode>().unwrap(), FlushMode::Manual);
        assert_eq!("never".parse::<FlushMode>().unwrap(), FlushMode::Manual);
        assert_eq!("commit".parse::<FlushMode>().unwrap(), FlushMode::Commit);
        assert_eq!("AUTO".parse::<FlushMode>().unwrap(), FlushMode::Auto);
        assert_eq!("always".parse::<FlushMode>().unwrap(), FlushMode::Always);
        assert!("sometimes".parse::<FlushMode>().is_err());
    }

    #[test]
    fn test_sql_param_conversions() {
        assert_eq!(SqlParam::from(7i64), SqlParam::Integer(7));
        assert_eq!(SqlParam::from(7i32), SqlParam::Integer(7));
        assert_eq!(SqlParam::from(true), SqlParam::Integer(1));
        assert_eq!(SqlParam::from("x"), SqlParam::Text("x".to_string()));
        assert_eq!(SqlParam::from(Option::<i64>::None), SqlParam::Null);
        assert_eq!(SqlParam::from(Some("y")), SqlParam::Text("y".to_string()));
    }
}
