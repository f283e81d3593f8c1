//! Session factories and their configuration builders
//!
//! A `SessionFactory` opens native sessions against one database. Factories
//! are produced by a `ConfigurationBuilder` selected by name from
//! configuration and collected in a `SessionFactoryResolver` keyed by alias.

use crate::config::AliasConfig;
use crate::domain::session::interceptor::Interceptor;
use crate::domain::session::session::{FlushMode, NativeSession};
use crate::domain::session::stateless::NativeStatelessSession;
use crate::error::{Error, Result};
use crate::storage::{Database, DatabaseConfig};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteJournalMode, SqliteSynchronous};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

/// Opens native sessions against a single database alias
#[derive(Debug)]
pub struct SessionFactory {
    alias: String,
    database: Arc<Database>,
    flush_mode: FlushMode,
}

impl SessionFactory {
    pub fn new(alias: impl Into<String>, database: Arc<Database>, flush_mode: FlushMode) -> Self {
        Self {
            alias: alias.into(),
            database,
            flush_mode,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Flush mode applied to sessions this factory opens
    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    pub(crate) fn open_session(&self, interceptor: Option<Arc<dyn Interceptor>>) -> NativeSession {
        NativeSession::new(
            self.alias.clone(),
            self.database.pool().clone(),
            self.flush_mode,
            interceptor,
        )
    }

    pub(crate) fn open_stateless_session(&self) -> NativeStatelessSession {
        NativeStatelessSession::new(self.alias.clone(), self.database.pool().clone())
    }
}

/// Alias-keyed registry of session factories
#[derive(Default)]
pub struct SessionFactoryResolver {
    factories: RwLock<HashMap<String, Arc<SessionFactory>>>,
}

impl SessionFactoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its alias, replacing any previous one
    pub fn register(&self, factory: Arc<SessionFactory>) {
        self.write().insert(factory.alias().to_string(), factory);
    }

    pub fn resolve(&self, alias: &str) -> Option<Arc<SessionFactory>> {
        self.read().get(alias).cloned()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.read().contains_key(alias)
    }

    /// All registered aliases, sorted
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<SessionFactory>>> {
        match self.factories.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<SessionFactory>>> {
        match self.factories.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Builds a session factory from one alias's configuration
///
/// Builders are registered by name; configuration selects one through
/// `facility.configuration_builder`. Custom builders can decorate or replace
/// how pools are opened.
#[async_trait]
pub trait ConfigurationBuilder: Send + Sync {
    /// Registry name used to select this builder from configuration
    fn name(&self) -> &str;

    /// Build a session factory for one configured alias
    async fn build(
        &self,
        config: &AliasConfig,
        default_flush_mode: FlushMode,
    ) -> Result<Arc<SessionFactory>>;
}

/// Standard builder mapping alias configuration onto a SQLite pool
#[derive(Default)]
pub struct DefaultConfigurationBuilder;

impl DefaultConfigurationBuilder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConfigurationBuilder for DefaultConfigurationBuilder {
    fn name(&self) -> &str {
        "default"
    }

    async fn build(
        &self,
        config: &AliasConfig,
        default_flush_mode: FlushMode,
    ) -> Result<Arc<SessionFactory>> {
        let mut db_config = match &config.path {
            Some(path) if path.as_os_str() != ":memory:" => {
                DatabaseConfig::with_path(path.clone()).max_connections(config.max_connections)
            }
            // In-memory pools stay single-connection; a shared pool would give
            // each connection its own private database
            _ => DatabaseConfig::in_memory(),
        };
        if let Some(mode) = &config.journal_mode {
            db_config = db_config.journal_mode(parse_journal_mode(mode)?);
        }
        if let Some(level) = &config.synchronous {
            db_config = db_config.synchronous(parse_synchronous(level)?);
        }

        let database = Database::new(db_config).await.map_err(|e| {
            Error::ConfigError(format!(
                "failed to open database for alias '{}': {e:#}",
                config.alias
            ))
        })?;

        let flush_mode = config.flush_mode.unwrap_or(default_flush_mode);
        info!(alias = %config.alias, flush_mode = %flush_mode, "Session factory built");
        Ok(Arc::new(SessionFactory::new(
            &config.alias,
            Arc::new(database),
            flush_mode,
        )))
    }
}

fn parse_journal_mode(value: &str) -> Result<SqliteJournalMode> {
    match value.to_ascii_lowercase().as_str() {
        "delete" => Ok(SqliteJournalMode::Delete),
        "truncate" => Ok(SqliteJournalMode::Truncate),
        "persist" => Ok(SqliteJournalMode::Persist),
        "memory" => Ok(SqliteJournalMode::Memory),
        "wal" => Ok(SqliteJournalMode::Wal),
        "off" => Ok(SqliteJournalMode::Off),
        other => Err(Error::ConfigError(format!(
            "unknown journal_mode '{other}'"
        ))),
    }
}

fn parse_synchronous(value: &str) -> Result<SqliteSynchronous> {
    match value.to_ascii_lowercase().as_str() {
        "off" => Ok(SqliteSynchronous::Off),
        "normal" => Ok(SqliteSynchronous::Normal),
        "full" => Ok(SqliteSynchronous::Full),
        "extra" => Ok(SqliteSynchronous::Extra),
        other => Err(Error::ConfigError(format!(
            "unknown synchronous level '{other}'"
        ))),
    }
}
