//! Facility assembly
//!
//! The builder wires configuration, session factories, the session store
//! and interceptors into a [`SessionFacility`], the long-lived handle
//! applications open sessions through.
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
//! ```

use crate::config::{AliasConfig, FacilityConfig, StoreKind};
use crate::domain::session::interceptor::aliased_interceptor_key;
use crate::domain::session::{
    ConfigurationBuilder, DefaultConfigurationBuilder, FlushMode, Interceptor,
    InterceptorRegistry, RequestSessionStore, Session, SessionFactoryResolver, SessionManager,
    SessionStore, StatelessSession, TaskLocalSessionStore,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Fluent assembly of a [`SessionFacility`]
pub struct FacilityBuilder {
    config: FacilityConfig,
    builders: HashMap<String, Arc<dyn ConfigurationBuilder>>,
    interceptors: Vec<(String, Arc<dyn Interceptor>)>,
}

impl FacilityBuilder {
    pub fn new() -> Self {
        let mut builders: HashMap<String, Arc<dyn ConfigurationBuilder>> = HashMap::new();
        let default: Arc<dyn ConfigurationBuilder> = Arc::new(DefaultConfigurationBuilder::new());
        builders.insert(default.name().to_string(), default);
        Self {
            config: FacilityConfig::default(),
            builders,
            interceptors: Vec::new(),
        }
    }

    /// Start from an already-loaded configuration
    pub fn with_config(config: FacilityConfig) -> Self {
        let mut builder = Self::new();
        builder.config = config;
        builder
    }

    /// Start from the configuration file at the default location
    pub fn from_config_file() -> Result<Self> {
        let config = FacilityConfig::load().map_err(|e| Error::ConfigError(format!("{e:#}")))?;
        Ok(Self::with_config(config))
    }

    /// Start from a specific configuration file
    pub fn from_config_path(path: &Path) -> Result<Self> {
        let config =
            FacilityConfig::load_from(path).map_err(|e| Error::ConfigError(format!("{e:#}")))?;
        Ok(Self::with_config(config))
    }

    /// Add a database under its alias
    pub fn database(mut self, config: AliasConfig) -> Self {
        self.config.databases.push(config);
        self
    }

    /// Add an in-memory database under an alias
    pub fn in_memory_database(self, alias: &str) -> Self {
        self.database(AliasConfig::in_memory(alias))
    }

    /// Select the session store implementation
    pub fn session_store(mut self, kind: StoreKind) -> Self {
        self.config.facility.session_store = kind;
        self
    }

    /// Flush mode applied to aliases that do not set their own
    pub fn default_flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.facility.default_flush_mode = mode;
        self
    }

    /// Select the configuration builder by registry name
    pub fn configuration_builder(mut self, name: &str) -> Self {
        self.config.facility.configuration_builder = name.to_string();
        self
    }

    /// Make a configuration builder selectable under its name
    pub fn register_configuration_builder(
        mut self,
        builder: Arc<dyn ConfigurationBuilder>,
    ) -> Self {
        self.builders.insert(builder.name().to_string(), builder);
        self
    }

    /// Register an interceptor under an explicit key
    pub fn interceptor(mut self, key: impl Into<String>, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push((key.into(), interceptor));
        self
    }

    /// Register an interceptor for a single alias
    pub fn alias_interceptor(self, alias: &str, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor(aliased_interceptor_key(alias), interceptor)
    }

    /// Validate the configuration and assemble the facility
    ///
    /// Selecting a configuration builder name that was never registered is
    /// fatal here, before any database is touched.
    pub async fn build(self) -> Result<SessionFacility> {
        self.config
            .validate()
            .map_err(|e| Error::ConfigError(format!("{e:#}")))?;

        let builder_name = &self.config.facility.configuration_builder;
        let Some(configuration_builder) = self.builders.get(builder_name) else {
            let mut known: Vec<&str> = self.builders.keys().map(String::as_str).collect();
            known.sort_unstable();
            return Err(Error::ConfigError(format!(
                "no configuration builder named '{}' is registered; known builders: {}",
                builder_name,
                known.join(", ")
            )));
        };

        let resolver = Arc::new(SessionFactoryResolver::new());
        for database in &self.config.databases {
            let factory = configuration_builder
                .build(database, self.config.facility.default_flush_mode)
                .await?;
            resolver.register(factory);
        }

        let store: Arc<dyn SessionStore> = match self.config.facility.session_store {
            StoreKind::TaskLocal => Arc::new(TaskLocalSessionStore::new()),
            StoreKind::Request => Arc::new(RequestSessionStore::new()),
        };

        let interceptors = Arc::new(InterceptorRegistry::new());
        for (key, interceptor) in self.interceptors {
            interceptors.register(key, interceptor);
        }

        let manager = SessionManager::new(store, resolver.clone(), interceptors);
        info!(
            databases = self.config.databases.len(),
            store = %self.config.facility.session_store,
            "Facility ready"
        );
        Ok(SessionFacility {
            config: self.config,
            resolver,
            manager,
        })
    }
}

impl Default for FacilityBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-lived handle to the configured databases and their sessions
pub struct SessionFacility {
    config: FacilityConfig,
    resolver: Arc<SessionFactoryResolver>,
    manager: SessionManager,
}

impl SessionFacility {
    pub fn session_manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn config(&self) -> &FacilityConfig {
        &self.config
    }

    /// All registered aliases, sorted
    pub fn aliases(&self) -> Vec<String> {
        self.resolver.aliases()
    }

    /// Open a session for the default alias
    pub async fn open_session(&self) -> Result<Session> {
        self.manager.open_session().await
    }

    /// Open a session for an alias
    pub async fn open_session_for(&self, alias: &str) -> Result<Session> {
        self.manager.open_session_for(alias).await
    }

    /// Open a stateless session for the default alias
    pub async fn open_stateless_session(&self) -> Result<StatelessSession> {
        self.manager.open_stateless_session().await
    }

    /// Open a stateless session for an alias
    pub async fn open_stateless_session_for(&self, alias: &str) -> Result<StatelessSession> {
        self.manager.open_stateless_session_for(alias).await
    }

    /// Round-trip a trivial query against one alias
    pub async fn health_check(&self, alias: &str) -> Result<()> {
        let factory = self
            .resolver
            .resolve(alias)
            .ok_or_else(|| Error::UnknownAlias(alias.to_string()))?;
        factory
            .database()
            .health_check()
            .await
            .map_err(|e| Error::Other(format!("{e:#}")))
    }

    /// Close every connection pool
    pub async fn close(&self) {
        for alias in self.aliases() {
            if let Some(factory) = self.resolver.resolve(&alias) {
                factory.database().close().await;
            }
        }
        info!("Facility closed");
    }
}

impl fmt::Debug for SessionFacility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFacility")
            .field("aliases", &self.aliases())
            .finish_non_exhaustive()
    }
}
