//! Facility configuration with file persistence

use crate::domain::session::FlushMode;
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Known SQLite journal modes, as accepted in configuration files
const JOURNAL_MODES: [&str; 6] = ["delete", "truncate", "persist", "memory", "wal", "off"];
/// Known SQLite synchronous levels
const SYNCHRONOUS_LEVELS: [&str; 4] = ["off", "normal", "full", "extra"];

fn default_builder_name() -> String {
    "default".to_string()
}

fn default_max_connections() -> u32 {
    crate::storage::database::DEFAULT_MAX_CONNECTIONS
}

/// Which session store implementation the facility uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Task-local activity scoping with a shared root fallback
    #[default]
    TaskLocal,
    /// Explicit request scoping; fails outside a request
    Request,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::TaskLocal => "task_local",
            StoreKind::Request => "request",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Castellan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacilityConfig {
    #[serde(default)]
    pub facility: FacilitySettings,
    #[serde(default, rename = "database")]
    pub databases: Vec<AliasConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilitySettings {
    #[serde(default)]
    pub session_store: StoreKind,
    #[serde(default)]
    pub default_flush_mode: FlushMode,
    #[serde(default = "default_builder_name")]
    pub configuration_builder: String,
}

impl Default for FacilitySettings {
    fn default() -> Self {
        Self {
            session_store: StoreKind::default(),
            default_flush_mode: FlushMode::default(),
            configuration_builder: default_builder_name(),
        }
    }
}

/// One configured database, keyed by its alias
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasConfig {
    pub alias: String,
    /// Database file; omit for an in-memory database
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Overrides the facility-wide default flush mode
    #[serde(default)]
    pub flush_mode: Option<FlushMode>,
    #[serde(default)]
    pub journal_mode: Option<String>,
    #[serde(default)]
    pub synchronous: Option<String>,
}

impl AliasConfig {
    pub fn new(alias: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            alias: alias.into(),
            path: Some(path.into()),
            max_connections: default_max_connections(),
            flush_mode: None,
            journal_mode: None,
            synchronous: None,
        }
    }

    pub fn in_memory(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            path: None,
            max_connections: default_max_connections(),
            flush_mode: None,
            journal_mode: None,
            synchronous: None,
        }
    }

    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = Some(mode);
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }
}

impl FacilityConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("CASTELLAN_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("castellan")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file, or defaults if absent
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: FacilityConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(FacilityConfig::default())
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.facility.configuration_builder.trim().is_empty() {
            return Err(anyhow!("configuration_builder must not be empty"));
        }

        if self.databases.is_empty() {
            return Err(anyhow!(
                "At least one [[database]] entry must be configured"
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for database in &self.databases {
            if database.alias.trim().is_empty() {
                return Err(anyhow!("Database alias must not be empty"));
            }
            if !seen.insert(database.alias.as_str()) {
                return Err(anyhow!("Duplicate database alias: {}", database.alias));
            }
            if database.max_connections == 0 {
                return Err(anyhow!(
                    "Database '{}' must allow at least one connection",
                    database.alias
                ));
            }
            if let Some(mode) = &database.journal_mode {
                if !JOURNAL_MODES.contains(&mode.to_ascii_lowercase().as_str()) {
                    return Err(anyhow!(
                        "Database '{}' has unknown journal_mode '{}'. Valid options: {}",
                        database.alias,
                        mode,
                        JOURNAL_MODES.join(", ")
                    ));
                }
            }
            if let Some(level) = &database.synchronous {
                if !SYNCHRONOUS_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                    return Err(anyhow!(
                        "Database '{}' has unknown synchronous level '{}'. Valid options: {}",
                        database.alias,
                        level,
                        SYNCHRONOUS_LEVELS.join(", ")
                    ));
                }
            }
        }
        Ok(())
    }

    /// Look up the configuration for an alias
    pub fn database(&self, alias: &str) -> Option<&AliasConfig> {
        self.databases.iter().find(|db| db.alias == alias)
    }

    /// All configured aliases, in declaration order
    pub fn aliases(&self) -> Vec<&str> {
        self.databases.iter().map(|db| db.alias.as_str()).collect()
    }
}
