//! Configuration management for the rendezvous agent

mod agent;
mod backoff;
pub mod serde_utils;

pub use agent::{AgentConfig, DirectoryConfig};
pub use backoff::BackoffConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rendezvous")
}

/// Get the default agent configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("agent.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Persistence for the agent configuration.
///
/// The tunnel core only reads the configuration it was constructed with;
/// writes happen at the listener boundary after registration.
pub trait ConfigStore: Send + Sync {
    /// Load the stored configuration
    fn load(&self) -> Result<AgentConfig, ConfigError>;

    /// Persist the configuration
    fn save(&self, config: &AgentConfig) -> Result<(), ConfigError>;
}

/// TOML file backed [`ConfigStore`]
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    /// Create a store for the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored configuration, falling back to defaults when the
    /// file is missing or unreadable
    pub fn load_or_default(&self) -> AgentConfig {
        match self.load() {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => AgentConfig::default(),
            Err(e) => {
                tracing::warn!("Failed to load config from {:?}: {}", self.path, e);
                AgentConfig::default()
            }
        }
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new(default_config_path())
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<AgentConfig, ConfigError> {
        load_config(&self.path)
    }

    fn save(&self, config: &AgentConfig) -> Result<(), ConfigError> {
        save_config(&self.path, config)
    }
}
