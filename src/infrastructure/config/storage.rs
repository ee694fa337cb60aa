//! Loading and saving the `config.toml` that describes a cache.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::app_config::AppConfig;
use crate::domain::errors::CacheError;

/// Why a configuration file could not be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No path was given and the platform has no config directory.
    #[error("failed to determine config directory")]
    ConfigDirNotFound,
    /// The file exists but could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file or its directory could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// File that was written.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The configuration could not be serialized.
    #[error("toml serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// The file parsed but a setting is unusable.
    #[error("invalid cache settings: {0}")]
    Invalid(String),
}

impl From<ConfigError> for CacheError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// One configuration file on disk.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Uses `path` when given, otherwise the platform config file.
    ///
    /// # Errors
    /// Returns `ConfigDirNotFound` if no path was given and the platform
    /// has no config directory.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Ok(Self::at(path)),
            None => AppConfig::default_config_path()
                .map(|path| Self { path })
                .ok_or(ConfigError::ConfigDirNotFound),
        }
    }

    /// Uses the file at `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this storage reads and writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the configuration, writing the defaults first if the file is
    /// missing. A file that is not valid TOML is left untouched and the
    /// defaults are used instead.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or created, or if it asks
    /// for settings the cache cannot run with.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "Config file not found, writing defaults");
            let config = AppConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;

        let mut config = match toml::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse config file, using defaults");
                AppConfig::default()
            }
        };
        validate(&config)?;
        config.config = Some(self.path.clone());
        debug!(path = %self.path.display(), "Loaded config");
        Ok(config)
    }

    /// Writes `config` atomically, creating the parent directory if needed.
    ///
    /// # Errors
    /// Returns error if the file cannot be serialized or written.
    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(write_err)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
        temp_file.write_all(content.as_bytes()).map_err(write_err)?;
        temp_file.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    if config.network.timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "network.timeout_secs must be at least 1".to_string(),
        ));
    }
    if config.network.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "network.user_agent must not be empty".to_string(),
        ));
    }
    if config.cache.disk.enabled
        && config
            .cache
            .disk
            .base_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
    {
        return Err(ConfigError::Invalid(
            "cache.disk.base_path must not be empty".to_string(),
        ));
    }
    Ok(())
}
