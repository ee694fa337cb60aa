//! Application and cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use super::args::CliArgs;
use crate::infrastructure::image::EncodeFormat;

const APP_NAME: &str = "opcache";
const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "linuxmobile";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Converts to tracing level.
    #[must_use]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path. Logs go to stderr when unset.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Image cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// HTTP fetcher settings.
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Image cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Decoded bytes kept in memory; 0 disables eviction.
    #[serde(default = "default_memory_cost_limit")]
    pub memory_cost_limit: usize,

    /// Format used when persisting images.
    #[serde(default)]
    pub encode_format: EncodeFormat,

    /// Background tasks allowed to run at once.
    #[serde(default = "default_max_concurrent_io")]
    pub max_concurrent_io: usize,

    /// Disk tier settings.
    #[serde(default)]
    pub disk: DiskConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cost_limit: default_memory_cost_limit(),
            encode_format: EncodeFormat::default(),
            max_concurrent_io: default_max_concurrent_io(),
            disk: DiskConfig::default(),
        }
    }
}

/// Disk tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Persist images to disk.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory; defaults to the platform cache dir.
    #[serde(default)]
    pub base_path: Option<PathBuf>,

    /// Seconds before a persisted image expires; 0 keeps it forever.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Largest encoding, in bytes, that will be written.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: u64,
}

impl DiskConfig {
    /// Returns the expiry window, `None` when entries never expire.
    #[must_use]
    pub const fn max_age(&self) -> Option<Duration> {
        if self.max_age_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_age_secs))
        }
    }

    /// Returns the configured directory or the platform default.
    #[must_use]
    pub fn effective_base_path(&self) -> PathBuf {
        self.base_path.clone().unwrap_or_else(default_image_dir)
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_path: None,
            max_age_secs: default_max_age_secs(),
            memory_threshold: default_memory_threshold(),
        }
    }
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl NetworkConfig {
    /// Returns the request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_memory_cost_limit() -> usize {
    64 * 1024 * 1024
}

fn default_max_concurrent_io() -> usize {
    4
}

fn default_max_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_memory_threshold() -> u64 {
    4 * 1024 * 1024
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION"))
}

/// Returns the default image cache directory.
#[must_use]
pub fn default_image_dir() -> PathBuf {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME).map_or_else(
        || std::env::temp_dir().join(APP_NAME).join("cache").join("images"),
        |dirs| dirs.cache_dir().join("images"),
    )
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache.disk.base_path = Some(cache_dir.clone());
        }
        if args.no_disk {
            self.cache.disk.enabled = false;
        }
        if let Some(limit) = args.memory_cost_limit {
            self.cache.memory_cost_limit = limit;
        }
        if let Some(format) = args.encode_format {
            self.cache.encode_format = format;
        }
        if let Some(timeout) = args.timeout_secs {
            self.network.timeout_secs = timeout;
        }
    }

    /// Returns the platform config file path.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            cache: CacheConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}
