//! Application configuration.

pub mod app_config;
pub mod args;
pub mod storage;

pub use app_config::{
    AppConfig, CacheConfig, DiskConfig, LogLevel, NetworkConfig, default_image_dir,
};
pub use args::{CliArgs, Command, FetchArgs};
pub use storage::{ConfigError, ConfigStorage};
