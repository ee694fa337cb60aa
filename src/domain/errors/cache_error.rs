//! Cache construction and storage error types.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors raised while building a cache or touching its disk tier.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// I/O error during a disk tier operation.
    #[error("IO error: {0}")]
    IoError(String),
    /// Image could not be encoded for persistence.
    #[error("Encode error: {0}")]
    EncodeError(String),
    /// No Tokio runtime is available to drive background work.
    #[error("No async runtime: {0}")]
    NoRuntime(String),
    /// The HTTP client could not be built.
    #[error("Network setup error: {0}")]
    NetworkSetup(String),
    /// The configuration file could not be used.
    #[error("Config error: {0}")]
    Config(String),
}
