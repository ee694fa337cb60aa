//! Infrastructure layer with adapters for the filesystem, HTTP and image codecs.

/// Application configuration.
pub mod config;
/// Image handling (tiers, processing, coordination).
pub mod image;

pub use config::{AppConfig, CacheConfig, CliArgs, ConfigStorage, LogLevel};
pub use image::{
    CacheStats, CancelHandle, DiskImageCache, EncodeFormat, ImageCache, MemoryImageCache,
    PendingFetch, ProcessingPipeline, ReqwestImageFetcher,
};
