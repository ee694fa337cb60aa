//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with cost-bounded LRU eviction
//! - Disk caching with expiry and atomic writes
//! - Composable post-decode processing
//! - A bounded background executor for disk and network work
//! - The fetch coordinator tying the tiers together

pub mod codec;
pub mod coordinator;
pub mod disk_cache;
pub mod executor;
pub mod http_fetcher;
pub mod memory_cache;
pub mod processing;

pub use codec::{EncodeFormat, ImageCrateCodec};
pub use coordinator::{CancelHandle, ImageCache, PendingFetch};
pub use disk_cache::DiskImageCache;
pub use executor::{CancelToken, IoExecutor, TaskHandle, TaskKind};
pub use http_fetcher::ReqwestImageFetcher;
pub use memory_cache::{CacheStats, MemoryImageCache};
pub use processing::{
    CircleCrop, MAX_DIMENSION, ProcessingPipeline, Resize, RoundedCorners, Transform, compose,
};
