//! Process-wide cache instance.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::domain::errors::CacheResult;
use crate::infrastructure::config::{AppConfig, ConfigStorage};
use crate::infrastructure::image::{ImageCache, ReqwestImageFetcher};

static SHARED: OnceCell<ImageCache> = OnceCell::const_new();

/// Builds a standalone cache with the HTTP fetcher described by `config`.
///
/// # Errors
/// Returns error if the HTTP client or disk tier cannot be set up.
pub async fn build_cache(config: &AppConfig) -> CacheResult<ImageCache> {
    let fetcher = ReqwestImageFetcher::new(config.network.timeout(), &config.network.user_agent)?;
    ImageCache::new(&config.cache, Arc::new(fetcher)).await
}

/// Returns the shared cache, creating it from `config` on first use.
///
/// Later calls return the existing instance and ignore `config`.
///
/// # Errors
/// Returns error if the cache has to be created and creation fails.
pub async fn init_shared_cache(config: &AppConfig) -> CacheResult<ImageCache> {
    SHARED
        .get_or_try_init(|| async {
            info!("Initializing shared image cache");
            build_cache(config).await
        })
        .await
        .cloned()
}

/// Returns the shared cache, creating it from the on-disk configuration on
/// first use.
///
/// # Errors
/// Returns error if the configuration cannot be loaded or the cache cannot
/// be created.
pub async fn shared_cache() -> CacheResult<ImageCache> {
    SHARED
        .get_or_try_init(|| async {
            let config = ConfigStorage::resolve(None)?.load()?;
            info!("Initializing shared image cache");
            build_cache(&config).await
        })
        .await
        .cloned()
}
