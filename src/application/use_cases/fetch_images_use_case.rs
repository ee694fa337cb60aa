//! Fetch images use case implementation.

use std::path::{Path, PathBuf};

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::application::dto::{FetchReport, FetchRequest};
use crate::domain::entities::{CacheKey, FetchedImage};
use crate::domain::errors::FetchError;
use crate::domain::ports::ImageCodecPort;
use crate::infrastructure::image::{EncodeFormat, ImageCache, ImageCrateCodec};

/// Fetches a batch of images concurrently through the cache and optionally
/// saves them.
#[derive(Clone, Debug)]
pub struct FetchImagesUseCase {
    cache: ImageCache,
    save_format: EncodeFormat,
}

impl FetchImagesUseCase {
    /// Creates new fetch use case.
    #[must_use]
    pub const fn new(cache: ImageCache, save_format: EncodeFormat) -> Self {
        Self { cache, save_format }
    }

    /// Issues every request at once and waits for all of them.
    ///
    /// Requests sharing a key share one fetch. Results come back in request
    /// order.
    pub async fn execute(
        &self,
        requests: Vec<FetchRequest>,
        output: Option<&Path>,
    ) -> Vec<Result<FetchReport, FetchError>> {
        debug!(count = requests.len(), "Fetching images");

        let pending: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let key = request.key.clone();
                (key, self.cache.fetch(request.key, request.processing))
            })
            .collect();

        let results = join_all(pending.into_iter().map(|(key, fetch)| async move {
            let result = fetch.wait().await.unwrap_or(Err(FetchError::Closed))?;
            let mut report = FetchReport::new(key.clone(), &result);
            if let Some(dir) = output {
                report.saved_to = self.save(&key, &result, dir).await;
            }
            Ok::<_, FetchError>(report)
        }))
        .await;

        let loaded = results.iter().filter(|r| r.is_ok()).count();
        info!(loaded, failed = results.len() - loaded, "Fetch batch finished");
        results
    }

    async fn save(&self, key: &CacheKey, fetched: &FetchedImage, dir: &Path) -> Option<PathBuf> {
        let codec = ImageCrateCodec::new(self.save_format);
        let image = fetched.image.clone();
        let encoded = tokio::task::spawn_blocking(move || codec.encode(&image))
            .await
            .ok()?
            .inspect_err(|e| warn!(key = %key, error = %e, "Failed to encode image for saving"))
            .ok()?;

        let path = dir.join(format!("{}.{}", key.digest(), self.save_format.extension()));
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to create output directory");
            return None;
        }
        match tokio::fs::write(&path, encoded).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to save image");
                None
            }
        }
    }
}
