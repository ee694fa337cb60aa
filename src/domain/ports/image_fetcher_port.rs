//! Port for fetching raw image bytes.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::errors::FetchError;

/// Capability that downloads the bytes behind a URL.
///
/// Timeouts and retries are the implementation's concern; the cache never
/// retries a failed fetch.
#[async_trait]
pub trait ImageFetcherPort: Send + Sync {
    /// Fetches the raw bytes for `url`.
    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, FetchError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    const OPEN_GATE_PERMITS: usize = 1 << 20;

    /// Encodes a solid image as PNG.
    pub fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Bytes {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba(color));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    /// Scripted fetcher that counts calls and can hold requests open.
    pub struct MockImageFetcher {
        responses: Mutex<HashMap<String, Result<Bytes, FetchError>>>,
        calls: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
        gate: Semaphore,
    }

    impl MockImageFetcher {
        /// Creates a fetcher that serves a 4x4 PNG for unknown URLs.
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
                gate: Semaphore::new(OPEN_GATE_PERMITS),
            }
        }

        /// Creates a fetcher whose requests block until [`Self::release`].
        pub fn held() -> Self {
            Self {
                gate: Semaphore::new(0),
                ..Self::new()
            }
        }

        /// Scripts the response for `url`.
        pub fn respond(&self, url: &str, response: Result<Bytes, FetchError>) {
            self.responses.lock().insert(url.to_string(), response);
        }

        /// Lets every held and future request proceed.
        pub fn release(&self) {
            self.gate.add_permits(OPEN_GATE_PERMITS);
        }

        /// Total number of fetches issued.
        pub fn total_calls(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }

        /// Number of fetches issued for `url`.
        pub fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }

        /// Waits until at least `n` fetches have started.
        pub async fn wait_for_calls(&self, n: usize) {
            for _ in 0..500 {
                if self.total_calls() >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            panic!("expected {n} fetches, saw {}", self.total_calls());
        }
    }

    #[async_trait]
    impl ImageFetcherPort for MockImageFetcher {
        async fn fetch_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
            *self.calls.lock().entry(url.to_string()).or_default() += 1;
            self.total.fetch_add(1, Ordering::SeqCst);

            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| FetchError::network(e.to_string()))?;

            let scripted = self.responses.lock().get(url).cloned();
            scripted.unwrap_or_else(|| Ok(png_bytes(4, 4, [200, 40, 40, 255])))
        }
    }
}
