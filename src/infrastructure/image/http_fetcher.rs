//! HTTP implementation of the fetcher port.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::domain::errors::{CacheError, CacheResult, FetchError};
use crate::domain::ports::ImageFetcherPort;

/// Downloads image bytes over HTTP(S) with `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestImageFetcher {
    client: reqwest::Client,
}

impl ReqwestImageFetcher {
    /// Creates a fetcher with a per-request timeout and user agent.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(timeout: Duration, user_agent: &str) -> CacheResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| CacheError::NetworkSetup(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcherPort for ReqwestImageFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        debug!(url, "Downloading image from network");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::network(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FetchError::network(format!(
                "HTTP {}: {}",
                response.status(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| FetchError::network(format!("Failed to read body: {e}")))
    }
}
