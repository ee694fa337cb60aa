//! Port for turning bytes into images and back.

use crate::domain::errors::{CacheResult, FetchError};

/// Image decode/encode capability.
///
/// Both operations are CPU-bound and are always called from a blocking
/// worker, never from an async task directly.
pub trait ImageCodecPort: Send + Sync {
    /// Decodes fetched or persisted bytes into an image.
    ///
    /// # Errors
    /// Returns [`FetchError::Decode`] if the bytes are not a valid image.
    fn decode(&self, bytes: &[u8]) -> Result<image::DynamicImage, FetchError>;

    /// Encodes a processed image for the disk tier.
    ///
    /// # Errors
    /// Returns an encode error if the image cannot be represented in the
    /// configured format.
    fn encode(&self, image: &image::DynamicImage) -> CacheResult<Vec<u8>>;
}
