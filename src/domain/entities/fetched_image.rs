//! Domain types for fetched images.

use std::sync::Arc;

use crate::domain::errors::FetchError;

use super::CacheKey;

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Served from the in-memory tier.
    MemoryCache,
    /// Decoded from the disk tier.
    DiskCache,
    /// Downloaded from the network.
    Network,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// A successfully fetched and processed image.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// The decoded, processed image.
    pub image: Arc<image::DynamicImage>,
    /// The tier that produced it.
    pub source: ImageSource,
}

impl FetchedImage {
    /// Returns true if the image was answered synchronously from memory,
    /// without running a fetch pipeline.
    #[must_use]
    pub fn from_cache(&self) -> bool {
        self.source == ImageSource::MemoryCache
    }
}

/// Outcome delivered to every subscriber of a fetch.
pub type FetchResult = Result<FetchedImage, FetchError>;

/// Identity of one fetch request, unique within a cache instance.
///
/// Ids are handed out in increasing order, so they also record the order
/// in which requests subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Message sent into a caller-owned channel when a fetch completes.
#[derive(Debug, Clone)]
pub struct ImageLoadedEvent {
    /// The key that was requested.
    pub key: CacheKey,
    /// The request this event answers.
    pub subscriber: SubscriberId,
    /// The fetched image, or the failure.
    pub result: FetchResult,
}

/// Decoded size of an image in bytes, used as its memory cost.
#[must_use]
pub fn decoded_cost(image: &image::DynamicImage) -> usize {
    image.as_bytes().len()
}
