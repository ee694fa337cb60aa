//! Fetch request and report DTOs.

use std::fmt;
use std::path::PathBuf;

use crate::domain::entities::{CacheKey, FetchedImage, ImageSource};
use crate::infrastructure::image::ProcessingPipeline;

/// One image to fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Cache identity of the image.
    pub key: CacheKey,
    /// Processing applied when this request starts the fetch.
    pub processing: Option<ProcessingPipeline>,
}

impl FetchRequest {
    /// Creates a request for the unprocessed image at `url`.
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            key: CacheKey::from_url(url),
            processing: None,
        }
    }

    /// Creates a request for a processed variant.
    #[must_use]
    pub fn variant(
        url: impl Into<String>,
        variant: impl Into<String>,
        processing: ProcessingPipeline,
    ) -> Self {
        Self {
            key: CacheKey::new(url, variant),
            processing: Some(processing),
        }
    }
}

/// Outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// Cache identity of the image.
    pub key: CacheKey,
    /// Tier the image came from.
    pub source: ImageSource,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Where the image was written, if saving was requested and succeeded.
    pub saved_to: Option<PathBuf>,
}

impl FetchReport {
    /// Builds a report from a fetched image.
    #[must_use]
    pub fn new(key: CacheKey, fetched: &FetchedImage) -> Self {
        Self {
            key,
            source: fetched.source,
            width: fetched.image.width(),
            height: fetched.image.height(),
            saved_to: None,
        }
    }
}

impl fmt::Display for FetchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} ({})",
            self.key, self.width, self.height, self.source
        )?;
        if let Some(path) = &self.saved_to {
            write!(f, " -> {}", path.display())?;
        }
        Ok(())
    }
}
