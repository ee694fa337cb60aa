//! `image`-crate implementation of the codec port.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{CacheError, CacheResult, FetchError};
use crate::domain::ports::ImageCodecPort;

/// Format used when persisting images to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EncodeFormat {
    /// Lossless PNG, keeps transparency.
    #[default]
    Png,
    /// JPEG; alpha is dropped.
    Jpeg,
    /// Lossless WebP.
    Webp,
}

impl EncodeFormat {
    /// Returns the matching `image` crate format.
    #[must_use]
    pub const fn image_format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Webp => ImageFormat::WebP,
        }
    }

    /// Conventional file extension.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }
}

impl std::fmt::Display for EncodeFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Png => write!(f, "png"),
            Self::Jpeg => write!(f, "jpeg"),
            Self::Webp => write!(f, "webp"),
        }
    }
}

/// Codec backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateCodec {
    format: EncodeFormat,
}

impl ImageCrateCodec {
    /// Creates a codec that encodes to `format`.
    #[must_use]
    pub const fn new(format: EncodeFormat) -> Self {
        Self { format }
    }
}

impl ImageCodecPort for ImageCrateCodec {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, FetchError> {
        image::load_from_memory(bytes)
            .map_err(|e| FetchError::decode(format!("Failed to decode image: {e}")))
    }

    fn encode(&self, image: &DynamicImage) -> CacheResult<Vec<u8>> {
        let prepared = match self.format {
            EncodeFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
            EncodeFormat::Png | EncodeFormat::Webp => DynamicImage::ImageRgba8(image.to_rgba8()),
        };
        let mut out = Cursor::new(Vec::new());
        prepared
            .write_to(&mut out, self.format.image_format())
            .map_err(|e| CacheError::EncodeError(format!("Failed to encode {}: {e}", self.format)))?;
        Ok(out.into_inner())
    }
}
