//! Cache key identifying a fetched image and its processed variant.

use sha2::{Digest, Sha256};

/// Composite identity of a cached image: the source URL plus a variant name.
///
/// The variant names a processed rendition of the same URL (e.g. `"thumb"`).
/// An empty variant addresses the unprocessed image and never collides with
/// a named one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    url: String,
    variant: String,
}

impl CacheKey {
    /// Creates a key for the given URL and variant name.
    #[must_use]
    pub fn new(url: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            variant: variant.into(),
        }
    }

    /// Creates a key addressing the URL with no variant.
    #[must_use]
    pub fn from_url(url: impl Into<String>) -> Self {
        Self::new(url, String::new())
    }

    /// Returns the source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the variant name, empty when none was given.
    #[must_use]
    pub fn variant(&self) -> &str {
        &self.variant
    }

    /// Returns true if this key carries a variant name.
    #[must_use]
    pub fn has_variant(&self) -> bool {
        !self.variant.is_empty()
    }

    /// Returns a stable hex digest of `url + "\0" + variant`.
    ///
    /// Used as the on-disk file name, so it must never change between
    /// releases.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.variant.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }

    /// Returns a stable hex digest of the URL alone.
    ///
    /// All variants of one URL share this prefix directory on disk.
    #[must_use]
    pub fn url_digest(&self) -> String {
        url_digest(&self.url)
    }
}

/// Stable hex digest of a URL, shared by every variant of it.
#[must_use]
pub fn url_digest(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_variant() {
            write!(f, "{}#{}", self.url, self.variant)
        } else {
            write!(f, "{}", self.url)
        }
    }
}

impl From<&str> for CacheKey {
    fn from(url: &str) -> Self {
        Self::from_url(url)
    }
}

impl From<String> for CacheKey {
    fn from(url: String) -> Self {
        Self::from_url(url)
    }
}
