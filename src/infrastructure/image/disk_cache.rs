//! Disk-based image cache for persistence across sessions.
//!
//! Layout: `<base>/<url digest>/<key digest>.img`, one file per cache key.
//! The key digest hashes `url + "\0" + variant`; grouping by URL digest
//! lets every variant of a URL be dropped at once. File modification time
//! is the expiry clock, so there is no index to fall out of sync.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::domain::entities::{CacheKey, url_digest};
use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::ClockPort;

const ENTRY_EXTENSION: &str = "img";
const TEMP_EXTENSION: &str = "img.tmp";

/// Disk-based image cache that persists encoded image bytes.
pub struct DiskImageCache {
    cache_dir: PathBuf,
    max_age: Option<Duration>,
    memory_threshold: u64,
    clock: Arc<dyn ClockPort>,
    // Serializes writes against evictions.
    writes: Mutex<()>,
}

impl DiskImageCache {
    /// Opens a disk cache rooted at `cache_dir`, creating it if needed.
    ///
    /// `max_age` of `None` keeps entries forever. Only encodings of at most
    /// `memory_threshold` bytes are persisted.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be created.
    pub async fn new(
        cache_dir: PathBuf,
        max_age: Option<Duration>,
        memory_threshold: u64,
        clock: Arc<dyn ClockPort>,
    ) -> CacheResult<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to create cache dir: {e}")))?;
        debug!(path = %cache_dir.display(), "Opened disk image cache");
        Ok(Self {
            cache_dir,
            max_age,
            memory_threshold,
            clock,
            writes: Mutex::new(()),
        })
    }

    /// Root directory of the cache.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path for a cached image.
    #[must_use]
    pub fn cache_path(&self, key: &CacheKey) -> PathBuf {
        self.url_dir(key.url())
            .join(format!("{}.{ENTRY_EXTENSION}", key.digest()))
    }

    fn url_dir(&self, url: &str) -> PathBuf {
        self.cache_dir.join(url_digest(url))
    }

    /// Returns true if an encoding of `len` bytes may be written.
    #[must_use]
    pub const fn accepts(&self, len: u64) -> bool {
        len <= self.memory_threshold
    }

    fn is_expired(&self, modified: std::time::SystemTime) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };
        self.clock
            .now()
            .duration_since(modified)
            .is_ok_and(|age| age > max_age)
    }

    /// Reads the encoded bytes for `key`.
    ///
    /// Expired or unreadable entries are deleted and reported as a miss.
    pub async fn get_bytes(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.cache_path(key);

        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to stat cache file");
                }
                trace!(key = %key, "Disk cache miss");
                return None;
            }
        };

        if meta.modified().is_ok_and(|modified| self.is_expired(modified)) {
            debug!(key = %key, "Disk cache entry expired");
            self.remove_path(&path).await;
            return None;
        }

        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(key = %key, path = %path.display(), "Disk cache hit");
                Some(bytes)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cache file, discarding");
                self.remove_path(&path).await;
                None
            }
        }
    }

    /// Stores encoded bytes for `key`.
    ///
    /// The bytes land in a temporary sibling first and are renamed into
    /// place, so readers never observe a partial entry.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or written.
    pub async fn put_bytes(&self, key: &CacheKey, bytes: &[u8]) -> CacheResult<()> {
        self.put_bytes_unless(key, bytes, || false).await.map(|_| ())
    }

    /// Stores encoded bytes for `key` unless `abandoned` reports true.
    ///
    /// `abandoned` is checked once the write holds the eviction lock and
    /// again just before the rename. An eviction that starts after
    /// `abandoned` turns true therefore never races a stale entry back
    /// into place. Returns whether the entry was stored.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or written.
    pub async fn put_bytes_unless(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        abandoned: impl Fn() -> bool,
    ) -> CacheResult<bool> {
        let _guard = self.writes.lock().await;
        if abandoned() {
            trace!(key = %key, "Skipping abandoned disk write");
            return Ok(false);
        }

        let path = self.cache_path(key);
        let temp = path.with_extension(TEMP_EXTENSION);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::IoError(format!("Failed to create entry dir: {e}")))?;
        }

        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to create cache file: {e}")))?;

        file.write_all(bytes)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to write cache file: {e}")))?;

        file.flush()
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to flush cache file: {e}")))?;
        drop(file);

        if abandoned() {
            self.remove_path(&temp).await;
            trace!(key = %key, "Dropped abandoned disk write");
            return Ok(false);
        }

        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::IoError(format!(
                "Failed to move cache file into place: {e}"
            )));
        }

        debug!(key = %key, path = %path.display(), size = bytes.len(), "Stored image in disk cache");
        Ok(true)
    }

    async fn remove_path(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "Failed to remove cache file");
        }
    }

    /// Removes one entry.
    pub async fn evict(&self, key: &CacheKey) {
        let _guard = self.writes.lock().await;
        self.remove_path(&self.cache_path(key)).await;
        debug!(key = %key, "Evicted from disk cache");
    }

    /// Removes every variant persisted for `url`.
    pub async fn evict_url(&self, url: &str) {
        let dir = self.url_dir(url);
        let _guard = self.writes.lock().await;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(url, "Evicted all variants from disk cache"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(url, error = %e, "Failed to evict url from disk cache"),
        }
    }

    /// Clears the entire disk cache.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be read.
    pub async fn clear(&self) -> CacheResult<()> {
        let _guard = self.writes.lock().await;
        let mut entries = fs::read_dir(&self.cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to read cache dir: {e}")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to read entry: {e}")))?
        {
            let path = entry.path();
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if is_dir && fs::remove_dir_all(&path).await.is_err() {
                warn!(path = %path.display(), "Failed to remove cache directory");
            }
        }
        debug!("Cleared disk cache");
        Ok(())
    }

    async fn entry_files(&self) -> Vec<(PathBuf, std::fs::Metadata)> {
        let mut files = Vec::new();
        let Ok(mut dirs) = fs::read_dir(&self.cache_dir).await else {
            return files;
        };

        while let Ok(Some(dir)) = dirs.next_entry().await {
            if !dir.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let Ok(mut entries) = fs::read_dir(dir.path()).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != ENTRY_EXTENSION) {
                    continue;
                }
                if let Ok(meta) = entry.metadata().await {
                    files.push((path, meta));
                }
            }
        }
        files
    }

    /// Deletes every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut removed = 0usize;
        for (path, meta) in self.entry_files().await {
            if meta.modified().is_ok_and(|modified| self.is_expired(modified))
                && fs::remove_file(&path).await.is_ok()
            {
                removed += 1;
            }
        }
        debug!(removed, "Purged expired disk cache entries");
        removed
    }

    /// Number of persisted entries.
    pub async fn len(&self) -> usize {
        self.entry_files().await.len()
    }

    /// Returns true if nothing is persisted.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Checks if an entry exists, regardless of its age.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        fs::try_exists(self.cache_path(key)).await.unwrap_or(false)
    }
}

impl std::fmt::Debug for DiskImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageCache")
            .field("cache_dir", &self.cache_dir)
            .field("max_age", &self.max_age)
            .field("memory_threshold", &self.memory_threshold)
            .finish_non_exhaustive()
    }
}
