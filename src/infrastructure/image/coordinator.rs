//! Fetch coordinator: deduplicated image loading over the memory and disk
//! tiers.
//!
//! The first request for a key with no memory hit starts one background
//! pipeline (disk -> network -> decode -> process -> store). Concurrent
//! requests for the same key subscribe to it and are completed together, in
//! subscription order. Subscriber bookkeeping and tier decisions happen
//! under a single coordinator lock; file and network I/O never do.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::domain::entities::{
    CacheKey, FetchResult, FetchedImage, ImageLoadedEvent, ImageSource, SubscriberId,
    decoded_cost,
};
use crate::domain::errors::{CacheResult, FetchError};
use crate::domain::ports::{ClockPort, ImageCodecPort, ImageFetcherPort, SystemClock};
use crate::infrastructure::config::CacheConfig;

use super::codec::ImageCrateCodec;
use super::disk_cache::DiskImageCache;
use super::executor::{CancelToken, IoExecutor, TaskHandle, TaskKind};
use super::memory_cache::{CacheStats, MemoryImageCache};
use super::processing::ProcessingPipeline;

/// Token returned for every fetch request; its only use is cancellation.
///
/// It refers to the subscription by key and id and never owns the fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelHandle {
    key: CacheKey,
    subscriber: SubscriberId,
}

impl CancelHandle {
    /// The key this handle subscribed to.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The subscriber identity.
    #[must_use]
    pub const fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }
}

/// A fetch request whose result arrives on a one-shot channel.
#[derive(Debug)]
pub struct PendingFetch {
    handle: CancelHandle,
    receiver: oneshot::Receiver<FetchResult>,
}

impl PendingFetch {
    /// The handle that cancels this request.
    #[must_use]
    pub const fn handle(&self) -> &CancelHandle {
        &self.handle
    }

    /// Waits for the result. Returns `None` if the request was cancelled
    /// or the cache was closed before it completed.
    pub async fn wait(self) -> Option<FetchResult> {
        self.receiver.await.ok()
    }

    /// Returns the result if it has already arrived.
    pub fn try_result(&mut self) -> Option<FetchResult> {
        self.receiver.try_recv().ok()
    }
}

enum Completion {
    Oneshot(oneshot::Sender<FetchResult>),
    Events(mpsc::UnboundedSender<ImageLoadedEvent>),
}

impl Completion {
    fn deliver(self, key: &CacheKey, subscriber: SubscriberId, result: FetchResult) {
        let delivered = match self {
            Self::Oneshot(tx) => tx.send(result).is_ok(),
            Self::Events(tx) => tx
                .send(ImageLoadedEvent {
                    key: key.clone(),
                    subscriber,
                    result,
                })
                .is_ok(),
        };
        if !delivered {
            trace!(key = %key, "Subscriber dropped its receiver");
        }
    }
}

struct Subscriber {
    id: SubscriberId,
    completion: Completion,
}

struct InFlightFetch {
    id: u64,
    processing: Option<ProcessingPipeline>,
    subscribers: Vec<Subscriber>,
    task: Option<TaskHandle>,
}

#[derive(Default)]
struct CoordinatorState {
    in_flight: HashMap<CacheKey, InFlightFetch>,
    disk_writes: HashMap<CacheKey, Vec<TaskHandle>>,
    next_subscriber: u64,
    next_fetch: u64,
    closed: bool,
}

impl CoordinatorState {
    fn allocate_subscriber(&mut self) -> SubscriberId {
        self.next_subscriber += 1;
        SubscriberId::new(self.next_subscriber)
    }

    fn allocate_fetch(&mut self) -> u64 {
        self.next_fetch += 1;
        self.next_fetch
    }

    fn track_disk_write(&mut self, key: CacheKey, task: TaskHandle) {
        self.disk_writes.retain(|_, tasks| {
            tasks.retain(|task| !task.is_finished());
            !tasks.is_empty()
        });
        self.disk_writes.entry(key).or_default().push(task);
    }

    /// Cancels pending disk writes for every key matching `matches`.
    fn cancel_disk_writes(&mut self, matches: impl Fn(&CacheKey) -> bool) -> usize {
        let mut cancelled = 0;
        self.disk_writes.retain(|key, tasks| {
            if !matches(key) {
                return true;
            }
            cancelled += tasks.drain(..).filter(TaskHandle::cancel).count();
            false
        });
        cancelled
    }
}

struct Loaded {
    image: Arc<image::DynamicImage>,
    source: ImageSource,
    encoded: Option<Vec<u8>>,
}

struct CacheInner {
    state: Mutex<CoordinatorState>,
    memory: MemoryImageCache,
    disk: Option<Arc<DiskImageCache>>,
    executor: IoExecutor,
    fetcher: Arc<dyn ImageFetcherPort>,
    codec: Arc<dyn ImageCodecPort>,
}

/// Deduplicating two-tier image cache.
///
/// Cheap to clone; clones share the same tiers and in-flight table.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
}

impl ImageCache {
    /// Creates a cache from configuration, using the `image` crate codec
    /// and the system clock.
    ///
    /// # Errors
    /// Returns error if called outside a Tokio runtime or if the disk tier
    /// directory cannot be created.
    pub async fn new(config: &CacheConfig, fetcher: Arc<dyn ImageFetcherPort>) -> CacheResult<Self> {
        let codec = Arc::new(ImageCrateCodec::new(config.encode_format));
        Self::with_parts(config, fetcher, codec, Arc::new(SystemClock)).await
    }

    /// Creates a cache with explicit collaborators.
    ///
    /// # Errors
    /// Returns error if called outside a Tokio runtime or if the disk tier
    /// directory cannot be created.
    pub async fn with_parts(
        config: &CacheConfig,
        fetcher: Arc<dyn ImageFetcherPort>,
        codec: Arc<dyn ImageCodecPort>,
        clock: Arc<dyn ClockPort>,
    ) -> CacheResult<Self> {
        let executor = IoExecutor::new(config.max_concurrent_io)?;

        let disk = if config.disk.enabled {
            let disk = DiskImageCache::new(
                config.disk.effective_base_path(),
                config.disk.max_age(),
                config.disk.memory_threshold,
                clock,
            )
            .await?;
            Some(Arc::new(disk))
        } else {
            None
        };

        info!(
            memory_cost_limit = config.memory_cost_limit,
            disk = disk.is_some(),
            max_concurrent_io = executor.max_concurrent(),
            "Image cache created"
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CoordinatorState::default()),
                memory: MemoryImageCache::new(config.memory_cost_limit),
                disk,
                executor,
                fetcher,
                codec,
            }),
        })
    }

    /// Requests an image. The result arrives on the returned [`PendingFetch`].
    ///
    /// A memory hit completes immediately. Otherwise the request joins the
    /// in-flight fetch for `key`, starting one if none exists; `processing`
    /// is only used when this request starts the fetch.
    pub fn fetch(&self, key: CacheKey, processing: Option<ProcessingPipeline>) -> PendingFetch {
        let (tx, receiver) = oneshot::channel();
        let handle = self.subscribe(key, processing, Completion::Oneshot(tx));
        PendingFetch { handle, receiver }
    }

    /// Requests the unprocessed image at `url`.
    pub fn fetch_url(&self, url: &str) -> PendingFetch {
        self.fetch(CacheKey::from_url(url), None)
    }

    /// Requests an image, delivering the result as an [`ImageLoadedEvent`]
    /// into the caller's channel.
    pub fn fetch_with_events(
        &self,
        key: CacheKey,
        processing: Option<ProcessingPipeline>,
        events: &mpsc::UnboundedSender<ImageLoadedEvent>,
    ) -> CancelHandle {
        self.subscribe(key, processing, Completion::Events(events.clone()))
    }

    fn subscribe(
        &self,
        key: CacheKey,
        processing: Option<ProcessingPipeline>,
        completion: Completion,
    ) -> CancelHandle {
        let mut state = self.inner.state.lock();
        let subscriber = state.allocate_subscriber();
        let handle = CancelHandle {
            key: key.clone(),
            subscriber,
        };

        if state.closed {
            drop(state);
            completion.deliver(&key, subscriber, Err(FetchError::Closed));
            return handle;
        }

        if let Some(image) = self.inner.memory.get(&key) {
            drop(state);
            completion.deliver(
                &key,
                subscriber,
                Ok(FetchedImage {
                    image,
                    source: ImageSource::MemoryCache,
                }),
            );
            return handle;
        }

        if let Some(flight) = state.in_flight.get_mut(&key) {
            flight.subscribers.push(Subscriber {
                id: subscriber,
                completion,
            });
            debug!(
                key = %key,
                subscribers = flight.subscribers.len(),
                processed = flight.processing.is_some(),
                "Attached to in-flight fetch"
            );
            return handle;
        }

        let fetch_id = state.allocate_fetch();
        let weak = Arc::downgrade(&self.inner);
        let task_key = key.clone();
        let task_processing = processing.clone();
        let task = self.inner.executor.submit(TaskKind::Fetch, move |token| {
            run_fetch(weak, task_key, fetch_id, task_processing, token)
        });

        state.in_flight.insert(
            key.clone(),
            InFlightFetch {
                id: fetch_id,
                processing,
                subscribers: vec![Subscriber {
                    id: subscriber,
                    completion,
                }],
                task: Some(task),
            },
        );
        debug!(key = %key, fetch_id, "Started fetch");
        handle
    }

    /// Cancels one subscription.
    ///
    /// Other subscribers of the same key are unaffected. When the last one
    /// cancels, the fetch is abandoned and nothing is written to either
    /// tier. Returns false if the subscription had already completed or
    /// was cancelled before.
    pub fn cancel(&self, handle: &CancelHandle) -> bool {
        let mut state = self.inner.state.lock();
        let Some(flight) = state.in_flight.get_mut(&handle.key) else {
            return false;
        };

        let before = flight.subscribers.len();
        flight.subscribers.retain(|s| s.id != handle.subscriber);
        if flight.subscribers.len() == before {
            return false;
        }

        if flight.subscribers.is_empty() {
            if let Some(flight) = state.in_flight.remove(&handle.key)
                && let Some(task) = flight.task
            {
                task.cancel();
            }
            debug!(key = %handle.key, "Cancelled fetch, no subscribers left");
        } else {
            trace!(
                key = %handle.key,
                remaining = flight.subscribers.len(),
                "Cancelled one subscriber"
            );
        }
        true
    }

    /// Memory-only lookup. Never touches the disk and never starts a fetch.
    #[must_use]
    pub fn cached_image(&self, key: &CacheKey) -> Option<Arc<image::DynamicImage>> {
        self.inner.memory.get(key)
    }

    /// Evicts `key` from both tiers.
    ///
    /// A disk write left over from a completed fetch is dropped. A fetch
    /// still in flight is not cancelled and will repopulate the tiers when
    /// it completes.
    pub fn remove(&self, key: &CacheKey) {
        let mut state = self.inner.state.lock();
        self.inner.memory.remove(key);
        let Some(disk) = self.inner.disk.clone() else {
            return;
        };
        let dropped = state.cancel_disk_writes(|k| k == key);
        let key = key.clone();
        trace!(key = %key, dropped, "Queueing disk eviction");
        self.inner
            .executor
            .submit(TaskKind::DiskDelete, move |_token| async move {
                disk.evict(&key).await;
            });
    }

    /// Evicts every variant of `url` from both tiers.
    pub fn remove_all_for_url(&self, url: &str) {
        let mut state = self.inner.state.lock();
        self.inner.memory.remove_all_for_url(url);
        let Some(disk) = self.inner.disk.clone() else {
            return;
        };
        let dropped = state.cancel_disk_writes(|k| k.url() == url);
        let url = url.to_string();
        trace!(url, dropped, "Queueing disk eviction");
        self.inner
            .executor
            .submit(TaskKind::DiskDelete, move |_token| async move {
                disk.evict_url(&url).await;
            });
    }

    /// Evicts everything from both tiers.
    pub fn remove_all(&self) {
        let mut state = self.inner.state.lock();
        self.inner.memory.clear();
        if let Some(disk) = self.inner.disk.clone() {
            state.cancel_disk_writes(|_| true);
            self.inner
                .executor
                .submit(TaskKind::DiskDelete, move |_token| async move {
                    if let Err(e) = disk.clear().await {
                        warn!(error = %e, "Failed to clear disk cache");
                    }
                });
        }
        drop(state);
        info!("Cleared all image caches");
    }

    /// Deletes expired files from the disk tier. Returns how many were
    /// removed.
    pub async fn purge_expired(&self) -> usize {
        let Some(disk) = self.inner.disk.clone() else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        self.inner
            .executor
            .submit(TaskKind::DiskDelete, move |_token| async move {
                let _ = tx.send(disk.purge_expired().await);
            });
        rx.await.unwrap_or(0)
    }

    /// Waits until every in-flight fetch and queued disk write or delete has
    /// finished.
    pub async fn flush(&self) {
        self.inner.executor.idle().await;
    }

    /// Returns true if a fetch for `key` is in flight.
    #[must_use]
    pub fn is_loading(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().in_flight.contains_key(key)
    }

    /// Number of fetches in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Memory tier statistics.
    #[must_use]
    pub fn memory_stats(&self) -> CacheStats {
        self.inner.memory.stats()
    }

    /// Returns the disk tier, if enabled.
    #[must_use]
    pub fn disk(&self) -> Option<&DiskImageCache> {
        self.inner.disk.as_deref()
    }

    /// Closes the cache.
    ///
    /// Every in-flight fetch is cancelled without completing its
    /// subscribers, the memory tier is emptied and later requests fail with
    /// [`FetchError::Closed`]. Persisted images are kept.
    pub fn close(&self) {
        let flights: Vec<InFlightFetch> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.in_flight.drain().map(|(_, flight)| flight).collect()
        };

        let cancelled = flights.len();
        for flight in flights {
            if let Some(task) = flight.task {
                task.cancel();
            }
        }
        self.inner.memory.clear();
        self.inner.executor.shutdown();
        info!(cancelled, "Image cache closed");
    }

    /// Returns true once [`Self::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk)
            .field("executor", &self.inner.executor)
            .finish_non_exhaustive()
    }
}

async fn run_fetch(
    cache: Weak<CacheInner>,
    key: CacheKey,
    fetch_id: u64,
    processing: Option<ProcessingPipeline>,
    token: Arc<CancelToken>,
) {
    let Some(inner) = cache.upgrade() else {
        return;
    };
    let outcome = inner.load(&key, processing, &token).await;
    inner.finish(key, fetch_id, outcome);
}

impl CacheInner {
    /// Runs the pipeline. Returns `None` if cancelled along the way.
    async fn load(
        &self,
        key: &CacheKey,
        processing: Option<ProcessingPipeline>,
        token: &CancelToken,
    ) -> Option<Result<Loaded, FetchError>> {
        if let Some(disk) = &self.disk
            && let Some(bytes) = token.run(disk.get_bytes(key)).await?
        {
            match self.decode(Bytes::from(bytes), None, false).await {
                Ok((image, _)) => {
                    debug!(key = %key, "Decoded image from disk cache");
                    return Some(Ok(Loaded {
                        image: Arc::new(image),
                        source: ImageSource::DiskCache,
                        encoded: None,
                    }));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding unreadable disk cache entry");
                    disk.evict(key).await;
                }
            }
        }

        let bytes = match token.run(self.fetcher.fetch_bytes(key.url())).await? {
            Ok(bytes) => bytes,
            Err(e) => return Some(Err(e)),
        };

        if token.is_cancelled() {
            return None;
        }

        let result = self
            .decode(bytes, processing, self.disk.is_some())
            .await
            .map(|(image, encoded)| Loaded {
                image: Arc::new(image),
                source: ImageSource::Network,
                encoded,
            });
        Some(result)
    }

    /// Decodes, processes and optionally encodes on the blocking pool.
    async fn decode(
        &self,
        bytes: Bytes,
        processing: Option<ProcessingPipeline>,
        encode: bool,
    ) -> Result<(image::DynamicImage, Option<Vec<u8>>), FetchError> {
        let codec = self.codec.clone();
        self.executor
            .spawn_blocking(move || -> Result<_, FetchError> {
                let decoded = codec.decode(&bytes)?;
                let processed = match &processing {
                    Some(pipeline) => pipeline.apply(decoded),
                    None => decoded,
                };
                let encoded = if encode {
                    codec
                        .encode(&processed)
                        .inspect_err(|e| warn!(error = %e, "Failed to encode image for disk cache"))
                        .ok()
                } else {
                    None
                };
                Ok((processed, encoded))
            })
            .await
            .map_err(|e| FetchError::decode(format!("Decode task panicked: {e}")))?
    }

    /// Stores the outcome and fans it out, unless the fetch was abandoned.
    fn finish(&self, key: CacheKey, fetch_id: u64, outcome: Option<Result<Loaded, FetchError>>) {
        let mut state = self.state.lock();
        let flight = match state.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().id == fetch_id => entry.remove(),
            _ => {
                debug!(key = %key, fetch_id, "Discarding result of abandoned fetch");
                return;
            }
        };
        let Some(outcome) = outcome else {
            debug!(key = %key, fetch_id, "Fetch stopped before producing a result");
            return;
        };

        let mut disk_write = None;
        let result = match outcome {
            Ok(loaded) => {
                let cost = decoded_cost(&loaded.image);
                self.memory.put(key.clone(), loaded.image.clone(), cost);

                if let (Some(disk), Some(encoded)) = (&self.disk, loaded.encoded) {
                    if loaded.source == ImageSource::Network && disk.accepts(encoded.len() as u64) {
                        disk_write = Some((disk.clone(), encoded));
                    } else {
                        debug!(key = %key, size = encoded.len(), "Skipping disk cache write");
                    }
                }

                debug!(
                    key = %key,
                    source = %loaded.source,
                    subscribers = flight.subscribers.len(),
                    "Image loaded successfully"
                );
                Ok(FetchedImage {
                    image: loaded.image,
                    source: loaded.source,
                })
            }
            Err(e) => {
                warn!(key = %key, error = %e, subscribers = flight.subscribers.len(), "Image fetch failed");
                Err(e)
            }
        };

        // Queue before fan-out; a subscriber may remove the key on delivery.
        if let Some((disk, encoded)) = disk_write {
            let write_key = key.clone();
            let task = self
                .executor
                .submit(TaskKind::DiskWrite, move |token| async move {
                    match disk
                        .put_bytes_unless(&write_key, &encoded, || token.is_cancelled())
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => debug!(key = %write_key, "Disk write dropped after removal"),
                        Err(e) => warn!(key = %write_key, error = %e, "Failed to cache to disk"),
                    }
                });
            state.track_disk_write(key.clone(), task);
        }
        drop(state);

        for subscriber in flight.subscribers {
            subscriber.completion.deliver(&key, subscriber.id, result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::MockClockPort;
    use crate::domain::ports::mocks::{MockImageFetcher, png_bytes};
    use crate::infrastructure::config::DiskConfig;
    use crate::infrastructure::image::processing::Resize;
    use std::path::Path;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    const URL: &str = "https://example.com/a.png";
    const MAX_AGE: Duration = Duration::from_secs(3600);

    fn config(disk_dir: Option<&Path>) -> CacheConfig {
        CacheConfig {
            memory_cost_limit: 1024 * 1024,
            max_concurrent_io: 4,
            disk: DiskConfig {
                enabled: disk_dir.is_some(),
                base_path: disk_dir.map(Path::to_path_buf),
                max_age_secs: MAX_AGE.as_secs(),
                memory_threshold: 1024 * 1024,
            },
            ..CacheConfig::default()
        }
    }

    async fn memory_only(fetcher: &Arc<MockImageFetcher>) -> ImageCache {
        ImageCache::new(&config(None), fetcher.clone()).await.unwrap()
    }

    async fn with_disk(fetcher: &Arc<MockImageFetcher>, dir: &TempDir) -> ImageCache {
        ImageCache::new(&config(Some(dir.path())), fetcher.clone())
            .await
            .unwrap()
    }

    async fn settle(cache: &ImageCache) {
        tokio::time::timeout(Duration::from_secs(5), cache.flush())
            .await
            .expect("cache did not settle");
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_network_call() {
        let fetcher = Arc::new(MockImageFetcher::held());
        let cache = memory_only(&fetcher).await;

        let first = cache.fetch_url(URL);
        let second = cache.fetch_url(URL);
        assert!(cache.is_loading(&CacheKey::from_url(URL)));
        assert_eq!(cache.pending_count(), 1);

        fetcher.wait_for_calls(1).await;
        fetcher.release();

        let a = assert_ok!(first.wait().await.unwrap());
        let b = assert_ok!(second.wait().await.unwrap());
        assert_eq!(a.source, ImageSource::Network);
        assert!(!a.from_cache());
        assert!(!b.from_cache());
        assert!(Arc::ptr_eq(&a.image, &b.image));
        assert_eq!(fetcher.total_calls(), 1);
        assert_eq!(cache.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_hit_after_success() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = memory_only(&fetcher).await;
        let key = CacheKey::new(URL, "small");
        let resize = ProcessingPipeline::new(Resize::new(2, 2));

        let fetched = assert_ok!(cache.fetch(key.clone(), Some(resize)).wait().await.unwrap());
        assert_eq!(fetched.image.width(), 2);

        let cached = cache.cached_image(&key).unwrap();
        assert_eq!((cached.width(), cached.height()), (2, 2));

        let again = assert_ok!(cache.fetch(key, None).wait().await.unwrap());
        assert!(again.from_cache());
        assert_eq!(again.image.width(), 2);
        assert_eq!(fetcher.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_cached_image_never_fetches() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = memory_only(&fetcher).await;

        assert!(cache.cached_image(&CacheKey::from_url(URL)).is_none());
        assert_eq!(cache.pending_count(), 0);
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_subscribers_discards_fetch() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::held());
        let cache = with_disk(&fetcher, &dir).await;
        let key = CacheKey::from_url(URL);

        let first = cache.fetch(key.clone(), None);
        let second = cache.fetch(key.clone(), None);

        assert!(cache.cancel(first.handle()));
        assert!(cache.is_loading(&key));
        assert!(cache.cancel(second.handle()));
        assert!(!cache.is_loading(&key));
        assert!(!cache.cancel(second.handle()));

        fetcher.release();
        assert!(first.wait().await.is_none());
        assert!(second.wait().await.is_none());

        settle(&cache).await;
        assert!(cache.cached_image(&key).is_none());
        assert!(cache.disk().unwrap().is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_one_subscriber_keeps_other() {
        let fetcher = Arc::new(MockImageFetcher::held());
        let cache = memory_only(&fetcher).await;
        let key = CacheKey::from_url(URL);

        let cancelled = cache.fetch(key.clone(), None);
        let kept = cache.fetch(key.clone(), None);
        assert!(cache.cancel(cancelled.handle()));

        fetcher.release();
        assert!(cancelled.wait().await.is_none());
        let image = assert_ok!(kept.wait().await.unwrap());
        assert_eq!(image.image.width(), 4);
        assert!(cache.cached_image(&key).is_some());
    }

    #[tokio::test]
    async fn test_disk_round_trip_skips_network() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = with_disk(&fetcher, &dir).await;
        let key = CacheKey::from_url(URL);

        let first = assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());
        settle(&cache).await;
        assert!(cache.disk().unwrap().contains(&key).await);

        cache.inner.memory.remove(&key);
        let second = assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());

        assert_eq!(second.source, ImageSource::DiskCache);
        assert_eq!(second.image.to_rgba8(), first.image.to_rgba8());
        assert_eq!(fetcher.total_calls(), 1);
        assert!(cache.cached_image(&key).is_some());
    }

    #[tokio::test]
    async fn test_disk_hit_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = with_disk(&fetcher, &dir).await;
        let key = CacheKey::from_url(URL);

        assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());
        settle(&cache).await;
        let path = cache.disk().unwrap().cache_path(&key);
        let written = std::fs::metadata(&path).unwrap().modified().unwrap();

        cache.inner.memory.remove(&key);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());
        settle(&cache).await;

        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(written, after);
    }

    #[tokio::test]
    async fn test_expired_disk_entry_refetches() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let later = SystemTime::now() + MAX_AGE + Duration::from_secs(60);
        let mut clock = MockClockPort::new();
        clock.expect_now().returning(move || later);

        let cache = ImageCache::with_parts(
            &config(Some(dir.path())),
            fetcher.clone(),
            Arc::new(ImageCrateCodec::default()),
            Arc::new(clock),
        )
        .await
        .unwrap();
        let key = CacheKey::from_url(URL);

        assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());
        settle(&cache).await;
        cache.inner.memory.remove(&key);

        let again = assert_ok!(cache.fetch(key, None).wait().await.unwrap());
        assert_eq!(again.source, ImageSource::Network);
        assert_eq!(fetcher.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_variants_never_share_a_fetch() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::held());
        let cache = with_disk(&fetcher, &dir).await;
        let bare = CacheKey::from_url("a.png");
        let thumb = CacheKey::new("a.png", "thumb");

        let full = cache.fetch(bare.clone(), None);
        let small = cache.fetch(thumb.clone(), Some(ProcessingPipeline::new(Resize::new(1, 1))));
        assert_eq!(cache.pending_count(), 2);

        fetcher.wait_for_calls(2).await;
        fetcher.release();

        let full = assert_ok!(full.wait().await.unwrap());
        let small = assert_ok!(small.wait().await.unwrap());
        assert_eq!(full.image.width(), 4);
        assert_eq!(small.image.width(), 1);
        assert_eq!(fetcher.calls_for("a.png"), 2);

        settle(&cache).await;
        assert_eq!(cache.cached_image(&bare).unwrap().width(), 4);
        assert_eq!(cache.cached_image(&thumb).unwrap().width(), 1);
        assert_eq!(cache.disk().unwrap().len().await, 2);
    }

    #[tokio::test]
    async fn test_first_subscriber_processing_wins() {
        let fetcher = Arc::new(MockImageFetcher::held());
        let cache = memory_only(&fetcher).await;
        let key = CacheKey::new(URL, "avatar");

        let first = cache.fetch(key.clone(), Some(ProcessingPipeline::new(Resize::new(2, 2))));
        let second = cache.fetch(key, Some(ProcessingPipeline::new(Resize::new(3, 3))));
        fetcher.release();

        assert_eq!(assert_ok!(first.wait().await.unwrap()).image.width(), 2);
        assert_eq!(assert_ok!(second.wait().await.unwrap()).image.width(), 2);
    }

    #[tokio::test]
    async fn test_network_failure_reaches_every_subscriber() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::held());
        fetcher.respond(URL, Err(FetchError::network("HTTP 404")));
        let cache = with_disk(&fetcher, &dir).await;
        let key = CacheKey::from_url(URL);

        let first = cache.fetch(key.clone(), None);
        let second = cache.fetch(key.clone(), None);
        fetcher.release();

        let a = assert_err!(first.wait().await.unwrap());
        let b = assert_err!(second.wait().await.unwrap());
        assert!(a.is_network());
        assert_eq!(a, b);

        settle(&cache).await;
        assert!(cache.cached_image(&key).is_none());
        assert!(cache.disk().unwrap().is_empty().await);
    }

    #[tokio::test]
    async fn test_decode_failure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        fetcher.respond(URL, Ok(Bytes::from_static(b"definitely not a png")));
        let cache = with_disk(&fetcher, &dir).await;
        let key = CacheKey::from_url(URL);

        let err = assert_err!(cache.fetch(key.clone(), None).wait().await.unwrap());
        assert!(err.is_decode());

        settle(&cache).await;
        assert!(cache.cached_image(&key).is_none());
        assert!(cache.disk().unwrap().is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_retried_until_asked() {
        let fetcher = Arc::new(MockImageFetcher::new());
        fetcher.respond(URL, Err(FetchError::network("offline")));
        let cache = memory_only(&fetcher).await;

        assert_err!(cache.fetch_url(URL).wait().await.unwrap());
        assert_eq!(fetcher.total_calls(), 1);

        fetcher.respond(URL, Ok(png_bytes(3, 3, [0, 0, 255, 255])));
        let image = assert_ok!(cache.fetch_url(URL).wait().await.unwrap());
        assert_eq!(image.image.width(), 3);
        assert_eq!(fetcher.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_disk_entry_falls_back_to_network() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = with_disk(&fetcher, &dir).await;
        let key = CacheKey::from_url(URL);

        let disk = cache.disk().unwrap();
        assert_ok!(disk.put_bytes(&key, b"garbage").await);

        let image = assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());
        assert_eq!(image.source, ImageSource::Network);
        settle(&cache).await;

        let persisted = cache.disk().unwrap().get_bytes(&key).await.unwrap();
        assert!(image::load_from_memory(&persisted).is_ok());
    }

    #[tokio::test]
    async fn test_large_encodings_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let mut config = config(Some(dir.path()));
        config.disk.memory_threshold = 8;
        let cache = ImageCache::new(&config, fetcher.clone()).await.unwrap();
        let key = CacheKey::from_url(URL);

        assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());
        settle(&cache).await;

        assert!(cache.cached_image(&key).is_some());
        assert!(!cache.disk().unwrap().contains(&key).await);
    }

    #[tokio::test]
    async fn test_remove_does_not_cancel_pending_fetch() {
        let fetcher = Arc::new(MockImageFetcher::held());
        let cache = memory_only(&fetcher).await;
        let key = CacheKey::from_url(URL);

        let pending = cache.fetch(key.clone(), None);
        cache.remove(&key);
        cache.remove_all();
        assert!(cache.is_loading(&key));

        fetcher.release();
        assert_ok!(pending.wait().await.unwrap());
        assert!(cache.cached_image(&key).is_some());
    }

    #[tokio::test]
    async fn test_remove_all_for_url_clears_variants() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = with_disk(&fetcher, &dir).await;
        let bare = CacheKey::from_url(URL);
        let thumb = CacheKey::new(URL, "thumb");
        let other = CacheKey::from_url("https://example.com/b.png");

        for key in [&bare, &thumb, &other] {
            assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());
        }
        settle(&cache).await;

        cache.remove_all_for_url(URL);
        settle(&cache).await;

        assert!(cache.cached_image(&bare).is_none());
        assert!(cache.cached_image(&thumb).is_none());
        assert!(cache.cached_image(&other).is_some());
        let disk = cache.disk().unwrap();
        assert!(!disk.contains(&bare).await);
        assert!(!disk.contains(&thumb).await);
        assert!(disk.contains(&other).await);
    }

    #[tokio::test]
    async fn test_remove_single_key() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = with_disk(&fetcher, &dir).await;
        let key = CacheKey::from_url(URL);

        assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());
        settle(&cache).await;

        cache.remove(&key);
        settle(&cache).await;
        assert!(cache.cached_image(&key).is_none());
        assert!(!cache.disk().unwrap().contains(&key).await);

        let again = assert_ok!(cache.fetch(key, None).wait().await.unwrap());
        assert_eq!(again.source, ImageSource::Network);
        assert_eq!(fetcher.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_subscription_order() {
        let fetcher = Arc::new(MockImageFetcher::held());
        let cache = memory_only(&fetcher).await;
        let key = CacheKey::from_url(URL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();

        let handles = [
            cache.fetch_with_events(key.clone(), None, &tx),
            cache.fetch_with_events(key.clone(), None, &other_tx),
            cache.fetch_with_events(key.clone(), None, &tx),
            cache.fetch_with_events(key.clone(), None, &tx),
        ];
        fetcher.release();

        let mut received = Vec::new();
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.key, key);
            assert!(event.result.is_ok());
            received.push(event.subscriber);
        }
        let other = other_rx.recv().await.unwrap();

        assert_eq!(
            received,
            [handles[0].subscriber(), handles[2].subscriber(), handles[3].subscriber()]
        );
        assert_eq!(other.subscriber, handles[1].subscriber());
        assert!(received.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(fetcher.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_memory_hit_event_names_its_subscriber() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = memory_only(&fetcher).await;
        let key = CacheKey::from_url(URL);
        assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = cache.fetch_with_events(key, None, &tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.subscriber, handle.subscriber());
        assert!(event.result.unwrap().from_cache());
    }

    async fn remove_right_after_completion(remove: fn(&ImageCache, &CacheKey)) {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = with_disk(&fetcher, &dir).await;

        for round in 0..20 {
            let key = CacheKey::new(URL, format!("v{round}"));
            assert_ok!(cache.fetch(key.clone(), None).wait().await.unwrap());
            remove(&cache, &key);
            settle(&cache).await;

            assert!(cache.cached_image(&key).is_none());
            assert!(!cache.disk().unwrap().contains(&key).await, "round {round}");
        }
        assert!(cache.disk().unwrap().is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_after_completion_drops_queued_disk_write() {
        remove_right_after_completion(|cache, key| cache.remove(key)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_url_after_completion_drops_queued_disk_write() {
        remove_right_after_completion(|cache, key| cache.remove_all_for_url(key.url())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_all_after_completion_drops_queued_disk_write() {
        remove_right_after_completion(|cache, _| cache.remove_all()).await;
    }

    #[tokio::test]
    async fn test_removal_leaves_other_keys_disk_writes_alone() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = with_disk(&fetcher, &dir).await;
        let kept = CacheKey::from_url("https://example.com/b.png");
        let removed = CacheKey::from_url(URL);

        assert_ok!(cache.fetch(kept.clone(), None).wait().await.unwrap());
        assert_ok!(cache.fetch(removed.clone(), None).wait().await.unwrap());
        cache.remove(&removed);
        settle(&cache).await;

        let disk = cache.disk().unwrap();
        assert!(disk.contains(&kept).await);
        assert!(!disk.contains(&removed).await);
    }

    /// Codec that parks in `decode` until the test lets it go.
    struct GatedCodec {
        inner: ImageCrateCodec,
        entered: mpsc::UnboundedSender<()>,
        release: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl ImageCodecPort for GatedCodec {
        fn decode(&self, bytes: &[u8]) -> Result<image::DynamicImage, FetchError> {
            let _ = self.entered.send(());
            let _ = self.release.lock().recv();
            self.inner.decode(bytes)
        }

        fn encode(&self, image: &image::DynamicImage) -> CacheResult<Vec<u8>> {
            self.inner.encode(image)
        }
    }

    #[tokio::test]
    async fn test_cancel_during_processing_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        let (entered_tx, mut entered) = mpsc::unbounded_channel();
        let (release, release_rx) = std::sync::mpsc::channel();
        let codec = GatedCodec {
            inner: ImageCrateCodec::default(),
            entered: entered_tx,
            release: parking_lot::Mutex::new(release_rx),
        };
        let cache = ImageCache::with_parts(
            &config(Some(dir.path())),
            fetcher.clone(),
            Arc::new(codec),
            Arc::new(crate::domain::ports::SystemClock),
        )
        .await
        .unwrap();
        let key = CacheKey::new(URL, "thumb");

        let first = cache.fetch(key.clone(), Some(ProcessingPipeline::new(Resize::new(2, 2))));
        let second = cache.fetch(key.clone(), None);
        entered.recv().await.unwrap();
        assert_eq!(fetcher.total_calls(), 1);

        assert!(cache.cancel(first.handle()));
        assert!(cache.cancel(second.handle()));
        release.send(()).unwrap();

        assert!(first.wait().await.is_none());
        assert!(second.wait().await.is_none());
        settle(&cache).await;

        assert_eq!(cache.pending_count(), 0);
        assert!(cache.cached_image(&key).is_none());
        assert!(cache.disk().unwrap().is_empty().await);
    }

    #[tokio::test]
    async fn test_close_cancels_and_rejects() {
        let fetcher = Arc::new(MockImageFetcher::held());
        let cache = memory_only(&fetcher).await;

        let pending = cache.fetch_url(URL);
        cache.close();
        assert!(cache.is_closed());
        assert_eq!(cache.pending_count(), 0);
        assert!(pending.wait().await.is_none());

        let after = cache.fetch_url(URL).wait().await.unwrap();
        assert_eq!(after.unwrap_err(), FetchError::Closed);
    }

    #[tokio::test]
    async fn test_memory_hit_handle_cancel_is_noop() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = memory_only(&fetcher).await;

        assert_ok!(cache.fetch_url(URL).wait().await.unwrap());
        let mut hit = cache.fetch_url(URL);
        assert!(hit.try_result().unwrap().unwrap().from_cache());
        assert!(!cache.cancel(hit.handle()));
    }

    #[tokio::test]
    async fn test_purge_expired_without_disk() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = memory_only(&fetcher).await;
        assert_eq!(cache.purge_expired().await, 0);
        assert!(cache.disk().is_none());
    }

    #[tokio::test]
    async fn test_memory_stats_track_lookups() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let cache = memory_only(&fetcher).await;

        assert_ok!(cache.fetch_url(URL).wait().await.unwrap());
        let _ = cache.cached_image(&CacheKey::from_url(URL));

        let stats = cache.memory_stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.total_cost, 4 * 4 * 4);
        assert!(stats.hits >= 1);
    }
}
