//! Bounded background executor for network and disk work.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::domain::errors::{CacheError, CacheResult};

/// Default number of tasks allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Kind of work submitted to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Disk lookup followed by a network fetch.
    Fetch,
    /// Persisting an encoded image.
    DiskWrite,
    /// Deleting persisted images.
    DiskDelete,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::DiskWrite => write!(f, "disk-write"),
            Self::DiskDelete => write!(f, "disk-delete"),
        }
    }
}

/// Cooperative cancellation flag shared with a running task.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Runs one blocking step, abandoning it if cancellation arrives first.
    ///
    /// Returns `None` when cancelled, before or during the step.
    pub async fn run<F: Future>(&self, step: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancelled() => None,
            out = step => Some(out),
        }
    }
}

/// Weak handle to a submitted task.
///
/// Holding it never keeps the task alive; once the task finishes the handle
/// becomes inert.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    token: Weak<CancelToken>,
    kind: TaskKind,
}

impl TaskHandle {
    /// Requests cancellation. Returns false if the task already finished.
    pub fn cancel(&self) -> bool {
        if let Some(token) = self.token.upgrade() {
            token.cancel();
            trace!(kind = %self.kind, "Cancelled background task");
            true
        } else {
            false
        }
    }

    /// Returns true once the task has finished or was dropped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.token.strong_count() == 0
    }

    /// The kind of work behind this handle.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }
}

/// Runs background work on a Tokio runtime, at most `max_concurrent` tasks
/// at a time.
///
/// Tasks report back through the closures they were given; the executor
/// itself never talks to end callers.
pub struct IoExecutor {
    runtime: Handle,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    max_concurrent: usize,
}

impl IoExecutor {
    /// Creates an executor on the current Tokio runtime.
    ///
    /// # Errors
    /// Returns error if called outside a Tokio runtime.
    pub fn new(max_concurrent: usize) -> CacheResult<Self> {
        let runtime = Handle::try_current().map_err(|e| CacheError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(runtime, max_concurrent))
    }

    /// Creates an executor on an explicit runtime.
    #[must_use]
    pub fn with_handle(runtime: Handle, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            queued: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            max_concurrent,
        }
    }

    /// Maximum number of tasks running at once.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of submitted tasks that have not finished yet.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Submits a task. The task receives its cancellation token and should
    /// check it before every blocking step.
    pub fn submit<F, Fut>(&self, kind: TaskKind, task: F) -> TaskHandle
    where
        F: FnOnce(Arc<CancelToken>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = Arc::new(CancelToken::default());
        let handle = TaskHandle {
            token: Arc::downgrade(&token),
            kind,
        };
        let permits = self.permits.clone();
        let queued = self.queued.clone();
        let idle = self.idle.clone();
        queued.fetch_add(1, Ordering::SeqCst);

        self.runtime.spawn(async move {
            if let Ok(_permit) = permits.acquire_owned().await {
                if token.is_cancelled() {
                    trace!(%kind, "Skipping task cancelled while queued");
                } else {
                    task(token).await;
                }
            }
            if queued.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });

        handle
    }

    /// Waits until every submitted task has finished, including tasks
    /// submitted while waiting.
    pub async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.queued() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Runs CPU-bound work (decode, process, encode) on the blocking pool.
    pub fn spawn_blocking<F, R>(&self, work: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.runtime.spawn_blocking(work)
    }

    /// Stops admitting queued tasks. Running tasks finish normally.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

impl std::fmt::Debug for IoExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoExecutor")
            .field("max_concurrent", &self.max_concurrent)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}
