//! Fetch -> store -> deliver chain for a single photo.
//!
//! A request that hits the cache is delivered on the calling thread and never
//! touches the network. A miss spawns a [`CancellableTask`] for the fetch; the
//! task's completion callback runs the store step and then the deliver step on
//! the worker that finished the fetch. Each step re-checks the pipeline stage
//! under its lock, so a cancel that lands before a step starts suppresses it
//! and everything after it.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};
use url::Url;

use crate::cache::ImageCache;
use crate::error::FetchError;
use crate::photo::PhotoId;
use crate::task::{CancellableTask, TaskOutcome};
use crate::transport::Transport;

/// What a consumer receives: the image bytes or the reason the fetch failed.
/// Cancelled pipelines deliver nothing.
pub type Delivery = Result<Bytes, FetchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(u64);

impl PipelineId {
    /// Shared by every cache-hit handle; no chain is built for those.
    pub const CACHED: PipelineId = PipelineId(0);

    pub fn is_cached(self) -> bool {
        self == Self::CACHED
    }

    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cached() {
            return f.write_str("pipeline-cached");
        }
        write!(f, "pipeline-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Served from the cache; no chain was built.
    Cached,
    Fetching,
    Storing,
    Delivering,
    Delivered,
    Failed,
    Cancelled,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStage::Cached
                | PipelineStage::Delivered
                | PipelineStage::Failed
                | PipelineStage::Cancelled
        )
    }

    fn is_cancellable(self) -> bool {
        matches!(self, PipelineStage::Fetching | PipelineStage::Storing)
    }
}

/// Hook for observing chain steps as they run. All methods default to no-ops.
pub trait StepObserver: Send + Sync {
    fn fetch_started(&self, _key: PhotoId, _pipeline: PipelineId) {}
    fn fetch_finished(&self, _key: PhotoId, _pipeline: PipelineId, _ok: bool) {}
    fn stored(&self, _key: PhotoId, _pipeline: PipelineId) {}
    fn delivered(&self, _key: PhotoId, _pipeline: PipelineId) {}
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: AtomicU64,
    fetches_started: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub cache_hits: u64,
    pub fetches_started: u64,
    pub delivered: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub in_flight: usize,
}

struct Shared {
    id: PipelineId,
    key: PhotoId,
    stage: Mutex<PipelineStage>,
    fetch: CancellableTask<Bytes>,
    counters: Arc<Counters>,
}

impl Shared {
    fn cancel(&self) -> bool {
        {
            let mut stage = self.stage.lock();
            if !stage.is_cancellable() {
                return false;
            }
            *stage = PipelineStage::Cancelled;
        }
        self.fetch.cancel();
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(key = %self.key, pipeline = %self.id, "pipeline cancelled");
        true
    }

    /// Move `from -> to` if nothing else (a cancel) got there first.
    fn advance(&self, from: PipelineStage, to: PipelineStage) -> bool {
        let mut stage = self.stage.lock();
        if *stage != from {
            return false;
        }
        *stage = to;
        true
    }
}

/// Decrements the in-flight gauge when the chain callback ends, whichever
/// branch it took.
struct InFlight(Arc<Counters>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Cancellation handle for one request. Handles for cache hits are inert.
#[derive(Clone)]
pub struct PipelineHandle {
    key: PhotoId,
    id: PipelineId,
    shared: Option<Arc<Shared>>,
}

impl PipelineHandle {
    fn cached(key: PhotoId) -> Self {
        Self {
            key,
            id: PipelineId::CACHED,
            shared: None,
        }
    }

    pub fn key(&self) -> PhotoId {
        self.key
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn stage(&self) -> PipelineStage {
        match &self.shared {
            Some(shared) => *shared.stage.lock(),
            None => PipelineStage::Cached,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.stage().is_terminal()
    }

    /// Cancel the fetch and suppress the steps that have not started yet.
    /// Returns false if there was nothing left to cancel.
    pub fn cancel(&self) -> bool {
        self.shared.as_ref().is_some_and(|shared| shared.cancel())
    }

    /// Lookup-only reference that does not keep the pipeline alive.
    pub fn downgrade(&self) -> WeakPipelineHandle {
        WeakPipelineHandle {
            key: self.key,
            id: self.id,
            shared: self.shared.as_ref().map(Arc::downgrade),
        }
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("stage", &self.stage())
            .finish()
    }
}

/// Weak counterpart of [`PipelineHandle`]. Once the chain has finished and
/// released its state, cancelling is a no-op.
#[derive(Debug, Clone)]
pub struct WeakPipelineHandle {
    key: PhotoId,
    id: PipelineId,
    shared: Option<Weak<Shared>>,
}

impl WeakPipelineHandle {
    pub fn key(&self) -> PhotoId {
        self.key
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn upgrade(&self) -> Option<PipelineHandle> {
        let shared = self.shared.as_ref()?.upgrade()?;
        Some(PipelineHandle {
            key: self.key,
            id: self.id,
            shared: Some(shared),
        })
    }

    pub fn cancel(&self) -> bool {
        self.upgrade().is_some_and(|handle| handle.cancel())
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Builds and runs fetch/store/deliver chains against a shared cache.
#[derive(Clone)]
pub struct FetchPipeline {
    cache: ImageCache,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    observer: Option<Arc<dyn StepObserver>>,
    counters: Arc<Counters>,
}

impl fmt::Debug for FetchPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchPipeline")
            .field("cache", &self.cache)
            .field("observer", &self.observer.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

impl FetchPipeline {
    /// `runtime` is the worker pool fetch tasks are spawned on.
    pub fn new(
        cache: ImageCache,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Self {
        Self {
            cache,
            transport,
            runtime,
            observer: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Produce the bytes for `key`, from the cache or by fetching `url`.
    ///
    /// On a hit `deliver` runs before this returns and the handle is inert.
    /// On a miss `deliver` runs on a worker thread after the bytes have been
    /// stored, or with the fetch error; it never runs for a cancelled chain.
    pub fn request<D>(&self, key: PhotoId, url: Url, deliver: D) -> PipelineHandle
    where
        D: FnOnce(Delivery) + Send + 'static,
    {
        if let Some(bytes) = self.cache.get(&key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(%key, "cache hit");
            deliver(Ok(bytes));
            return PipelineHandle::cached(key);
        }

        let id = PipelineId::next();
        let transport = Arc::clone(&self.transport);
        let fetch = CancellableTask::new(self.runtime.clone(), move |token| {
            async move { transport.fetch(&url, token).await }
        });
        let shared = Arc::new(Shared {
            id,
            key,
            stage: Mutex::new(PipelineStage::Fetching),
            fetch: fetch.clone(),
            counters: Arc::clone(&self.counters),
        });

        self.counters.fetches_started.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        debug!(%key, pipeline = %id, task = %fetch.id(), "fetch started");
        if let Some(observer) = &self.observer {
            observer.fetch_started(key, id);
        }

        let chain = Chain {
            shared: Arc::clone(&shared),
            cache: self.cache.clone(),
            observer: self.observer.clone(),
        };
        fetch.on_completion(move |outcome| chain.run(outcome, deliver));
        fetch.start();

        PipelineHandle {
            key,
            id,
            shared: Some(shared),
        }
    }

    /// Same as [`PipelineHandle::cancel`].
    pub fn cancel(&self, handle: &PipelineHandle) -> bool {
        handle.cancel()
    }

    /// Pipelines that have not reached a terminal stage.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            fetches_started: self.counters.fetches_started.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// The steps after the fetch, run by the fetch task's completion callback.
struct Chain {
    shared: Arc<Shared>,
    cache: ImageCache,
    observer: Option<Arc<dyn StepObserver>>,
}

impl Chain {
    fn run<D>(self, outcome: TaskOutcome<Bytes>, deliver: D)
    where
        D: FnOnce(Delivery),
    {
        let _in_flight = InFlight(Arc::clone(&self.shared.counters));
        let (id, key) = (self.shared.id, self.shared.key);

        match outcome {
            TaskOutcome::Completed(bytes) => {
                self.notify(|o| o.fetch_finished(key, id, true));

                if !self
                    .shared
                    .advance(PipelineStage::Fetching, PipelineStage::Storing)
                {
                    trace!(%key, pipeline = %id, "store suppressed");
                    return;
                }
                self.cache.put(key, bytes.clone());
                trace!(%key, pipeline = %id, bytes = bytes.len(), "stored");
                self.notify(|o| o.stored(key, id));

                if !self
                    .shared
                    .advance(PipelineStage::Storing, PipelineStage::Delivering)
                {
                    trace!(%key, pipeline = %id, "deliver suppressed");
                    return;
                }
                self.notify(|o| o.delivered(key, id));
                deliver(Ok(bytes));
                *self.shared.stage.lock() = PipelineStage::Delivered;
                self.shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            TaskOutcome::Failed(err) => {
                self.notify(|o| o.fetch_finished(key, id, false));
                if !self
                    .shared
                    .advance(PipelineStage::Fetching, PipelineStage::Delivering)
                {
                    return;
                }
                debug!(%key, pipeline = %id, error = %err, "fetch failed");
                deliver(Err(err));
                *self.shared.stage.lock() = PipelineStage::Failed;
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            TaskOutcome::Cancelled => {
                *self.shared.stage.lock() = PipelineStage::Cancelled;
                trace!(%key, pipeline = %id, "fetch cancelled");
            }
        }
    }

    fn notify(&self, step: impl FnOnce(&dyn StepObserver)) {
        if let Some(observer) = &self.observer {
            step(observer.as_ref());
        }
    }
}
