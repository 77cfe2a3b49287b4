#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock};
use std::time::Duration;

use astro_core::{
    FetchError, PhotoId, PipelineHandle, PipelineId, PipelineStage, StepObserver,
    Transport,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "astro_core=trace".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn photo_url(id: u64) -> Url {
    Url::parse(&format!("https://mars.example/photos/{id}.jpg"))
        .expect("valid url")
}

/// Wait for a pipeline to record its terminal stage, which happens just
/// after its deliver callback returns.
pub async fn settled(handle: &PipelineHandle) -> PipelineStage {
    for _ in 0..200 {
        if !handle.is_active() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.stage()
}

/// Blocking variant of [`settled`] for tests that drive the consumer thread.
pub fn settled_blocking(handle: &PipelineHandle) -> PipelineStage {
    for _ in 0..200 {
        if !handle.is_active() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    handle.stage()
}

struct Gate {
    open: Semaphore,
    response: Result<Bytes, FetchError>,
}

/// Transport whose fetches block until the test opens the gate for that URL.
/// Unknown URLs fail immediately.
#[derive(Default)]
pub struct GatedTransport {
    gates: Mutex<HashMap<Url, Arc<Gate>>>,
    started: AtomicUsize,
    completed: AtomicUsize,
    dropped: Arc<AtomicUsize>,
}

impl GatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a response for `url`; the fetch waits until [`open`] is called.
    pub fn respond(&self, url: &Url, response: Result<Bytes, FetchError>) {
        self.gates.lock().insert(
            url.clone(),
            Arc::new(Gate {
                open: Semaphore::new(0),
                response,
            }),
        );
    }

    /// Register a response that is returned without waiting.
    pub fn respond_now(&self, url: &Url, response: Result<Bytes, FetchError>) {
        self.respond(url, response);
        self.open(url);
    }

    pub fn open(&self, url: &Url) {
        if let Some(gate) = self.gates.lock().get(url) {
            gate.open.add_permits(1_000);
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Fetches abandoned before they returned.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DropCounter {
    counter: Arc<AtomicUsize>,
    armed: bool,
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn fetch(
        &self,
        url: &Url,
        _cancel: CancellationToken,
    ) -> Result<Bytes, FetchError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().get(url).cloned();
        let Some(gate) = gate else {
            return Err(FetchError::Transport(format!("no route for {url}")));
        };

        let mut guard = DropCounter {
            counter: Arc::clone(&self.dropped),
            armed: true,
        };
        let permit = gate.open.acquire().await;
        drop(permit);
        guard.armed = false;

        self.completed.fetch_add(1, Ordering::SeqCst);
        gate.response.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    FetchStarted(PhotoId),
    FetchFinished(PhotoId, bool),
    Stored(PhotoId),
    Delivered(PhotoId),
    /// Recorded by the test's own deliver callback.
    Callback(PhotoId),
}

/// Parks a pipeline's deliver step until the test lets it go.
pub struct DeliveryGate {
    entered: Barrier,
    release: Barrier,
}

impl DeliveryGate {
    /// Block until the pipeline has reached its deliver step.
    pub fn wait_entered(&self) {
        self.entered.wait();
    }

    pub fn release(&self) {
        self.release.wait();
    }

    fn hold(&self) {
        self.entered.wait();
        self.release.wait();
    }
}

/// Records chain steps; optionally cancels a pipeline from inside a step or
/// holds it at the deliver step.
#[derive(Default)]
pub struct RecordingObserver {
    pub steps: Mutex<Vec<Step>>,
    cancel_on_fetch_finished: OnceLock<PipelineHandle>,
    cancel_on_stored: OnceLock<PipelineHandle>,
    hold_on_deliver: OnceLock<(PipelineId, Arc<DeliveryGate>)>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().push(step);
    }

    pub fn steps(&self) -> Vec<Step> {
        self.steps.lock().clone()
    }

    pub fn cancel_when_fetched(&self, handle: PipelineHandle) {
        let _ = self.cancel_on_fetch_finished.set(handle);
    }

    pub fn cancel_when_stored(&self, handle: PipelineHandle) {
        let _ = self.cancel_on_stored.set(handle);
    }

    pub fn hold_delivery(&self, pipeline: PipelineId) -> Arc<DeliveryGate> {
        let gate = Arc::new(DeliveryGate {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let _ = self.hold_on_deliver.set((pipeline, Arc::clone(&gate)));
        gate
    }
}

impl StepObserver for RecordingObserver {
    fn fetch_started(&self, key: PhotoId, _pipeline: PipelineId) {
        self.push(Step::FetchStarted(key));
    }

    fn fetch_finished(&self, key: PhotoId, pipeline: PipelineId, ok: bool) {
        self.push(Step::FetchFinished(key, ok));
        if let Some(handle) = self.cancel_on_fetch_finished.get()
            && handle.id() == pipeline
        {
            handle.cancel();
        }
    }

    fn stored(&self, key: PhotoId, pipeline: PipelineId) {
        self.push(Step::Stored(key));
        if let Some(handle) = self.cancel_on_stored.get()
            && handle.id() == pipeline
        {
            handle.cancel();
        }
    }

    fn delivered(&self, key: PhotoId, pipeline: PipelineId) {
        self.push(Step::Delivered(key));
        if let Some((held, gate)) = self.hold_on_deliver.get()
            && *held == pipeline
        {
            gate.hold();
        }
    }
}
