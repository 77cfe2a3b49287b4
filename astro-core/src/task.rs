//! Cancellable asynchronous task with an explicit lifecycle.
//!
//! A task moves `Ready -> Running -> Finished` exactly once. Cancellation is an
//! orthogonal flag that may be raised at any point before `Finished`; the work
//! sees it through its [`CancellationToken`] and its future is dropped as soon
//! as the flag is observed, which aborts whatever I/O it was awaiting.
//!
//! Completion callbacks run outside the state lock, at most once each, on
//! whichever thread finished the task.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::FetchError;

/// Process-unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Finished,
}

/// How a task ended. A cancelled task never carries a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(FetchError),
    Cancelled,
}

impl<T> TaskOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }

    /// `None` for cancellation, otherwise the value or the failure.
    pub fn into_result(self) -> Option<Result<T, FetchError>> {
        match self {
            TaskOutcome::Completed(value) => Some(Ok(value)),
            TaskOutcome::Failed(err) => Some(Err(err)),
            TaskOutcome::Cancelled => None,
        }
    }
}

type Work<T> = Box<
    dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, FetchError>>
        + Send,
>;
type Callback<T> = Box<dyn FnOnce(TaskOutcome<T>) + Send>;

struct Core<T> {
    state: TaskState,
    work: Option<Work<T>>,
    callbacks: Vec<Callback<T>>,
    outcome: Option<TaskOutcome<T>>,
}

struct Inner<T> {
    id: TaskId,
    token: CancellationToken,
    core: Mutex<Core<T>>,
}

impl<T: Clone> Inner<T> {
    /// Move to `Finished` and fire callbacks. Returns false if another path
    /// already finished the task.
    fn finish(&self, outcome: TaskOutcome<T>) -> bool {
        let (callbacks, work) = {
            let mut core = self.core.lock();
            if core.state == TaskState::Finished {
                return false;
            }
            core.state = TaskState::Finished;
            core.outcome = Some(outcome.clone());
            (std::mem::take(&mut core.callbacks), core.work.take())
        };
        drop(work);

        trace!(task = %self.id, cancelled = outcome.is_cancelled(), "task finished");
        for callback in callbacks {
            callback(outcome.clone());
        }
        true
    }
}

/// Owned by the spawned future. If the runtime drops the future before it
/// finishes (shutdown, or a spawn on a closed runtime), the task finishes as
/// cancelled so its callbacks still run and release what they hold.
struct FinishOnDrop<T: Clone>(Arc<Inner<T>>);

impl<T: Clone> Drop for FinishOnDrop<T> {
    fn drop(&mut self) {
        if self.0.finish(TaskOutcome::Cancelled) {
            trace!(task = %self.0.id, "task abandoned by its runtime");
        }
    }
}

/// A unit of asynchronous work spawned on the worker pool.
///
/// Cloning gives another handle to the same task.
pub struct CancellableTask<T> {
    inner: Arc<Inner<T>>,
    runtime: Handle,
}

impl<T> Clone for CancellableTask<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            runtime: self.runtime.clone(),
        }
    }
}

impl<T> fmt::Debug for CancellableTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableTask")
            .field("id", &self.inner.id)
            .field("state", &self.inner.core.lock().state)
            .field("cancel_requested", &self.inner.token.is_cancelled())
            .finish()
    }
}

impl<T> CancellableTask<T>
where
    T: Clone + Send + 'static,
{
    /// Create a task in the `Ready` state. `work` only runs once the task is
    /// started, on `runtime`.
    pub fn new<F, Fut>(runtime: Handle, work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let work: Work<T> = Box::new(move |token| Box::pin(work(token)));
        Self {
            inner: Arc::new(Inner {
                id: TaskId::next(),
                token: CancellationToken::new(),
                core: Mutex::new(Core {
                    state: TaskState::Ready,
                    work: Some(work),
                    callbacks: Vec::new(),
                    outcome: None,
                }),
            }),
            runtime,
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn state(&self) -> TaskState {
        self.inner.core.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == TaskState::Ready
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Outcome of a finished task.
    pub fn outcome(&self) -> Option<TaskOutcome<T>> {
        self.inner.core.lock().outcome.clone()
    }

    /// Spawn the work and return immediately.
    ///
    /// Returns false if the task was not `Ready`. A task cancelled before it
    /// gets here finishes as cancelled without running its work.
    pub fn start(&self) -> bool {
        let work = {
            let mut core = self.inner.core.lock();
            if core.state != TaskState::Ready {
                return false;
            }
            core.state = TaskState::Running;
            core.work.take()
        };

        let work = match work {
            Some(work) if !self.inner.token.is_cancelled() => work,
            _ => {
                trace!(task = %self.inner.id, "cancelled before start");
                self.inner.finish(TaskOutcome::Cancelled);
                return true;
            }
        };

        let guard = FinishOnDrop(Arc::clone(&self.inner));
        self.runtime.spawn(async move {
            let inner = &guard.0;
            let token = inner.token.clone();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => TaskOutcome::Cancelled,
                result = work(token.clone()) => match result {
                    _ if token.is_cancelled() => TaskOutcome::Cancelled,
                    Ok(value) => TaskOutcome::Completed(value),
                    Err(err) => TaskOutcome::Failed(err),
                },
            };
            inner.finish(outcome);
        });
        true
    }

    /// Request cancellation. Returns false if the task had already finished.
    ///
    /// A task that was never started finishes right away; a running task
    /// finishes once its worker observes the token.
    pub fn cancel(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.inner.token.cancel();
        if self.is_ready() {
            self.inner.finish(TaskOutcome::Cancelled);
        }
        true
    }

    /// Register a callback for the terminal outcome. Fires immediately if the
    /// task has already finished.
    pub fn on_completion<F>(&self, callback: F)
    where
        F: FnOnce(TaskOutcome<T>) + Send + 'static,
    {
        let mut core = self.inner.core.lock();
        match core.outcome.clone() {
            Some(outcome) => {
                drop(core);
                callback(outcome);
            }
            None => core.callbacks.push(Box::new(callback)),
        }
    }

    /// Resolve with the terminal outcome.
    pub fn completion(&self) -> impl Future<Output = TaskOutcome<T>> + use<T> {
        let (tx, rx) = oneshot::channel();
        self.on_completion(move |outcome| {
            let _ = tx.send(outcome);
        });
        async move { rx.await.unwrap_or(TaskOutcome::Cancelled) }
    }
}
