use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use sentry::{Hub, SentryFutureExt};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

/// The failure of a [`Deferred`] computation.
///
/// The error is memoized together with the deferred value, so it is cheaply cloneable and every
/// waiter observes the same failure.
#[derive(Clone, Debug, Error)]
#[error("{0:#}")]
pub struct DeferredError(Arc<anyhow::Error>);

impl DeferredError {
    fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// The underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

/// A handle to a computation that runs concurrently with its creator.
///
/// The computation is spawned on the tokio runtime as soon as the `Deferred` is created. Its
/// result is obtained with [`wait`](Self::wait), which can be called any number of times: the
/// first call awaits the spawned task, every later call returns the memoized result right away.
///
/// A computation handed to the [`OffloadManager`](crate::OffloadManager) may return a `Deferred`
/// through [`Outcome::Deferred`](crate::Outcome::Deferred), in which case the manager waits for
/// it before caching the value.
pub struct Deferred<T> {
    task: Mutex<Option<JoinHandle<anyhow::Result<T>>>>,
    value: OnceCell<Result<T, DeferredError>>,
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("resolved", &self.value.initialized())
            .finish()
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// Spawns `future` and returns a handle to its result.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let task = tokio::spawn(future.bind_hub(Hub::new_from_top(Hub::current())));
        Self::from_task(task)
    }

    /// Runs the blocking function `f` on the blocking thread pool and returns a handle to its
    /// result.
    pub fn spawn_blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let hub = Arc::new(Hub::new_from_top(Hub::current()));
        let task = tokio::task::spawn_blocking(move || Hub::run(hub, f));
        Self::from_task(task)
    }

    fn from_task(task: JoinHandle<anyhow::Result<T>>) -> Self {
        Self {
            task: Mutex::new(Some(task)),
            value: OnceCell::new(),
        }
    }
}

impl<T> Deferred<T> {
    /// Creates an already resolved handle.
    pub fn resolved(value: T) -> Self {
        Self {
            task: Mutex::new(None),
            value: OnceCell::new_with(Some(Ok(value))),
        }
    }

    /// Whether the result is available without waiting.
    pub fn is_resolved(&self) -> bool {
        self.value.initialized()
    }

    /// Waits for the computation to finish and returns its result.
    ///
    /// Concurrent waiters share a single wait on the spawned task. If the computation panicked
    /// or was cancelled, the failure is memoized like any other error.
    pub async fn wait(&self) -> Result<&T, DeferredError> {
        let result = self
            .value
            .get_or_init(|| async {
                let task = self
                    .task
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match task {
                    Some(task) => match task.await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(DeferredError::new(err)),
                        Err(join_err) => Err(DeferredError::new(join_err.into())),
                    },
                    // A previous waiter was cancelled after taking the task.
                    None => Err(DeferredError::new(anyhow::anyhow!(
                        "deferred computation was abandoned"
                    ))),
                }
            })
            .await;
        result.as_ref().map_err(Clone::clone)
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        // nobody is interested in the result anymore
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
