use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::deferred::{Deferred, DeferredError};

/// The context handed to every computation run by the [`OffloadManager`](crate::OffloadManager).
///
/// A computation calls [`set_bad`](Self::set_bad) to declare that its result must not be cached,
/// for instance because it was produced by a degraded fallback. The value is still returned to
/// the caller, but the next request for the key computes again.
///
/// `Run` is a cheap handle: clones share the same flag, so it can be moved into a
/// [`Deferred`] computation and marked from there.
#[derive(Clone, Debug, Default)]
pub struct Run {
    bad: Arc<AtomicBool>,
}

impl Run {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the result of this run as unfit for caching.
    pub fn set_bad(&self) {
        self.bad.store(true, Ordering::Release);
    }

    /// Whether [`set_bad`](Self::set_bad) was called on this run or any of its clones.
    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }
}

/// The value produced by a computation.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The value is available right away.
    Ready(T),
    /// The value is still being computed.
    ///
    /// The manager waits for it before caching and returning it.
    Deferred(Deferred<T>),
}

impl<T> Outcome<T> {
    pub fn ready(value: T) -> Self {
        Self::Ready(value)
    }
}

impl<T: Clone> Outcome<T> {
    /// Resolves the outcome into its final value, waiting for a deferred computation if needed.
    pub async fn resolve(self) -> Result<T, DeferredError> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Deferred(deferred) => deferred.wait().await.cloned(),
        }
    }
}

impl<T> From<Deferred<T>> for Outcome<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Self::Deferred(deferred)
    }
}
