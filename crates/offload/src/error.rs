use thiserror::Error;

use crate::deferred::DeferredError;
use crate::store::StoreError;

/// An error returned by the [`OffloadManager`](crate::OffloadManager).
///
/// A computation marking its own run as bad is not an error, and neither is a contended lock.
/// Both are handled inside the manager.
#[derive(Debug, Error)]
pub enum OffloadError {
    /// The computation itself failed.
    ///
    /// The error carries the key of the computation as context.
    #[error(transparent)]
    Computation(anyhow::Error),
    /// The computation returned a [`Deferred`](crate::Deferred) value which failed to resolve.
    #[error("deferred computation for `{key}` failed")]
    Deferred {
        key: String,
        #[source]
        source: DeferredError,
    },
    /// The cache store could not be read or written.
    #[error("cache store failure")]
    Store(#[from] StoreError),
    /// A value could not be converted from or to its cached representation.
    #[error("failed to convert cached value")]
    Value(#[from] serde_json::Error),
}

impl OffloadError {
    pub(crate) fn computation(key: &str, error: anyhow::Error) -> Self {
        Self::Computation(error.context(format!("computation for `{key}` failed")))
    }

    /// Whether this error originates in the computation rather than in the cache machinery.
    pub fn is_computation(&self) -> bool {
        matches!(self, Self::Computation(_) | Self::Deferred { .. })
    }
}
