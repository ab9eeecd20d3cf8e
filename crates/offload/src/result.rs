use chrono::{DateTime, TimeDelta, Utc};

use crate::entry::Entry;

/// The answer to every [`OffloadManager`](crate::OffloadManager) request.
///
/// Created once per call and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult<T> {
    data: Option<T>,
    from_cache: bool,
    stale_time: Option<TimeDelta>,
    expire_time: Option<DateTime<Utc>>,
}

impl<T> ExecutionResult<T> {
    /// A value that was just computed.
    pub(crate) fn computed(data: T) -> Self {
        Self {
            data: Some(data),
            from_cache: false,
            stale_time: None,
            expire_time: None,
        }
    }

    /// A value served from `entry`, as observed at `now`.
    pub(crate) fn cached(data: T, entry: &Entry, now: DateTime<Utc>) -> Self {
        Self {
            data: Some(data),
            from_cache: true,
            stale_time: Some(now - entry.fresh_until()),
            expire_time: Some(entry.expire_at()),
        }
    }

    /// A cache miss without computation.
    pub(crate) fn miss() -> Self {
        Self {
            data: None,
            from_cache: false,
            stale_time: None,
            expire_time: None,
        }
    }

    /// The computed or cached value, `None` on a plain cache miss.
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    /// Whether the data was served by the cache store instead of a fresh computation.
    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    /// Whether the data came from the cache and its freshness window has elapsed.
    pub fn is_stale(&self) -> bool {
        self.stale_time.is_some_and(|t| t >= TimeDelta::zero())
    }

    /// How long ago the freshness window elapsed.
    ///
    /// Negative while the entry is still fresh, `None` if the data was not served from cache.
    pub fn stale_time(&self) -> Option<TimeDelta> {
        self.stale_time
    }

    /// When the cached entry stops being servable, `None` if the data was not served from cache.
    pub fn expire_time(&self) -> Option<DateTime<Utc>> {
        self.expire_time
    }
}
