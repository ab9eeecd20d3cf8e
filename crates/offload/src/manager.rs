use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::try_join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::{Config, ManagerConfig};
use crate::entry::Entry;
use crate::error::OffloadError;
use crate::lock::{Acquisition, LockCoordinator, LockToken};
use crate::queue::{Drained, Job, WorkItem, WorkQueue};
use crate::result::ExecutionResult;
use crate::run::{Outcome, Run};
use crate::store::{self, StoreRef};

/// A value that can be computed and cached by an [`OffloadManager`].
///
/// Values are stored as JSON, so every serde-compatible type qualifies.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Per-call options of the [`OffloadManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchOptions {
    /// Take the per-key lock before computing.
    ///
    /// Without it the computation always runs on a miss, even if a peer is computing the same
    /// key right now. For queued work, non-exclusive items are not deduplicated.
    pub exclusive: bool,
    /// Overrides [`ManagerConfig::stale_grace`] for the entry written by this call.
    pub stale_grace: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            exclusive: true,
            stale_grace: None,
        }
    }
}

impl FetchOptions {
    /// Options skipping the per-key lock.
    pub fn non_exclusive() -> Self {
        Self {
            exclusive: false,
            ..Default::default()
        }
    }

    pub fn with_stale_grace(mut self, stale_grace: Duration) -> Self {
        self.stale_grace = Some(stale_grace);
        self
    }
}

/// Runs, caches and deduplicates computations of values of type `T`.
///
/// All managers sharing a [`CacheStore`](crate::CacheStore) share their cached values and
/// their locks, so managers in different processes coordinate through the store. The
/// [`WorkQueue`] on the other hand is private to every manager.
#[derive(Debug)]
pub struct OffloadManager<T> {
    store: StoreRef,
    locks: LockCoordinator,
    queue: WorkQueue<T>,
    config: ManagerConfig,
}

impl<T: CacheValue> OffloadManager<T> {
    pub fn new(store: StoreRef, config: ManagerConfig) -> Self {
        let locks = LockCoordinator::new(store.clone(), &config);
        Self {
            store,
            locks,
            queue: WorkQueue::new(),
            config,
        }
    }

    /// Creates a manager along with the store described by `config`.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let store = store::from_config(&config.store)?;
        Ok(Self::new(store, config.manager))
    }

    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Returns the value for `key`, computing it unless a servable entry exists.
    ///
    /// This is [`fetch_cached`](Self::fetch_cached) with a TTL of zero: the written entry is
    /// stale right away, so the next access serves it while refreshing it in the background.
    pub async fn fetch<F, Fut>(
        &self,
        key: &str,
        computation: F,
        options: FetchOptions,
    ) -> Result<ExecutionResult<T>, OffloadError>
    where
        F: FnOnce(Run) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Outcome<T>>> + Send + 'static,
    {
        self.fetch_cached(key, Duration::ZERO, computation, options)
            .await
    }

    /// Returns the value for `key`, consulting the cache first.
    ///
    /// - A fresh entry is returned as is.
    /// - A stale entry is returned as well, and a refresh running `computation` is queued for
    ///   the next [`drain`](Self::drain).
    /// - Otherwise, `computation` runs under the lock for `key` and its value is cached for
    ///   `ttl`, unless the computation marked its [`Run`] as bad.
    pub async fn fetch_cached<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        computation: F,
        options: FetchOptions,
    ) -> Result<ExecutionResult<T>, OffloadError>
    where
        F: FnOnce(Run) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Outcome<T>>> + Send + 'static,
    {
        if let Some(cached) = self.read_servable(key, Utc::now()).await? {
            if !cached.is_stale() {
                tracing::trace!("Serving fresh entry for `{}`", key);
                metric!(counter("offload.access") += 1, "result" => "fresh");
                return Ok(cached);
            }

            tracing::trace!("Serving stale entry for `{}`", key);
            metric!(counter("offload.access") += 1, "result" => "stale");
            self.queue.register(WorkItem {
                key: key.to_owned(),
                job: boxed_job(computation),
                exclusive: options.exclusive,
                ttl,
                stale_grace: options.stale_grace,
            });
            return Ok(cached);
        }

        let token = if options.exclusive {
            match self.lock_or_serve(key).await? {
                Acquisition::Locked(token) => Some(token),
                Acquisition::Resolved(cached) => {
                    metric!(counter("offload.access") += 1, "result" => "contended");
                    return Ok(cached);
                }
                Acquisition::Contended => None,
            }
        } else {
            None
        };

        tracing::trace!("Computing `{}`", key);
        metric!(counter("offload.access") += 1, "result" => "miss");
        let result = self
            .execute(key, ttl, options.stale_grace, computation)
            .await;
        self.release(token).await;

        result.map(ExecutionResult::computed)
    }

    /// Queues `computation` for the next [`drain`](Self::drain), caching its value with a TTL
    /// of zero.
    ///
    /// Returns `false` if an exclusive item for `key` is already queued and this one was
    /// dropped.
    pub fn queue<F, Fut>(&self, key: &str, computation: F, options: FetchOptions) -> bool
    where
        F: FnOnce(Run) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Outcome<T>>> + Send + 'static,
    {
        self.queue_cached(key, Duration::ZERO, computation, options)
    }

    /// Queues `computation` for the next [`drain`](Self::drain), caching its value for `ttl`.
    ///
    /// Returns `false` if an exclusive item for `key` is already queued and this one was
    /// dropped.
    pub fn queue_cached<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        computation: F,
        options: FetchOptions,
    ) -> bool
    where
        F: FnOnce(Run) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Outcome<T>>> + Send + 'static,
    {
        self.queue.register(WorkItem {
            key: key.to_owned(),
            job: boxed_job(computation),
            exclusive: options.exclusive,
            ttl,
            stale_grace: options.stale_grace,
        })
    }

    /// Looks up `key` in the cache without computing anything.
    pub async fn get(&self, key: &str) -> Result<ExecutionResult<T>, OffloadError> {
        let cached = self.read_servable(key, Utc::now()).await?;
        Ok(cached.unwrap_or_else(ExecutionResult::miss))
    }

    /// Looks up all `keys`, returning one result per key in the same order.
    pub async fn get_many<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<Vec<ExecutionResult<T>>, OffloadError> {
        try_join_all(keys.iter().map(|key| self.get(key.as_ref()))).await
    }

    /// Removes the entries for `keys` from the cache and returns how many existed.
    pub async fn delete<K: AsRef<str>>(&self, keys: &[K]) -> Result<usize, OffloadError> {
        let mut unique: Vec<&str> = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(&key.as_ref()) {
                unique.push(key.as_ref());
            }
        }
        let removed = self.store.delete(&unique).await?;
        tracing::trace!("Deleted {} of {} entries", removed, unique.len());
        Ok(removed)
    }

    /// Whether queued work is waiting for [`drain`](Self::drain).
    pub fn has_work(&self) -> bool {
        self.queue.has_work()
    }

    /// Runs all queued work, one item at a time in registration order.
    ///
    /// Every item is computed and cached like a miss in [`fetch_cached`](Self::fetch_cached).
    /// Failures are reported per key and do not keep the remaining items from running.
    /// Exclusive items whose lock is held by somebody else are skipped, as that holder is
    /// already computing the key.
    ///
    /// Work queued while draining is left for the next call.
    pub async fn drain(&self) -> Drained<T> {
        let items = self.queue.take();
        let mut drained = Drained::default();
        if items.is_empty() {
            return drained;
        }

        let started = Instant::now();
        metric!(gauge("offload.drain.items") = items.len() as u64);
        tracing::debug!("Draining {} queued items", items.len());

        for item in items {
            let key = item.key.clone();
            match self.run_queued(item).await {
                Ok(Some(value)) => drained.insert(key, Ok(value)),
                Ok(None) => {}
                Err(err) => {
                    let dynerr: &dyn std::error::Error = &err;
                    tracing::error!(error = dynerr, "Queued work for `{}` failed", key);
                    drained.insert(key, Err(err));
                }
            }
        }

        metric!(timer("offload.drain.duration") = started.elapsed());
        drained
    }

    /// Closes the underlying store.
    ///
    /// The store is shared, so this affects every manager using it. Work still queued in this
    /// manager is dropped.
    pub async fn close(&self) -> Result<(), OffloadError> {
        let dropped = self.queue.take().len();
        if dropped > 0 {
            tracing::warn!("Dropping {} queued items on close", dropped);
        }
        self.store.close().await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key = %item.key))]
    async fn run_queued(&self, item: WorkItem<T>) -> Result<Option<T>, OffloadError> {
        let WorkItem {
            key,
            job,
            exclusive,
            ttl,
            stale_grace,
        } = item;

        let token = if exclusive {
            match self.locks.try_acquire(&key).await? {
                Some(token) => Some(token),
                None => {
                    tracing::debug!("Skipping `{}`, it is computed elsewhere", key);
                    return Ok(None);
                }
            }
        } else {
            None
        };

        let result = self.execute(&key, ttl, stale_grace, job).await;
        self.release(token).await;

        result.map(Some)
    }

    /// Reads the entry for `key` and converts it into a cache hit, unless it is expired.
    ///
    /// Entries that cannot be converted into a `T` are treated as a miss.
    async fn read_servable(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionResult<T>>, OffloadError> {
        let Some(entry) = self.store.read(key).await? else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            return Ok(None);
        }
        match serde_json::from_slice::<T>(entry.value()) {
            Ok(data) => Ok(Some(ExecutionResult::cached(data, &entry, now))),
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring unreadable entry for `{}`", key);
                Ok(None)
            }
        }
    }

    /// Takes the lock for `key`, or serves the value a peer computed in the meantime.
    ///
    /// The store is re-read after every contended attempt. Once all attempts failed, the
    /// caller computes without the lock.
    async fn lock_or_serve(
        &self,
        key: &str,
    ) -> Result<Acquisition<ExecutionResult<T>>, OffloadError> {
        let acquisition = self
            .locks
            .acquire_or_else(key, || self.read_servable(key, Utc::now()))
            .await?;

        let token = match acquisition {
            Acquisition::Locked(token) => token,
            Acquisition::Resolved(cached) => {
                tracing::debug!("Serving entry for `{}` computed by lock holder", key);
                return Ok(Acquisition::Resolved(cached));
            }
            Acquisition::Contended => {
                tracing::debug!("Computing `{}` without holding its lock", key);
                return Ok(Acquisition::Contended);
            }
        };

        // the previous holder may have finished between our read and the lock
        match self.read_servable(key, Utc::now()).await {
            Ok(Some(cached)) => {
                self.release(Some(token)).await;
                Ok(Acquisition::Resolved(cached))
            }
            Ok(None) => Ok(Acquisition::Locked(token)),
            Err(err) => {
                self.release(Some(token)).await;
                Err(err)
            }
        }
    }

    /// Runs `computation` and caches its value unless the run was marked bad.
    async fn execute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        stale_grace: Option<Duration>,
        computation: F,
    ) -> Result<T, OffloadError>
    where
        F: FnOnce(Run) -> Fut,
        Fut: Future<Output = anyhow::Result<Outcome<T>>>,
    {
        let run = Run::new();
        let started = Instant::now();
        let computed = AssertUnwindSafe(async {
            match computation(run.clone()).await {
                Ok(outcome) => outcome
                    .resolve()
                    .await
                    .map_err(|source| OffloadError::Deferred {
                        key: key.to_owned(),
                        source,
                    }),
                Err(err) => Err(OffloadError::computation(key, err)),
            }
        })
        .catch_unwind()
        .await;
        let value = computed.unwrap_or_else(|panic| {
            Err(OffloadError::computation(key, panic_error(panic)))
        });
        metric!(
            timer("offload.computation") = started.elapsed(),
            "status" => if value.is_ok() { "ok" } else { "error" },
        );
        let value = value?;

        if run.is_bad() {
            tracing::debug!("Not caching `{}`, its run was marked bad", key);
            return Ok(value);
        }

        let payload = Bytes::from(serde_json::to_vec(&value)?);
        let entry = Entry::new(payload, Utc::now(), ttl, self.stale_grace(stale_grace));
        self.store.write(key, entry).await?;
        metric!(counter("offload.store.write") += 1);

        Ok(value)
    }

    fn stale_grace(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.config.stale_grace)
            .max(ManagerConfig::MIN_STALE_GRACE)
    }

    /// Releases the lock behind `token`, if any.
    ///
    /// A failed release is not reported to the caller, the lock token expires on its own.
    async fn release(&self, token: Option<LockToken>) {
        let Some(token) = token else { return };
        let key = token.key().to_owned();
        if let Err(err) = self.locks.release(token).await {
            let dynerr: &dyn std::error::Error = &err;
            tracing::error!(error = dynerr, "Failed to release lock for `{}`", key);
        }
    }
}

/// Turns the payload of a panicking computation into an error.
fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    };
    anyhow::anyhow!("computation panicked: {message}")
}

fn boxed_job<T, F, Fut>(computation: F) -> Job<T>
where
    F: FnOnce(Run) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Outcome<T>>> + Send + 'static,
{
    Box::new(move |run| computation(run).boxed())
}
