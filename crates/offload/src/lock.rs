use std::future::Future;
use std::time::Duration;

use crate::config::ManagerConfig;
use crate::store::{StoreError, StoreRef};

/// Proof of holding the exclusivity lock for a key.
///
/// The token must be handed back to [`LockCoordinator::release`]. A token that is dropped
/// instead stays in the store until its expiry.
#[derive(Debug)]
#[must_use = "a lock token has to be released"]
pub struct LockToken {
    key: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// The outcome of [`LockCoordinator::acquire_or_else`].
#[derive(Debug)]
pub enum Acquisition<R> {
    /// The lock is held and has to be released.
    Locked(LockToken),
    /// Waiting for the lock was cut short by a value.
    Resolved(R),
    /// All attempts failed.
    Contended,
}

/// Per-key mutual exclusion on top of the [`CacheStore`](crate::CacheStore).
///
/// Since the lock lives in the shared store, it excludes computations in other processes as well.
/// It is a best-effort anti-stampede measure rather than a strict mutex: lock tokens expire on
/// their own so a crashed holder cannot block a key forever, and acquisition gives up after a
/// bounded number of attempts.
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    store: StoreRef,
    expiry: Duration,
    attempts: usize,
    retry_delay: Duration,
}

impl LockCoordinator {
    pub fn new(store: StoreRef, config: &ManagerConfig) -> Self {
        Self {
            store,
            expiry: config.lock_expiry,
            attempts: config.lock_attempts.max(1),
            retry_delay: config.lock_retry_delay,
        }
    }

    /// How many attempts [`acquire_or_else`](Self::acquire_or_else) makes.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Makes a single attempt at taking the lock for `key`.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LockToken>, StoreError> {
        let acquired = self.store.acquire_lock_if_absent(key, self.expiry).await?;
        if acquired {
            tracing::trace!("Acquired lock for `{}`", key);
            Ok(Some(LockToken {
                key: key.to_owned(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Takes the lock for `key`, retrying a contended lock up to the configured number of
    /// attempts.
    ///
    /// After every failed attempt `contended` is polled. If it produces a value, the caller
    /// no longer needs the lock and waiting ends with [`Acquisition::Resolved`].
    pub async fn acquire_or_else<R, E, F, Fut>(
        &self,
        key: &str,
        mut contended: F,
    ) -> Result<Acquisition<R>, E>
    where
        E: From<StoreError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<R>, E>>,
    {
        for attempt in 1..=self.attempts {
            if let Some(token) = self.try_acquire(key).await? {
                return Ok(Acquisition::Locked(token));
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
            if let Some(resolved) = contended().await? {
                return Ok(Acquisition::Resolved(resolved));
            }
        }
        tracing::debug!("Gave up on contended lock for `{}`", key);
        metric!(counter("offload.lock.contended") += 1);
        Ok(Acquisition::Contended)
    }

    /// Releases the lock held through `token`.
    pub async fn release(&self, token: LockToken) -> Result<(), StoreError> {
        tracing::trace!("Releasing lock for `{}`", token.key);
        self.store.release_lock(&token.key).await
    }
}
