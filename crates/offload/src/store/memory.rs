use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use super::{CacheStore, StoreError};
use crate::entry::Entry;

/// An item saved in one of the moka caches, evicted at its `deadline`.
#[derive(Clone, Debug)]
struct Timed<T> {
    deadline: Instant,
    data: T,
}

type InMemoryCache<T> = moka::future::Cache<String, Timed<T>>;

/// A struct implementing [`moka::Expiry`] that uses the [`Timed`] [`Instant`] as the explicit
/// expiration time.
struct Expiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl<T> moka::Expiry<String, Timed<T>> for Expiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Timed<T>,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Timed<T>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

fn deadline_in(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        // roughly thirty years, plenty for anything that is supposed to expire
        .unwrap_or_else(|| now + Duration::from_secs(1 << 30))
}

/// A [`CacheStore`] living in the memory of a single process.
///
/// Entries are evicted once they reach their `expire_at`, or when the configured capacity is
/// exceeded. Lock tokens are kept in a separate cache with a per-token expiry.
#[derive(Debug)]
pub struct MemoryStore {
    entries: InMemoryCache<Entry>,
    locks: InMemoryCache<()>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Creates a store holding up to `capacity` bytes of keys and values.
    pub fn new(capacity: u64) -> Self {
        let entries = InMemoryCache::builder()
            .max_capacity(capacity)
            .name("offload_entries")
            .expire_after(Expiration)
            // NOTE: we count all the bookkeeping structures to the weight as well
            .weigher(|k: &String, v: &Timed<Entry>| {
                let size = k.len() + v.data.value().len() + std::mem::size_of::<Timed<Entry>>();
                size.try_into().unwrap_or(u32::MAX)
            })
            .build();
        let locks = InMemoryCache::builder()
            .name("offload_locks")
            .expire_after(Expiration)
            .build();

        Self {
            entries,
            locks,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        self.check_open()?;
        Ok(self.entries.get(key).await.map(|item| item.data))
    }

    async fn write(&self, key: &str, entry: Entry) -> Result<(), StoreError> {
        self.check_open()?;
        let deadline = deadline_in(entry.time_to_live(Utc::now()));
        let item = Timed {
            deadline,
            data: entry,
        };
        self.entries.insert(key.to_owned(), item).await;
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<usize, StoreError> {
        self.check_open()?;
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            // expired items may linger until moka gets around to evicting them
            if let Some(item) = self.entries.remove(*key).await {
                if item.deadline > now {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn acquire_lock_if_absent(
        &self,
        key: &str,
        expiry: Duration,
    ) -> Result<bool, StoreError> {
        self.check_open()?;
        let token = Timed {
            deadline: deadline_in(expiry),
            data: (),
        };
        let entry = self
            .locks
            .entry_by_ref(key)
            .or_insert_with(async { token })
            .await;
        Ok(entry.is_fresh())
    }

    async fn release_lock(&self, key: &str) -> Result<(), StoreError> {
        self.check_open()?;
        self.locks.invalidate(key).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        self.entries.invalidate_all();
        self.locks.invalidate_all();
        Ok(())
    }
}
