//! In-process collection of work that runs on [`OffloadManager::drain`](crate::OffloadManager::drain).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::OffloadError;
use crate::run::{Outcome, Run};

/// A type-erased computation, as handed to the manager.
pub(crate) type Job<T> =
    Box<dyn FnOnce(Run) -> BoxFuture<'static, anyhow::Result<Outcome<T>>> + Send + 'static>;

/// A unit of queued work.
pub(crate) struct WorkItem<T> {
    pub key: String,
    pub job: Job<T>,
    pub exclusive: bool,
    /// The freshness window of the entry written on success.
    pub ttl: Duration,
    pub stale_grace: Option<Duration>,
}

impl<T> fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("key", &self.key)
            .field("exclusive", &self.exclusive)
            .field("ttl", &self.ttl)
            .field("stale_grace", &self.stale_grace)
            .finish_non_exhaustive()
    }
}

struct Pending<T> {
    items: Vec<WorkItem<T>>,
    /// Keys of the exclusive items in `items`.
    exclusive: HashSet<String>,
}

/// Work registered by a manager but not run yet.
///
/// Exclusive items are deduplicated by key: as long as an exclusive item for a key is pending,
/// further exclusive registrations for that key are dropped. Non-exclusive items are always
/// appended.
pub struct WorkQueue<T> {
    pending: Mutex<Pending<T>>,
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(Pending {
                items: Vec::new(),
                exclusive: HashSet::new(),
            }),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item` to the queue.
    ///
    /// Returns `false` if the item was dropped in favor of an already pending exclusive item for
    /// the same key.
    pub(crate) fn register(&self, item: WorkItem<T>) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if item.exclusive && !pending.exclusive.insert(item.key.clone()) {
            tracing::trace!("Work for `{}` is already queued", item.key);
            metric!(counter("offload.queue.dropped") += 1);
            return false;
        }

        tracing::trace!(
            "Queued work for `{}` (exclusive: {})",
            item.key,
            item.exclusive
        );
        metric!(
            counter("offload.queue.registered") += 1,
            "exclusive" => if item.exclusive { "true" } else { "false" },
        );
        pending.items.push(item);
        true
    }

    /// Whether any work is pending.
    pub fn has_work(&self) -> bool {
        !self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .is_empty()
    }

    /// The number of pending items.
    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_work()
    }

    /// Removes all pending items, in registration order.
    ///
    /// Items registered afterwards start a new batch, and their keys are no longer considered
    /// pending.
    pub(crate) fn take(&self) -> Vec<WorkItem<T>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.exclusive.clear();
        std::mem::take(&mut pending.items)
    }
}

/// The outcome of a [`drain`](crate::OffloadManager::drain), per key.
///
/// Keys are iterated in the order their first item was registered. When several items for the
/// same key ran, the result of the last one is kept. Items that were skipped because another
/// holder of the key's lock was active do not appear at all.
#[derive(Debug)]
pub struct Drained<T> {
    results: Vec<(String, Result<T, OffloadError>)>,
    /// Position of every key in `results`.
    index: HashMap<String, usize>,
}

impl<T> Default for Drained<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Drained<T> {
    pub(crate) fn insert(&mut self, key: String, result: Result<T, OffloadError>) {
        match self.index.get(&key) {
            Some(&position) => self.results[position].1 = result,
            None => {
                self.index.insert(key.clone(), self.results.len());
                self.results.push((key, result));
            }
        }
    }

    /// The result of the work for `key`.
    pub fn get(&self, key: &str) -> Option<&Result<T, OffloadError>> {
        let &position = self.index.get(key)?;
        Some(&self.results[position].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.results.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<T, OffloadError>)> {
        self.results.iter().map(|(k, result)| (k.as_str(), result))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Drops the failures and returns the successfully computed values.
    pub fn into_values(self) -> Vec<(String, T)> {
        self.results
            .into_iter()
            .filter_map(|(key, result)| Some((key, result.ok()?)))
            .collect()
    }
}

impl<T> IntoIterator for Drained<T> {
    type Item = (String, Result<T, OffloadError>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}
