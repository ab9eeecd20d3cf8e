//! # Offload
//!
//! A request-coalescing, stale-while-revalidate computation cache.
//!
//! Callers ask the [`OffloadManager`] for the result of a named computation. The manager decides
//! whether to run it, serve a cached value, serve a stale value while scheduling a refresh, or
//! deduplicate concurrent requests for the same key across every process sharing a
//! [`CacheStore`](store::CacheStore).
//!
//! ## Freshness
//!
//! Every cache [`Entry`] carries three timestamps:
//!
//! - `created_at`: when the entry was written.
//! - `fresh_until`: `created_at` plus the TTL given to [`OffloadManager::fetch_cached`]. Until
//!   then the entry is served without any further work.
//! - `expire_at`: `fresh_until` plus the configured grace window. Between `fresh_until` and
//!   `expire_at` the entry is *stale*: it is still served, but a refresh is queued. After
//!   `expire_at` the entry is treated as a miss.
//!
//! [`OffloadManager::fetch`] is `fetch_cached` with a TTL of zero, so its entries are stale right
//! away and every later access schedules a refresh.
//!
//! ## Exclusivity
//!
//! A miss takes a per-key lock token in the store before computing, so at most one computation
//! per key runs at a time, across processes. The lock is best-effort: contended callers retry a
//! few times and then serve whatever the store still holds, or compute without the lock.
//! See [`LockCoordinator`].
//!
//! ## Background work
//!
//! Refreshes of stale entries, as well as explicit [`OffloadManager::queue`] calls, are collected
//! in an in-process [`WorkQueue`]. Nothing runs until [`OffloadManager::drain`] is called, which
//! executes all queued items in registration order. Queued work is lost if the process exits
//! before draining.
//!
//! ## Deferred values
//!
//! A computation returns an [`Outcome`], which is either a ready value or a [`Deferred`] handle to
//! a computation already running concurrently. The manager waits for deferred values before
//! caching them, so callers always see the final value.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod deferred;
pub mod entry;
pub mod error;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod queue;
pub mod result;
pub mod run;
pub mod store;

pub use deferred::{Deferred, DeferredError};
pub use entry::{CodecError, Entry, EntryCodec};
pub use error::OffloadError;
pub use lock::{Acquisition, LockCoordinator, LockToken};
pub use manager::{CacheValue, FetchOptions, OffloadManager};
pub use queue::{Drained, WorkQueue};
pub use result::ExecutionResult;
pub use run::{Outcome, Run};
pub use store::{CacheStore, StoreError, StoreRef};
