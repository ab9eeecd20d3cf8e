//! The cache store shared by all managers.
//!
//! The [`CacheStore`] is the only shared mutable resource of offload. Freshness decisions,
//! exclusivity and deduplication across processes are all mediated through it. Two
//! implementations exist:
//!
//! - [`MemoryStore`], which is limited to a single process.
//! - [`FilesystemStore`], which can be shared by every process that can see the same directory.
//!
//! A Redis-like store with `SET NX EX` semantics satisfies the contract just as well.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::entry::{CodecError, Entry};

mod fs;
mod memory;

pub use fs::{CleanupStats, FilesystemStore};
pub use memory::MemoryStore;

/// An error talking to the cache store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed")]
    Io(#[from] io::Error),
    #[error("failed to encode entry")]
    Codec(#[from] CodecError),
    /// The store cannot serve requests, for instance because it was closed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable key/value storage with entry timing metadata and atomic lock tokens.
#[async_trait]
pub trait CacheStore: fmt::Debug + Send + Sync {
    /// Reads the entry stored under `key`.
    ///
    /// Stores may return entries past their `expire_at`; the manager decides what to do with them.
    async fn read(&self, key: &str) -> Result<Option<Entry>, StoreError>;

    /// Writes `entry` under `key`, replacing any previous entry.
    async fn write(&self, key: &str, entry: Entry) -> Result<(), StoreError>;

    /// Removes the entries for `keys` and returns how many actually existed.
    async fn delete(&self, keys: &[&str]) -> Result<usize, StoreError>;

    /// Atomically takes the lock token for `key` if nobody holds it.
    ///
    /// The token vanishes on its own after `expiry`, even if it is never released.
    async fn acquire_lock_if_absent(&self, key: &str, expiry: Duration)
    -> Result<bool, StoreError>;

    /// Releases the lock token for `key`, whoever holds it.
    async fn release_lock(&self, key: &str) -> Result<(), StoreError>;

    /// Shuts the store down.
    ///
    /// After closing, every other operation fails with [`StoreError::Unavailable`].
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A shared handle to a [`CacheStore`].
pub type StoreRef = Arc<dyn CacheStore>;

/// Creates the store described by `config`.
pub fn from_config(config: &StoreConfig) -> io::Result<StoreRef> {
    Ok(match config {
        StoreConfig::Memory(cfg) => Arc::new(MemoryStore::new(cfg.capacity)),
        StoreConfig::Filesystem(cfg) => Arc::new(FilesystemStore::new(&cfg.path)?),
    })
}
