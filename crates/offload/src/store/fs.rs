use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::{CacheStore, StoreError};
use crate::entry::{Entry, EntryCodec};

/// Returns the relative path for `key`.
///
/// The relative path is a sha-256 hash hex-formatted like so:
/// `v$version/aa/bbccdd/eeff...`
fn hashed_path(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    let mut path = format!("v{}/{:02x}/", EntryCodec::VERSION, hash[0]);
    for b in &hash[1..4] {
        let _ = write!(path, "{b:02x}");
    }
    path.push('/');
    for b in &hash[4..] {
        let _ = write!(path, "{b:02x}");
    }
    path
}

/// How long a takeover marker protects an expired lock.
///
/// A marker outliving this was left behind by a crashed process and may be removed.
const TAKEOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// The extension of takeover markers next to their lock file.
const TAKEOVER_EXTENSION: &str = "takeover";

/// What a [`FilesystemStore::cleanup`] run removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    /// Entries past their `expire_at`, or entries that could not be decoded.
    pub entries: usize,
    /// Lock files past their deadline.
    pub locks: usize,
}

/// A [`CacheStore`] backed by a directory.
///
/// Every process pointing at the same directory shares entries and locks:
///
/// - Entries are written to a temporary file which is then atomically moved into place, so
///   readers never observe a partially written entry.
/// - A lock is a file containing its deadline and a unique nonce. It is created with an atomic
///   no-clobber rename, which fails if another process holds the lock.
/// - A lock file past its deadline is taken over. Only the process that manages to create the
///   takeover marker next to it may remove it, and only if the file still is the expired one.
#[derive(Debug)]
pub struct FilesystemStore {
    entries_dir: PathBuf,
    locks_dir: PathBuf,
    tmp_dir: PathBuf,
    closed: AtomicBool,
}

impl FilesystemStore {
    /// Opens the store rooted at `path`, creating the directory layout if necessary.
    pub fn new(path: &Path) -> io::Result<Self> {
        let store = Self {
            entries_dir: path.join("entries"),
            locks_dir: path.join("locks"),
            tmp_dir: path.join("tmp"),
            closed: AtomicBool::new(false),
        };
        fs::create_dir_all(&store.entries_dir)?;
        fs::create_dir_all(&store.locks_dir)?;
        fs::create_dir_all(&store.tmp_dir)?;
        Ok(store)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("filesystem store is closed".into()));
        }
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.entries_dir.join(hashed_path(key))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.locks_dir.join(hashed_path(key))
    }

    /// Removes every expired entry and expired lock file.
    ///
    /// Entries that cannot be decoded, for instance because they were written by an older
    /// version, are removed as well.
    pub fn cleanup(&self) -> io::Result<CleanupStats> {
        let now = Utc::now();
        let mut stats = CleanupStats::default();

        for path in files_in(&self.entries_dir)? {
            let expired = match fs::read(&path) {
                Ok(bytes) => match EntryCodec::decode(&bytes) {
                    Ok(entry) => entry.is_expired(now),
                    Err(_) => true,
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if expired && remove_if_exists(&path)? {
                tracing::trace!("Removed expired entry {}", path.display());
                stats.entries += 1;
            }
        }

        for path in files_in(&self.locks_dir)? {
            if is_takeover_marker(&path) {
                // left behind by a crashed takeover
                if remove_stale_marker(&path, now)? {
                    tracing::trace!("Removed stale takeover marker {}", path.display());
                }
                continue;
            }
            let Some(lock) = LockFile::read(&path)? else {
                continue;
            };
            if lock.deadline <= now && remove_expired_lock(&path, &lock, &self.tmp_dir, now)? {
                tracing::trace!("Removed expired lock {}", path.display());
                stats.locks += 1;
            }
        }

        tracing::debug!(
            entries = stats.entries,
            locks = stats.locks,
            "Cleaned up filesystem store"
        );
        Ok(stats)
    }
}

/// Recursively lists all files below `dir`.
fn files_in(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            // `cleanup` or `delete` might race with us
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in read_dir {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

/// Removes `path`, returning whether there was anything to remove.
fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// The contents of a lock file.
#[derive(Debug)]
struct LockFile {
    deadline: DateTime<Utc>,
    raw: String,
}

impl LockFile {
    /// Renders a new, unique lock file valid until `deadline`.
    fn contents(deadline: DateTime<Utc>) -> String {
        static NONCE: AtomicU64 = AtomicU64::new(0);
        let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}\n{:x}-{:x}\n",
            deadline.to_rfc3339(),
            std::process::id(),
            nonce
        )
    }

    /// Reads the lock file at `path`.
    ///
    /// Returns `None` if the lock file does not exist. A lock file that cannot be parsed is
    /// treated as already expired.
    fn read(path: &Path) -> io::Result<Option<Self>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let deadline = raw.lines().next().unwrap_or_default().trim();
        let deadline = match DateTime::parse_from_rfc3339(deadline) {
            Ok(deadline) => deadline.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Malformed lock file");
                DateTime::<Utc>::MIN_UTC
            }
        };
        Ok(Some(Self { deadline, raw }))
    }
}

/// The marker guarding the takeover of `lock`, which is stored at `path`.
///
/// The marker name depends on the contents of the expired lock, so a new lock at the same path
/// gets a fresh marker.
fn takeover_marker(path: &Path, lock: &LockFile) -> PathBuf {
    let hash = Sha256::digest(lock.raw.as_bytes());
    let mut extension = format!("{TAKEOVER_EXTENSION}-");
    for b in &hash[..8] {
        let _ = write!(extension, "{b:02x}");
    }
    path.with_extension(extension)
}

fn is_takeover_marker(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.starts_with(TAKEOVER_EXTENSION))
}

/// Removes the takeover marker at `path` if it outlived [`TAKEOVER_TIMEOUT`].
fn remove_stale_marker(path: &Path, now: DateTime<Utc>) -> io::Result<bool> {
    match LockFile::read(path)? {
        Some(marker) if marker.deadline <= now => remove_if_exists(path),
        _ => Ok(false),
    }
}

/// Removes the expired `lock` stored at `path`.
///
/// Contenders racing for the same expired lock first create its takeover marker without
/// clobbering, so only one of them gets to remove the lock file. The file is only removed if it
/// still holds `lock`, a lock that was taken over in the meantime is left alone.
///
/// Returns whether the lock file was removed.
fn remove_expired_lock(
    path: &Path,
    lock: &LockFile,
    tmp_dir: &Path,
    now: DateTime<Utc>,
) -> io::Result<bool> {
    let marker = takeover_marker(path, lock);
    let marker_deadline = now + TimeDelta::from_std(TAKEOVER_TIMEOUT).unwrap_or(TimeDelta::MAX);
    let temp_file = tempfile_in(tmp_dir, LockFile::contents(marker_deadline).as_bytes())?;
    match persist_tempfile(temp_file, &marker, false) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // somebody else is taking over, unless they crashed doing so
            remove_stale_marker(&marker, now)?;
            return Ok(false);
        }
        Err(e) => return Err(e),
    }

    let removed = match LockFile::read(path) {
        Ok(Some(current)) if current.raw == lock.raw => remove_if_exists(path),
        Ok(_) => Ok(false),
        Err(e) => Err(e),
    };
    remove_if_exists(&marker)?;
    removed
}

/// Takes the lock at `path` until `deadline`.
fn acquire_lock(
    path: &Path,
    tmp_dir: &Path,
    now: DateTime<Utc>,
    deadline: DateTime<Utc>,
) -> io::Result<bool> {
    // One take-over of an expired lock, then give up.
    for _ in 0..2 {
        let temp_file = tempfile_in(tmp_dir, LockFile::contents(deadline).as_bytes())?;
        match persist_tempfile(temp_file, path, false) {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        match LockFile::read(path)? {
            Some(lock) if lock.deadline > now => return Ok(false),
            Some(lock) => {
                if !remove_expired_lock(path, &lock, tmp_dir, now)? {
                    return Ok(false);
                }
                tracing::debug!("Taking over expired lock {}", path.display());
            }
            // released in the meantime
            None => {}
        }
    }
    Ok(false)
}

/// Creates a temp file in `tmp_dir` holding `contents`.
fn tempfile_in(tmp_dir: &Path, contents: &[u8]) -> io::Result<NamedTempFile> {
    // The `tmp` directory might have been removed from under us.
    fs::create_dir_all(tmp_dir)?;
    let mut temp_file = NamedTempFile::new_in(tmp_dir)?;
    temp_file.write_all(contents)?;
    temp_file.flush()?;
    Ok(temp_file)
}

/// Runs blocking filesystem work off the async runtime.
async fn run_blocking<R, F>(f: F) -> io::Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> io::Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Moves `temp_file` to `path`, creating parent directories as needed.
///
/// With `clobber = false`, the move fails with [`io::ErrorKind::AlreadyExists`] if `path`
/// already exists.
fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path, clobber: bool) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // `cleanup` and `delete` can race with us, so retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(error = &e as &dyn std::error::Error, path = %parent.display(), "Failed to create store directory");
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        let result = if clobber {
            temp_file.persist(path)
        } else {
            temp_file.persist_noclobber(path)
        };
        match result {
            Ok(_) => return Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => return Err(e.error),
            Err(e) => {
                temp_file = e.file;
                if retries > MAX_RETRIES {
                    return Err(e.error);
                }
            }
        }
    }
}

#[async_trait]
impl CacheStore for FilesystemStore {
    async fn read(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        self.check_open()?;
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match EntryCodec::decode(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // A broken entry is as good as a missing one, it will be overwritten by the
                // next write or removed by the next cleanup.
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to decode cache entry",
                );
                Ok(None)
            }
        }
    }

    async fn write(&self, key: &str, entry: Entry) -> Result<(), StoreError> {
        self.check_open()?;
        let path = self.entry_path(key);
        let bytes = EntryCodec::encode(&entry)?;
        tracing::trace!("Writing entry for `{}` to {}", key, path.display());

        let tmp_dir = self.tmp_dir.clone();
        run_blocking(move || {
            let temp_file = tempfile_in(&tmp_dir, &bytes)?;
            persist_tempfile(temp_file, &path, true)
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<usize, StoreError> {
        self.check_open()?;
        let paths: Vec<_> = keys.iter().map(|key| self.entry_path(key)).collect();
        let removed = run_blocking(move || {
            let mut removed = 0;
            for path in &paths {
                if remove_if_exists(path)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await?;
        Ok(removed)
    }

    async fn acquire_lock_if_absent(
        &self,
        key: &str,
        expiry: Duration,
    ) -> Result<bool, StoreError> {
        self.check_open()?;
        let path = self.lock_path(key);
        let tmp_dir = self.tmp_dir.clone();
        let now = Utc::now();
        let deadline = now
            .checked_add_signed(TimeDelta::from_std(expiry).unwrap_or(TimeDelta::MAX))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let acquired = run_blocking(move || acquire_lock(&path, &tmp_dir, now, deadline)).await?;
        Ok(acquired)
    }

    async fn release_lock(&self, key: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let path = self.lock_path(key);
        run_blocking(move || remove_if_exists(&path)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
