use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for offload.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "offload".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the in-process [`MemoryStore`](crate::store::MemoryStore).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// Capacity (in bytes) of stored values.
    ///
    /// The size limit is a best-effort approximation, and not an exact limit.
    ///
    /// Defaults to `100 MiB (= 104_857_600)`.
    pub capacity: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            capacity: 100 * 1024 * 1024,
        }
    }
}

/// Configuration of the [`FilesystemStore`](crate::store::FilesystemStore).
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct FilesystemStoreConfig {
    /// The directory holding entries and lock files.
    ///
    /// Every process pointed at the same directory shares its cache and its locks.
    pub path: PathBuf,
}

/// The backend to use as the shared cache store.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreConfig {
    Memory(MemoryStoreConfig),
    Filesystem(FilesystemStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(MemoryStoreConfig::default())
    }
}

/// Fine-tuning of the manager's freshness and locking policy.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long an entry stays servable after its freshness window has elapsed.
    ///
    /// Entries written by [`fetch`](crate::OffloadManager::fetch) are stale right away, so this
    /// is also the time a zero-TTL entry can be served while it is being refreshed.
    /// Values below one millisecond are raised to one millisecond.
    #[serde(with = "humantime_serde")]
    pub stale_grace: Duration,

    /// Expiry of a lock token.
    ///
    /// A lock whose holder crashed is released by the store after this time.
    #[serde(with = "humantime_serde")]
    pub lock_expiry: Duration,

    /// How many times a contended lock is tried before giving up.
    pub lock_attempts: usize,

    /// The pause between two lock attempts.
    #[serde(with = "humantime_serde")]
    pub lock_retry_delay: Duration,
}

impl ManagerConfig {
    pub(crate) const MIN_STALE_GRACE: Duration = Duration::from_millis(1);
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stale_grace: Duration::from_secs(5),
            lock_expiry: Duration::from_secs(5),
            lock_attempts: 3,
            lock_retry_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// The cache store shared by all managers of this process.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub store: StoreConfig,

    /// Freshness and locking policy.
    pub manager: ManagerConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
