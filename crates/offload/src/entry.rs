//! Cache entries and their on-store representation.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A cached value together with its timing metadata.
///
/// The timestamps always satisfy `created_at <= fresh_until <= expire_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    value: Bytes,
    created_at: DateTime<Utc>,
    fresh_until: DateTime<Utc>,
    expire_at: DateTime<Utc>,
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

impl Entry {
    /// Creates an entry written at `created_at`, fresh for `ttl` and servable as stale for
    /// `grace` beyond that.
    pub fn new(value: Bytes, created_at: DateTime<Utc>, ttl: Duration, grace: Duration) -> Self {
        let fresh_until = created_at
            .checked_add_signed(delta(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let expire_at = fresh_until
            .checked_add_signed(delta(grace))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            value,
            created_at,
            fresh_until,
            expire_at,
        }
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn fresh_until(&self) -> DateTime<Utc> {
        self.fresh_until
    }

    pub fn expire_at(&self) -> DateTime<Utc> {
        self.expire_at
    }

    /// Whether the entry can be served without scheduling a refresh.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.fresh_until
    }

    /// Whether the entry must be treated as a miss.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_at
    }

    /// The time left until the entry expires, zero if it already has.
    pub fn time_to_live(&self, now: DateTime<Utc>) -> Duration {
        (self.expire_at - now).to_std().unwrap_or_default()
    }
}

/// An error decoding an [`Entry`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("entry is missing its metadata header")]
    MissingHeader,
    #[error("unsupported entry version {0}")]
    UnsupportedVersion(u32),
    #[error("entry timestamps are out of order")]
    InvalidTimestamps,
    #[error("malformed entry header")]
    Header(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    version: u32,
    created_at: DateTime<Utc>,
    fresh_until: DateTime<Utc>,
    expire_at: DateTime<Utc>,
}

/// Converts [`Entry`]s from and to bytes.
///
/// The encoded form is one line of JSON metadata, followed by a newline and the raw value:
///
/// ```text
/// {"version":1,"created_at":"…","fresh_until":"…","expire_at":"…"}
/// <value bytes>
/// ```
///
/// Bumping [`VERSION`](Self::VERSION) turns every previously written entry into a miss.
pub struct EntryCodec;

impl EntryCodec {
    pub const VERSION: u32 = 1;

    pub fn encode(entry: &Entry) -> Result<Vec<u8>, CodecError> {
        let header = Header {
            version: Self::VERSION,
            created_at: entry.created_at,
            fresh_until: entry.fresh_until,
            expire_at: entry.expire_at,
        };
        // compact JSON never contains a raw newline
        let mut buf = serde_json::to_vec(&header)?;
        buf.reserve(entry.value.len() + 1);
        buf.push(b'\n');
        buf.extend_from_slice(&entry.value);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Entry, CodecError> {
        let split = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(CodecError::MissingHeader)?;
        let (header, value) = (&bytes[..split], &bytes[split + 1..]);

        let header: Header = serde_json::from_slice(header)?;
        if header.version != Self::VERSION {
            return Err(CodecError::UnsupportedVersion(header.version));
        }
        if header.created_at > header.fresh_until || header.fresh_until > header.expire_at {
            return Err(CodecError::InvalidTimestamps);
        }

        Ok(Entry {
            value: Bytes::copy_from_slice(value),
            created_at: header.created_at,
            fresh_until: header.fresh_until,
            expire_at: header.expire_at,
        })
    }
}
