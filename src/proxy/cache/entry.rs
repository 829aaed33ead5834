use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::proxy::headers::HeaderLine;

/// Sentinel stored when the origin response carried no `Last-Modified`.
pub const LAST_MODIFIED_ABSENT: &str = "na";

/// Freshness lifetime meaning "unknown": the entry is stored but treated as
/// stale on every read, forcing a re-fetch.
pub const MAX_AGE_UNKNOWN: i64 = -1;

/// One cached response, persisted as a single blob per cache key. Blobs never
/// mutate in place; staleness removes the file and a later store replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    /// (name, value) pairs in wire order; repeated names keep their
    /// multiplicity and relative order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub max_age: i64,
    pub last_modified: String,
    pub created_unix: u64,
}

impl CacheEntry {
    pub fn new(
        status: u16,
        headers: &[HeaderLine],
        body: Vec<u8>,
        max_age: i64,
        last_modified: String,
        created: SystemTime,
    ) -> Self {
        Self {
            status,
            headers: headers
                .iter()
                .map(|header| (header.name.clone(), header.value.clone()))
                .collect(),
            body,
            max_age,
            last_modified,
            created_unix: unix_seconds(created),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .context("failed to encode cache entry")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .context("failed to decode cache entry")?;
        Ok(entry)
    }

    pub fn header_lines(&self) -> Vec<HeaderLine> {
        self.headers
            .iter()
            .map(|(name, value)| HeaderLine::new(name.clone(), value.clone()))
            .collect()
    }

    /// `max_age == 0` is always stale; a positive lifetime expires `max_age`
    /// seconds after creation; a negative lifetime means "unknown" and is
    /// treated as stale so the next request revalidates by re-fetching.
    pub fn is_stale(&self, now: SystemTime) -> bool {
        if self.max_age == 0 {
            return true;
        }
        if self.max_age < 0 {
            return true;
        }
        let age = unix_seconds(now).saturating_sub(self.created_unix);
        age > self.max_age as u64
    }
}

fn unix_seconds(instant: SystemTime) -> u64 {
    instant
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
