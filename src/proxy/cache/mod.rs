use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::fs as async_fs;
use tracing::{debug, warn};

mod entry;
mod key;

pub use entry::{CacheEntry, LAST_MODIFIED_ABSENT, MAX_AGE_UNKNOWN};
pub use key::cache_key;

use super::headers::HeaderLine;

/// A response served from disk: the stored status, headers in wire order, and
/// the byte-identical body.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: Vec<HeaderLine>,
    pub body: Vec<u8>,
}

/// On-disk response cache: one blob per SHA-1 key, the filesystem as the
/// concurrency substrate. Same-key writers race benignly (last rename wins);
/// readers never observe partial files because entries are published with a
/// write-to-temp-then-rename.
#[derive(Debug, Clone)]
pub struct HttpCache {
    dir: PathBuf,
}

impl HttpCache {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        async_fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Looks up `url`. Stale entries are removed and reported as a miss; a
    /// missing file is a silent miss; any other I/O or decode problem is
    /// logged and also treated as a miss.
    pub async fn get(&self, url: &str) -> Option<CachedResponse> {
        let key = cache_key(url);
        let path = self.entry_path(&key);

        let bytes = match async_fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read cache entry");
                return None;
            }
        };

        let entry = match CacheEntry::from_bytes(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "corrupt cache entry; removing");
                self.remove(&key).await;
                return None;
            }
        };

        if entry.is_stale(SystemTime::now()) {
            debug!(key, url, "stale cache entry; removing");
            self.remove(&key).await;
            return None;
        }

        let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
        Some(CachedResponse {
            status,
            headers: entry.header_lines(),
            body: entry.body,
        })
    }

    /// Stores a response under `url`. Write errors are logged and swallowed;
    /// the response already streaming to the client is unaffected.
    pub async fn put(
        &self,
        url: &str,
        status: StatusCode,
        headers: &[HeaderLine],
        body: Vec<u8>,
        max_age: i64,
        last_modified: String,
    ) {
        let key = cache_key(url);
        let entry = CacheEntry::new(
            status.as_u16(),
            headers,
            body,
            max_age,
            last_modified,
            SystemTime::now(),
        );
        if let Err(err) = self.write_entry(&key, &entry).await {
            warn!(error = %err, key, url, "failed to store cache entry");
        } else {
            debug!(key, url, max_age, "stored cache entry");
        }
    }

    async fn write_entry(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let bytes = entry.to_bytes()?;
        let temp_path = self.dir.join(format!("tmp_{}", uuid::Uuid::new_v4()));
        let final_path = self.entry_path(key);

        if let Err(err) = async_fs::write(&temp_path, &bytes).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("failed to write cache temp {}", temp_path.display()));
        }
        if let Err(err) = async_fs::rename(&temp_path, &final_path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("failed to publish cache entry {}", final_path.display()));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) {
        let path = self.entry_path(key);
        match async_fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to remove cache entry");
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
