use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use wardcache::blocklist::BlockList;
use wardcache::proxy::{self, cache::HttpCache, AppContext};
use wardcache::settings::Settings;

pub struct ProxyHarnessBuilder {
    patterns: Vec<String>,
    max_body_buffer: usize,
}

impl ProxyHarnessBuilder {
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
            max_body_buffer: 1024 * 1024,
        }
    }

    pub fn block(mut self, pattern: &str) -> Self {
        self.patterns.push(pattern.to_string());
        self
    }

    pub fn max_body_buffer(mut self, limit: usize) -> Self {
        self.max_body_buffer = limit;
        self
    }

    pub async fn spawn(self) -> Result<ProxyHarness> {
        let dir = TempDir::new()?;
        let cache_dir = dir.path().join("http_cache");
        let blocklist_path = dir.path().join("blocked-domains.txt");
        std::fs::write(&blocklist_path, self.patterns.join("\n"))?;

        let settings = Settings {
            listen: "127.0.0.1:0".parse()?,
            blocklist: blocklist_path,
            cache_dir: cache_dir.clone(),
            dial_timeout: 2,
            max_body_buffer: self.max_body_buffer,
            ..Settings::default()
        };

        let blocklist = Arc::new(BlockList::load(&settings.blocklist)?);
        let cache = Arc::new(HttpCache::new(cache_dir.clone()).await?);
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let app = AppContext::new(Arc::new(settings), blocklist, cache);

        let handle = tokio::spawn(async move {
            let _ = proxy::listener::serve(listener, app).await;
        });

        Ok(ProxyHarness {
            addr,
            cache_dir,
            _dir: dir,
            handle,
        })
    }
}

pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub cache_dir: PathBuf,
    _dir: TempDir,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub fn cache_file_count(&self) -> usize {
        match std::fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries.filter_map(|entry| entry.ok()).count(),
            Err(_) => 0,
        }
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
