use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_listen() -> SocketAddr {
    "127.0.0.1:9999".parse().expect("static listen address")
}

fn default_blocklist() -> PathBuf {
    PathBuf::from("blocked-domains.txt")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("http_cache")
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_tunnel_idle_timeout() -> u64 {
    0
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_body_buffer() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_blocklist")]
    pub blocklist: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    /// Dial timeout in seconds for origin connections (CONNECT and forwarding).
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    /// Idle read timeout in seconds for CONNECT tunnels; 0 disables it.
    #[serde(default = "default_tunnel_idle_timeout")]
    pub tunnel_idle_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Upper bound for bodies held in memory: buffered chunked request bodies
    /// and cacheable response bodies. Larger responses bypass the cache.
    #[serde(default = "default_max_body_buffer")]
    pub max_body_buffer: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(config_path) = resolve_config_path(cli) {
            builder = builder.add_source(File::from(config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("WARDCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(addr) = cli.addr {
            settings.listen = addr;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.dial_timeout > 0,
            "dial_timeout must be greater than 0 seconds (got {})",
            self.dial_timeout
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_body_buffer > 0,
            "max_body_buffer must be greater than 0 (got {})",
            self.max_body_buffer
        );
        if self.blocklist.as_os_str().is_empty() {
            bail!("blocklist path must not be empty");
        }
        if self.cache_dir.as_os_str().is_empty() {
            bail!("cache_dir must not be empty");
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn tunnel_idle_timeout(&self) -> Option<Duration> {
        if self.tunnel_idle_timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.tunnel_idle_timeout))
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            blocklist: default_blocklist(),
            cache_dir: default_cache_dir(),
            log: default_log_format(),
            dial_timeout: default_dial_timeout(),
            tunnel_idle_timeout: default_tunnel_idle_timeout(),
            max_header_size: default_max_header_size(),
            max_body_buffer: default_max_body_buffer(),
        }
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Some(path.to_path_buf());
    }
    let fallback = Path::new("wardcache.toml");
    if fallback.exists() {
        return Some(fallback.to_path_buf());
    }
    None
}
