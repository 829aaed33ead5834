use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "wardcache", about = "Caching forward HTTP proxy")]
pub struct Cli {
    /// Listen address for the proxy (overrides the configured value).
    #[arg(short = 'a', long)]
    pub addr: Option<SocketAddr>,

    /// Path to the settings file (defaults to ./wardcache.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
