pub mod cache;
pub mod headers;
pub mod listener;
pub mod request;

mod codec;
mod forward;
mod handler;
mod tunnel;

use std::sync::Arc;

use anyhow::Result;

use crate::blocklist::BlockList;
use crate::settings::Settings;
use cache::HttpCache;

/// Everything a request handler needs, injected explicitly: settings, the
/// immutable blocklist, and the shared on-disk cache.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub blocklist: Arc<BlockList>,
    pub cache: Arc<HttpCache>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, blocklist: Arc<BlockList>, cache: Arc<HttpCache>) -> Self {
        Self {
            settings,
            blocklist,
            cache,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
