pub mod blocklist;
pub mod cli;
pub mod logging;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use blocklist::BlockList;
use proxy::cache::HttpCache;
use settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let blocklist = Arc::new(BlockList::load(&settings.blocklist)?);
    info!(
        path = %settings.blocklist.display(),
        patterns = blocklist.len(),
        "blocklist loaded"
    );

    let cache = Arc::new(HttpCache::new(settings.cache_dir.clone()).await?);
    info!(dir = %settings.cache_dir.display(), "response cache ready");

    let app = proxy::AppContext::new(settings, blocklist, cache);
    proxy::run(app).await
}
