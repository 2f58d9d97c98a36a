//! Service entry point

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crawld::config::{Config, LogFormat};
use crawld::server::CrawlService;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // RUST_LOG still wins for ad-hoc debugging; LOG_LEVEL sets the default.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    tracing::info!(
        port = config.server.port,
        workers = config.crawler.workers,
        log_level = %config.logging.level,
        "configuration loaded"
    );

    let service = CrawlService::start(config).await?;
    service.run().await
}
