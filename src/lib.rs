//! crawld: distributed web-crawl service
//!
//! Clients submit URLs through a small HTTP API; background workers fetch
//! each URL with a headless browser, extract structured page data, and
//! persist results to PostgreSQL. The pipeline guarantees:
//! - deduplication within a configurable TTL window (Redis flags)
//! - bounded crawl concurrency (browser page pool)
//! - per-domain politeness (minimum inter-request delay)
//! - exponential-backoff retry of transient failures with jitter

pub mod config;
pub mod crawl;
pub mod server;
pub mod storage;
pub mod types;
pub mod util;

pub use config::Config;
pub use types::*;
