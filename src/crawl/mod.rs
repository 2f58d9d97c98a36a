//! The crawl pipeline
//!
//! Cooperating components that take a submitted URL to a terminal state:
//!
//! - `SubmissionGate`: validates, deduplicates, and enqueues URLs
//! - `HostRateLimiter`: per-hostname minimum inter-request delay
//! - `ChromeDriver`: headless navigation and DOM extraction
//! - `Worker` / `WorkerPool`: queue consumption and outcome routing
//! - `RetrySweeper`: re-enqueues failures whose backoff has elapsed

pub mod driver;
pub mod gate;
pub mod rate_limiter;
pub mod sweeper;
pub mod worker;

pub use driver::{ChromeDriver, CrawlDriver, CrawlError};
pub use gate::{SubmissionGate, SubmitError};
pub use rate_limiter::HostRateLimiter;
pub use sweeper::RetrySweeper;
pub use worker::{Worker, WorkerPool};
