//! HTTP boundary and service wiring
//!
//! The request surface (submission, status, health, metrics), the metric
//! registry, and the lifecycle glue that assembles the crawl pipeline and
//! tears it down in order.

pub mod handlers;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod routes;
pub mod types;

pub use http::HttpServer;
pub use lifecycle::CrawlService;
pub use metrics::CrawlMetrics;
