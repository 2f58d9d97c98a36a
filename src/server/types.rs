//! HTTP API request/response types

use serde::{Deserialize, Serialize};

/// Crawl behavior requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    /// Plain navigation with the default browser profile
    Respectful,
    /// Randomized viewport, user agent, and Referer
    Sneaky,
}

/// Body of `POST /api/crawl`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCrawlRequest {
    pub url: String,
    #[serde(default)]
    pub force_crawl: bool,
    /// Accepted for forward compatibility; the effective mode is service
    /// configuration since queue items carry only the URL.
    #[serde(default)]
    pub crawl_mode: Option<CrawlMode>,
}

/// 202 body of `POST /api/crawl`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCrawlResponse {
    pub status: String,
    pub message: String,
    pub crawl_request_id: String,
}

impl SubmitCrawlResponse {
    pub fn accepted(crawl_request_id: String) -> Self {
        Self {
            status: "success".to_string(),
            message: "URL submitted for crawling.".to_string(),
            crawl_request_id,
        }
    }
}

/// Query parameters of `GET /api/status`
#[derive(Debug, Clone, Deserialize)]
pub struct StatusQuery {
    pub url: Option<String>,
}

/// Body of `GET /api/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub dependencies: DependencyHealth,
}

/// Per-dependency health detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub database: String,
    pub cache: String,
}

/// Error body shared by all non-2xx responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
