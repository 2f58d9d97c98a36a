//! Core domain types shared across the crawl pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An image extracted from a crawled page.
///
/// `data_src` captures the lazy-loading attribute used by many sites; both
/// `src` and `data_src` are absolute URLs, resolved against the final
/// (post-redirect) document URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub src: String,
    #[serde(default)]
    pub alt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_src: String,
}

/// Structured data extracted from a single page.
///
/// `url` is the submitted URL, not the post-redirect one: it is the row
/// identity in the relational store, so status lookups by the URL a client
/// submitted always resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub url: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub h1_tags: Vec<String>,
    pub content: String,
    pub images: Vec<ImageInfo>,
    pub crawl_timestamp: DateTime<Utc>,
    pub http_status_code: i32,
    pub response_time_ms: i32,
}

/// A row in the `failed_urls` table with its retry bookkeeping.
///
/// `next_retry_at == None` means the retry budget is exhausted and the URL
/// is permanently failed; the sweeper never picks it up again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUrl {
    pub url: String,
    pub failure_reason: String,
    pub http_status_code: Option<i32>,
    pub last_attempt_at: DateTime<Utc>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Derived status of a URL, computed from the terminal tables and the
/// deduplication flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    /// A row exists in `extracted_data`.
    Completed,
    /// A failure row exists and its next retry is in the future.
    Retrying,
    /// A failure row exists with no scheduled retry.
    Failed,
    /// The deduplication flag is set but no terminal row exists yet.
    Pending,
    /// Nothing is known about the URL.
    NotFound,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Pending => "pending",
            Self::NotFound => "not_found",
        }
    }
}

/// Full status report for a URL, as returned by the submission gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub url: String,
    pub current_status: CrawlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_crawl_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}
