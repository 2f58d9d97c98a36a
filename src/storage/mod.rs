//! Storage facades for the crawl pipeline
//!
//! Two backing stores cooperate: Redis holds the deduplication flags and
//! the work queue, PostgreSQL holds the extracted pages and the failed-URL
//! table with its retry bookkeeping. The traits here are the seams the
//! submission gate, the workers, and the retry sweeper depend on; tests
//! substitute in-memory implementations.

pub mod cache;
pub mod postgres;

pub use cache::RedisStore;
pub use postgres::PostgresStore;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ExtractedPage, FailedUrl};

/// Presence-only deduplication flags with a TTL.
///
/// A set flag means "this URL has recently been accepted for crawling and
/// should not be re-queued unless forced".
#[async_trait]
pub trait VisitedFlags: Send + Sync {
    /// Set the flag for a URL with the given time-to-live.
    async fn mark_visited(&self, url: &str, ttl: Duration) -> Result<()>;

    /// Check whether the flag is currently set.
    async fn is_visited(&self, url: &str) -> Result<bool>;

    /// Remove the flag so the URL can be re-queued immediately.
    async fn remove_visited(&self, url: &str) -> Result<()>;
}

/// FIFO work queue transporting URLs from submitters to workers.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a URL to the queue.
    async fn push(&self, url: &str) -> Result<()>;

    /// Take the oldest URL off the queue. `None` means the queue is empty,
    /// which is a normal state and not an error.
    async fn pop(&self) -> Result<Option<String>>;

    /// Current queue depth.
    async fn size(&self) -> Result<i64>;
}

/// Durable storage for extracted pages and failure bookkeeping.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Upsert a page keyed on its URL and clear any prior failure record
    /// for that URL in the same transaction.
    async fn save_page(&self, page: &ExtractedPage) -> Result<()>;

    /// Look up the extracted page for a URL.
    async fn find_page(&self, url: &str) -> Result<Option<ExtractedPage>>;

    /// Record a failed crawl attempt. Creates the row with `retry_count = 1`
    /// on first failure; on conflict increments the count and recomputes
    /// `next_retry_at` with exponential backoff, or sets it to NULL once the
    /// retry budget is exhausted.
    async fn record_failure(
        &self,
        url: &str,
        reason: &str,
        http_status: Option<i32>,
    ) -> Result<()>;

    /// Delete the failure record for a URL. A no-op if none exists.
    async fn clear_failure(&self, url: &str) -> Result<()>;

    /// Rows whose `next_retry_at` has come due, oldest first.
    async fn find_retryable(&self, limit: i64) -> Result<Vec<FailedUrl>>;

    /// Look up the failure record for a URL.
    async fn find_failure(&self, url: &str) -> Result<Option<FailedUrl>>;
}
