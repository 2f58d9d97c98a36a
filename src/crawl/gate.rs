//! URL submission gate
//!
//! The entry point of the pipeline: validates submitted URLs, enforces the
//! deduplication window, and enqueues accepted work. Also serves the
//! derived status read model.
//!
//! Ordering matters: the URL is pushed onto the queue before the visited
//! flag is set. A failed push therefore never strands a flag that would
//! block resubmission; the narrow window where a duplicate can slip in
//! before the flag lands is absorbed by the idempotent result writer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, warn};
use url::Url;

use crate::storage::{PageStore, VisitedFlags, WorkQueue};
use crate::types::{CrawlStatus, StatusReport};
use crate::util::hash_url;

/// Errors surfaced to the submission boundary
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("URL has been crawled recently and force_crawl is false")]
    AlreadyQueued,
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

/// Submission gate over the dedup flags, the queue, and the page store.
pub struct SubmissionGate {
    visited: Arc<dyn VisitedFlags>,
    queue: Arc<dyn WorkQueue>,
    pages: Arc<dyn PageStore>,
    dedup_ttl: Duration,
}

impl SubmissionGate {
    pub fn new(
        visited: Arc<dyn VisitedFlags>,
        queue: Arc<dyn WorkQueue>,
        pages: Arc<dyn PageStore>,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            visited,
            queue,
            pages,
            dedup_ttl,
        }
    }

    /// Accept a URL for crawling.
    ///
    /// Returns the crawl request id (the hex SHA-256 of the submitted URL)
    /// on success. With `force` set, any existing dedup flag is cleared
    /// first; without it, a set flag rejects the submission.
    pub async fn submit(&self, raw_url: &str, force: bool) -> Result<String, SubmitError> {
        validate_url(raw_url)?;

        if !force {
            if self.visited.is_visited(raw_url).await? {
                return Err(SubmitError::AlreadyQueued);
            }
        } else if let Err(e) = self.visited.remove_visited(raw_url).await {
            // Not fatal: the worst case is the flag expiring on its own.
            warn!(url = raw_url, error = %e, "failed to clear visited flag for forced crawl");
        }

        self.queue.push(raw_url).await?;

        if let Err(e) = self.visited.mark_visited(raw_url, self.dedup_ttl).await {
            // The URL is already queued; losing the flag only risks an
            // extra, idempotent submission.
            error!(url = raw_url, error = %e, "failed to mark URL visited after queueing");
        }

        Ok(hash_url(raw_url))
    }

    /// Derive the current status of a URL.
    ///
    /// Lookup order: extracted page, then failure record, then the dedup
    /// flag. Whichever matches first reflects the most recent attempt.
    pub async fn status(&self, raw_url: &str) -> Result<StatusReport, SubmitError> {
        validate_url(raw_url)?;

        if let Some(page) = self.pages.find_page(raw_url).await? {
            return Ok(StatusReport {
                url: raw_url.to_string(),
                current_status: CrawlStatus::Completed,
                last_crawl_timestamp: Some(page.crawl_timestamp),
                next_retry_at: None,
                failure_reason: None,
            });
        }

        if let Some(failed) = self.pages.find_failure(raw_url).await? {
            let current_status = match failed.next_retry_at {
                Some(at) if at > Utc::now() => CrawlStatus::Retrying,
                _ => CrawlStatus::Failed,
            };
            return Ok(StatusReport {
                url: raw_url.to_string(),
                current_status,
                last_crawl_timestamp: None,
                next_retry_at: failed.next_retry_at,
                failure_reason: Some(failed.failure_reason),
            });
        }

        if self.visited.is_visited(raw_url).await? {
            return Ok(StatusReport {
                url: raw_url.to_string(),
                current_status: CrawlStatus::Pending,
                last_crawl_timestamp: None,
                next_retry_at: None,
                failure_reason: None,
            });
        }

        Ok(StatusReport {
            url: raw_url.to_string(),
            current_status: CrawlStatus::NotFound,
            last_crawl_timestamp: None,
            next_retry_at: None,
            failure_reason: None,
        })
    }
}

/// Require an absolute http(s) URL with a host.
fn validate_url(raw: &str) -> Result<Url, SubmitError> {
    let parsed = Url::parse(raw).map_err(|e| SubmitError::InvalidUrl(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SubmitError::InvalidUrl(format!(
            "unsupported scheme: {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(SubmitError::InvalidUrl("missing host".to_string()));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_http_and_https() {
        assert!(validate_url("https://example.com/page?q=1").is_ok());
        assert!(validate_url("http://example.com").is_ok());
    }

    #[test]
    fn validate_rejects_relative_and_other_schemes() {
        assert!(matches!(
            validate_url("/relative/path"),
            Err(SubmitError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("ftp://example.com/file"),
            Err(SubmitError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("not a url"),
            Err(SubmitError::InvalidUrl(_))
        ));
    }

    #[test]
    fn already_queued_message_is_contractual() {
        // The 409 body on the HTTP surface carries this exact text.
        assert_eq!(
            SubmitError::AlreadyQueued.to_string(),
            "URL has been crawled recently and force_crawl is false"
        );
    }
}
