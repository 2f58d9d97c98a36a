//! End-to-end crawl pipeline semantics against in-memory stores
//!
//! These tests exercise the submission gate, the worker outcome routing,
//! and the retry sweeper together, with the backing stores and the browser
//! driver replaced by in-memory fakes that mirror the production
//! contracts (including the backoff math of the failure upsert).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use url::Url;

use crawld::crawl::{
    CrawlDriver, CrawlError, HostRateLimiter, RetrySweeper, SubmissionGate, SubmitError, Worker,
};
use crawld::server::CrawlMetrics;
use crawld::storage::{PageStore, VisitedFlags, WorkQueue};
use crawld::types::{CrawlStatus, ExtractedPage, FailedUrl};

const EXAMPLE: &str = "https://example.com";
const EXAMPLE_ID: &str = "100680ad546ce6a577f42f52df33b4cfdca756859e664b8d7de329b150d09ce9";

const MAX_RETRIES: i32 = 5;
const BASE_BACKOFF_SECS: f64 = 5.0;
const DEDUP_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// In-memory stand-in for the Redis facade: flags plus a FIFO queue.
#[derive(Default)]
struct MemoryCache {
    visited: Mutex<HashMap<String, ()>>,
    queue: Mutex<VecDeque<String>>,
    fail_pushes: AtomicBool,
}

impl MemoryCache {
    fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queue_contents(&self) -> Vec<String> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl VisitedFlags for MemoryCache {
    async fn mark_visited(&self, url: &str, _ttl: Duration) -> Result<()> {
        self.visited.lock().unwrap().insert(url.to_string(), ());
        Ok(())
    }

    async fn is_visited(&self, url: &str) -> Result<bool> {
        Ok(self.visited.lock().unwrap().contains_key(url))
    }

    async fn remove_visited(&self, url: &str) -> Result<()> {
        self.visited.lock().unwrap().remove(url);
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for MemoryCache {
    async fn push(&self, url: &str) -> Result<()> {
        if self.fail_pushes.load(Ordering::SeqCst) {
            anyhow::bail!("queue backend unavailable");
        }
        self.queue.lock().unwrap().push_back(url.to_string());
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>> {
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn size(&self) -> Result<i64> {
        Ok(self.queue.lock().unwrap().len() as i64)
    }
}

/// In-memory stand-in for the Postgres facade. `record_failure` mirrors the
/// production upsert: increment on conflict, exponential backoff with ±20%
/// jitter, NULL once the retry budget is spent, and `save_page` clears the
/// failure row in the same step.
#[derive(Default)]
struct MemoryPages {
    pages: Mutex<HashMap<String, ExtractedPage>>,
    failures: Mutex<HashMap<String, FailedUrl>>,
}

impl MemoryPages {
    fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn seed_failure(&self, url: &str, retry_count: i32, next_retry_at: Option<DateTime<Utc>>) {
        self.failures.lock().unwrap().insert(
            url.to_string(),
            FailedUrl {
                url: url.to_string(),
                failure_reason: "navigation failed: seeded".to_string(),
                http_status_code: None,
                last_attempt_at: Utc::now(),
                retry_count,
                next_retry_at,
            },
        );
    }
}

fn backoff(retry_count: i32) -> ChronoDuration {
    let jitter: f64 = rand::thread_rng().gen_range(-0.2..=0.2);
    let secs = BASE_BACKOFF_SECS * 2f64.powi(retry_count - 1) * (1.0 + jitter);
    ChronoDuration::milliseconds((secs * 1000.0) as i64)
}

#[async_trait]
impl PageStore for MemoryPages {
    async fn save_page(&self, page: &ExtractedPage) -> Result<()> {
        self.pages
            .lock()
            .unwrap()
            .insert(page.url.clone(), page.clone());
        self.failures.lock().unwrap().remove(&page.url);
        Ok(())
    }

    async fn find_page(&self, url: &str) -> Result<Option<ExtractedPage>> {
        Ok(self.pages.lock().unwrap().get(url).cloned())
    }

    async fn record_failure(
        &self,
        url: &str,
        reason: &str,
        http_status: Option<i32>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(url) {
            Some(failed) => {
                failed.retry_count += 1;
                failed.failure_reason = reason.to_string();
                failed.http_status_code = http_status;
                failed.last_attempt_at = now;
                failed.next_retry_at = if failed.retry_count >= MAX_RETRIES {
                    None
                } else {
                    Some(now + backoff(failed.retry_count))
                };
            }
            None => {
                failures.insert(
                    url.to_string(),
                    FailedUrl {
                        url: url.to_string(),
                        failure_reason: reason.to_string(),
                        http_status_code: http_status,
                        last_attempt_at: now,
                        retry_count: 1,
                        next_retry_at: Some(now + backoff(1)),
                    },
                );
            }
        }
        Ok(())
    }

    async fn clear_failure(&self, url: &str) -> Result<()> {
        self.failures.lock().unwrap().remove(url);
        Ok(())
    }

    async fn find_retryable(&self, limit: i64) -> Result<Vec<FailedUrl>> {
        let now = Utc::now();
        let mut due: Vec<FailedUrl> = self
            .failures
            .lock()
            .unwrap()
            .values()
            .filter(|f| matches!(f.next_retry_at, Some(at) if at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|f| f.next_retry_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn find_failure(&self, url: &str) -> Result<Option<FailedUrl>> {
        Ok(self.failures.lock().unwrap().get(url).cloned())
    }
}

/// Browser driver fake that replays scripted outcomes.
struct StubDriver {
    outcomes: Mutex<VecDeque<Result<ExtractedPage, CrawlError>>>,
}

impl StubDriver {
    fn with(outcomes: Vec<Result<ExtractedPage, CrawlError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
        })
    }
}

#[async_trait]
impl CrawlDriver for StubDriver {
    async fn crawl(&self, url: &Url, _sneaky: bool) -> Result<ExtractedPage, CrawlError> {
        match self.outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(sample_page(url.as_str())),
        }
    }
}

fn sample_page(url: &str) -> ExtractedPage {
    ExtractedPage {
        url: url.to_string(),
        title: "Example Domain".to_string(),
        description: "Illustrative example".to_string(),
        keywords: vec!["example".to_string()],
        h1_tags: vec!["Example Domain".to_string()],
        content: "This domain is for use in illustrative examples.".to_string(),
        images: vec![],
        crawl_timestamp: Utc::now(),
        http_status_code: 200,
        response_time_ms: 42,
    }
}

fn make_gate(cache: &Arc<MemoryCache>, pages: &Arc<MemoryPages>) -> SubmissionGate {
    SubmissionGate::new(cache.clone(), cache.clone(), pages.clone(), DEDUP_TTL)
}

fn make_worker(
    cache: &Arc<MemoryCache>,
    pages: &Arc<MemoryPages>,
    driver: Arc<StubDriver>,
    metrics: Arc<CrawlMetrics>,
) -> Worker {
    Worker::new(
        cache.clone(),
        cache.clone(),
        pages.clone(),
        driver,
        Arc::new(HostRateLimiter::new(Duration::ZERO)),
        metrics,
        DEDUP_TTL,
        true,
    )
}

fn make_sweeper(cache: &Arc<MemoryCache>, pages: &Arc<MemoryPages>) -> RetrySweeper {
    RetrySweeper::new(
        pages.clone(),
        cache.clone(),
        cache.clone(),
        Duration::from_secs(30),
        100,
    )
}

// ---------------------------------------------------------------------------
// Submission gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_enqueues_and_sets_flag() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let gate = make_gate(&cache, &pages);

    let id = gate.submit(EXAMPLE, false).await.unwrap();
    assert_eq!(id, EXAMPLE_ID);
    assert_eq!(cache.queue_contents(), vec![EXAMPLE.to_string()]);
    assert!(cache.is_visited(EXAMPLE).await.unwrap());
}

#[tokio::test]
async fn duplicate_submission_is_rejected() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let gate = make_gate(&cache, &pages);

    gate.submit(EXAMPLE, false).await.unwrap();
    let err = gate.submit(EXAMPLE, false).await.unwrap_err();
    assert!(matches!(err, SubmitError::AlreadyQueued));
    // Queue depth is unchanged by the rejected submission.
    assert_eq!(cache.queue_contents().len(), 1);
}

#[tokio::test]
async fn force_submission_bypasses_dedup() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let gate = make_gate(&cache, &pages);

    gate.submit(EXAMPLE, false).await.unwrap();
    let id = gate.submit(EXAMPLE, true).await.unwrap();
    assert_eq!(id, EXAMPLE_ID);
    assert_eq!(cache.queue_contents().len(), 2);
    assert!(cache.is_visited(EXAMPLE).await.unwrap());
}

#[tokio::test]
async fn invalid_urls_are_rejected_before_any_side_effect() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let gate = make_gate(&cache, &pages);

    for bad in ["not a url", "ftp://example.com/x", "/relative/only"] {
        let err = gate.submit(bad, false).await.unwrap_err();
        assert!(matches!(err, SubmitError::InvalidUrl(_)), "{}", bad);
    }
    assert!(cache.queue_contents().is_empty());
}

#[tokio::test]
async fn failed_push_leaves_no_visited_flag() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let gate = make_gate(&cache, &pages);

    cache.fail_pushes.store(true, Ordering::SeqCst);
    let err = gate.submit(EXAMPLE, false).await.unwrap_err();
    assert!(matches!(err, SubmitError::Unavailable(_)));

    // The URL must remain submittable once the queue recovers.
    assert!(!cache.is_visited(EXAMPLE).await.unwrap());
    cache.fail_pushes.store(false, Ordering::SeqCst);
    gate.submit(EXAMPLE, false).await.unwrap();
}

// ---------------------------------------------------------------------------
// Worker outcome routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_crawl_persists_page_and_clears_failure() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let metrics = CrawlMetrics::shared();

    // A prior failure exists; success must supersede it.
    pages.seed_failure(EXAMPLE, 2, Some(Utc::now() + ChronoDuration::seconds(10)));

    let driver = StubDriver::with(vec![Ok(sample_page(EXAMPLE))]);
    let worker = make_worker(&cache, &pages, driver, metrics.clone());
    worker.process(EXAMPLE).await;

    let page = pages.find_page(EXAMPLE).await.unwrap().unwrap();
    assert_eq!(page.url, EXAMPLE);
    assert_eq!(page.title, "Example Domain");
    assert!(pages.find_failure(EXAMPLE).await.unwrap().is_none());
    // The dedup window restarts from completion.
    assert!(cache.is_visited(EXAMPLE).await.unwrap());
    assert_eq!(metrics.crawls_total.get(&["success", ""]), 1);
}

#[tokio::test]
async fn failed_crawl_schedules_first_retry_within_jitter_window() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let metrics = CrawlMetrics::shared();

    let driver = StubDriver::with(vec![Err(CrawlError::NavigationFailed(
        "dns lookup failed".to_string(),
    ))]);
    let worker = make_worker(&cache, &pages, driver, metrics.clone());

    let before = Utc::now();
    worker.process("https://nonexistent.tld/x").await;

    let failed = pages
        .find_failure("https://nonexistent.tld/x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.retry_count, 1);
    let next = failed.next_retry_at.unwrap();
    // base 5s with ±20% jitter
    assert!(next >= before + ChronoDuration::seconds(4));
    assert!(next <= Utc::now() + ChronoDuration::seconds(6));
    assert_eq!(metrics.crawls_total.get(&["failure", "navigation"]), 1);
    assert!(pages.find_page("https://nonexistent.tld/x").await.unwrap().is_none());
}

#[tokio::test]
async fn backoff_doubles_per_attempt_within_jitter_bounds() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let metrics = CrawlMetrics::shared();

    let driver = StubDriver::with(
        (0..4)
            .map(|_| {
                Err(CrawlError::NavigationFailed(
                    "connection refused".to_string(),
                ))
            })
            .collect(),
    );
    let worker = make_worker(&cache, &pages, driver, metrics);

    for attempt in 1..=4 {
        let before = Utc::now();
        worker.process(EXAMPLE).await;

        let failed = pages.find_failure(EXAMPLE).await.unwrap().unwrap();
        assert_eq!(failed.retry_count, attempt);
        let next = failed.next_retry_at.unwrap();
        let base = 5.0 * 2f64.powi(attempt - 1);
        let low = before + ChronoDuration::milliseconds((base * 0.8 * 1000.0) as i64);
        let high = Utc::now() + ChronoDuration::milliseconds((base * 1.2 * 1000.0) as i64);
        assert!(next >= low, "attempt {}: {} < {}", attempt, next, low);
        assert!(next <= high, "attempt {}: {} > {}", attempt, next, high);
    }
}

#[tokio::test]
async fn retries_exhaust_at_max_and_url_becomes_permanently_failed() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let metrics = CrawlMetrics::shared();

    let driver = StubDriver::with(
        (0..MAX_RETRIES)
            .map(|_| Err(CrawlError::Timeout))
            .collect(),
    );
    let worker = make_worker(&cache, &pages, driver, metrics);

    for _ in 0..MAX_RETRIES {
        worker.process(EXAMPLE).await;
    }

    let failed = pages.find_failure(EXAMPLE).await.unwrap().unwrap();
    assert_eq!(failed.retry_count, MAX_RETRIES);
    assert!(failed.next_retry_at.is_none());

    // The sweeper never picks up exhausted rows.
    assert!(pages.find_retryable(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn restricted_failure_records_http_status() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let metrics = CrawlMetrics::shared();

    let driver = StubDriver::with(vec![Err(CrawlError::ContentRestricted(403))]);
    let worker = make_worker(&cache, &pages, driver, metrics.clone());
    worker.process(EXAMPLE).await;

    let failed = pages.find_failure(EXAMPLE).await.unwrap().unwrap();
    assert_eq!(failed.http_status_code, Some(403));
    assert!(failed.failure_reason.contains("status code 403"));
    assert_eq!(metrics.crawls_total.get(&["failure", "restricted"]), 1);
}

// ---------------------------------------------------------------------------
// Retry sweeper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweeper_requeues_due_failures_and_clears_flag() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();

    pages.seed_failure(EXAMPLE, 1, Some(Utc::now() - ChronoDuration::seconds(1)));
    cache.mark_visited(EXAMPLE, DEDUP_TTL).await.unwrap();

    let requeued = make_sweeper(&cache, &pages).sweep().await.unwrap();
    assert_eq!(requeued, 1);
    assert_eq!(cache.queue_contents(), vec![EXAMPLE.to_string()]);
    // The gate must admit the retry, so the flag is gone.
    assert!(!cache.is_visited(EXAMPLE).await.unwrap());
    // The failure row survives until a successful crawl deletes it.
    assert!(pages.find_failure(EXAMPLE).await.unwrap().is_some());
}

#[tokio::test]
async fn sweeper_skips_future_retries() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();

    pages.seed_failure(EXAMPLE, 1, Some(Utc::now() + ChronoDuration::minutes(5)));

    let requeued = make_sweeper(&cache, &pages).sweep().await.unwrap();
    assert_eq!(requeued, 0);
    assert!(cache.queue_contents().is_empty());
}

#[tokio::test]
async fn sweeper_clears_instead_of_requeueing_completed_urls() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();

    // A completed page with a stale due failure row left behind.
    pages.save_page(&sample_page(EXAMPLE)).await.unwrap();
    pages.seed_failure(EXAMPLE, 1, Some(Utc::now() - ChronoDuration::seconds(1)));

    let requeued = make_sweeper(&cache, &pages).sweep().await.unwrap();
    assert_eq!(requeued, 0);
    assert!(cache.queue_contents().is_empty());
    assert!(pages.find_failure(EXAMPLE).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Status read model
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_walks_the_full_lifecycle() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let metrics = CrawlMetrics::shared();
    let gate = make_gate(&cache, &pages);

    // Unknown URL
    let report = gate.status(EXAMPLE).await.unwrap();
    assert_eq!(report.current_status, CrawlStatus::NotFound);

    // Submitted but not yet crawled
    gate.submit(EXAMPLE, false).await.unwrap();
    let report = gate.status(EXAMPLE).await.unwrap();
    assert_eq!(report.current_status, CrawlStatus::Pending);

    // First failure: retrying with a scheduled attempt
    let driver = StubDriver::with(vec![
        Err(CrawlError::NavigationFailed("tls handshake".to_string())),
        Ok(sample_page(EXAMPLE)),
    ]);
    let worker = make_worker(&cache, &pages, driver, metrics);
    worker.process(EXAMPLE).await;
    let report = gate.status(EXAMPLE).await.unwrap();
    assert_eq!(report.current_status, CrawlStatus::Retrying);
    assert!(report.next_retry_at.is_some());
    assert!(report.failure_reason.unwrap().contains("tls handshake"));

    // Success: completed, failure state gone
    worker.process(EXAMPLE).await;
    let report = gate.status(EXAMPLE).await.unwrap();
    assert_eq!(report.current_status, CrawlStatus::Completed);
    assert!(report.last_crawl_timestamp.is_some());
    assert!(report.failure_reason.is_none());
}

#[tokio::test]
async fn status_reports_failed_once_retries_are_exhausted() {
    let cache = MemoryCache::shared();
    let pages = MemoryPages::shared();
    let gate = make_gate(&cache, &pages);

    pages.seed_failure(EXAMPLE, MAX_RETRIES, None);

    let report = gate.status(EXAMPLE).await.unwrap();
    assert_eq!(report.current_status, CrawlStatus::Failed);
    assert!(report.next_retry_at.is_none());
}
