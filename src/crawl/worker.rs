//! Crawl workers
//!
//! A fixed pool of workers consumes the queue: pop, pace by host, drive the
//! browser, and route the outcome to either the result writer or the
//! failure bookkeeping. Driver errors never propagate out of a worker:
//! every crawl reduces to a `save_page` or a `record_failure` call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use url::Url;

use crate::crawl::driver::{CrawlDriver, CrawlError};
use crate::crawl::rate_limiter::HostRateLimiter;
use crate::server::metrics::CrawlMetrics;
use crate::storage::{PageStore, VisitedFlags, WorkQueue};
use crate::types::ExtractedPage;

/// Shared per-worker context: stores, driver, limiter, and metrics.
pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    visited: Arc<dyn VisitedFlags>,
    pages: Arc<dyn PageStore>,
    driver: Arc<dyn CrawlDriver>,
    limiter: Arc<HostRateLimiter>,
    metrics: Arc<CrawlMetrics>,
    dedup_ttl: Duration,
    sneaky: bool,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        visited: Arc<dyn VisitedFlags>,
        pages: Arc<dyn PageStore>,
        driver: Arc<dyn CrawlDriver>,
        limiter: Arc<HostRateLimiter>,
        metrics: Arc<CrawlMetrics>,
        dedup_ttl: Duration,
        sneaky: bool,
    ) -> Self {
        Self {
            queue,
            visited,
            pages,
            driver,
            limiter,
            metrics,
            dedup_ttl,
            sneaky,
        }
    }

    /// Worker loop: pop until shutdown, sleeping through empty polls.
    async fn run(
        &self,
        id: usize,
        poll_interval: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        info!(worker = id, "crawl worker started");
        loop {
            match shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                // A signal or a closed channel both mean stop popping.
                _ => break,
            }

            match self.queue.pop().await {
                Ok(Some(url)) => self.process(&url).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
                Err(e) => {
                    warn!(worker = id, error = %e, "failed to pop from queue");
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
        }
        info!(worker = id, "crawl worker stopped");
    }

    /// Crawl a single URL and persist the outcome.
    pub async fn process(&self, raw_url: &str) {
        let url = match Url::parse(raw_url) {
            Ok(url) => url,
            Err(e) => {
                // The gate validates on submission, so this only happens if
                // something else wrote to the queue.
                warn!(url = raw_url, error = %e, "skipping malformed URL from queue");
                return;
            }
        };
        let host = url.host_str().unwrap_or("unknown").to_string();

        self.limiter.wait(&host).await;

        let start = Instant::now();
        let result = self.driver.crawl(&url, self.sneaky).await;
        self.metrics
            .crawl_duration_seconds
            .observe(&[&host], start.elapsed());

        match result {
            Ok(mut page) => {
                // The row identity is the string exactly as submitted; Url
                // parsing may have normalized it (e.g. a trailing slash on
                // bare hosts).
                page.url = raw_url.to_string();
                self.handle_success(raw_url, page).await
            }
            Err(err) => self.handle_failure(raw_url, err).await,
        }
    }

    async fn handle_success(&self, raw_url: &str, page: ExtractedPage) {
        match self.pages.save_page(&page).await {
            Ok(()) => {
                self.metrics.crawls_total.inc(&["success", ""]);
                // The dedup window restarts from successful completion.
                if let Err(e) = self.visited.mark_visited(raw_url, self.dedup_ttl).await {
                    warn!(url = raw_url, error = %e, "failed to refresh visited flag");
                }
                info!(
                    url = raw_url,
                    title = %page.title,
                    status = page.http_status_code,
                    duration_ms = page.response_time_ms,
                    "crawl completed"
                );
            }
            Err(e) => {
                // The URL stays in limbo until resubmitted; all bookkeeping
                // is idempotent so that is safe.
                error!(url = raw_url, error = %e, "failed to save extracted page");
            }
        }
    }

    async fn handle_failure(&self, raw_url: &str, err: CrawlError) {
        warn!(url = raw_url, error = %err, "crawl failed, scheduling retry");
        self.metrics.crawls_total.inc(&["failure", err.error_type()]);

        if let Err(e) = self
            .pages
            .record_failure(raw_url, &err.to_string(), err.http_status())
            .await
        {
            error!(url = raw_url, error = %e, "failed to record crawl failure");
        }
    }
}

/// Handle over the spawned worker tasks.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing one context.
    pub fn spawn(
        count: usize,
        worker: Arc<Worker>,
        poll_interval: Duration,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let handles = (0..count)
            .map(|id| {
                let worker = worker.clone();
                let mut shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move {
                    worker.run(id, poll_interval, &mut shutdown_rx).await;
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for workers to finish their in-flight crawls, aborting any that
    /// outlive the drain deadline.
    pub async fn drain(self, deadline: Duration) {
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let drain_all = futures::future::join_all(self.handles);
        if tokio::time::timeout(deadline, drain_all).await.is_err() {
            warn!("workers did not drain within the deadline, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}
