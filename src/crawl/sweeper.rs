//! Retry sweeper
//!
//! Periodically scans the failure table for rows whose `next_retry_at` has
//! come due and feeds them back through the pipeline: push onto the queue,
//! clear the dedup flag so the gate admits the re-entry. The failure row
//! itself is left in place; only a successful crawl deletes it, and a
//! re-failure updates it where it stands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::storage::{PageStore, VisitedFlags, WorkQueue};

pub struct RetrySweeper {
    pages: Arc<dyn PageStore>,
    queue: Arc<dyn WorkQueue>,
    visited: Arc<dyn VisitedFlags>,
    interval: Duration,
    batch_limit: i64,
}

impl RetrySweeper {
    pub fn new(
        pages: Arc<dyn PageStore>,
        queue: Arc<dyn WorkQueue>,
        visited: Arc<dyn VisitedFlags>,
        interval: Duration,
        batch_limit: i64,
    ) -> Self {
        Self {
            pages,
            queue,
            visited,
            interval,
            batch_limit,
        }
    }

    /// Sweep on a fixed interval until shutdown.
    pub async fn run(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "retry sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "retry sweep failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("retry sweeper stopped");
    }

    /// One scan pass. Returns how many URLs were re-enqueued.
    pub async fn sweep(&self) -> Result<usize> {
        let due = self.pages.find_retryable(self.batch_limit).await?;
        let mut requeued = 0usize;

        for failed in due {
            // A URL that completed since the failure was recorded needs its
            // stale row cleared, not another crawl.
            match self.pages.find_page(&failed.url).await {
                Ok(Some(_)) => {
                    if let Err(e) = self.pages.clear_failure(&failed.url).await {
                        warn!(url = %failed.url, error = %e, "failed to clear stale failure record");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(url = %failed.url, error = %e, "failed to check completion, skipping");
                    continue;
                }
            }

            if let Err(e) = self.queue.push(&failed.url).await {
                warn!(url = %failed.url, error = %e, "failed to re-enqueue URL");
                continue;
            }
            if let Err(e) = self.visited.remove_visited(&failed.url).await {
                warn!(url = %failed.url, error = %e, "failed to clear visited flag for retry");
            }
            debug!(url = %failed.url, retry_count = failed.retry_count, "re-enqueued failed URL");
            requeued += 1;
        }

        if requeued > 0 {
            info!(count = requeued, "retry sweep re-enqueued URLs");
        }
        Ok(requeued)
    }
}
