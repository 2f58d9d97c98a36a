//! Service lifecycle
//!
//! Wires the pipeline together and manages startup, background tasks, and
//! graceful shutdown. Teardown order matters: the HTTP boundary stops
//! accepting submissions first, then workers stop popping and drain their
//! in-flight crawls up to the drain deadline, and only then does the
//! browser close.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::crawl::{ChromeDriver, HostRateLimiter, RetrySweeper, SubmissionGate, Worker, WorkerPool};
use crate::server::handlers::AppState;
use crate::server::http::HttpServer;
use crate::server::metrics::CrawlMetrics;
use crate::storage::{PostgresStore, RedisStore, WorkQueue};

/// How often the queue-depth gauge is refreshed.
const QUEUE_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Crawl service instance managing all components
pub struct CrawlService {
    config: Config,
    store: Arc<PostgresStore>,
    cache: Arc<RedisStore>,
    driver: Arc<ChromeDriver>,
    gate: Arc<SubmissionGate>,
    metrics: Arc<CrawlMetrics>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CrawlService {
    /// Connect to the backing stores, launch the browser, and assemble the
    /// pipeline.
    pub async fn start(config: Config) -> Result<Self> {
        info!("Starting crawl service");

        let store = Arc::new(
            PostgresStore::connect(&config.postgres, config.crawler.max_retries)
                .await
                .context("PostgreSQL initialization failed")?,
        );
        info!("Connected to PostgreSQL");

        let cache = Arc::new(
            RedisStore::connect(&config.redis)
                .await
                .context("Redis initialization failed")?,
        );
        info!("Connected to Redis");

        let driver = Arc::new(
            ChromeDriver::launch(
                config.crawler.max_concurrency,
                config.crawler.page_load_timeout(),
            )
            .await
            .context("Browser initialization failed")?,
        );

        let metrics = CrawlMetrics::shared();
        let gate = Arc::new(SubmissionGate::new(
            cache.clone(),
            cache.clone(),
            store.clone(),
            config.crawler.dedup_ttl(),
        ));

        let (shutdown_tx, _) = broadcast::channel(16);

        info!(
            workers = config.crawler.workers,
            max_concurrency = config.crawler.max_concurrency,
            "Crawl service initialized"
        );

        Ok(Self {
            config,
            store,
            cache,
            driver,
            gate,
            metrics,
            shutdown_tx,
        })
    }

    /// Run the service until a shutdown signal arrives (blocking).
    pub async fn run(&self) -> Result<()> {
        let crawler = &self.config.crawler;

        let sampler_task = self.spawn_queue_sampler();

        let limiter = Arc::new(HostRateLimiter::new(crawler.rate_limit_delay()));
        let worker = Arc::new(Worker::new(
            self.cache.clone(),
            self.cache.clone(),
            self.store.clone(),
            self.driver.clone(),
            limiter,
            self.metrics.clone(),
            crawler.dedup_ttl(),
            crawler.sneaky,
        ));
        let pool = WorkerPool::spawn(
            crawler.workers,
            worker,
            crawler.queue_poll_interval(),
            &self.shutdown_tx,
        );

        let sweeper = RetrySweeper::new(
            self.store.clone(),
            self.cache.clone(),
            self.cache.clone(),
            crawler.retry_scan_interval(),
            crawler.retry_batch_limit,
        );
        let mut sweeper_rx = self.shutdown_tx.subscribe();
        let sweeper_task = tokio::spawn(async move {
            sweeper.run(&mut sweeper_rx).await;
        });

        let state = AppState {
            gate: self.gate.clone(),
            store: self.store.clone(),
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
        };
        let http_server = HttpServer::new(self.config.server.clone(), state);
        let http_rx = self.shutdown_tx.subscribe();
        let http_task = tokio::spawn(async move {
            match http_server.run(http_rx).await {
                Ok(()) => info!("HTTP server shut down cleanly"),
                Err(e) => error!(error = %e, "HTTP server failed"),
            }
        });

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = Self::wait_for_sigterm() => {
                info!("Received SIGTERM, shutting down");
            }
        }

        let _ = self.shutdown_tx.send(());

        // The boundary stops first so no new work arrives while draining.
        Self::join_with_timeout(http_task, Duration::from_secs(5), "HTTP server").await;
        pool.drain(crawler.drain_timeout()).await;
        Self::join_with_timeout(sweeper_task, Duration::from_secs(5), "retry sweeper").await;
        Self::join_with_timeout(sampler_task, Duration::from_secs(5), "queue sampler").await;

        self.driver.close().await;
        info!("Crawl service shutdown complete");
        Ok(())
    }

    /// Periodically publish the queue depth to the `urls_in_queue` gauge.
    fn spawn_queue_sampler(&self) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(QUEUE_SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match cache.size().await {
                            Ok(size) => metrics.urls_in_queue.set(size.max(0) as u64),
                            Err(e) => warn!(error = %e, "failed to sample queue size"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    async fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) {
        let abort = handle.abort_handle();
        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!("{} did not shut down within {:?}, aborting", name, timeout);
            abort.abort();
        }
    }

    /// Wait for SIGTERM
    #[cfg(unix)]
    async fn wait_for_sigterm() {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_sigterm() {
        std::future::pending::<()>().await
    }
}
