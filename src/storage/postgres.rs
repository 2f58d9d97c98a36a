//! PostgreSQL facade: extracted pages and failure bookkeeping
//!
//! Backoff for failed URLs is computed inside the upsert statement so that
//! `retry_count` and `next_retry_at` stay consistent under concurrent
//! updates: the stored count drives the exponent, and a ±20% jitter keeps
//! retries from herding.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::info;

use crate::config::PostgresConfig;
use crate::storage::PageStore;
use crate::types::{ExtractedPage, FailedUrl, ImageInfo};

/// Base backoff applied to the first failure, in seconds.
const INITIAL_BACKOFF_SECS: f64 = 5.0;

/// PostgreSQL-backed page store.
pub struct PostgresStore {
    pool: PgPool,
    max_retries: i32,
}

#[derive(FromRow)]
struct PageRow {
    url: String,
    title: Option<String>,
    description: Option<String>,
    keywords: Option<Vec<String>>,
    h1_tags: Option<Vec<String>>,
    content: Option<String>,
    images: Option<Json<Vec<ImageInfo>>>,
    crawl_timestamp: DateTime<Utc>,
    http_status_code: Option<i32>,
    response_time_ms: Option<i32>,
}

impl From<PageRow> for ExtractedPage {
    fn from(row: PageRow) -> Self {
        Self {
            url: row.url,
            title: row.title.unwrap_or_default(),
            description: row.description.unwrap_or_default(),
            keywords: row.keywords.unwrap_or_default(),
            h1_tags: row.h1_tags.unwrap_or_default(),
            content: row.content.unwrap_or_default(),
            images: row.images.map(|j| j.0).unwrap_or_default(),
            crawl_timestamp: row.crawl_timestamp,
            http_status_code: row.http_status_code.unwrap_or(0),
            response_time_ms: row.response_time_ms.unwrap_or(0),
        }
    }
}

#[derive(FromRow)]
struct FailedRow {
    url: String,
    failure_reason: Option<String>,
    http_status_code: Option<i32>,
    last_attempt_timestamp: DateTime<Utc>,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
}

impl From<FailedRow> for FailedUrl {
    fn from(row: FailedRow) -> Self {
        Self {
            url: row.url,
            failure_reason: row.failure_reason.unwrap_or_default(),
            http_status_code: row.http_status_code.filter(|&s| s != 0),
            last_attempt_at: row.last_attempt_timestamp,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
        }
    }
}

impl PostgresStore {
    /// Connect, run schema migrations, and return the store.
    pub async fn connect(config: &PostgresConfig, max_retries: i32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_url())
            .await
            .context("Failed to connect to PostgreSQL")?;

        let store = Self { pool, max_retries };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Build a store from an existing pool (used by tests and tools).
    pub fn from_pool(pool: PgPool, max_retries: i32) -> Self {
        Self { pool, max_retries }
    }

    /// Round-trip a trivial query for health checking.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("PostgreSQL ping failed")?;
        Ok(())
    }

    /// Create the tables and indexes if they do not exist yet.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS extracted_data (
                id BIGSERIAL PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT,
                description TEXT,
                keywords TEXT[],
                h1_tags TEXT[],
                content TEXT,
                images JSONB,
                crawl_timestamp TIMESTAMPTZ DEFAULT now(),
                http_status_code INT,
                response_time_ms INT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create extracted_data table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failed_urls (
                id BIGSERIAL PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                failure_reason TEXT,
                http_status_code INT,
                last_attempt_timestamp TIMESTAMPTZ DEFAULT now(),
                retry_count INT DEFAULT 0,
                next_retry_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create failed_urls table")?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_extracted_data_url ON extracted_data(url)",
            "CREATE INDEX IF NOT EXISTS idx_extracted_data_crawl_timestamp ON extracted_data(crawl_timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_failed_urls_url ON failed_urls(url)",
            "CREATE INDEX IF NOT EXISTS idx_failed_urls_next_retry_at ON failed_urls(next_retry_at)",
        ] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("Failed to create index")?;
        }

        info!("Database schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl PageStore for PostgresStore {
    async fn save_page(&self, page: &ExtractedPage) -> Result<()> {
        // Upsert and failure-row delete share a transaction so a completed
        // URL can never be observed with a stale failure record.
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin save transaction")?;

        sqlx::query(
            r#"
            INSERT INTO extracted_data
                (url, title, description, keywords, h1_tags, content, images,
                 http_status_code, response_time_ms, crawl_timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (url) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                keywords = EXCLUDED.keywords,
                h1_tags = EXCLUDED.h1_tags,
                content = EXCLUDED.content,
                images = EXCLUDED.images,
                http_status_code = EXCLUDED.http_status_code,
                response_time_ms = EXCLUDED.response_time_ms,
                crawl_timestamp = EXCLUDED.crawl_timestamp
            "#,
        )
        .bind(&page.url)
        .bind(&page.title)
        .bind(&page.description)
        .bind(&page.keywords)
        .bind(&page.h1_tags)
        .bind(&page.content)
        .bind(Json(&page.images))
        .bind(page.http_status_code)
        .bind(page.response_time_ms)
        .bind(page.crawl_timestamp)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert extracted page")?;

        sqlx::query("DELETE FROM failed_urls WHERE url = $1")
            .bind(&page.url)
            .execute(&mut *tx)
            .await
            .context("Failed to clear failure record on save")?;

        tx.commit().await.context("Failed to commit page save")?;
        Ok(())
    }

    async fn find_page(&self, url: &str) -> Result<Option<ExtractedPage>> {
        let row = sqlx::query_as::<_, PageRow>(
            r#"
            SELECT url, title, description, keywords, h1_tags, content, images,
                   crawl_timestamp, http_status_code, response_time_ms
            FROM extracted_data
            WHERE url = $1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query extracted page")?;

        Ok(row.map(ExtractedPage::from))
    }

    async fn record_failure(
        &self,
        url: &str,
        reason: &str,
        http_status: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_urls
                (url, failure_reason, http_status_code, last_attempt_timestamp,
                 retry_count, next_retry_at)
            VALUES ($1, $2, $3, NOW(), 1,
                    NOW() + ($4 * (1 + random() * 0.4 - 0.2)) * INTERVAL '1 second')
            ON CONFLICT (url) DO UPDATE
            SET failure_reason = EXCLUDED.failure_reason,
                http_status_code = EXCLUDED.http_status_code,
                last_attempt_timestamp = NOW(),
                retry_count = failed_urls.retry_count + 1,
                next_retry_at = CASE
                    WHEN failed_urls.retry_count + 1 >= $5 THEN NULL
                    ELSE NOW() + (
                        ($4 * pow(2, failed_urls.retry_count))
                        * (1 + random() * 0.4 - 0.2)
                    ) * INTERVAL '1 second'
                END
            "#,
        )
        .bind(url)
        .bind(reason)
        .bind(http_status)
        .bind(INITIAL_BACKOFF_SECS)
        .bind(self.max_retries)
        .execute(&self.pool)
        .await
        .context("Failed to record crawl failure")?;
        Ok(())
    }

    async fn clear_failure(&self, url: &str) -> Result<()> {
        sqlx::query("DELETE FROM failed_urls WHERE url = $1")
            .bind(url)
            .execute(&self.pool)
            .await
            .context("Failed to clear failure record")?;
        Ok(())
    }

    async fn find_retryable(&self, limit: i64) -> Result<Vec<FailedUrl>> {
        let rows = sqlx::query_as::<_, FailedRow>(
            r#"
            SELECT url, failure_reason, http_status_code, last_attempt_timestamp,
                   retry_count, next_retry_at
            FROM failed_urls
            WHERE next_retry_at IS NOT NULL AND next_retry_at <= NOW()
            ORDER BY next_retry_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query retryable URLs")?;

        Ok(rows.into_iter().map(FailedUrl::from).collect())
    }

    async fn find_failure(&self, url: &str) -> Result<Option<FailedUrl>> {
        let row = sqlx::query_as::<_, FailedRow>(
            r#"
            SELECT url, failure_reason, http_status_code, last_attempt_timestamp,
                   retry_count, next_retry_at
            FROM failed_urls
            WHERE url = $1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query failure record")?;

        Ok(row.map(FailedUrl::from))
    }
}
