//! Redis facade: deduplication flags and the work queue
//!
//! Flags live at `visited:<sha256(url)>` with value `"1"` and a TTL; the
//! queue is a single list at `crawler:queue` with LPUSH for submission and
//! RPOP for consumption, giving FIFO order per instance.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::config::RedisConfig;
use crate::storage::{VisitedFlags, WorkQueue};
use crate::util::hash_url;

const VISITED_PREFIX: &str = "visited:";
const QUEUE_KEY: &str = "crawler:queue";

/// Shared Redis connection wrapping both store roles.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server responds to PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.connection_url())
            .context("Invalid Redis connection URL")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        let store = Self { manager };
        store.ping().await?;
        Ok(store)
    }

    /// Round-trip a PING for health checking.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis ping failed")?;
        anyhow::ensure!(pong == "PONG", "unexpected Redis ping reply: {}", pong);
        Ok(())
    }

    fn visited_key(url: &str) -> String {
        format!("{}{}", VISITED_PREFIX, hash_url(url))
    }
}

#[async_trait]
impl VisitedFlags for RedisStore {
    async fn mark_visited(&self, url: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        // SET with EX is a single atomic operation.
        let _: () = conn
            .set_ex(Self::visited_key(url), "1", ttl.as_secs())
            .await
            .context("Failed to set visited flag")?;
        Ok(())
    }

    async fn is_visited(&self, url: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let exists: bool = conn
            .exists(Self::visited_key(url))
            .await
            .context("Failed to check visited flag")?;
        Ok(exists)
    }

    async fn remove_visited(&self, url: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .del(Self::visited_key(url))
            .await
            .context("Failed to delete visited flag")?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisStore {
    async fn push(&self, url: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .lpush(QUEUE_KEY, url)
            .await
            .context("Failed to push URL onto queue")?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let popped: Option<String> = conn
            .rpop(QUEUE_KEY, None)
            .await
            .context("Failed to pop URL from queue")?;
        Ok(popped)
    }

    async fn size(&self) -> Result<i64> {
        let mut conn = self.manager.clone();
        let len: i64 = conn
            .llen(QUEUE_KEY)
            .await
            .context("Failed to read queue length")?;
        Ok(len)
    }
}
