use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::utils::ShieldResult;

/// Counter of every request that reached the blacklist check
pub const TOTAL_REQUESTS_KEY: &str = "stats:ttl_req";
/// Counter of blocked requests, maintained by the audit stores
pub const BLOCKED_REQUESTS_KEY: &str = "stats:blocked_req";

/// Process-wide named counters, safe for concurrent increments
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestCounter: Send + Sync {
    async fn increment(&self, key: &str) -> ShieldResult<()>;

    async fn get(&self, key: &str) -> ShieldResult<u64>;
}

/// Counters kept in Redis with `INCR`
pub struct RedisRequestCounter {
    conn: ConnectionManager,
}

impl RedisRequestCounter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RequestCounter for RedisRequestCounter {
    async fn increment(&self, key: &str) -> ShieldResult<()> {
        let mut conn = self.conn.clone();
        conn.incr::<_, _, ()>(key, 1u64).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> ShieldResult<u64> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }
}

/// In-memory counters backed by atomics
#[derive(Default)]
pub struct MemoryRequestCounter {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl MemoryRequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn counter(&self, key: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.read().await.get(key) {
            return counter.clone();
        }
        self.counters
            .write()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }
}

#[async_trait]
impl RequestCounter for MemoryRequestCounter {
    async fn increment(&self, key: &str) -> ShieldResult<()> {
        self.counter(key).await.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str) -> ShieldResult<u64> {
        Ok(self
            .counters
            .read()
            .await
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0))
    }
}
