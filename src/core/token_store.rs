use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::utils::ShieldResult;

/// Query parameter carrying a bypass token
pub const TOKEN_QUERY_PARAM: &str = "pow_token";
/// Header carrying a bypass token
pub const TOKEN_HEADER: &str = "PoW-Token";

/// Whether `candidate` has the canonical `8-4-4-4-12` hex UUID layout.
///
/// Braced, URN and simple forms are rejected.
pub fn is_bypass_token(candidate: &str) -> bool {
    candidate.len() == 36 && Uuid::try_parse(candidate).is_ok()
}

/// Solved challenge tokens
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BypassTokenStore: Send + Sync {
    /// Whether the token is currently marked as solved
    async fn is_solved(&self, token: &str) -> ShieldResult<bool>;

    /// Record a solved token for `ttl`
    async fn mark_solved(&self, token: &str, ttl: Duration) -> ShieldResult<()>;
}

/// Bypass tokens stored in Redis as `wht:{token}` with a TTL
pub struct RedisTokenStore {
    conn: ConnectionManager,
}

impl RedisTokenStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl BypassTokenStore for RedisTokenStore {
    async fn is_solved(&self, token: &str) -> ShieldResult<bool> {
        let key = format!("wht:{}", token);
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(&key).await?;
        Ok(exists)
    }

    async fn mark_solved(&self, token: &str, ttl: Duration) -> ShieldResult<()> {
        let key = format!("wht:{}", token);
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(&key, 1u8, ttl.as_secs().max(1) as usize).await?;
        Ok(())
    }
}

/// In-process token store for single-node setups and tests
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, Instant>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired tokens
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        self.tokens.write().await.retain(|_, expires| *expires > now);
    }
}

#[async_trait]
impl BypassTokenStore for MemoryTokenStore {
    async fn is_solved(&self, token: &str) -> ShieldResult<bool> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .get(token)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false))
    }

    async fn mark_solved(&self, token: &str, ttl: Duration) -> ShieldResult<()> {
        self.tokens
            .write()
            .await
            .insert(token.to_string(), Instant::now() + ttl);
        Ok(())
    }
}
