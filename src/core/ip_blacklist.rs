use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::utils::ShieldResult;

/// Answers whether a client IP is blacklisted
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlacklistOracle: Send + Sync {
    async fn contains(&self, ip: IpAddr) -> ShieldResult<bool>;
}

/// IP blacklist implementation using Redis backend
pub struct RedisBlacklist {
    /// Shared Redis connection
    conn: ConnectionManager,
    /// Blacklist expiration time in seconds
    expiration_seconds: u64,
}

impl RedisBlacklist {
    /// Create a new IP blacklist instance
    pub fn new(conn: ConnectionManager, expiration_seconds: u64) -> Self {
        Self {
            conn,
            expiration_seconds,
        }
    }

    fn key(ip: &IpAddr) -> String {
        format!("blacklist:{}", ip)
    }

    /// Add an IP to the blacklist; `expiration_seconds == 0` keeps it until removed
    pub async fn add_ip(&self, ip: IpAddr) -> ShieldResult<()> {
        let mut conn = self.conn.clone();
        if self.expiration_seconds == 0 {
            conn.set::<_, _, ()>(Self::key(&ip), "1").await?;
        } else {
            conn.set_ex::<_, _, ()>(Self::key(&ip), "1", self.expiration_seconds as usize)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlacklistOracle for RedisBlacklist {
    async fn contains(&self, ip: IpAddr) -> ShieldResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(Self::key(&ip)).await?;
        Ok(exists)
    }
}

/// In-process blacklist with optional per-entry expiry
#[derive(Default)]
pub struct MemoryBlacklist {
    entries: RwLock<HashMap<IpAddr, Option<Instant>>>,
}

impl MemoryBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an IP, permanently when `ttl` is `None`
    pub async fn add_ip(&self, ip: IpAddr, ttl: Option<Duration>) {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.write().await.insert(ip, expires);
    }

    pub async fn remove_ip(&self, ip: IpAddr) {
        self.entries.write().await.remove(&ip);
    }

    /// Currently blacklisted IPs
    pub async fn list(&self) -> Vec<IpAddr> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, expires)| expires.map_or(true, |at| at > now))
            .map(|(ip, _)| *ip)
            .collect()
    }
}

#[async_trait]
impl BlacklistOracle for MemoryBlacklist {
    async fn contains(&self, ip: IpAddr) -> ShieldResult<bool> {
        let entries = self.entries.read().await;
        Ok(match entries.get(&ip) {
            Some(Some(expires)) => *expires > Instant::now(),
            Some(None) => true,
            None => false,
        })
    }
}
