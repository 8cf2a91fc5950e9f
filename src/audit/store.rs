use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{BTreeSet, VecDeque};
use tokio::sync::RwLock;

use super::{AuditEvent, AuditReader, AuditSink, BlockedRequest, HealthSnapshot, RequestLog};
use crate::core::BLOCKED_REQUESTS_KEY;
use crate::utils::ShieldResult;

/// Writes every audit event to the tracing subscriber
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn record(&self, event: &AuditEvent) -> ShieldResult<()> {
        match event {
            AuditEvent::Blocked(b) => tracing::warn!(
                ip = %b.ip,
                reason = %b.reason,
                url = %b.request_url,
                user_agent = %b.user_agent,
                event = "request_blocked",
            ),
            AuditEvent::Request(r) => tracing::debug!(
                ip = %r.ip,
                method = %r.method,
                path = %r.path,
                status = r.status,
                verdict = %r.verdict,
                response_time_ms = r.response_time_ms,
                event = "request_served",
            ),
            AuditEvent::Health(h) => tracing::info!(
                status = ?h.status,
                uptime_seconds = h.uptime_seconds,
                traffic_in = h.traffic_in,
                traffic_out = h.traffic_out,
                event = "health_snapshot",
            ),
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryAudit {
    blocked: VecDeque<BlockedRequest>,
    requests: VecDeque<RequestLog>,
    health: Option<HealthSnapshot>,
    blocked_total: u64,
    blocked_ips: BTreeSet<String>,
}

/// Bounded in-process audit store
pub struct MemoryAuditStore {
    inner: RwLock<MemoryAudit>,
    max_records: usize,
}

impl MemoryAuditStore {
    pub fn new(max_records: usize) -> Self {
        Self {
            inner: RwLock::new(MemoryAudit::default()),
            max_records: max_records.max(1),
        }
    }

    fn push_capped<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
        queue.push_front(item);
        queue.truncate(cap);
    }
}

#[async_trait]
impl AuditSink for MemoryAuditStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn record(&self, event: &AuditEvent) -> ShieldResult<()> {
        let mut inner = self.inner.write().await;
        match event {
            AuditEvent::Blocked(b) => {
                inner.blocked_total += 1;
                inner.blocked_ips.insert(b.ip.to_string());
                Self::push_capped(&mut inner.blocked, b.clone(), self.max_records);
            }
            AuditEvent::Request(r) => {
                Self::push_capped(&mut inner.requests, r.clone(), self.max_records);
            }
            AuditEvent::Health(h) => inner.health = Some(h.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl AuditReader for MemoryAuditStore {
    async fn blocked_count(&self) -> ShieldResult<u64> {
        Ok(self.inner.read().await.blocked_total)
    }

    async fn blocked_ips(&self) -> ShieldResult<Vec<String>> {
        Ok(self.inner.read().await.blocked_ips.iter().cloned().collect())
    }

    async fn recent_blocked(&self, limit: usize) -> ShieldResult<Vec<BlockedRequest>> {
        Ok(self.inner.read().await.blocked.iter().take(limit).cloned().collect())
    }

    async fn recent_requests(&self, limit: usize) -> ShieldResult<Vec<RequestLog>> {
        Ok(self.inner.read().await.requests.iter().take(limit).cloned().collect())
    }

    async fn latest_health(&self) -> ShieldResult<Option<HealthSnapshot>> {
        Ok(self.inner.read().await.health.clone())
    }
}

const BLOCKED_LIST: &str = "audit:blocked";
const REQUEST_LIST: &str = "audit:requests";
const HEALTH_LIST: &str = "audit:health";
const BLOCKED_IPS_SET: &str = "audit:blocked_ips";

/// Audit store kept in capped Redis lists, shared by every shield node
pub struct RedisAuditStore {
    conn: ConnectionManager,
    max_records: usize,
}

impl RedisAuditStore {
    pub fn new(conn: ConnectionManager, max_records: usize) -> Self {
        Self {
            conn,
            max_records: max_records.max(1),
        }
    }

    async fn push_capped(&self, list: &str, json: String) -> ShieldResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lpush(list, json)
            .ignore()
            .ltrim(list, 0, self.max_records as isize - 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_list<T: serde::de::DeserializeOwned>(
        &self,
        list: &str,
        limit: usize,
    ) -> ShieldResult<Vec<T>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(list, 0, limit as isize - 1).await?;

        // Entries written by a different schema version are skipped
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }
}

#[async_trait]
impl AuditSink for RedisAuditStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn record(&self, event: &AuditEvent) -> ShieldResult<()> {
        match event {
            AuditEvent::Blocked(b) => {
                let mut conn = self.conn.clone();
                redis::pipe()
                    .atomic()
                    .incr(BLOCKED_REQUESTS_KEY, 1u64)
                    .ignore()
                    .sadd(BLOCKED_IPS_SET, b.ip.to_string())
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                self.push_capped(BLOCKED_LIST, serde_json::to_string(b)?).await
            }
            AuditEvent::Request(r) => {
                self.push_capped(REQUEST_LIST, serde_json::to_string(r)?).await
            }
            AuditEvent::Health(h) => {
                self.push_capped(HEALTH_LIST, serde_json::to_string(h)?).await
            }
        }
    }
}

#[async_trait]
impl AuditReader for RedisAuditStore {
    async fn blocked_count(&self) -> ShieldResult<u64> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(BLOCKED_REQUESTS_KEY).await?;
        Ok(count.unwrap_or(0))
    }

    async fn blocked_ips(&self) -> ShieldResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut ips: Vec<String> = conn.smembers(BLOCKED_IPS_SET).await?;
        ips.sort();
        Ok(ips)
    }

    async fn recent_blocked(&self, limit: usize) -> ShieldResult<Vec<BlockedRequest>> {
        self.read_list(BLOCKED_LIST, limit).await
    }

    async fn recent_requests(&self, limit: usize) -> ShieldResult<Vec<RequestLog>> {
        self.read_list(REQUEST_LIST, limit).await
    }

    async fn latest_health(&self) -> ShieldResult<Option<HealthSnapshot>> {
        Ok(self.read_list(HEALTH_LIST, 1).await?.into_iter().next())
    }
}
