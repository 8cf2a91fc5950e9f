//! Fire-and-forget audit trail.
//!
//! The request path only ever calls [`AuditHandle`], which enqueues onto a
//! bounded channel without waiting. A background worker fans each event out
//! to the configured [`AuditSink`]s; their failures are logged and dropped.

mod records;
mod store;

pub use records::{
    AuditEvent, BlockedRequest, HealthSnapshot, HealthStatus, RequestLog, BAN_REASON,
};
pub use store::{MemoryAuditStore, RedisAuditStore, TracingAuditSink};

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::utils::ShieldResult;

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn record(&self, event: &AuditEvent) -> ShieldResult<()>;
}

/// Read side of an audit store, used by the admin API
#[async_trait]
pub trait AuditReader: Send + Sync {
    async fn blocked_count(&self) -> ShieldResult<u64>;

    /// Distinct IPs that have been blocked, sorted
    async fn blocked_ips(&self) -> ShieldResult<Vec<String>>;

    /// Most recent first
    async fn recent_blocked(&self, limit: usize) -> ShieldResult<Vec<BlockedRequest>>;

    /// Most recent first
    async fn recent_requests(&self, limit: usize) -> ShieldResult<Vec<RequestLog>>;

    async fn latest_health(&self) -> ShieldResult<Option<HealthSnapshot>>;
}

/// Sending half of the audit channel
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditHandle {
    /// Create a handle and the receiver the worker drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue an event without waiting. Returns whether it was accepted.
    pub fn send(&self, event: AuditEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                metrics::increment_counter!("shield_audit_dropped_total", "reason" => "full");
                tracing::warn!(kind = event.kind(), "audit channel full, dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                metrics::increment_counter!("shield_audit_dropped_total", "reason" => "closed");
                tracing::warn!(kind = event.kind(), "audit channel closed, dropping event");
                false
            }
        }
    }

    /// Record a blocked request
    pub fn record_blocked(
        &self,
        ip: IpAddr,
        reason: impl Into<String>,
        path: impl Into<String>,
        user_agent: Option<&str>,
    ) -> bool {
        self.send(AuditEvent::Blocked(BlockedRequest::new(
            ip, reason, path, user_agent,
        )))
    }
}

/// Drain the channel into every sink until all handles are dropped
pub fn spawn_audit_worker(
    mut rx: mpsc::Receiver<AuditEvent>,
    sinks: Vec<Arc<dyn AuditSink>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let results =
                futures::future::join_all(sinks.iter().map(|sink| sink.record(&event))).await;

            for (sink, result) in sinks.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(
                        sink = sink.name(),
                        kind = event.kind(),
                        error = %e,
                        "failed to record audit event"
                    );
                }
            }
        }
        tracing::debug!("audit worker stopped");
    })
}
