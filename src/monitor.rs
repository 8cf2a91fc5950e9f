//! Periodic system health snapshots.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::audit::{AuditEvent, AuditHandle, HealthSnapshot, HealthStatus};

const NET_DEV: &str = "/proc/net/dev";
const UPTIME: &str = "/proc/uptime";

/// Samples uptime, interface traffic and upstream reachability
pub struct HealthMonitor {
    audit: AuditHandle,
    client: reqwest::Client,
    probe_url: String,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        audit: AuditHandle,
        client: reqwest::Client,
        probe_url: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            audit,
            client,
            probe_url: probe_url.into(),
            interval,
        }
    }

    /// Take one sample
    pub async fn snapshot(&self) -> HealthSnapshot {
        let uptime_seconds = read_proc(UPTIME)
            .await
            .map(|raw| parse_uptime(&raw))
            .unwrap_or(0.0);
        let (traffic_in, traffic_out) = read_proc(NET_DEV)
            .await
            .map(|raw| parse_net_dev(&raw))
            .unwrap_or((0, 0));
        let (status, details) = self.probe().await;

        HealthSnapshot {
            timestamp: Utc::now(),
            uptime_seconds,
            traffic_in,
            traffic_out,
            status,
            details,
        }
    }

    async fn probe(&self) -> (HealthStatus, String) {
        match self.client.get(&self.probe_url).send().await {
            Ok(response) => (
                HealthStatus::Healthy,
                format!("upstream answered {}", response.status()),
            ),
            Err(e) => (HealthStatus::Unhealthy, e.to_string()),
        }
    }

    /// Emit a snapshot every interval, starting immediately
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let snapshot = self.snapshot().await;
                self.audit.send(AuditEvent::Health(snapshot));
            }
        })
    }
}

async fn read_proc(path: &str) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Some(raw),
        Err(e) => {
            tracing::debug!(path = path, error = %e, "proc file unavailable");
            None
        }
    }
}

/// Sum received and transmitted bytes over all interfaces in `/proc/net/dev`
pub fn parse_net_dev(raw: &str) -> (u64, u64) {
    raw.lines()
        .skip(2)
        .filter_map(|line| {
            let (_, counters) = line.split_once(':')?;
            let fields: Vec<&str> = counters.split_whitespace().collect();
            let received = fields.first()?.parse::<u64>().ok()?;
            let transmitted = fields.get(8)?.parse::<u64>().ok()?;
            Some((received, transmitted))
        })
        .fold((0, 0), |(rx, tx), (r, t)| (rx + r, tx + t))
}

/// Seconds since boot from `/proc/uptime`
pub fn parse_uptime(raw: &str) -> f64 {
    raw.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}
