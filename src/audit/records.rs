use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Reason recorded for requests from blacklisted IPs
pub const BAN_REASON: &str = "IP blacklisted";

/// A request that received a 403
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedRequest {
    pub ip: IpAddr,
    pub reason: String,
    pub request_url: String,
    pub user_agent: String,
    pub blocked_at: DateTime<Utc>,
}

impl BlockedRequest {
    pub fn new(
        ip: IpAddr,
        reason: impl Into<String>,
        request_url: impl Into<String>,
        user_agent: Option<&str>,
    ) -> Self {
        Self {
            ip,
            reason: reason.into(),
            request_url: request_url.into(),
            user_agent: user_agent.unwrap_or("Unknown").to_string(),
            blocked_at: Utc::now(),
        }
    }

    /// Reason string for a WAF block
    pub fn waf_reason(rule_id: &str) -> String {
        format!("WAF triggered: Rule {}", rule_id)
    }
}

/// One served request, written after the response is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    pub timestamp: DateTime<Utc>,
    pub ip: IpAddr,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub user_agent: String,
    pub referrer: String,
    pub protocol: String,
    pub status: u16,
    pub verdict: String,
    pub response_time_ms: u64,
    pub payload_size: u64,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Periodic system health sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub traffic_in: u64,
    pub traffic_out: u64,
    pub status: HealthStatus,
    pub details: String,
}

/// Everything that flows through the audit channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Blocked(BlockedRequest),
    Request(RequestLog),
    Health(HealthSnapshot),
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Blocked(_) => "blocked",
            AuditEvent::Request(_) => "request",
            AuditEvent::Health(_) => "health",
        }
    }
}
