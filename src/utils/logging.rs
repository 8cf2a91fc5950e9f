use std::env;
use std::net::IpAddr;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use crate::core::ScanMatch;
use crate::utils::{ShieldError, ShieldResult};

/// Initialize the logging system with the level taken from `RUST_LOG`
pub fn init_logging() -> ShieldResult<()> {
    // Get the log level from environment variable or default to INFO
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing::subscriber::set_global_default(build_subscriber(filter))
        .map_err(|e| ShieldError::Internal(format!("failed to set tracing subscriber: {}", e)))
}

fn build_subscriber(filter: EnvFilter) -> impl tracing::Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_level(true)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .pretty()
        .finish()
}

/// Create a new span for tracking request context
pub fn create_request_span(request_id: &str, ip: &IpAddr, path: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        request_id = %request_id,
        ip = %ip,
        path = %path,
    )
}

/// Log a rate limit event
pub fn log_rate_limit(ip: &IpAddr, exceeded: bool, count: u32) {
    if exceeded {
        tracing::warn!(
            ip = %ip,
            count = count,
            event = "rate_limit_exceeded",
            timestamp = %chrono::Utc::now()
        );
    } else {
        tracing::debug!(
            ip = %ip,
            count = count,
            event = "rate_limit_check",
            timestamp = %chrono::Utc::now()
        );
    }
}

/// Log a WAF signature match
pub fn log_waf_match(ip: &IpAddr, hit: &ScanMatch) {
    tracing::warn!(
        ip = %ip,
        rule_id = %hit.rule_id,
        comment = %hit.comment,
        category = %hit.category,
        location = %hit.location,
        event = "waf_triggered",
        timestamp = %chrono::Utc::now().to_rfc3339()
    );
}

/// Log the verdict reached for a request
pub fn log_verdict(ip: &IpAddr, path: &str, verdict: &str) {
    match verdict {
        "allow" | "challenge" => {
            tracing::debug!(ip = %ip, path = %path, verdict = %verdict, event = "verdict")
        }
        "blocked_error" => {
            tracing::error!(ip = %ip, path = %path, verdict = %verdict, event = "verdict")
        }
        _ => tracing::info!(ip = %ip, path = %path, verdict = %verdict, event = "verdict"),
    }
}
