use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::Quota;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::core::session::{RateLimitDelta, Session};
use crate::utils::{log_rate_limit, ShieldError, ShieldResult};

/// Consumes one request unit for an IP and reports the resulting accounting.
///
/// Exceeding the quota is reported through `RateLimitDelta::limited`, not as an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn consume(&self, ip: IpAddr, session: &Session) -> ShieldResult<RateLimitDelta>;
}

type KeyedLimiter = governor::RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// In-process limiter using governor's keyed GCRA state.
///
/// Bursts of up to `max_requests` are admitted, then one request per
/// `period_seconds / max_requests`.
pub struct GovernorRateLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
    period: Duration,
}

impl GovernorRateLimiter {
    pub fn new(config: &RateLimitConfig) -> ShieldResult<Self> {
        let burst = NonZeroU32::new(config.max_requests).ok_or_else(|| {
            ShieldError::Internal("rate_limit.max_requests must be greater than zero".to_string())
        })?;
        let period = Duration::from_secs(config.period_seconds.max(1));
        let quota = Quota::with_period(period / burst.get())
            .ok_or_else(|| ShieldError::Internal("rate limit period is too short".to_string()))?
            .allow_burst(burst);

        let clock = DefaultClock::default();
        let limiter = governor::RateLimiter::dashmap_with_clock(quota, &clock);

        Ok(Self {
            limiter,
            clock,
            period,
        })
    }

    /// Forget IPs whose buckets are full again
    pub fn shrink(&self) {
        self.limiter.retain_recent();
    }

    /// Number of IPs currently tracked
    pub fn tracked(&self) -> usize {
        self.limiter.len()
    }

    fn window(&self, session: &Session, now: DateTime<Utc>) -> (DateTime<Utc>, u32) {
        let period = chrono::Duration::seconds(self.period.as_secs() as i64);
        match &session.rate_limit {
            Some(prev) if now - prev.window_start < period => {
                (prev.window_start, prev.count.saturating_add(1))
            }
            _ => (now, 1),
        }
    }
}

#[async_trait]
impl RateLimiter for GovernorRateLimiter {
    async fn consume(&self, ip: IpAddr, session: &Session) -> ShieldResult<RateLimitDelta> {
        let (window_start, count) = self.window(session, Utc::now());

        let retry_after = match self.limiter.check_key(&ip) {
            Ok(()) => None,
            Err(not_until) => Some(not_until.wait_time_from(self.clock.now())),
        };
        let limited = retry_after.is_some();
        log_rate_limit(&ip, limited, count);

        Ok(RateLimitDelta {
            window_start,
            count,
            limited,
            retry_after_secs: retry_after.map(|wait| wait.as_secs().max(1)),
        })
    }
}

/// Fixed-window limiter shared across nodes through Redis
pub struct RedisRateLimiter {
    /// Shared Redis connection
    conn: ConnectionManager,
    /// Rate limit configuration
    config: RateLimitConfig,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager, config: RateLimitConfig) -> Self {
        Self { conn, config }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn consume(&self, ip: IpAddr, _session: &Session) -> ShieldResult<RateLimitDelta> {
        let key = format!("rate_limit:{}", ip);
        let mut conn = self.conn.clone();

        // INCR and TTL run in one MULTI/EXEC, so concurrent requests always
        // observe distinct counts
        let (count, ttl): (u32, i64) = redis::pipe()
            .atomic()
            .incr(&key, 1u32)
            .ttl(&key)
            .query_async(&mut conn)
            .await?;

        // A cancelled call can leave the key behind without an expiry; any
        // later call repairs it instead of limiting the client forever
        let remaining = match remaining_window(ttl) {
            Some(remaining) => remaining,
            None => {
                conn.expire::<_, ()>(&key, self.config.period_seconds as usize).await?;
                self.config.period_seconds
            }
        };
        let elapsed = self.config.period_seconds.saturating_sub(remaining);
        let window_start = Utc::now() - chrono::Duration::seconds(elapsed as i64);

        let limited = count > self.config.max_requests;
        log_rate_limit(&ip, limited, count);

        Ok(RateLimitDelta {
            window_start,
            count,
            limited,
            retry_after_secs: limited.then_some(remaining.max(1)),
        })
    }
}

/// Seconds left in a Redis window, `None` when the key has no expiry yet
fn remaining_window(ttl: i64) -> Option<u64> {
    (ttl >= 0).then_some(ttl as u64)
}
