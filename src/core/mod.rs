//! Core collaborators of the gating pipeline.
//! This module contains the request and session model and the
//! bypass-token, blacklist, signature-scanning, rate-limiting and
//! counting services the pipeline consults.

mod ip_blacklist;
mod rate_limiter;
mod request;
mod request_counter;
mod session;
mod token_store;
mod waf;

pub use ip_blacklist::{BlacklistOracle, MemoryBlacklist, RedisBlacklist};
pub use rate_limiter::{GovernorRateLimiter, RateLimiter, RedisRateLimiter};
pub use request::ClientRequest;
pub use request_counter::{
    MemoryRequestCounter, RedisRequestCounter, RequestCounter, BLOCKED_REQUESTS_KEY,
    TOTAL_REQUESTS_KEY,
};
pub use session::{LoadedSession, RateLimitDelta, Session, SessionStore};
pub use token_store::{
    is_bypass_token, BypassTokenStore, MemoryTokenStore, RedisTokenStore, TOKEN_HEADER,
    TOKEN_QUERY_PARAM,
};
pub use waf::{AttackScanner, ScanMatch, ScanTarget, SignatureScanner, WafRule, WafRuleSpec};

#[cfg(test)]
pub use ip_blacklist::MockBlacklistOracle;
#[cfg(test)]
pub use rate_limiter::MockRateLimiter;
#[cfg(test)]
pub use request_counter::MockRequestCounter;
#[cfg(test)]
pub use token_store::MockBypassTokenStore;
#[cfg(test)]
pub use waf::MockAttackScanner;

use redis::aio::ConnectionManager;

use crate::utils::ShieldResult;

/// Open the shared, auto-reconnecting Redis connection used by every Redis-backed collaborator
pub async fn connect_redis(url: &str) -> ShieldResult<ConnectionManager> {
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client).await?;
    Ok(conn)
}
