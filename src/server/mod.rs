//! HTTP surface of the shield.
//!
//! The gateway router sends every request through [`gate::gate`] and
//! forwards allowed ones to the upstream application. The admin router
//! serves stats on its own listener and is never gated.

pub mod admin;
pub mod gate;
pub mod pages;
pub mod proxy;

pub use admin::AdminState;
pub use gate::GateOutcome;
pub use proxy::UpstreamProxy;

use axum::middleware;
use axum::routing::any;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::audit::{
    AuditEvent, AuditHandle, AuditReader, AuditSink, MemoryAuditStore, RedisAuditStore,
    TracingAuditSink,
};
use crate::config::Settings;
use crate::core::{
    connect_redis, AttackScanner, BlacklistOracle, BypassTokenStore, GovernorRateLimiter,
    MemoryBlacklist, MemoryRequestCounter, MemoryTokenStore, RateLimiter, RedisBlacklist,
    RedisRateLimiter, RedisRequestCounter, RedisTokenStore, RequestCounter, SessionStore,
    SignatureScanner,
};
use crate::service::{Collaborators, GatingPipeline};
use crate::utils::ShieldResult;

/// Transport settings used by the gate middleware
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub cookie_name: String,
    pub trust_forwarded_for: bool,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl GatewayOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cookie_name: settings.session.cookie_name.clone(),
            trust_forwarded_for: settings.server.trust_forwarded_for,
            request_timeout: Duration::from_secs(settings.server.request_timeout_seconds),
            max_body_bytes: settings.server.max_body_bytes,
        }
    }
}

/// Shared state of the gateway router
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<GatingPipeline>,
    pub sessions: Arc<SessionStore>,
    pub proxy: Arc<UpstreamProxy>,
    pub audit: AuditHandle,
    pub options: GatewayOptions,
}

/// Build the public router: gate, request log and proxy
pub fn gateway_router(state: AppState) -> Router {
    let timeout = state.options.request_timeout;

    Router::new()
        .route("/", any(proxy::forward))
        .route("/*path", any(proxy::forward))
        .layer(middleware::from_fn_with_state(state.clone(), gate::gate))
        .layer(middleware::from_fn_with_state(state.clone(), gate::log_request))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodic cleanup of in-process state
pub struct Housekeeping {
    sessions: Arc<SessionStore>,
    governor: Option<Arc<GovernorRateLimiter>>,
    tokens: Option<Arc<MemoryTokenStore>>,
}

impl Housekeeping {
    pub async fn run_once(&self) {
        let expired = self.sessions.cleanup_expired().await;
        if let Some(limiter) = &self.governor {
            limiter.shrink();
        }
        if let Some(tokens) = &self.tokens {
            tokens.purge_expired().await;
        }
        tracing::debug!(expired_sessions = expired, "housekeeping pass finished");
    }

    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

/// Everything the binary wires together, built once at startup
pub struct Shield {
    pub gateway: AppState,
    pub admin: AdminState,
    pub audit_rx: mpsc::Receiver<AuditEvent>,
    pub audit_sinks: Vec<Arc<dyn AuditSink>>,
    pub housekeeping: Housekeeping,
}

struct Backends {
    tokens: Arc<dyn BypassTokenStore>,
    blacklist: Arc<dyn BlacklistOracle>,
    rate_limiter: Arc<dyn RateLimiter>,
    counter: Arc<dyn RequestCounter>,
    audit_sink: Arc<dyn AuditSink>,
    audit_reader: Arc<dyn AuditReader>,
    governor: Option<Arc<GovernorRateLimiter>>,
    memory_tokens: Option<Arc<MemoryTokenStore>>,
}

impl Shield {
    /// Build collaborators from the settings: Redis-backed when `redis.url`
    /// is set, in-process otherwise
    pub async fn build(settings: &Settings) -> ShieldResult<Self> {
        settings.validate()?;
        let backends = match &settings.redis.url {
            Some(url) => Self::redis_backends(url, settings).await?,
            None => Self::memory_backends(settings).await?,
        };

        let scanner: Arc<dyn AttackScanner> =
            Arc::new(SignatureScanner::from_config(&settings.waf)?);
        let (audit, audit_rx) = AuditHandle::channel(settings.audit.channel_capacity);
        let sessions = Arc::new(
            SessionStore::new(Duration::from_secs(settings.session.idle_timeout_seconds))
                .with_max_sessions(settings.session.max_sessions),
        );

        let collaborators = Collaborators {
            tokens: backends.tokens.clone(),
            blacklist: backends.blacklist,
            scanner,
            rate_limiter: backends.rate_limiter,
            counter: backends.counter.clone(),
            audit: audit.clone(),
        };

        let gateway = AppState {
            pipeline: Arc::new(GatingPipeline::new(collaborators, settings.gate.clone())),
            sessions: sessions.clone(),
            proxy: Arc::new(UpstreamProxy::from_config(&settings.upstream)?),
            audit,
            options: GatewayOptions::from_settings(settings),
        };

        let admin = AdminState {
            sessions: sessions.clone(),
            tokens: backends.tokens,
            counter: backends.counter,
            audit: backends.audit_reader,
        };

        let tracing_sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
        Ok(Self {
            gateway,
            admin,
            audit_rx,
            audit_sinks: vec![tracing_sink, backends.audit_sink],
            housekeeping: Housekeeping {
                sessions,
                governor: backends.governor,
                tokens: backends.memory_tokens,
            },
        })
    }

    async fn redis_backends(url: &str, settings: &Settings) -> ShieldResult<Backends> {
        let conn = connect_redis(url).await?;
        tracing::info!("connected to Redis");

        let blacklist = RedisBlacklist::new(conn.clone(), settings.blacklist.expiration_seconds);
        for ip in &settings.blacklist.ips {
            blacklist.add_ip(*ip).await?;
        }

        let audit = Arc::new(RedisAuditStore::new(conn.clone(), settings.audit.max_records));
        let limiter = RedisRateLimiter::new(conn.clone(), settings.rate_limit.clone());
        Ok(Backends {
            tokens: Arc::new(RedisTokenStore::new(conn.clone())),
            blacklist: Arc::new(blacklist),
            rate_limiter: Arc::new(limiter),
            counter: Arc::new(RedisRequestCounter::new(conn)),
            audit_sink: audit.clone(),
            audit_reader: audit,
            governor: None,
            memory_tokens: None,
        })
    }

    async fn memory_backends(settings: &Settings) -> ShieldResult<Backends> {
        tracing::warn!("no Redis URL configured, using in-process state");

        let ttl = match settings.blacklist.expiration_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let blacklist = MemoryBlacklist::new();
        for ip in &settings.blacklist.ips {
            blacklist.add_ip(*ip, ttl).await;
        }

        let governor = Arc::new(GovernorRateLimiter::new(&settings.rate_limit)?);
        let tokens = Arc::new(MemoryTokenStore::new());
        let audit = Arc::new(MemoryAuditStore::new(settings.audit.max_records));
        Ok(Backends {
            tokens: tokens.clone(),
            blacklist: Arc::new(blacklist),
            rate_limiter: governor.clone(),
            counter: Arc::new(MemoryRequestCounter::new()),
            audit_sink: audit.clone(),
            audit_reader: audit,
            governor: Some(governor),
            memory_tokens: Some(tokens),
        })
    }
}
