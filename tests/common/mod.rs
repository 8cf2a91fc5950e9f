#![allow(dead_code)]

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, Uri};
use axum::routing::any;
use axum::Router;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use edge_shield::audit::{AuditEvent, AuditHandle};
use edge_shield::config::{GateConfig, RateLimitConfig};
use edge_shield::core::{
    GovernorRateLimiter, MemoryBlacklist, MemoryRequestCounter, MemoryTokenStore, SessionStore,
    SignatureScanner,
};
use edge_shield::server::{gateway_router, AppState, GatewayOptions, UpstreamProxy};
use edge_shield::{Collaborators, GatingPipeline};

/// Body limit of the test gateway
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Generate a random IPv4 address for testing
pub fn random_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>(),
    ))
}

/// Start a stand-in upstream that echoes the method and target it received
pub async fn spawn_upstream() -> SocketAddr {
    async fn echo(method: Method, uri: Uri) -> String {
        format!("upstream {} {}", method, uri)
    }

    let app = Router::new()
        .route("/", any(echo))
        .route("/*path", any(echo));
    let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
        .serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

/// An address nothing listens on
pub fn dead_upstream() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Gateway wired to in-process collaborators, with handles to seed them
pub struct TestShield {
    pub router: Router,
    pub state: AppState,
    pub tokens: Arc<MemoryTokenStore>,
    pub blacklist: Arc<MemoryBlacklist>,
    pub counter: Arc<MemoryRequestCounter>,
    pub audit_rx: mpsc::Receiver<AuditEvent>,
}

impl TestShield {
    pub fn new(upstream: SocketAddr, gate: GateConfig) -> Self {
        Self::with_rate_limit(
            upstream,
            gate,
            RateLimitConfig {
                max_requests: 100,
                period_seconds: 60,
            },
        )
    }

    pub fn with_rate_limit(
        upstream: SocketAddr,
        gate: GateConfig,
        limits: RateLimitConfig,
    ) -> Self {
        let tokens = Arc::new(MemoryTokenStore::new());
        let blacklist = Arc::new(MemoryBlacklist::new());
        let counter = Arc::new(MemoryRequestCounter::new());
        let (audit, audit_rx) = AuditHandle::channel(256);

        let collaborators = Collaborators {
            tokens: tokens.clone(),
            blacklist: blacklist.clone(),
            scanner: Arc::new(SignatureScanner::new(
                SignatureScanner::builtin_rules().unwrap(),
                64 * 1024,
            )),
            rate_limiter: Arc::new(GovernorRateLimiter::new(&limits).unwrap()),
            counter: counter.clone(),
            audit: audit.clone(),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        let state = AppState {
            pipeline: Arc::new(GatingPipeline::new(collaborators, gate)),
            sessions: Arc::new(SessionStore::new(Duration::from_secs(600))),
            proxy: Arc::new(UpstreamProxy::new(client, format!("http://{}", upstream))),
            audit,
            options: GatewayOptions {
                cookie_name: "shield_sid".to_string(),
                trust_forwarded_for: false,
                request_timeout: Duration::from_secs(5),
                max_body_bytes: MAX_BODY_BYTES,
            },
        };

        Self {
            router: gateway_router(state.clone()),
            state,
            tokens,
            blacklist,
            counter,
            audit_rx,
        }
    }

    /// Audit events emitted so far
    pub fn drain_audit(&mut self) -> Vec<AuditEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.audit_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// GET request arriving from `ip`
pub fn get_from(ip: IpAddr, uri: &str) -> Request<Body> {
    request_from(ip, Request::builder().method(Method::GET).uri(uri))
}

/// Finish a request builder and attach the peer address
pub fn request_from(ip: IpAddr, builder: axum::http::request::Builder) -> Request<Body> {
    request_with_body(ip, builder, Body::empty())
}

/// Like [`request_from`] with a request body
pub fn request_with_body(
    ip: IpAddr,
    builder: axum::http::request::Builder,
    body: impl Into<Body>,
) -> Request<Body> {
    let mut req = builder.body(body.into()).unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::new(ip, 40000)));
    req
}

pub async fn body_text(response: axum::response::Response) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
