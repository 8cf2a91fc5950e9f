use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use chrono::Utc;
use http_body::{LengthLimitError, Limited};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::{pages, AppState};
use crate::audit::{AuditEvent, RequestLog};
use crate::core::ClientRequest;
use crate::service::Verdict;
use crate::utils::create_request_span;

/// What the gate decided, attached to the response for the request logger
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub ip: IpAddr,
    pub verdict: &'static str,
    /// Absent when no session was kept for the client
    pub session_id: Option<String>,
}

/// Runs every request through the gating pipeline before it reaches the proxy
pub async fn gate(State(state): State<AppState>, req: Request<Body>, next: Next<Body>) -> Response {
    let ip = client_ip(&req, state.options.trust_forwarded_for);
    let (parts, body) = req.into_parts();

    let limit = state.options.max_body_bytes;
    let body = match hyper::body::to_bytes(Limited::new(body, limit)).await {
        Ok(body) => body,
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            tracing::info!(ip = %ip, limit, "request body too large");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response();
        }
        Err(e) => {
            tracing::debug!(ip = %ip, error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let request = ClientRequest::new(ip, parts.method.clone(), target)
        .with_headers(parts.headers.clone())
        .with_body(body.clone());

    let cookie = session_cookie(&parts.headers, &state.options.cookie_name);
    let loaded = state.sessions.load(cookie).await;

    let request_id = Uuid::new_v4().to_string();
    let span = create_request_span(&request_id, &ip, &request.path);
    let (verdict, session) = state
        .pipeline
        .decide(&request, loaded.session)
        .instrument(span)
        .await;

    // Blocked clients never get a session minted for them
    let keep =
        !loaded.is_new || matches!(verdict, Verdict::Allow | Verdict::ChallengeRedirect { .. });
    let kept = keep && state.sessions.store(&loaded.id, session).await;

    let label = verdict.as_str();
    let mut response = match verdict {
        Verdict::Allow => next.run(Request::from_parts(parts, Body::from(body))).await,
        Verdict::ChallengeRedirect { location } => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Verdict::BlockedWaf(hit) => {
            (StatusCode::FORBIDDEN, Html(pages::waf_blocked(&hit.rule_id))).into_response()
        }
        Verdict::BlockedBanned => (StatusCode::FORBIDDEN, Html(pages::banned())).into_response(),
        Verdict::BlockedError => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    };

    if loaded.is_new && kept {
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            state.options.cookie_name, loaded.id
        );
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(error = %e, "invalid session cookie"),
        }
    }

    response.extensions_mut().insert(GateOutcome {
        ip,
        verdict: label,
        session_id: kept.then_some(loaded.id),
    });
    response
}

/// Emits a `RequestLog` for every response
pub async fn log_request(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next<Body>,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let protocol = format!("{:?}", req.version());
    let headers = req.headers();
    let user_agent = header_text(headers, header::USER_AGENT).to_string();
    let referrer = header_text(headers, header::REFERER).to_string();
    let payload_size = header_text(headers, header::CONTENT_LENGTH)
        .parse()
        .unwrap_or(0);
    let fallback_ip = client_ip(&req, state.options.trust_forwarded_for);

    let response = next.run(req).await;

    let outcome = response.extensions().get::<GateOutcome>();
    let entry = RequestLog {
        timestamp: Utc::now(),
        ip: outcome.map(|o| o.ip).unwrap_or(fallback_ip),
        method,
        path,
        query,
        user_agent,
        referrer,
        protocol,
        status: response.status().as_u16(),
        verdict: outcome.map(|o| o.verdict).unwrap_or("unknown").to_string(),
        response_time_ms: started.elapsed().as_millis() as u64,
        payload_size,
        session_id: outcome.and_then(|o| o.session_id.clone()),
    };
    state.audit.send(AuditEvent::Request(entry));

    response
}

/// Client address from the first `X-Forwarded-For` hop when trusted, else the peer
pub fn client_ip<B>(req: &Request<B>, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = header_text(req.headers(), "x-forwarded-for")
            .split(',')
            .next()
            .and_then(|hop| hop.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Value of the named cookie, across all `Cookie` headers
pub fn session_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn header_text<K: header::AsHeaderName>(headers: &HeaderMap, name: K) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
