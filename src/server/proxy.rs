use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Duration;

use super::AppState;
use crate::config::UpstreamConfig;
use crate::utils::{ShieldError, ShieldResult};

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

/// Forwards allowed requests to the protected application
pub struct UpstreamProxy {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamProxy {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> ShieldResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self::new(client, config.url.as_str()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn forward(&self, req: Request<Body>) -> ShieldResult<Response> {
        let (parts, body) = req.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, target);

        // The gate has already buffered the body within the configured limit
        let body = hyper::body::to_bytes(body)
            .await
            .map_err(|e| ShieldError::InvalidRequest(format!("unreadable body: {}", e)))?;

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(strip_hop_by_hop(parts.headers))
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = strip_hop_by_hop(upstream.headers().clone());
        headers.remove(header::CONTENT_LENGTH);
        let bytes: Bytes = upstream.bytes().await?;

        Ok((status, headers, bytes).into_response())
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    // Headers named by `Connection` are connection-scoped as well
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP.iter().chain(named.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}

/// Fallback handler behind the gate
pub async fn forward(State(state): State<AppState>, req: Request<Body>) -> Response {
    match state.proxy.forward(req).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(
                upstream = %state.proxy.base_url(),
                error = %e,
                "upstream request failed"
            );
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}
