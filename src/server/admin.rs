//! Stats and session endpoints served on the admin listener.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audit::{AuditReader, BlockedRequest, HealthStatus, RequestLog};
use crate::core::{
    is_bypass_token, BypassTokenStore, RequestCounter, SessionStore, TOTAL_REQUESTS_KEY,
};
use crate::utils::ShieldError;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;
const DEFAULT_TOKEN_TTL_SECS: u64 = 300;
const MAX_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Shared state of the admin API
#[derive(Clone)]
pub struct AdminState {
    pub sessions: Arc<SessionStore>,
    pub tokens: Arc<dyn BypassTokenStore>,
    pub counter: Arc<dyn RequestCounter>,
    pub audit: Arc<dyn AuditReader>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub details: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopResponse {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub blocked_ips: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphResponse {
    pub total_requests: u64,
    pub blocked_requests: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpeedResponse {
    pub traffic_in: u64,
    pub traffic_out: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TimeResponse {
    pub uptime_seconds: f64,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

impl LimitParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenParams {
    pub ttl_seconds: Option<u64>,
}

impl TokenParams {
    fn ttl(&self) -> Duration {
        let secs = self.ttl_seconds.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        Duration::from_secs(secs.clamp(1, MAX_TOKEN_TTL_SECS))
    }
}

/// Error body for the admin API
pub enum ApiError {
    BadRequest(&'static str),
    NotFound(&'static str),
    Internal(ShieldError),
}

impl From<ShieldError> for ApiError {
    fn from(e: ShieldError) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail.to_string()),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail.to_string()),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "admin request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/speed", get(speed))
        .route("/time", get(time))
        .route("/top", get(top))
        .route("/graph", get(graph))
        .route("/logs", get(logs))
        .route("/blocked", get(blocked))
        .route("/sessions/:id/authorize", post(authorize_session))
        .route("/tokens/:token", post(solve_token))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> ApiResult<HealthResponse> {
    let response = match state.audit.latest_health().await? {
        Some(snapshot) => HealthResponse {
            status: match snapshot.status {
                HealthStatus::Healthy => "Healthy",
                HealthStatus::Unhealthy => "Unhealthy",
            }
            .to_string(),
            details: snapshot.details,
        },
        None => HealthResponse {
            status: "Unknown".to_string(),
            details: "no health snapshot recorded yet".to_string(),
        },
    };
    Ok(Json(response))
}

async fn speed(State(state): State<AdminState>) -> ApiResult<SpeedResponse> {
    let snapshot = state
        .audit
        .latest_health()
        .await?
        .ok_or(ApiError::NotFound("no health snapshot recorded yet"))?;
    Ok(Json(SpeedResponse {
        traffic_in: snapshot.traffic_in,
        traffic_out: snapshot.traffic_out,
    }))
}

async fn time(State(state): State<AdminState>) -> ApiResult<TimeResponse> {
    let snapshot = state
        .audit
        .latest_health()
        .await?
        .ok_or(ApiError::NotFound("no health snapshot recorded yet"))?;
    Ok(Json(TimeResponse {
        uptime_seconds: snapshot.uptime_seconds,
    }))
}

async fn top(State(state): State<AdminState>) -> ApiResult<TopResponse> {
    Ok(Json(TopResponse {
        total_requests: state.counter.get(TOTAL_REQUESTS_KEY).await?,
        blocked_requests: state.audit.blocked_count().await?,
        blocked_ips: state.audit.blocked_ips().await?,
    }))
}

async fn graph(State(state): State<AdminState>) -> ApiResult<GraphResponse> {
    Ok(Json(GraphResponse {
        total_requests: state.counter.get(TOTAL_REQUESTS_KEY).await?,
        blocked_requests: state.audit.blocked_count().await?,
    }))
}

async fn logs(
    State(state): State<AdminState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<RequestLog>> {
    let logs = state.audit.recent_requests(params.limit()).await?;
    if logs.is_empty() {
        return Err(ApiError::NotFound("No logs found"));
    }
    Ok(Json(logs))
}

async fn blocked(
    State(state): State<AdminState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<BlockedRequest>> {
    Ok(Json(state.audit.recent_blocked(params.limit()).await?))
}

async fn authorize_session(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.authorize(&id).await {
        tracing::info!(session = %id, "session authorized");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("unknown session"))
    }
}

/// Lets an external challenge solver register a solved bypass token
async fn solve_token(
    State(state): State<AdminState>,
    Path(token): Path<String>,
    Query(params): Query<TokenParams>,
) -> Result<StatusCode, ApiError> {
    if !is_bypass_token(&token) {
        return Err(ApiError::BadRequest("token must be a UUID"));
    }
    let ttl = params.ttl();
    state.tokens.mark_solved(&token, ttl).await?;
    tracing::info!(ttl_seconds = ttl.as_secs(), "bypass token registered");
    Ok(StatusCode::NO_CONTENT)
}
