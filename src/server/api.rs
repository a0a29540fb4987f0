//! HTTP API over a [`TieredCache`].
//!
//! - GET    /v1/cache/{key}
//! - PUT    /v1/cache/{key}
//! - DELETE /v1/cache/{key}
//! - GET    /v1/stats
//! - GET    /health
//! - GET    /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info_span};
use uuid::Uuid;

use crate::cache::memory::{MemoryStore, MemoryStoreStats};
use crate::cache::tiered::{TierInfo, TieredCache};
use crate::error::CacheError;

/// Application state shared across handlers.
pub struct AppState {
    pub cache: Arc<TieredCache<String>>,
    /// The in-process tier, kept separately for its stats.
    pub memory: Option<Arc<MemoryStore<String>>>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        info_span!(
            "request",
            id = %Uuid::new_v4(),
            method = %request.method(),
            uri = %request.uri()
        )
    });

    Router::new()
        .route(
            "/v1/cache/{key}",
            get(get_value).put(put_value).delete(delete_value),
        )
        .route("/v1/stats", get(cache_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(ServiceBuilder::new().layer(trace))
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub tiers: Vec<TierInfo>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub tiers: Vec<TierInfo>,
    pub pending_backfills: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStoreStats>,
}

/// Error mapped onto an HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        let (status, kind) = match &err {
            CacheError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            CacheError::Tier { .. } => (StatusCode::BAD_GATEWAY, "tier_failure"),
            CacheError::Closed => (StatusCode::SERVICE_UNAVAILABLE, "closed"),
        };
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            kind: self.kind,
        };
        (self.status, Json(body)).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn get_value(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<String, ApiError> {
    Ok(state.cache.get(&key).await?)
}

async fn put_value(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let value = String::from_utf8(body.to_vec())
        .map_err(|_| ApiError::bad_request("value must be valid UTF-8"))?;

    debug!(key = %key, bytes = value.len(), "Set request");
    state.cache.set(&key, value).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_value(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.cache.delete(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        tiers: state.cache.tiers(),
        pending_backfills: state.cache.pending_backfills(),
        memory: state.memory.as_ref().map(|memory| memory.stats()),
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = if state.cache.is_closed() { "closed" } else { "ok" };
    Json(HealthResponse {
        status: status.to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        tiers: state.cache.tiers(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.cache.metrics().encode() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
