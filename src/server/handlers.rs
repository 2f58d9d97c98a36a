//! HTTP API handlers

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{MatchedPath, Query, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tokio::time::Instant;
use tracing::error;

use crate::crawl::{SubmissionGate, SubmitError};
use crate::server::metrics::CrawlMetrics;
use crate::server::types::*;
use crate::storage::{PostgresStore, RedisStore};
use crate::types::CrawlStatus;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<SubmissionGate>,
    pub store: Arc<PostgresStore>,
    pub cache: Arc<RedisStore>,
    pub metrics: Arc<CrawlMetrics>,
}

/// `POST /api/crawl`
pub async fn submit_crawl(
    State(state): State<AppState>,
    Json(request): Json<SubmitCrawlRequest>,
) -> Response {
    match state.gate.submit(&request.url, request.force_crawl).await {
        Ok(crawl_request_id) => (
            StatusCode::ACCEPTED,
            Json(SubmitCrawlResponse::accepted(crawl_request_id)),
        )
            .into_response(),
        Err(SubmitError::InvalidUrl(_)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Invalid URL format")),
        )
            .into_response(),
        Err(err @ SubmitError::AlreadyQueued) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse::new(err.to_string())),
        )
            .into_response(),
        Err(SubmitError::Unavailable(e)) => {
            error!(url = %request.url, error = %e, "failed to submit URL");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Internal server error")),
            )
                .into_response()
        }
    }
}

/// `GET /api/status?url=...`
pub async fn crawl_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let url = match query.url.as_deref() {
        Some(url) if !url.is_empty() => url,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("URL query parameter is required")),
            )
                .into_response();
        }
    };

    match state.gate.status(url).await {
        Ok(report) if report.current_status == CrawlStatus::NotFound => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "Crawl status not found for the given URL",
            )),
        )
            .into_response(),
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(SubmitError::InvalidUrl(_)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Invalid URL format")),
        )
            .into_response(),
        Err(e) => {
            error!(url, error = %e, "failed to get crawl status");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Internal server error")),
            )
                .into_response()
        }
    }
}

/// `GET /api/health`: 200 only when both backing stores answer.
pub async fn health(State(state): State<AppState>) -> Response {
    let (database, cache) = tokio::join!(state.store.ping(), state.cache.ping());

    let database = match database {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };
    let cache = match cache {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let healthy = database == "ok" && cache == "ok";
    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        dependencies: DependencyHealth { database, cache },
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// `GET /metrics`: Prometheus text exposition
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.to_prometheus();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

/// Middleware recording request count and latency per method, matched
/// route, and status. The matched route template keeps label cardinality
/// bounded regardless of query strings.
pub async fn track_metrics(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();

    state
        .metrics
        .http_requests_total
        .inc(&[&method, &path, &status]);
    state
        .metrics
        .http_request_duration_seconds
        .observe(&[&method, &path, &status], start.elapsed());

    response
}
