// Copyright 2025 Memophor Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP API handlers for the Ward Strategist.
//!
//! - `GET /healthz` - Service health check
//! - `GET /metrics` - Prometheus metrics export
//! - `GET /cache/stats` - Cache hit/miss counters and memory usage
//! - `GET /strategist/:ward` - Coordinated briefing, ETag aware
//! - `GET /strategist/:ward/stream` - NDJSON intelligence feed
//! - `POST /strategist/:ward/invalidate` - Drop cached briefings for a ward
//! - `GET /admin/traces` - Recent dispatch traces
//!
//! Caller mistakes (bad ward, depth, context, priority or timestamp) are
//! rejected before any dispatch. Everything else answers 200 and reports
//! degradation in the body.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{BriefingCache, CacheStats, CacheStatus, Conditional};
use crate::coordinator::{Coordinator, DispatchTrace};
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::model::{AnalysisRequest, ContextMode, Depth, PriorityFilter};
use crate::signals::SignalStore;
use crate::stream::{IntelligenceStream, StreamConfig};

const MAX_WARD_LEN: usize = 64;
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub cache: BriefingCache,
    pub signals: Arc<dyn SignalStore>,
    pub metrics: Metrics,
    pub stream_config: StreamConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct BriefingQuery {
    pub depth: Option<String>,
    pub context: Option<String>,
    /// Comma separated free-text filters.
    pub filters: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub since: Option<String>,
    pub priority: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub ward: String,
    pub purged: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/cache/stats", get(cache_stats))
        .route("/strategist/:ward", get(handle_briefing))
        .route("/strategist/:ward/stream", get(handle_stream))
        .route("/strategist/:ward/invalidate", post(handle_invalidate))
        .route("/admin/traces", get(traces))
        .with_state(state)
}

/// Health check endpoint
pub async fn health() -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": "ward-strategist",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// Metrics endpoint
pub async fn metrics(State(state): State<AppState>) -> Result<String, AppError> {
    state.metrics.export()
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}

pub async fn traces(State(state): State<AppState>) -> Json<Vec<DispatchTrace>> {
    Json(state.coordinator.recent_traces())
}

/// Produce (or serve from cache) the coordinated briefing for a ward
pub async fn handle_briefing(
    State(state): State<AppState>,
    Path(ward): Path<String>,
    Query(query): Query<BriefingQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let ward = validate_ward(&ward)?;
    let depth: Depth = parse_or_default(query.depth.as_deref())?;
    let context: ContextMode = parse_or_default(query.context.as_deref())?;
    let filters = query
        .filters
        .as_deref()
        .map(|raw| raw.split(',').map(str::to_string).collect::<Vec<_>>())
        .unwrap_or_default();

    let request = AnalysisRequest::new(ward, depth, context).with_filters(filters);

    if let Some(tag) = if_none_match(&headers) {
        let key = BriefingCache::key_for(&request);
        match state.cache.get_if_none_match(&key, &tag).await {
            Conditional::NotModified => {
                tracing::debug!(%key, "briefing not modified");
                return Ok(not_modified(&tag));
            }
            Conditional::Fresh { payload, etag } => {
                return Ok(briefing_response(payload, &etag, CacheStatus::Hit));
            }
            Conditional::Miss => {}
        }
    }

    let briefing = state.coordinator.briefing(&request).await;
    tracing::info!(
        ward = request.ward(),
        depth = %depth,
        context = %context,
        cache = briefing.status.as_str(),
        fallback = briefing.result.fallback_mode,
        "briefing served"
    );

    Ok(briefing_response(
        briefing.payload.to_string(),
        &briefing.etag,
        briefing.status,
    ))
}

/// Drop every cached briefing for a ward
pub async fn handle_invalidate(
    State(state): State<AppState>,
    Path(ward): Path<String>,
) -> Result<Json<InvalidateResponse>, AppError> {
    let ward = validate_ward(&ward)?;
    let purged = state
        .cache
        .invalidate_pattern(&BriefingCache::ward_pattern(ward))
        .await;

    Ok(Json(InvalidateResponse {
        ward: ward.to_string(),
        purged,
    }))
}

/// Open a line-delimited JSON event feed for a ward
pub async fn handle_stream(
    State(state): State<AppState>,
    Path(ward): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, AppError> {
    let ward = validate_ward(&ward)?.to_string();
    let since = query
        .since
        .as_deref()
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw.trim())
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| AppError::bad_request(format!("invalid since '{raw}': {e}")))
        })
        .transpose()?;
    let priority: PriorityFilter = parse_or_default(query.priority.as_deref())?;

    let rx = IntelligenceStream::new(
        Arc::clone(&state.signals),
        ward.clone(),
        since,
        priority,
        state.stream_config,
    )
    .spawn();

    state.metrics.stream_opened();
    let guard = SubscriberGuard(state.metrics.clone());
    tracing::info!(%ward, priority = priority.as_str(), "stream subscriber attached");

    let frames = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok::<_, std::convert::Infallible>(event.to_frame()), (rx, guard)))
    });

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

/// Keeps the subscriber gauge accurate however the stream ends.
struct SubscriberGuard(Metrics);

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.stream_closed();
    }
}

fn validate_ward(raw: &str) -> Result<&str, AppError> {
    let ward = raw.trim();
    if ward.is_empty() {
        return Err(AppError::bad_request("ward is required"));
    }
    if ward.len() > MAX_WARD_LEN {
        return Err(AppError::bad_request(format!(
            "ward must be at most {MAX_WARD_LEN} characters"
        )));
    }
    if !ward
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
    {
        return Err(AppError::bad_request(format!("invalid ward '{ward}'")));
    }
    Ok(ward)
}

fn parse_or_default<T>(raw: Option<&str>) -> Result<T, AppError>
where
    T: std::str::FromStr<Err = String> + Default,
{
    match raw {
        Some(value) if !value.trim().is_empty() => value.parse().map_err(AppError::bad_request),
        _ => Ok(T::default()),
    }
}

/// First entity tag from `If-None-Match`, unquoted and without the weak prefix.
fn if_none_match(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::IF_NONE_MATCH)?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    let tag = first.strip_prefix("W/").unwrap_or(first).trim_matches('"');
    (!tag.is_empty()).then(|| tag.to_string())
}

fn quoted(etag: &str) -> String {
    format!("\"{etag}\"")
}

fn briefing_response(payload: String, etag: &str, status: CacheStatus) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::ETAG, quoted(etag)),
            (X_CACHE, status.as_str().to_string()),
        ],
        payload,
    )
        .into_response()
}

fn not_modified(etag: &str) -> Response {
    (
        StatusCode::NOT_MODIFIED,
        [
            (header::ETAG, quoted(etag)),
            (X_CACHE, CacheStatus::Hit.as_str().to_string()),
        ],
    )
        .into_response()
}
