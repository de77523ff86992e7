//! HTTP handlers for the speech gateway
//!
//! `POST /v1/audio/speech` runs one pooled generation request. Callers see
//! either audio bytes or a single JSON error after all internal rotation
//! and backoff is spent; key ids and attempt counts never leak into
//! responses.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::{error, info};

use voice_pool::{Error as PoolError, PoolStats, SpeechService};

use crate::metrics;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SpeechService>,
    pub default_model: String,
    pub prometheus: PrometheusHandle,
}

/// Request body for speech generation.
#[derive(Debug, Deserialize)]
pub struct SpeechParams {
    pub text: String,
    pub voice: String,
    pub model: Option<String>,
}

/// JSON error envelope: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, error_type: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Map an orchestrator error to a response status and error type.
///
/// Upstream errors keep their status when it is a valid HTTP code so
/// callers can distinguish quota exhaustion (429) from upstream faults;
/// transport-level failures become 502.
fn error_status(err: &PoolError) -> (StatusCode, &'static str) {
    match err {
        PoolError::PoolExhausted => (StatusCode::SERVICE_UNAVAILABLE, "pool_exhausted"),
        PoolError::Upstream(upstream) => {
            let status = upstream
                .status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            (status, "upstream_error")
        }
        PoolError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

pub async fn speech_handler(
    State(state): State<AppState>,
    payload: Result<Json<SpeechParams>, JsonRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
    let started = Instant::now();

    // Malformed bodies get the same envelope as every other error path
    let Json(params) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            let status = rejection.status();
            metrics::record_request(status.as_u16(), started.elapsed().as_secs_f64());
            return error_response(status, "invalid_request", &rejection.body_text(), &request_id);
        }
    };

    if params.text.trim().is_empty() {
        metrics::record_request(400, started.elapsed().as_secs_f64());
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "text must not be empty",
            &request_id,
        );
    }

    let model = params
        .model
        .as_deref()
        .unwrap_or(&state.default_model);

    info!(
        request_id = %request_id,
        voice = %params.voice,
        model = %model,
        text_len = params.text.len(),
        "speech request received"
    );

    match state
        .service
        .generate_speech(&params.text, &params.voice, model)
        .await
    {
        Ok(audio) => {
            metrics::record_request(200, started.elapsed().as_secs_f64());
            info!(
                request_id = %request_id,
                bytes = audio.data.len(),
                mime_type = %audio.mime_type,
                "speech request completed"
            );
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, audio.mime_type),
                    (header::HeaderName::from_static("x-request-id"), request_id),
                ],
                audio.data,
            )
                .into_response()
        }
        Err(err) => {
            let (status, error_type) = error_status(&err);
            metrics::record_request(status.as_u16(), started.elapsed().as_secs_f64());
            error!(request_id = %request_id, error = %err, "speech request failed");
            error_response(status, error_type, &err.to_string(), &request_id)
        }
    }
}

/// Pool health summary.
///
/// Status mapping: all keys active → healthy, some active → degraded,
/// none active (or empty pool) → unhealthy.
pub async fn health_handler(State(state): State<AppState>) -> Response {
    match state.service.pool().usage_stats().await {
        Ok(stats) => Json(health_body(&stats)).into_response(),
        Err(err) => {
            error!(error = %err, "failed to compute pool stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "unknown" })),
            )
                .into_response()
        }
    }
}

fn health_body(stats: &PoolStats) -> serde_json::Value {
    let status = if stats.total_keys > 0 && stats.active_keys == stats.total_keys {
        "healthy"
    } else if stats.active_keys > 0 {
        "degraded"
    } else {
        "unhealthy"
    };
    serde_json::json!({
        "status": status,
        "keys_total": stats.total_keys,
        "keys_active": stats.active_keys,
        "keys_recently_failed": stats.recently_failed_keys,
        "requests_today": stats.requests_today,
    })
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.prometheus.render().into_response()
}
