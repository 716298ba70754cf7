use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::HealthResponse;
use crate::state::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct ReadyResponse {
    pub status: String,
    /// False means challenged clients cannot get through until a secret is set
    pub verifier_configured: bool,
    pub active_grants: usize,
    pub tracked_counters: usize,
    pub buffered_events: usize,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe. Degraded while no captcha secret is configured: the
/// gate still challenges, but no proof can succeed.
#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Ready to serve", body = ReadyResponse),
        (status = 503, description = "Captcha verifier is not configured", body = ReadyResponse)
    ),
    tag = "system"
)]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let engine = &state.engine;
    let verifier_configured = engine.gate.verifier_configured();
    let (http_status, status) = if verifier_configured {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        http_status,
        Json(ReadyResponse {
            status: status.to_string(),
            verifier_configured,
            active_grants: engine.gate.active_grants(),
            tracked_counters: engine.ledger.tracked_counters(),
            buffered_events: engine.bus.len(),
        }),
    )
}
