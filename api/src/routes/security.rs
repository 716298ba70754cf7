use std::net::IpAddr;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use encore_core::security_metrics::WindowMetrics;
use serde::Deserialize;

use crate::auth::AdminAccess;
use crate::error::AppError;
use crate::mitigation::GateStatus;
use crate::mitigation::bus::SecuritySnapshot;
use crate::state::AppState;

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct SnapshotQuery {
    /// Recent events to include, newest first (default 50, max 200)
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct MetricsQuery {
    /// Window length in hours (default 24, max 168)
    #[serde(default)]
    pub window_hours: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/v1/admin/security/snapshot",
    params(SnapshotQuery),
    responses(
        (status = 200, description = "Recent events and running totals", body = SecuritySnapshot),
        (status = 401, description = "Missing or invalid admin token"),
        (status = 404, description = "Admin routes are disabled")
    ),
    security(("bearer_auth" = [])),
    tag = "security"
)]
pub async fn get_snapshot(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<SecuritySnapshot>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    Ok(Json(state.engine.bus.snapshot(limit)))
}

#[utoipa::path(
    get,
    path = "/v1/admin/security/metrics",
    params(MetricsQuery),
    responses(
        (status = 200, description = "Derived metrics for the window", body = WindowMetrics),
        (status = 401, description = "Missing or invalid admin token"),
        (status = 404, description = "Admin routes are disabled")
    ),
    security(("bearer_auth" = [])),
    tag = "security"
)]
pub async fn get_metrics(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<WindowMetrics>, AppError> {
    let window_hours = query.window_hours.unwrap_or(24).clamp(1, 168);
    Ok(Json(
        state
            .engine
            .bus
            .metrics_for_window(Duration::hours(window_hours), Utc::now()),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/admin/security/gate/{address}",
    params(("address" = String, Path, description = "Client IP address")),
    responses(
        (status = 200, description = "Gate state and standing for the address", body = GateStatus),
        (status = 400, description = "Not an IP address"),
        (status = 401, description = "Missing or invalid admin token"),
        (status = 404, description = "Admin routes are disabled")
    ),
    security(("bearer_auth" = [])),
    tag = "security"
)]
pub async fn get_gate_status(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(address): Path<String>,
) -> Result<Json<GateStatus>, AppError> {
    let client_addr = address
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| AppError::Validation {
            message: "address must be an IPv4 or IPv6 address".to_string(),
            field: Some("address".to_string()),
            received: Some(serde_json::Value::String(address.clone())),
            docs_hint: Some("Example: /v1/admin/security/gate/203.0.113.5".to_string()),
        })?;
    Ok(Json(state.engine.gate_status(client_addr, Utc::now())))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/security/snapshot", get(get_snapshot))
        .route("/v1/admin/security/metrics", get(get_metrics))
        .route("/v1/admin/security/gate/{address}", get(get_gate_status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use encore_core::security_events::{SecurityEvent, SecurityEventType, Severity};
    use tower::ServiceExt;

    fn state(admin_token: Option<&str>) -> AppState {
        AppState::new(Config {
            admin_token: admin_token.map(str::to_string),
            ..Config::default()
        })
    }

    fn get_with_token(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).expect("request")
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn admin_routes_are_hidden_without_configured_token() {
        let app = router().with_state(state(None));
        let response = app
            .oneshot(get_with_token("/v1/admin/security/snapshot", Some("anything")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let app = router().with_state(state(Some("ops-token")));
        let missing = app
            .clone()
            .oneshot(get_with_token("/v1/admin/security/snapshot", None))
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .oneshot(get_with_token("/v1/admin/security/snapshot", Some("guess")))
            .await
            .expect("response");
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn snapshot_lists_newest_events_first() {
        let state = state(Some("ops-token"));
        let now = Utc::now();
        for (offset, event_type) in [
            (2, SecurityEventType::XssAttempt),
            (1, SecurityEventType::SqlInjectionAttempt),
        ] {
            state.engine.bus.publish(SecurityEvent::new(
                event_type,
                Severity::High,
                now - Duration::minutes(offset),
            ));
        }
        let response = router()
            .with_state(state)
            .oneshot(get_with_token(
                "/v1/admin/security/snapshot?limit=1",
                Some("ops-token"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["total_events"], 2);
        assert_eq!(body["recent_events"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["recent_events"][0]["event_type"], "sql_injection_attempt");
    }

    #[tokio::test]
    async fn metrics_report_threat_level() {
        let state = state(Some("ops-token"));
        let now = Utc::now();
        for hour in 0..11 {
            state.engine.bus.publish(SecurityEvent::new(
                SecurityEventType::RateLimitViolation,
                Severity::Critical,
                now - Duration::hours(hour),
            ));
        }
        let response = router()
            .with_state(state)
            .oneshot(get_with_token(
                "/v1/admin/security/metrics?window_hours=24",
                Some("ops-token"),
            ))
            .await
            .expect("response");
        let body = json_body(response).await;
        assert_eq!(body["threat_level"], "CRITICAL");
        assert_eq!(body["total_events"], 11);
    }

    #[tokio::test]
    async fn gate_status_validates_address() {
        let state = state(Some("ops-token"));
        let app = router().with_state(state);
        let bad = app
            .clone()
            .oneshot(get_with_token(
                "/v1/admin/security/gate/not-an-ip",
                Some("ops-token"),
            ))
            .await
            .expect("response");
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let good = app
            .oneshot(get_with_token(
                "/v1/admin/security/gate/203.0.113.5",
                Some("ops-token"),
            ))
            .await
            .expect("response");
        assert_eq!(good.status(), StatusCode::OK);
        let body = json_body(good).await;
        assert_eq!(body["state"], "ungated");
        assert_eq!(body["standing"]["violations"], 0);
    }
}
