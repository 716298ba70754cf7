use std::net::SocketAddr;

use axum::Router;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod config;
mod error;
mod middleware;
mod mitigation;
mod routes;
mod state;

use crate::error::AppError;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Encore Mitigation API",
        version = "0.1.0",
        description = "Adaptive rate limiting and bot mitigation in front of the Encore song and setlist app."
    ),
    paths(
        routes::health::health_check,
        routes::health::readiness,
        routes::challenge::challenge_page,
        routes::challenge::verify_challenge,
        routes::security::get_snapshot,
        routes::security::get_metrics,
        routes::security::get_gate_status,
    ),
    components(schemas(
        HealthResponse,
        routes::health::ReadyResponse,
        routes::challenge::VerifiedResponse,
        mitigation::GateStatus,
        mitigation::bus::SecuritySnapshot,
        mitigation::bus::OffenderCount,
        mitigation::challenge::ChallengeBody,
        mitigation::gate::GateState,
        mitigation::gate::BypassGrant,
        mitigation::ledger::ClientStanding,
        mitigation::ledger::ViolationRecord,
        encore_core::error::ApiError,
        encore_core::policy::RateLimitPolicy,
        encore_core::security_events::SecurityEvent,
        encore_core::security_events::SecurityEventType,
        encore_core::security_events::Severity,
        encore_core::security_metrics::WindowMetrics,
        encore_core::security_metrics::ThreatLevel,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn not_found() -> AppError {
    AppError::NotFound {
        resource: "route".to_string(),
    }
}

fn app(state: state::AppState) -> Router {
    let cors_layer = middleware::cors::build_cors_layer(&state.config.cors_origins);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::challenge::router())
        .merge(routes::security::router())
        .fallback(not_found)
        .layer(middleware::mitigation::MitigationLayer::new(
            state.engine.clone(),
        ))
        .layer(auth::InjectIdentityLayer::new(
            state.config.identity_header.as_deref(),
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::security_headers::apply))
                .layer(cors_layer),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "encore_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = config::Config::from_env();
    let port = config.port;
    let maintenance_interval = config.maintenance_interval;
    let app_state = state::AppState::new(config);

    if !app_state.engine.gate.verifier_configured() {
        tracing::warn!(
            "TURNSTILE_SECRET_KEY is not set; challenged clients cannot verify until it is"
        );
    }
    if app_state.config.admin_token.is_none() {
        tracing::info!("ENCORE_SECURITY_ADMIN_TOKEN is not set; admin security routes are disabled");
    }

    let maintenance = mitigation::spawn_maintenance(app_state.engine.clone(), maintenance_interval);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Encore mitigation API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app(app_state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    maintenance.abort();
    Ok(())
}
