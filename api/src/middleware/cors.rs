use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;

/// Build a CORS layer from the configured origin list (`ENCORE_CORS_ORIGINS`).
///
/// - Methods: GET, POST, OPTIONS
/// - Headers: Authorization, Content-Type, X-Captcha-Token
/// - Credentials: allowed
/// - Max age: 3600s
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("authorization"),
            HeaderName::from_static("content-type"),
            HeaderName::from_static("x-captcha-token"),
        ])
        .expose_headers([
            HeaderName::from_static("retry-after"),
            HeaderName::from_static("x-ratelimit-policy"),
        ])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600))
}
