use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;

const BASELINE: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("x-frame-options", "DENY"),
    ("content-security-policy", "frame-ancestors 'none'"),
    ("permissions-policy", "camera=(), microphone=(), geolocation=()"),
];

/// Baseline security headers on every response. Admin responses are also
/// marked uncacheable since they carry client addresses.
pub async fn apply(req: Request, next: Next) -> Response {
    let admin = req.uri().path().starts_with("/v1/admin/");
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    for &(name, value) in BASELINE {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    if admin {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    response
}
