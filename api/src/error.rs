use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use encore_core::error::{self, ApiError};
use encore_core::policy::RateLimitPolicy;

pub const RATE_LIMIT_POLICY_HEADER: &str = "x-ratelimit-policy";

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or wrong credentials (401)
    Unauthorized { message: String },
    /// Resource not found, or a surface that is switched off (404)
    NotFound { resource: String },
    /// Quota for the request's policy tier is spent (429)
    RateLimited {
        policy: RateLimitPolicy,
        retry_after_secs: u64,
    },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                Json(ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                }),
            )
                .into_response(),
            AppError::Unauthorized { message } => (
                StatusCode::UNAUTHORIZED,
                Json(ApiError {
                    error: error::codes::UNAUTHORIZED.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: Some("Send 'Authorization: Bearer <admin token>'.".to_string()),
                }),
            )
                .into_response(),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                Json(ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message: format!("{resource} not found"),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                }),
            )
                .into_response(),
            AppError::RateLimited {
                policy,
                retry_after_secs,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ApiError {
                        error: error::codes::RATE_LIMITED.to_string(),
                        message: format!(
                            "Too many requests for the '{}' tier. Retry in {retry_after_secs}s.",
                            policy.as_str()
                        ),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: Some(format!(
                            "This tier allows {} requests per minute.",
                            policy.requests_per_minute()
                        )),
                    }),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                headers.insert(
                    RATE_LIMIT_POLICY_HEADER,
                    HeaderValue::from_static(policy.as_str()),
                );
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_sets_retry_after_and_policy_headers() {
        let response = AppError::RateLimited {
            policy: RateLimitPolicy::Auth,
            retry_after_secs: 12,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
        assert_eq!(response.headers()[RATE_LIMIT_POLICY_HEADER], "auth");
    }

    #[test]
    fn not_found_maps_to_404() {
        let response = AppError::NotFound {
            resource: "route".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
