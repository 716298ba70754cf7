use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::{FromRequestParts, Request};
use axum::http::HeaderName;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tower::{Layer, Service, ServiceExt};

use crate::error::AppError;
use crate::state::AppState;

const MAX_USER_ID_LEN: usize = 128;

/// Signed-in user as asserted by the upstream identity subsystem.
///
/// The mitigation layer only reads it: identity is one fingerprint factor
/// and selects the authenticated policy tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

// --- Tower Layer/Service for identity injection ---

/// Tower Layer that copies the user id from a trusted proxy header into
/// request extensions. Does nothing when no header is configured.
#[derive(Clone)]
pub struct InjectIdentityLayer {
    header: Option<HeaderName>,
}

impl InjectIdentityLayer {
    pub fn new(header: Option<&str>) -> Self {
        let header = header.and_then(|name| match HeaderName::try_from(name) {
            Ok(header) => Some(header),
            Err(err) => {
                tracing::warn!(header = name, error = %err, "invalid identity header name; ignoring");
                None
            }
        });
        Self { header }
    }
}

impl<S> Layer<S> for InjectIdentityLayer {
    type Service = InjectIdentityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InjectIdentityService {
            inner,
            header: self.header.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InjectIdentityService<S> {
    inner: S,
    header: Option<HeaderName>,
}

impl<S> Service<Request> for InjectIdentityService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);

        if let Some(user) = self
            .header
            .as_ref()
            .and_then(|header| identity_from_header(&req, header))
        {
            req.extensions_mut().insert(user);
        }

        Box::pin(async move { Ok(ready.oneshot(req).await.into_response()) })
    }
}

fn identity_from_header(req: &Request, header: &HeaderName) -> Option<AuthenticatedUser> {
    let value = req.headers().get(header)?.to_str().ok()?.trim();
    if value.is_empty() || value.len() > MAX_USER_ID_LEN {
        return None;
    }
    Some(AuthenticatedUser {
        user_id: value.to_string(),
    })
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(parts: &Parts) -> Option<&str> {
    let auth_header = parts.headers.get("authorization")?.to_str().ok()?;
    auth_header.strip_prefix("Bearer ").map(str::trim)
}

/// Operator access to the security admin routes.
///
/// The routes do not exist while no admin token is configured, so a missing
/// token answers 404 rather than 401.
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess;

impl FromRequestParts<AppState> for AdminAccess {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.admin_token.as_deref() else {
            return Err(AppError::NotFound {
                resource: "route".to_string(),
            });
        };

        let presented = extract_bearer_token(parts).ok_or_else(|| AppError::Unauthorized {
            message: "Missing or malformed Authorization header".to_string(),
        })?;

        if !token_matches(presented, expected) {
            tracing::warn!(path = %parts.uri.path(), "rejected security admin token");
            return Err(AppError::Unauthorized {
                message: "Invalid admin token".to_string(),
            });
        }
        Ok(AdminAccess)
    }
}

fn token_matches(presented: &str, expected: &str) -> bool {
    bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}
