use axum::extract::{Query, Request, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use encore_core::fingerprint::compose_key;
use encore_core::policy::RateLimitPolicy;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::mitigation::challenge::{
    CHALLENGE_PATH, CHALLENGE_VERIFY_PATH, ChallengePrompt, challenge_response,
    render_challenge_page, sanitize_next, verifier_unavailable_response,
};
use crate::mitigation::gate::ProofOutcome;
use crate::mitigation::request::{FORM_PROOF_FIELD, RequestAttributes, parse_pairs};
use crate::state::AppState;

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ChallengePageQuery {
    /// Same-site path to return to after verification
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct VerifiedResponse {
    pub status: String,
    pub expires_at: DateTime<Utc>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(CHALLENGE_PATH, get(challenge_page))
        .route(CHALLENGE_VERIFY_PATH, axum::routing::post(verify_challenge))
}

/// Standalone challenge page
#[utoipa::path(
    get,
    path = "/challenge",
    params(ChallengePageQuery),
    responses((status = 200, description = "HTML page with the captcha widget")),
    tag = "challenge"
)]
pub async fn challenge_page(
    State(state): State<AppState>,
    Query(query): Query<ChallengePageQuery>,
) -> impl IntoResponse {
    let next = sanitize_next(query.next.as_deref());
    (
        [(header::CACHE_CONTROL, "no-store")],
        Html(render_challenge_page(state.engine.site_key(), &next, None)),
    )
}

/// Submit a captcha proof. Accepts the widget's form post, or a token in the
/// `x-captcha-token` header or `captcha_token` query parameter.
#[utoipa::path(
    post,
    path = "/challenge/verify",
    responses(
        (status = 200, description = "Verified; bypass grant issued", body = VerifiedResponse),
        (status = 303, description = "Verified; redirect to the return target"),
        (status = 429, description = "Missing, rejected or unverifiable proof")
    ),
    tag = "challenge"
)]
pub async fn verify_challenge(
    State(state): State<AppState>,
    req: Request,
) -> Result<Response, AppError> {
    let engine = &state.engine;
    let attrs = RequestAttributes::from_request(&req, engine.trust_forwarded_for());
    let form_encoded = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

    let body = axum::body::to_bytes(req.into_body(), engine.max_inspected_body_bytes())
        .await
        .map_err(|_| AppError::Validation {
            message: "Challenge form is too large or unreadable".to_string(),
            field: None,
            received: None,
            docs_hint: None,
        })?;
    let form = if form_encoded {
        parse_pairs(&String::from_utf8_lossy(&body))
    } else {
        Vec::new()
    };
    let form_value = |name: &str| {
        form.iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.clone())
    };

    let next = sanitize_next(
        form_value("next")
            .or_else(|| {
                attrs
                    .query
                    .iter()
                    .find(|(name, _)| name == "next")
                    .map(|(_, value)| value.clone())
            })
            .as_deref(),
    );
    let token = form_value(FORM_PROOF_FIELD)
        .filter(|value| !value.trim().is_empty())
        .or_else(|| attrs.header_proof.clone())
        .or_else(|| attrs.query_proof.clone());

    let Some(token) = token else {
        let prompt = ChallengePrompt {
            site_key: engine.site_key(),
            next: &next,
            reason: None,
            notice: Some("Please complete the verification to continue."),
        };
        return Ok(challenge_response(&prompt, attrs.wants_html || form_encoded));
    };

    let now = Utc::now();
    let composite_key = compose_key(&attrs.factors());
    if let Some(retry_after_secs) = engine.throttle_proof(&attrs, &composite_key, now) {
        tracing::warn!(client = %attrs.client_addr, "proof submissions throttled");
        return Err(AppError::RateLimited {
            policy: RateLimitPolicy::Auth,
            retry_after_secs,
        });
    }
    let response = match engine.submit_proof(&attrs, &composite_key, &token, now).await {
        ProofOutcome::Granted(grant) => {
            if attrs.wants_html || form_encoded {
                Redirect::to(&next).into_response()
            } else {
                Json(VerifiedResponse {
                    status: "verified".to_string(),
                    expires_at: grant.expires_at,
                })
                .into_response()
            }
        }
        ProofOutcome::Rejected { .. } => {
            let prompt = ChallengePrompt {
                site_key: engine.site_key(),
                next: &next,
                reason: None,
                notice: Some("Verification failed. Please try again."),
            };
            challenge_response(&prompt, attrs.wants_html || form_encoded)
        }
        ProofOutcome::Unavailable(_) => verifier_unavailable_response(
            engine.site_key(),
            &next,
            attrs.wants_html || form_encoded,
        ),
    };
    Ok(response)
}
