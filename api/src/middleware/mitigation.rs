use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use encore_core::fingerprint::compose_key;
use encore_core::policy::{RateLimitPolicy, classify};
use encore_core::sentinel;
use tower::{Layer, Service, ServiceExt};

use crate::error::{AppError, RATE_LIMIT_POLICY_HEADER};
use crate::mitigation::MitigationEngine;
use crate::mitigation::challenge::{
    CHALLENGE_PATH, ChallengePrompt, challenge_response, verifier_unavailable_response,
};
use crate::mitigation::gate::{GateDecision, ProofOutcome};
use crate::mitigation::quota::QuotaCheck;
use crate::mitigation::request::{FORM_PROOF_FIELD, RequestAttributes, parse_pairs};

/// Paths that bypass classification, quotas and the gate. The URL sentinel
/// still sees them.
const EXEMPT_PATHS: &[&str] = &[
    "/static",
    "/media",
    "/favicon.ico",
    "/robots.txt",
    "/health",
    "/ready",
    CHALLENGE_PATH,
];

const REJECTED_PROOF_NOTICE: &str = "Verification failed. Please try again.";

#[derive(Clone)]
pub struct MitigationLayer {
    engine: Arc<MitigationEngine>,
}

impl MitigationLayer {
    pub fn new(engine: Arc<MitigationEngine>) -> Self {
        Self { engine }
    }
}

impl<S> Layer<S> for MitigationLayer {
    type Service = MitigationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MitigationService {
            inner,
            engine: self.engine.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MitigationService<S> {
    inner: S,
    engine: Arc<MitigationEngine>,
}

impl<S> Service<Request> for MitigationService<S>
where
    S: Service<Request, Response = axum::response::Response, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = axum::response::Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let engine = self.engine.clone();

        Box::pin(async move {
            let now = Utc::now();
            let attrs = RequestAttributes::from_request(&req, engine.trust_forwarded_for());

            let mut detections = sentinel::inspect_url(&attrs.path, &attrs.query);
            let (req, form) = match buffer_form_fields(req, engine.max_inspected_body_bytes()).await
            {
                Ok(buffered) => buffered,
                Err(response) => return Ok(response),
            };
            let inspected: Vec<(String, String)> = form
                .iter()
                .filter(|(name, _)| name != FORM_PROOF_FIELD)
                .cloned()
                .collect();
            detections.extend(sentinel::inspect_fields(&inspected));
            engine.report_detections(&attrs, &detections, now);

            if is_exempt(&attrs.path) {
                return Ok(ready.oneshot(req).await.into_response());
            }

            let policy = classify(&attrs.path, &attrs.method, attrs.identity.is_some());
            let composite_key = compose_key(&attrs.factors());
            let assessment = engine.assess(&attrs, &composite_key, now);

            match engine
                .gate
                .decide(attrs.client_addr, &assessment.triggers, now)
            {
                GateDecision::Pass => {}
                GateDecision::Bypassed { expires_at } => {
                    tracing::debug!(
                        client = %attrs.client_addr,
                        grant_expires_at = %expires_at,
                        "bypass grant honoured"
                    );
                }
                GateDecision::Required(reason) => {
                    let next = attrs.return_target();
                    let proof = form
                        .iter()
                        .find(|(name, _)| name == FORM_PROOF_FIELD)
                        .map(|(_, value)| value.clone())
                        .or_else(|| attrs.header_proof.clone())
                        .or_else(|| attrs.query_proof.clone());

                    let Some(token) = proof else {
                        engine.challenge_issued(&attrs, reason, &assessment.triggers, now);
                        tracing::info!(
                            client = %attrs.client_addr,
                            path = %attrs.path,
                            reason = reason.as_str(),
                            velocity_per_minute = assessment.tally.velocity_per_minute,
                            address_violations = assessment.standing.violations,
                            "challenge issued"
                        );
                        let prompt = ChallengePrompt {
                            site_key: engine.site_key(),
                            next: &next,
                            reason: Some(reason),
                            notice: None,
                        };
                        return Ok(challenge_response(&prompt, attrs.wants_html));
                    };

                    if let Some(retry_after_secs) =
                        engine.throttle_proof(&attrs, &composite_key, now)
                    {
                        return Ok(AppError::RateLimited {
                            policy: RateLimitPolicy::Auth,
                            retry_after_secs,
                        }
                        .into_response());
                    }
                    match engine.submit_proof(&attrs, &composite_key, &token, now).await {
                        ProofOutcome::Granted(_) => {}
                        ProofOutcome::Rejected { .. } => {
                            let prompt = ChallengePrompt {
                                site_key: engine.site_key(),
                                next: &next,
                                reason: Some(reason),
                                notice: Some(REJECTED_PROOF_NOTICE),
                            };
                            return Ok(challenge_response(&prompt, attrs.wants_html));
                        }
                        ProofOutcome::Unavailable(_) => {
                            return Ok(verifier_unavailable_response(
                                engine.site_key(),
                                &next,
                                attrs.wants_html,
                            ));
                        }
                    }
                }
            }

            if let QuotaCheck::Exceeded { retry_after_secs } =
                engine.quotas.check(policy, composite_key.as_str())
            {
                let tally = engine.record_rate_violation(&attrs, &composite_key, policy, now);
                tracing::warn!(
                    client = %attrs.client_addr,
                    path = %attrs.path,
                    policy = policy.as_str(),
                    address_violations = tally.address_count,
                    "rate limit exceeded"
                );
                return Ok(AppError::RateLimited {
                    policy,
                    retry_after_secs,
                }
                .into_response());
            }

            let mut response = ready.oneshot(req).await.into_response();
            if policy == RateLimitPolicy::Auth && response.status() == StatusCode::UNAUTHORIZED {
                engine.record_auth_failure(attrs.client_addr, &attrs.path, now);
            }
            annotate_response_headers(&mut response, policy);
            Ok(response)
        })
    }
}

fn annotate_response_headers(response: &mut Response, policy: RateLimitPolicy) {
    response.headers_mut().insert(
        RATE_LIMIT_POLICY_HEADER,
        HeaderValue::from_static(policy.as_str()),
    );
}

fn is_exempt(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    EXEMPT_PATHS.iter().any(|exempt| {
        lowered == *exempt
            || lowered
                .strip_prefix(exempt)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

fn is_form_submission(req: &Request) -> bool {
    let writes_body = matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH);
    let form_encoded = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        });
    writes_body && form_encoded
}

/// Read a form body so its fields can be inspected, then hand the same bytes
/// on to the inner service. Bodies without a declared length, or larger than
/// `limit`, pass through uninspected and unread.
///
/// A body that fails mid-read (the stream errors, or runs past `limit`
/// despite its declared length) is already consumed and cannot be forwarded,
/// so the request is answered with the same 400 a form extractor would give.
/// It is logged but never counted as an abuse signal.
async fn buffer_form_fields(
    req: Request,
    limit: usize,
) -> Result<(Request, Vec<(String, String)>), Response> {
    if !is_form_submission(&req) {
        return Ok((req, Vec::new()));
    }
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<usize>().ok());
    if !declared.is_some_and(|len| len <= limit) {
        return Ok((req, Vec::new()));
    }

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, limit).await.map_err(|err| {
        tracing::warn!(
            error = %err,
            path = %parts.uri.path(),
            declared_len = ?declared,
            "form body unreadable; request not forwarded"
        );
        AppError::Validation {
            message: "Request body could not be read".to_string(),
            field: None,
            received: None,
            docs_hint: None,
        }
        .into_response()
    })?;
    let fields = parse_pairs(&String::from_utf8_lossy(&bytes));
    Ok((Request::from_parts(parts, Body::from(bytes)), fields))
}
