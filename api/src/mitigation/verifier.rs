use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;

pub const TURNSTILE_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

pub type VerifyFuture<'a> =
    Pin<Box<dyn Future<Output = Result<VerifyOutcome, VerifierError>> + Send + 'a>>;

/// Result of a completed verification round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    Rejected { error_codes: Vec<String> },
}

/// The verifier could not give an answer. Always treated as "not verified".
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("captcha verifier is not configured")]
    NotConfigured,
    #[error("captcha verification timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha verifier unreachable: {0}")]
    Transport(String),
    #[error("captcha verifier returned status {0}")]
    Status(u16),
    #[error("captcha verifier returned an unreadable body: {0}")]
    Malformed(String),
}

/// External proof-of-humanity check. Implementations must be cancel-safe:
/// dropping the future abandons the call with no side effects.
pub trait ChallengeVerifier: Send + Sync {
    fn verify<'a>(&'a self, token: &'a str, client_addr: IpAddr) -> VerifyFuture<'a>;

    fn is_configured(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct TurnstileVerifyResponse {
    success: bool,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(rename = "error-codes", default)]
    error_codes: Vec<String>,
}

/// Cloudflare Turnstile siteverify client.
#[derive(Clone)]
pub struct TurnstileVerifier {
    client: reqwest::Client,
    verify_url: String,
    secret: Option<String>,
    expected_hostname: Option<String>,
    timeout: Duration,
}

impl TurnstileVerifier {
    pub fn new(
        verify_url: String,
        secret: Option<String>,
        expected_hostname: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "failed to build verifier client; using defaults");
                reqwest::Client::new()
            });
        Self {
            client,
            verify_url,
            secret: secret.filter(|value| !value.trim().is_empty()),
            expected_hostname,
            timeout,
        }
    }

    async fn siteverify(&self, token: &str, client_addr: IpAddr) -> Result<VerifyOutcome, VerifierError> {
        let secret = self.secret.as_deref().ok_or(VerifierError::NotConfigured)?;
        let remote_ip = client_addr.to_string();

        let request = self
            .client
            .post(&self.verify_url)
            .form(&[
                ("secret", secret),
                ("response", token),
                ("remoteip", remote_ip.as_str()),
            ])
            .send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| VerifierError::Timeout(self.timeout))?
            .map_err(|err| {
                if err.is_timeout() {
                    VerifierError::Timeout(self.timeout)
                } else {
                    VerifierError::Transport(err.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(VerifierError::Status(response.status().as_u16()));
        }

        let verification = response
            .json::<TurnstileVerifyResponse>()
            .await
            .map_err(|err| VerifierError::Malformed(err.to_string()))?;

        Ok(evaluate_verification(
            verification,
            self.expected_hostname.as_deref(),
        ))
    }
}

impl ChallengeVerifier for TurnstileVerifier {
    fn verify<'a>(&'a self, token: &'a str, client_addr: IpAddr) -> VerifyFuture<'a> {
        Box::pin(self.siteverify(token, client_addr))
    }

    fn is_configured(&self) -> bool {
        self.secret.is_some()
    }
}

fn evaluate_verification(
    verification: TurnstileVerifyResponse,
    expected_hostname: Option<&str>,
) -> VerifyOutcome {
    if !verification.success {
        tracing::warn!(
            error_codes = ?verification.error_codes,
            "captcha verification returned unsuccessful response"
        );
        return VerifyOutcome::Rejected {
            error_codes: verification.error_codes,
        };
    }

    if let Some(expected_hostname) = expected_hostname
        && verification.hostname.as_deref() != Some(expected_hostname)
    {
        tracing::warn!(
            expected_hostname = expected_hostname,
            actual_hostname = verification.hostname.as_deref().unwrap_or("<missing>"),
            "captcha hostname mismatch"
        );
        return VerifyOutcome::Rejected {
            error_codes: vec!["hostname-mismatch".to_string()],
        };
    }

    VerifyOutcome::Verified
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use std::collections::HashMap;

    fn sample(success: bool, hostname: Option<&str>, codes: &[&str]) -> TurnstileVerifyResponse {
        TurnstileVerifyResponse {
            success,
            hostname: hostname.map(str::to_string),
            error_codes: codes.iter().map(|code| code.to_string()).collect(),
        }
    }

    async fn spawn_siteverify(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });
        format!("http://{addr}/siteverify")
    }

    fn client_ip() -> IpAddr {
        "203.0.113.5".parse().expect("valid ip")
    }

    #[test]
    fn unsuccessful_verification_is_rejected_with_codes() {
        let outcome = evaluate_verification(sample(false, None, &["invalid-input-response"]), None);
        assert_eq!(
            outcome,
            VerifyOutcome::Rejected {
                error_codes: vec!["invalid-input-response".to_string()]
            }
        );
    }

    #[test]
    fn hostname_mismatch_is_rejected() {
        let outcome =
            evaluate_verification(sample(true, Some("evil.example"), &[]), Some("encore.band"));
        assert!(matches!(outcome, VerifyOutcome::Rejected { .. }));
    }

    #[test]
    fn expected_values_verify() {
        let outcome =
            evaluate_verification(sample(true, Some("encore.band"), &[]), Some("encore.band"));
        assert_eq!(outcome, VerifyOutcome::Verified);
    }

    #[tokio::test]
    async fn missing_secret_is_not_configured() {
        let verifier = TurnstileVerifier::new(
            TURNSTILE_VERIFY_URL.to_string(),
            Some("  ".to_string()),
            None,
            Duration::from_secs(1),
        );
        assert!(!verifier.is_configured());
        let err = verifier
            .verify("token", client_ip())
            .await
            .expect_err("unconfigured verifier must fail");
        assert!(matches!(err, VerifierError::NotConfigured));
    }

    #[tokio::test]
    async fn posts_secret_token_and_remote_ip() {
        let router = Router::new().route(
            "/siteverify",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                let ok = form.get("secret").map(String::as_str) == Some("s3cret")
                    && form.get("response").map(String::as_str) == Some("proof")
                    && form.get("remoteip").map(String::as_str) == Some("203.0.113.5");
                Json(serde_json::json!({ "success": ok, "error-codes": [] }))
            }),
        );
        let url = spawn_siteverify(router).await;
        let verifier = TurnstileVerifier::new(
            url,
            Some("s3cret".to_string()),
            None,
            Duration::from_secs(2),
        );
        let outcome = verifier.verify("proof", client_ip()).await.expect("reachable");
        assert_eq!(outcome, VerifyOutcome::Verified);
    }

    #[tokio::test]
    async fn server_error_maps_to_status_error() {
        let router = Router::new().route(
            "/siteverify",
            post(|| async { axum::http::StatusCode::BAD_GATEWAY }),
        );
        let url = spawn_siteverify(router).await;
        let verifier =
            TurnstileVerifier::new(url, Some("s".to_string()), None, Duration::from_secs(2));
        let err = verifier
            .verify("proof", client_ip())
            .await
            .expect_err("5xx must not verify");
        assert!(matches!(err, VerifierError::Status(502)));
    }

    #[tokio::test]
    async fn slow_verifier_times_out() {
        let router = Router::new().route(
            "/siteverify",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(serde_json::json!({ "success": true }))
            }),
        );
        let url = spawn_siteverify(router).await;
        let verifier =
            TurnstileVerifier::new(url, Some("s".to_string()), None, Duration::from_millis(100));
        let err = verifier
            .verify("proof", client_ip())
            .await
            .expect_err("timeout must not verify");
        assert!(matches!(err, VerifierError::Timeout(_)));
    }

    #[tokio::test]
    async fn unreachable_verifier_is_transport_error() {
        let verifier = TurnstileVerifier::new(
            "http://127.0.0.1:9/siteverify".to_string(),
            Some("s".to_string()),
            None,
            Duration::from_secs(1),
        );
        let err = verifier
            .verify("proof", client_ip())
            .await
            .expect_err("closed port must not verify");
        assert!(matches!(
            err,
            VerifierError::Transport(_) | VerifierError::Timeout(_)
        ));
    }
}
