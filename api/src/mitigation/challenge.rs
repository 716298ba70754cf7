use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use encore_core::error::codes;
use serde::Serialize;

use super::gate::ChallengeReason;

pub const CHALLENGE_PATH: &str = "/challenge";
pub const CHALLENGE_VERIFY_PATH: &str = "/challenge/verify";
/// Suggested wait before retrying without solving.
pub const CHALLENGE_RETRY_AFTER_SECS: u64 = 60;

const TURNSTILE_SCRIPT: &str = "https://challenges.cloudflare.com/turnstile/v0/api.js";
const MAX_NEXT_LEN: usize = 2_048;

/// Body of a JSON challenge. API clients solve the widget out of band and
/// replay the request with `x-captcha-token`.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ChallengeBody {
    pub error: String,
    pub message: String,
    pub captcha_site_key: Option<String>,
    pub retry_after: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// What the challenge page should say and where to go afterwards.
#[derive(Debug, Clone)]
pub struct ChallengePrompt<'a> {
    pub site_key: Option<&'a str>,
    pub next: &'a str,
    pub reason: Option<ChallengeReason>,
    /// Set after a rejected or unverifiable proof
    pub notice: Option<&'a str>,
}

/// 429 challenge in the representation the client asked for.
pub fn challenge_response(prompt: &ChallengePrompt<'_>, wants_html: bool) -> Response {
    let message = prompt
        .notice
        .unwrap_or("Please complete the verification to continue.");
    let response = if wants_html {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Html(render_challenge_page(prompt.site_key, prompt.next, prompt.notice)),
        )
            .into_response()
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ChallengeBody {
                error: codes::CAPTCHA_REQUIRED.to_string(),
                message: message.to_string(),
                captcha_site_key: prompt.site_key.map(str::to_string),
                retry_after: CHALLENGE_RETRY_AFTER_SECS,
                reason: prompt.reason.map(|reason| reason.as_str().to_string()),
            }),
        )
            .into_response()
    };
    with_retry_after(response)
}

/// The verifier could not answer. Still a 429: a challenged client never
/// gets through on an outage.
pub fn verifier_unavailable_response(
    site_key: Option<&str>,
    next: &str,
    wants_html: bool,
) -> Response {
    const NOTICE: &str = "Verification is temporarily unavailable. Please try again shortly.";
    let response = if wants_html {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Html(render_challenge_page(site_key, next, Some(NOTICE))),
        )
            .into_response()
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ChallengeBody {
                error: codes::CAPTCHA_UNAVAILABLE.to_string(),
                message: NOTICE.to_string(),
                captcha_site_key: site_key.map(str::to_string),
                retry_after: CHALLENGE_RETRY_AFTER_SECS,
                reason: None,
            }),
        )
            .into_response()
    };
    with_retry_after(response)
}

/// Only same-site absolute paths are accepted as a return target.
pub fn sanitize_next(next: Option<&str>) -> String {
    let Some(next) = next.map(str::trim) else {
        return "/".to_string();
    };
    let safe = next.starts_with('/')
        && !next.starts_with("//")
        && !next.contains('\\')
        && !next.chars().any(char::is_control)
        && next.len() <= MAX_NEXT_LEN
        && !next.starts_with(CHALLENGE_PATH);
    if safe { next.to_string() } else { "/".to_string() }
}

fn with_retry_after(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::RETRY_AFTER,
        HeaderValue::from(CHALLENGE_RETRY_AFTER_SECS),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

pub(crate) fn render_challenge_page(site_key: Option<&str>, next: &str, notice: Option<&str>) -> String {
    let notice_html = notice
        .map(|text| format!(r#"<p class="notice">{}</p>"#, html_escape(text)))
        .unwrap_or_default();
    let widget = match site_key {
        Some(key) => format!(
            r#"<div class="cf-turnstile" data-sitekey="{}"></div>"#,
            html_escape(key)
        ),
        None => r#"<p class="notice">Verification is not available right now.</p>"#.to_string(),
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<meta name="robots" content="noindex">
<title>Encore - Quick check</title>
<script src="{script}" async defer></script>
<style>
body {{ font-family: system-ui, sans-serif; max-width: 420px; margin: 60px auto; padding: 0 20px; }}
h1 {{ font-size: 1.4em; }}
.notice {{ color: #b00020; }}
button {{ margin-top: 20px; padding: 10px 24px; background: #111; color: #fff; border: none; cursor: pointer; font-size: 1em; }}
</style>
</head>
<body>
<h1>One quick check</h1>
<p>We noticed unusual traffic from your connection. Confirm you are human to get back to your songs and setlists.</p>
{notice_html}
<form method="post" action="{action}">
<input type="hidden" name="next" value="{next}">
{widget}
<button type="submit">Continue</button>
</form>
</body>
</html>"#,
        script = TURNSTILE_SCRIPT,
        action = CHALLENGE_VERIFY_PATH,
        next = html_escape(next),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_rejects_offsite_and_malformed_targets() {
        assert_eq!(sanitize_next(Some("/setlists/4")), "/setlists/4");
        assert_eq!(sanitize_next(Some("//evil.example")), "/");
        assert_eq!(sanitize_next(Some("https://evil.example")), "/");
        assert_eq!(sanitize_next(Some("/\\evil.example")), "/");
        assert_eq!(sanitize_next(Some("/challenge/verify")), "/");
        assert_eq!(sanitize_next(None), "/");
    }

    #[test]
    fn page_escapes_return_target_and_embeds_widget() {
        let page = render_challenge_page(Some("site-key"), "/songs/?q=\"><script>", None);
        assert!(page.contains("&quot;&gt;&lt;script&gt;"));
        assert!(!page.contains("\"><script>"));
        assert!(page.contains(r#"data-sitekey="site-key""#));
        assert!(page.contains(TURNSTILE_SCRIPT));
    }

    #[test]
    fn json_challenge_is_429_with_retry_after() {
        let prompt = ChallengePrompt {
            site_key: Some("site-key"),
            next: "/",
            reason: Some(ChallengeReason::SuspiciousSignature),
            notice: None,
        };
        let response = challenge_response(&prompt, false);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .expect("ascii")
                .starts_with("application/json")
        );
    }

    #[test]
    fn html_challenge_for_browsers() {
        let prompt = ChallengePrompt {
            site_key: None,
            next: "/",
            reason: None,
            notice: None,
        };
        let response = challenge_response(&prompt, true);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .expect("ascii")
                .starts_with("text/html")
        );
    }
}
