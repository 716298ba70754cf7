use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, header};
use encore_core::fingerprint::FingerprintFactors;

use crate::auth::AuthenticatedUser;

/// Form field the Turnstile widget submits.
pub const FORM_PROOF_FIELD: &str = "cf-turnstile-response";
pub const HEADER_PROOF: &str = "x-captcha-token";
pub const QUERY_PROOF_PARAM: &str = "captcha_token";

const SESSION_COOKIE_NAMES: &[&str] = &["sessionid", "session"];
const MAX_SIGNATURE_LEN: usize = 512;

/// Everything the mitigation pipeline needs to know about a request, read
/// once before the body is touched.
#[derive(Debug, Clone)]
pub struct RequestAttributes {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Unknown clients share the unspecified address, so they are throttled
    /// together rather than not at all.
    pub client_addr: IpAddr,
    pub addr_known: bool,
    pub client_signature: Option<String>,
    pub identity: Option<String>,
    pub session_id: Option<String>,
    pub wants_html: bool,
    pub header_proof: Option<String>,
    pub query_proof: Option<String>,
}

impl RequestAttributes {
    pub fn from_request(req: &Request, trust_forwarded_for: bool) -> Self {
        let headers = req.headers();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(parse_pairs).unwrap_or_default();

        let connect_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let forwarded = trust_forwarded_for
            .then(|| forwarded_client_addr(headers))
            .flatten();
        let resolved = forwarded.or(connect_addr);

        let query_proof = query
            .iter()
            .find(|(name, _)| name == QUERY_PROOF_PARAM)
            .map(|(_, value)| value.clone())
            .filter(|value| !value.trim().is_empty());

        Self {
            method: req.method().as_str().to_string(),
            wants_html: wants_html(headers, &path),
            path,
            query,
            client_addr: resolved.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            addr_known: resolved.is_some(),
            client_signature: header_str(headers, header::USER_AGENT.as_str()).map(|value| {
                let mut value = value.to_string();
                value.truncate(floor_char_boundary(&value, MAX_SIGNATURE_LEN));
                value
            }),
            identity: req
                .extensions()
                .get::<AuthenticatedUser>()
                .map(|user| user.user_id.clone()),
            session_id: session_cookie(headers),
            header_proof: header_str(headers, HEADER_PROOF).map(str::to_string),
            query_proof,
        }
    }

    pub fn factors(&self) -> FingerprintFactors<'_> {
        FingerprintFactors {
            identity: self.identity.as_deref(),
            client_addr: self.addr_known.then_some(self.client_addr),
            session_id: self.session_id.as_deref(),
            client_signature: self.client_signature.as_deref(),
        }
    }

    pub fn client_label(&self) -> Option<String> {
        self.addr_known.then(|| self.client_addr.to_string())
    }

    /// Path plus query, used as the return target after a challenge.
    pub fn return_target(&self) -> String {
        let remaining: Vec<(&str, &str)> = self
            .query
            .iter()
            .filter(|(name, _)| name != QUERY_PROOF_PARAM)
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        if remaining.is_empty() {
            return self.path.clone();
        }
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(remaining)
            .finish();
        format!("{}?{encoded}", self.path)
    }
}

/// Decode an `application/x-www-form-urlencoded` string into pairs.
pub fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

/// First hop of X-Forwarded-For, falling back to X-Real-IP.
fn forwarded_client_addr(headers: &HeaderMap) -> Option<IpAddr> {
    first_header_token(headers, "x-forwarded-for")
        .or_else(|| first_header_token(headers, "x-real-ip"))
        .and_then(|value| parse_addr(&value))
}

fn parse_addr(value: &str) -> Option<IpAddr> {
    if let Ok(addr) = value.parse::<IpAddr>() {
        return Some(addr);
    }
    value.parse::<SocketAddr>().ok().map(|addr| addr.ip())
}

fn first_header_token(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

fn header_str<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| SESSION_COOKIE_NAMES.contains(name) && !value.trim().is_empty())
        .map(|(_, value)| value.trim().to_string())
}

/// Browsers navigating to a page get the HTML challenge; API and XHR callers
/// get JSON.
fn wants_html(headers: &HeaderMap, path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    if lowered.starts_with("/api/") || lowered.starts_with("/v1/") {
        return false;
    }
    let xhr = header_str(headers, "x-requested-with")
        .is_some_and(|value| value.eq_ignore_ascii_case("xmlhttprequest"));
    let accepts_html = header_str(headers, header::ACCEPT.as_str())
        .is_some_and(|value| value.contains("text/html"));
    accepts_html && !xhr
}

fn floor_char_boundary(value: &str, max: usize) -> usize {
    if value.len() <= max {
        return value.len();
    }
    (0..=max)
        .rev()
        .find(|index| value.is_char_boundary(*index))
        .unwrap_or(0)
}
