use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Named rate-limit tier assigned to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    Auth,
    Sensitive,
    Strict,
    Api,
    AuthenticatedApi,
    AuthenticatedDefault,
    Global,
}

impl RateLimitPolicy {
    pub const ALL: [RateLimitPolicy; 7] = [
        RateLimitPolicy::Auth,
        RateLimitPolicy::Sensitive,
        RateLimitPolicy::Strict,
        RateLimitPolicy::Api,
        RateLimitPolicy::AuthenticatedApi,
        RateLimitPolicy::AuthenticatedDefault,
        RateLimitPolicy::Global,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitPolicy::Auth => "auth",
            RateLimitPolicy::Sensitive => "sensitive",
            RateLimitPolicy::Strict => "strict",
            RateLimitPolicy::Api => "api",
            RateLimitPolicy::AuthenticatedApi => "authenticated_api",
            RateLimitPolicy::AuthenticatedDefault => "authenticated_default",
            RateLimitPolicy::Global => "global",
        }
    }

    /// Sustained requests per minute allowed under this tier.
    pub fn requests_per_minute(self) -> u32 {
        match self {
            RateLimitPolicy::Auth => 5,
            RateLimitPolicy::Sensitive => 10,
            RateLimitPolicy::Strict => 20,
            RateLimitPolicy::Api => 60,
            RateLimitPolicy::AuthenticatedApi => 300,
            RateLimitPolicy::AuthenticatedDefault => 600,
            RateLimitPolicy::Global => 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathClass {
    Auth,
    Sensitive,
    Strict,
    Api,
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy)]
struct PolicyRule {
    prefix: &'static str,
    class: PathClass,
    writes_only: bool,
}

const fn rule(prefix: &'static str, class: PathClass, writes_only: bool) -> PolicyRule {
    PolicyRule {
        prefix,
        class,
        writes_only,
    }
}

/// Evaluated top to bottom, first match wins. Authentication endpoints come
/// first so credential routes always get the tightest tier; sensitive writes
/// come before the generic API rows or they would never match.
const POLICY_RULES: &[PolicyRule] = &[
    rule("/accounts/login", PathClass::Auth, false),
    rule("/accounts/signup", PathClass::Auth, false),
    rule("/accounts/password", PathClass::Auth, false),
    rule("/accounts/oauth", PathClass::Auth, false),
    rule("/api/auth/", PathClass::Auth, false),
    rule("/auth/", PathClass::Auth, false),
    rule("/accounts/", PathClass::Sensitive, true),
    rule("/settings/", PathClass::Sensitive, true),
    rule("/songs/", PathClass::Sensitive, true),
    rule("/setlists/", PathClass::Sensitive, true),
    rule("/api/songs", PathClass::Sensitive, true),
    rule("/api/setlists", PathClass::Sensitive, true),
    rule("/admin/", PathClass::Strict, false),
    rule("/debug/", PathClass::Strict, false),
    rule("/export/", PathClass::Strict, false),
    rule("/import/", PathClass::Strict, false),
    rule("/v1/admin/", PathClass::Strict, false),
    rule("/api/", PathClass::Api, false),
    rule("/v1/", PathClass::Api, false),
];

/// Endpoints whose per-address hourly hit count feeds the challenge gate.
const HIGH_RISK_ENDPOINTS: &[&str] = &[
    "/accounts/login",
    "/accounts/signup",
    "/accounts/password",
    "/accounts/delete",
    "/api/auth/",
    "/auth/",
    "/export/",
];

/// Map a request to exactly one rate-limit tier.
pub fn classify(path: &str, method: &str, authenticated: bool) -> RateLimitPolicy {
    let is_write = is_write_method(method);
    let matched = POLICY_RULES
        .iter()
        .find(|rule| path_matches(path, rule.prefix) && (!rule.writes_only || is_write));

    match (matched.map(|rule| rule.class), authenticated) {
        (Some(PathClass::Auth), _) => RateLimitPolicy::Auth,
        (Some(PathClass::Sensitive), _) => RateLimitPolicy::Sensitive,
        (Some(PathClass::Strict), _) => RateLimitPolicy::Strict,
        (Some(PathClass::Api), true) => RateLimitPolicy::AuthenticatedApi,
        (Some(PathClass::Api), false) => RateLimitPolicy::Api,
        (None, true) => RateLimitPolicy::AuthenticatedDefault,
        (None, false) => RateLimitPolicy::Global,
    }
}

pub fn is_high_risk_endpoint(path: &str) -> bool {
    HIGH_RISK_ENDPOINTS
        .iter()
        .any(|prefix| path_matches(path, prefix))
}

pub fn is_write_method(method: &str) -> bool {
    matches!(
        method.to_ascii_uppercase().as_str(),
        "POST" | "PUT" | "PATCH" | "DELETE"
    )
}

/// Prefix match that is case-insensitive and tolerates a missing trailing
/// slash, so `/admin` matches the `/admin/` row.
fn path_matches(path: &str, prefix: &str) -> bool {
    let path = path.to_ascii_lowercase();
    if path.starts_with(prefix) {
        return true;
    }
    match prefix.strip_suffix('/') {
        Some(bare) => path == bare,
        None => false,
    }
}
